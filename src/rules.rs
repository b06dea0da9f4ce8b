// Rules as data: box-number and serial-number templates.
// Templates are parsed once into a token list and evaluated from there;
// nothing re-substitutes placeholder strings on the hot path.

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// RULE ROWS
// ============================================================================

/// A box-number rule: literal text plus `{SN4}`, date codes and one
/// zero-padded `{SEQ<n>}` placeholder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoxRule {
    pub id: i64,
    pub name: String,
    pub template: String,
}

/// A serial-number format rule over `{SN4}`, `{BATCH}` and `{SEQ<n>}`.
/// `length` is an optional fixed total length used as a fast reject before
/// positional matching.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnRule {
    pub id: i64,
    pub name: String,
    pub template: String,
    pub length: Option<usize>,
}

// ============================================================================
// TEMPLATE TOKENS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateCode {
    /// `{YYYY}` - full year
    YearFull,
    /// `{Y2}` - last two digits of the year
    Year2,
    /// `{Y1}` - last digit of the year
    Year1,
    /// `{MM}` - zero-padded month
    Month2,
    /// `{M1}` - month 1-9 as-is, 10/11/12 as A/B/C
    Month1,
    /// `{DD}` - zero-padded day
    Day2,
}

impl DateCode {
    pub fn code(&self) -> &'static str {
        match self {
            DateCode::YearFull => "YYYY",
            DateCode::Year2 => "Y2",
            DateCode::Year1 => "Y1",
            DateCode::Month2 => "MM",
            DateCode::Month1 => "M1",
            DateCode::Day2 => "DD",
        }
    }

    fn from_code(code: &str) -> Option<Self> {
        match code {
            "YYYY" => Some(DateCode::YearFull),
            "Y2" => Some(DateCode::Year2),
            "Y1" => Some(DateCode::Year1),
            "MM" => Some(DateCode::Month2),
            "M1" => Some(DateCode::Month1),
            "DD" => Some(DateCode::Day2),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// Verbatim text between placeholders.
    Literal(String),
    /// `{SN4}` - the product's serial prefix.
    SnPrefix,
    /// `{BATCH}` - the repair/batch level as its decimal digit.
    Batch,
    /// A date code evaluated against the production date.
    Date(DateCode),
    /// `{SEQ<n>}` - the running counter, zero-padded to `width`.
    Seq { width: usize },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("sequence width '{0}' is not a usable number")]
    BadSeqWidth(String),
}

/// Parse a rule template into tokens.
///
/// Unrecognized `{...}` groups and unclosed braces are kept as literal text
/// so that rules written for older stations keep printing what they always
/// printed. Only a `{SEQ...}` whose width does not parse is rejected.
pub fn parse_template(template: &str) -> Result<Vec<Token>, TemplateError> {
    let mut tokens = Vec::new();
    let mut literal = String::new();
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        let (before, after_open) = rest.split_at(open);
        literal.push_str(before);

        let Some(close) = after_open.find('}') else {
            // Unclosed brace: the remainder is literal text.
            literal.push_str(after_open);
            rest = "";
            break;
        };

        let inner = &after_open[1..close];
        let token = match inner {
            "SN4" => Some(Token::SnPrefix),
            "BATCH" => Some(Token::Batch),
            _ => {
                if let Some(code) = DateCode::from_code(inner) {
                    Some(Token::Date(code))
                } else if let Some(digits) = inner.strip_prefix("SEQ") {
                    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                        None
                    } else {
                        let width = digits
                            .parse::<usize>()
                            .map_err(|_| TemplateError::BadSeqWidth(digits.to_string()))?;
                        Some(Token::Seq { width })
                    }
                } else {
                    None
                }
            }
        };

        match token {
            Some(token) => {
                if !literal.is_empty() {
                    tokens.push(Token::Literal(std::mem::take(&mut literal)));
                }
                tokens.push(token);
            }
            None => {
                // Not a placeholder we know: keep it verbatim.
                literal.push_str(&after_open[..=close]);
            }
        }
        rest = &after_open[close + 1..];
    }

    literal.push_str(rest);
    if !literal.is_empty() {
        tokens.push(Token::Literal(literal));
    }

    Ok(tokens)
}
