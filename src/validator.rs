// Serial-number validation.
//
// A validator is compiled once when the operator selects a product and then
// checks every scan. Rejections are ordinary outcomes with an operator-
// facing reason, not errors; a rule that will not compile rejects every
// serial instead of crashing the scan loop.

use thiserror::Error;

use crate::db::Product;
use crate::rules::{parse_template, SnRule, Token};

/// Why a scan was not accepted. Shown verbatim to the operator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("empty scan")]
    Empty,

    #[error("prefix mismatch: serial must start with {required}")]
    PrefixMismatch { required: String },

    #[error("length mismatch: serial must be exactly {required} characters")]
    LengthMismatch { required: usize },

    #[error("format mismatch: {sn}")]
    FormatMismatch { sn: String },

    #[error("serial rule is malformed: {reason}")]
    RuleMalformed { reason: String },

    #[error("already scanned into this box")]
    DuplicateInBox,

    #[error("this serial was already printed")]
    AlreadyPrinted,
}

/// One step of the compiled positional matcher.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Digits(usize),
}

pub struct SnValidator {
    prefix: String,
    length: Option<usize>,
    /// None: prefix-only product (no SN rule bound).
    /// Some(Err): the rule failed to compile; every scan is rejected.
    matcher: Option<Result<Vec<Segment>, String>>,
}

/// Drop trailing whitespace, control and zero-width characters that barcode
/// scanners like to append, then trim ordinary whitespace on both ends.
pub fn clean_sn(raw: &str) -> &str {
    raw.trim_end_matches(|c: char| {
        c.is_whitespace() || c.is_control() || c == '\u{200b}' || c == '\u{feff}'
    })
    .trim()
}

impl SnValidator {
    /// Compile the matcher for one product selection. `repair_level` is the
    /// batch digit that `{BATCH}` must match.
    pub fn compile(product: &Product, rule: Option<&SnRule>, repair_level: u32) -> Self {
        let prefix = product.sn4.trim().to_string();
        let (length, matcher) = match rule {
            None => (None, None),
            Some(rule) => (
                rule.length,
                Some(compile_segments(&rule.template, &prefix, repair_level)),
            ),
        };
        SnValidator {
            prefix,
            length,
            matcher,
        }
    }

    /// Run the full pipeline: clean, prefix, length, positional match.
    /// Short-circuits on the first failure.
    pub fn validate(&self, raw: &str) -> Result<(), Rejection> {
        let sn = clean_sn(raw);
        if sn.is_empty() {
            return Err(Rejection::Empty);
        }

        if !sn.starts_with(&self.prefix) {
            return Err(Rejection::PrefixMismatch {
                required: self.prefix.clone(),
            });
        }

        if let Some(required) = self.length {
            if sn.chars().count() != required {
                return Err(Rejection::LengthMismatch { required });
            }
        }

        match &self.matcher {
            None => Ok(()),
            Some(Err(reason)) => Err(Rejection::RuleMalformed {
                reason: reason.clone(),
            }),
            Some(Ok(segments)) => match_segments(segments, sn),
        }
    }
}

fn compile_segments(
    template: &str,
    prefix: &str,
    repair_level: u32,
) -> Result<Vec<Segment>, String> {
    let tokens = parse_template(template).map_err(|e| e.to_string())?;

    let mut segments = Vec::new();
    for token in tokens {
        let segment = match token {
            Token::Literal(text) => Segment::Literal(text),
            Token::SnPrefix => Segment::Literal(prefix.to_string()),
            Token::Batch => Segment::Literal(repair_level.to_string()),
            // Date codes carry no meaning in a serial rule; they match
            // themselves as written, same as any other literal.
            Token::Date(code) => Segment::Literal(format!("{{{}}}", code.code())),
            Token::Seq { width } => Segment::Digits(width),
        };
        // Fold adjacent literals so matching walks fewer segments.
        match (segments.last_mut(), segment) {
            (Some(Segment::Literal(last)), Segment::Literal(text)) => last.push_str(&text),
            (_, segment) => segments.push(segment),
        }
    }
    Ok(segments)
}

fn match_segments(segments: &[Segment], sn: &str) -> Result<(), Rejection> {
    let mismatch = || Rejection::FormatMismatch { sn: sn.to_string() };

    let mut rest = sn;
    for segment in segments {
        match segment {
            Segment::Literal(text) => {
                rest = rest.strip_prefix(text.as_str()).ok_or_else(mismatch)?;
            }
            Segment::Digits(n) => {
                let digits = rest.as_bytes().get(..*n).ok_or_else(mismatch)?;
                if !digits.iter().all(u8::is_ascii_digit) {
                    return Err(mismatch());
                }
                rest = &rest[*n..];
            }
        }
    }

    // The whole serial must be consumed; trailing garbage is a mismatch.
    if rest.is_empty() {
        Ok(())
    } else {
        Err(mismatch())
    }
}
