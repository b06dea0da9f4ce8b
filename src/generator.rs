// Box-number generation.
//
// `preview` is read-only: it shows the number the NEXT committed box will
// get, so the station can display it while serials are still being scanned.
// `commit` is the one mutation, called only after the physical print
// succeeded. Keeping the two apart is what makes the numbering duplicate-
// and gap-free.

use chrono::{Datelike, Local, NaiveDate};
use tracing::{debug, info};

use crate::counter::{CounterKey, SequenceCounterStore};
use crate::db::{Database, Product};
use crate::error::{CoreError, CoreResult};
use crate::rules::{parse_template, BoxRule, DateCode, Token};

/// Result of a preview. A product without a bound rule gets a placeholder,
/// never a committable number - the type makes committing it impossible to
/// do by accident.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoxNumber {
    Generated { text: String, next_seq: i64 },
    NoRuleBound,
}

impl BoxNumber {
    /// Text shown to the operator and printed on the label.
    pub fn display_text(&self) -> &str {
        match self {
            BoxNumber::Generated { text, .. } => text,
            BoxNumber::NoRuleBound => "NO_RULE",
        }
    }

    pub fn is_generated(&self) -> bool {
        matches!(self, BoxNumber::Generated { .. })
    }
}

pub struct BoxNumberGenerator<'d> {
    db: &'d Database,
}

impl<'d> BoxNumberGenerator<'d> {
    pub fn new(db: &'d Database) -> Self {
        BoxNumberGenerator { db }
    }

    /// Preview the next box number for today. Does not mutate the counter.
    pub fn preview(&self, product: &Product, repair_level: u32) -> CoreResult<BoxNumber> {
        self.preview_on(product, repair_level, Local::now().date_naive())
    }

    /// Preview against an explicit date (the production date on the label).
    pub fn preview_on(
        &self,
        product: &Product,
        repair_level: u32,
        date: NaiveDate,
    ) -> CoreResult<BoxNumber> {
        let Some(rule) = self.bound_rule(product)? else {
            return Ok(BoxNumber::NoRuleBound);
        };

        let tokens = parse_template(&rule.template).map_err(|e| CoreError::RuleMalformed {
            name: rule.name.clone(),
            reason: e.to_string(),
        })?;

        let key = CounterKey::new(product.id, rule.id, date, repair_level);
        let current = SequenceCounterStore::new(self.db.conn()).get(&key)?;
        let next_seq = current + 1;

        let text = expand(&tokens, product, repair_level, date, next_seq);
        debug!(box_no = %text, next_seq, key = %key.storage_key(), "box number preview");

        Ok(BoxNumber::Generated { text, next_seq })
    }

    /// Advance the counter for today's key by one. Call at most once per
    /// successfully printed box.
    pub fn commit(&self, product: &Product, repair_level: u32) -> CoreResult<i64> {
        self.commit_on(product, repair_level, Local::now().date_naive())
    }

    /// Commit against an explicit date. Unconditional increment - this is
    /// not a reconciliation against any previous preview. Refused when the
    /// product has no bound rule: a counter keyed by a nonexistent rule
    /// would leak sequence numbers nobody can trace.
    pub fn commit_on(
        &self,
        product: &Product,
        repair_level: u32,
        date: NaiveDate,
    ) -> CoreResult<i64> {
        let Some(rule) = self.bound_rule(product)? else {
            return Err(CoreError::RuleMissing {
                product_id: product.id,
            });
        };

        let key = CounterKey::new(product.id, rule.id, date, repair_level);
        let value = SequenceCounterStore::new(self.db.conn()).increment(&key)?;
        info!(key = %key.storage_key(), value, "sequence committed");
        Ok(value)
    }

    fn bound_rule(&self, product: &Product) -> CoreResult<Option<BoxRule>> {
        match product.rule_id {
            Some(rule_id) => self.db.get_box_rule(rule_id),
            None => Ok(None),
        }
    }
}

fn expand(
    tokens: &[Token],
    product: &Product,
    repair_level: u32,
    date: NaiveDate,
    next_seq: i64,
) -> String {
    let mut out = String::new();
    for token in tokens {
        match token {
            Token::Literal(text) => out.push_str(text),
            Token::SnPrefix => out.push_str(&product.sn4),
            Token::Batch => out.push_str(&repair_level.to_string()),
            Token::Date(code) => out.push_str(&expand_date_code(*code, date)),
            // Overflowing the declared width prints at full width; the
            // accepted policy is no truncation and no error.
            Token::Seq { width } => {
                out.push_str(&format!("{:0w$}", next_seq, w = *width));
            }
        }
    }
    out
}

/// Evaluate one date code against the production date.
pub fn expand_date_code(code: DateCode, date: NaiveDate) -> String {
    match code {
        DateCode::YearFull => date.year().to_string(),
        DateCode::Year2 => format!("{:02}", date.year().rem_euclid(100)),
        DateCode::Year1 => format!("{}", date.year().rem_euclid(10)),
        DateCode::Month2 => format!("{:02}", date.month()),
        DateCode::Month1 => match date.month() {
            10 => "A".to_string(),
            11 => "B".to_string(),
            12 => "C".to_string(),
            m => m.to_string(),
        },
        DateCode::Day2 => format!("{:02}", date.day()),
    }
}
