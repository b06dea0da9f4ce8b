// Error taxonomy for the box engine core.
// Validation rejections are NOT errors - they are normal outcomes reported
// to the operator and live in validator::Rejection instead.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    /// No box rule is bound to the product. Previewing yields the NO_RULE
    /// placeholder; committing a counter against it is refused.
    #[error("no box rule bound to product {product_id}")]
    RuleMissing { product_id: i64 },

    /// A rule template could not be compiled (e.g. unparseable SEQ width).
    #[error("rule '{name}' is malformed: {reason}")]
    RuleMalformed { name: String, reason: String },

    /// The label template file is missing or unreadable. Reported before
    /// any print attempt is made.
    #[error("label template not found: {0}")]
    TemplateMissing(PathBuf),

    /// The external print backend reported a failure. The in-flight box is
    /// preserved so the operator can retry.
    #[error("print backend failure: {0}")]
    PrintBackendFailure(String),

    /// The durable counter write failed. Treated as fatal to the commit:
    /// records and counter are rolled back together.
    #[error("counter store failure: {0}")]
    CounterStoreFailure(String),

    #[error("no product selected")]
    NoProductSelected,

    #[error("product not found: {0}")]
    ProductNotFound(String),

    #[error("no print records for box {0}")]
    BoxNotFound(String),

    #[error("cannot submit an empty box")]
    EmptyBox,

    #[error("box is full; submit it or remove serials first")]
    BoxFull,

    #[error("storage failure: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("io failure: {0}")]
    Io(#[from] std::io::Error),
}

pub type CoreResult<T> = Result<T, CoreError>;
