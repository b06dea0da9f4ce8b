// Boxline - box numbering and print-commit engine for label stations.
// Exposes all modules for use in the CLI and in tests.

pub mod config;
pub mod coordinator;
pub mod counter;
pub mod db;
pub mod error;
pub mod export;
pub mod generator;
pub mod printer;
pub mod rules;
pub mod validator;

// Re-export commonly used types
pub use coordinator::{reprint_box, BoxCommit, Phase, PrintTransactionCoordinator, ScanOutcome};
pub use counter::{CounterKey, SequenceCounterStore};
pub use db::{Database, PrintRecord, Product, RecordQuery};
pub use error::{CoreError, CoreResult};
pub use export::{export_records, import_products};
pub use generator::{BoxNumber, BoxNumberGenerator};
pub use printer::{LabelPrinter, PrintError, SpoolPrinter};
pub use rules::{parse_template, BoxRule, DateCode, SnRule, TemplateError, Token};
pub use validator::{clean_sn, Rejection, SnValidator};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
