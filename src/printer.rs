//! Print backend seam.
//!
//! The engine never talks to label hardware directly: it hands a template
//! reference and a flat key->value map to a [`LabelPrinter`] and looks only
//! at success or failure. The call is blocking; the coordinator owns the
//! box for its duration.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

/// Print backend error types.
#[derive(Debug, Error)]
pub enum PrintError {
    /// Backend not installed, not reachable, or refusing work.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// IO error while handing the job over.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The backend accepted the job and then reported a failure.
    #[error("print failed: {0}")]
    Failed(String),
}

pub trait LabelPrinter {
    /// Print one label job. `fields` maps backend data-source names to the
    /// values to substitute; unknown names are the backend's business.
    fn print(
        &mut self,
        template: &Path,
        fields: &BTreeMap<String, String>,
    ) -> Result<(), PrintError>;
}

/// A printer that spools jobs to a JSON-lines file instead of hardware.
/// Used by the CLI when no driver is configured, and handy for diffing what
/// would have been printed.
pub struct SpoolPrinter {
    path: PathBuf,
}

impl SpoolPrinter {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        SpoolPrinter {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl LabelPrinter for SpoolPrinter {
    fn print(
        &mut self,
        template: &Path,
        fields: &BTreeMap<String, String>,
    ) -> Result<(), PrintError> {
        let job = serde_json::json!({
            "template": template.display().to_string(),
            "fields": fields,
        });

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{job}")?;

        info!(spool = %self.path.display(), template = %template.display(), "job spooled");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spool_printer_appends_one_line_per_job() {
        let dir = tempfile::tempdir().unwrap();
        let spool = dir.path().join("jobs.jsonl");
        let mut printer = SpoolPrinter::new(&spool);

        let fields: BTreeMap<String, String> =
            [("xianghao".to_string(), "ABCD-202403-0001".to_string())]
                .into_iter()
                .collect();

        printer.print(Path::new("widget.btw"), &fields).unwrap();
        printer.print(Path::new("widget.btw"), &fields).unwrap();

        let content = std::fs::read_to_string(&spool).unwrap();
        assert_eq!(content.lines().count(), 2);
        assert!(content.contains("ABCD-202403-0001"));
    }
}
