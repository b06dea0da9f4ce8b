// The print transaction.
//
// One coordinator owns one in-flight box. Serials are collected one scan at
// a time, the box number is previewed (never committed) while collecting,
// and the print backend is invoked exactly once per box. Records and the
// sequence counter are persisted only after the backend reports success,
// inside a single database transaction. A failed print leaves everything
// exactly as it was so the operator can retry without re-scanning.
//
// Phases: Idle -> Collecting -> Submitting -> (back to Collecting, either
// with an empty box on success or the same box on failure).

use chrono::{Local, NaiveDate};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use crate::config::{resolve_template_path, SETTING_TEMPLATE_ROOT};
use crate::counter::CounterKey;
use crate::db::{Database, PrintRecord, Product};
use crate::error::{CoreError, CoreResult};
use crate::generator::{BoxNumber, BoxNumberGenerator};
use crate::printer::LabelPrinter;
use crate::rules::SnRule;
use crate::validator::{clean_sn, Rejection, SnValidator};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No product selected.
    Idle,
    /// Product selected; serials accepted one at a time.
    Collecting,
    /// Box reached full quantity; next step is the print call.
    Submitting,
}

/// Outcome of one scan. Rejections carry the operator-facing reason and
/// never change the box.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    Accepted { slot: u32, box_full: bool },
    Rejected(Rejection),
}

/// Summary of a successfully committed box.
#[derive(Debug, Clone)]
pub struct BoxCommit {
    pub box_no: String,
    pub records: usize,
    /// Counter value after the commit; None for a NO_RULE box (printed for
    /// manual tracking, counter untouched).
    pub committed_seq: Option<i64>,
    /// The preview for the next box, already recomputed.
    pub next_preview: String,
}

pub struct PrintTransactionCoordinator<'d> {
    db: &'d mut Database,
    phase: Phase,
    product: Option<Product>,
    sn_rule: Option<SnRule>,
    validator: Option<SnValidator>,
    repair_level: u32,
    prod_date: NaiveDate,
    sns: Vec<String>,
    preview: Option<BoxNumber>,
}

impl<'d> PrintTransactionCoordinator<'d> {
    pub fn new(db: &'d mut Database) -> Self {
        PrintTransactionCoordinator {
            db,
            phase: Phase::Idle,
            product: None,
            sn_rule: None,
            validator: None,
            repair_level: 0,
            prod_date: Local::now().date_naive(),
            sns: Vec::new(),
            preview: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn scanned(&self) -> &[String] {
        &self.sns
    }

    pub fn product(&self) -> Option<&Product> {
        self.product.as_ref()
    }

    /// The box number the next commit will use ("NO_RULE" when unbound).
    pub fn preview_text(&self) -> Option<&str> {
        self.preview.as_ref().map(BoxNumber::display_text)
    }

    // ========================================================================
    // TRANSITIONS
    // ========================================================================

    /// Select the product to build boxes for. Clears any in-flight box and
    /// compiles the serial validator for this product + repair level.
    pub fn select_product(&mut self, product_id: i64, repair_level: u32) -> CoreResult<()> {
        let product = self
            .db
            .get_product(product_id)?
            .ok_or_else(|| CoreError::ProductNotFound(product_id.to_string()))?;

        let sn_rule = match product.sn_rule_id {
            Some(id) => self.db.get_sn_rule(id)?,
            None => None,
        };

        self.validator = Some(SnValidator::compile(
            &product,
            sn_rule.as_ref(),
            repair_level,
        ));
        self.product = Some(product);
        self.sn_rule = sn_rule;
        self.repair_level = repair_level;
        self.sns.clear();
        self.refresh_preview()?;
        self.phase = Phase::Collecting;
        Ok(())
    }

    /// Change the repair/batch level mid-session. Recompiles the validator
    /// (the `{BATCH}` digit changes) and moves the preview to the new
    /// counter range.
    pub fn set_repair_level(&mut self, repair_level: u32) -> CoreResult<()> {
        self.repair_level = repair_level;
        if let Some(product) = &self.product {
            self.validator = Some(SnValidator::compile(
                product,
                self.sn_rule.as_ref(),
                repair_level,
            ));
            self.refresh_preview()?;
        }
        Ok(())
    }

    /// Change the production date printed on the label and used for the
    /// date codes and the counter key.
    pub fn set_prod_date(&mut self, date: NaiveDate) -> CoreResult<()> {
        self.prod_date = date;
        if self.product.is_some() {
            self.refresh_preview()?;
        }
        Ok(())
    }

    /// Drop the product selection and the in-flight box.
    pub fn clear(&mut self) {
        self.phase = Phase::Idle;
        self.product = None;
        self.sn_rule = None;
        self.validator = None;
        self.sns.clear();
        self.preview = None;
    }

    /// Accept or reject one scanned serial. Rejections leave the box
    /// untouched. Reaching the product's full quantity moves the box to
    /// Submitting; the caller decides when to call [`submit`].
    ///
    /// [`submit`]: Self::submit
    pub fn scan(&mut self, raw: &str) -> CoreResult<ScanOutcome> {
        let Some(product) = self.product.clone() else {
            return Err(CoreError::NoProductSelected);
        };
        // Fullness is checked against the serial count, not just the phase:
        // a failed submit must not reopen a full box to a sixth serial.
        if self.phase == Phase::Submitting
            || (product.qty > 0 && self.sns.len() as u32 >= product.qty)
        {
            return Err(CoreError::BoxFull);
        }

        let sn = clean_sn(raw).to_uppercase();
        if sn.is_empty() {
            return Ok(ScanOutcome::Rejected(Rejection::Empty));
        }

        if self.sns.iter().any(|existing| *existing == sn) {
            warn!(%sn, "rejected: duplicate in current box");
            return Ok(ScanOutcome::Rejected(Rejection::DuplicateInBox));
        }

        // History check comes before format validation, every time: a unit
        // must never land in two boxes even if the rule has changed since.
        if self.db.sn_exists(&sn)? {
            warn!(%sn, "rejected: already printed");
            return Ok(ScanOutcome::Rejected(Rejection::AlreadyPrinted));
        }

        if let Some(validator) = &self.validator {
            if let Err(rejection) = validator.validate(&sn) {
                warn!(%sn, %rejection, "rejected by serial rule");
                return Ok(ScanOutcome::Rejected(rejection));
            }
        }

        self.sns.push(sn);
        let slot = self.sns.len() as u32;

        // Redisplay is idempotent; the number itself cannot move while the
        // counter is uncommitted.
        self.refresh_preview()?;

        let box_full = product.qty > 0 && slot >= product.qty;
        if box_full {
            self.phase = Phase::Submitting;
        }
        debug!(slot, box_full, "serial accepted");

        Ok(ScanOutcome::Accepted { slot, box_full })
    }

    /// Remove serials by their 1-based slots. Allowed any time before the
    /// print call; never touches the counter. Later serials shift down.
    pub fn remove_slots(&mut self, slots: &[u32]) {
        let mut sorted: Vec<u32> = slots.to_vec();
        sorted.sort_unstable();
        sorted.dedup();

        for slot in sorted.into_iter().rev() {
            let index = slot as usize;
            if index >= 1 && index <= self.sns.len() {
                self.sns.remove(index - 1);
            }
        }

        if self.phase == Phase::Submitting {
            if let Some(product) = &self.product {
                if (self.sns.len() as u32) < product.qty {
                    self.phase = Phase::Collecting;
                }
            }
        }
    }

    /// Print the box and, on confirmed success, persist its records and
    /// advance the counter - both in one database transaction. On any
    /// failure the box stays as-is for a retry.
    pub fn submit(&mut self, printer: &mut dyn LabelPrinter) -> CoreResult<BoxCommit> {
        let Some(product) = self.product.clone() else {
            return Err(CoreError::NoProductSelected);
        };
        if self.sns.is_empty() {
            return Err(CoreError::EmptyBox);
        }

        self.phase = Phase::Submitting;
        if self.preview.is_none() {
            self.refresh_preview()?;
        }
        let preview = self.preview.clone().unwrap_or(BoxNumber::NoRuleBound);
        let box_no = preview.display_text().to_string();

        // Resolve the template before touching the backend: a missing file
        // is a configuration error, not a print failure.
        let root = self.db.get_setting(SETTING_TEMPLATE_ROOT)?;
        let template = resolve_template_path(root.as_deref(), &product.template_path);
        if product.template_path.is_empty() || !template.exists() {
            self.reopen_after_failure();
            return Err(CoreError::TemplateMissing(template));
        }

        let fields = self.build_fields(&product, &box_no);

        if let Err(e) = printer.print(&template, &fields) {
            warn!(%box_no, error = %e, "print backend failed; box preserved");
            self.reopen_after_failure();
            return Err(CoreError::PrintBackendFailure(e.to_string()));
        }

        // Counter advances only for a generated number. A NO_RULE box may
        // still be printed for manual tracking but must not burn a sequence
        // under a degenerate key.
        let counter_key = match (&preview, product.rule_id) {
            (BoxNumber::Generated { .. }, Some(rule_id)) => Some(CounterKey::new(
                product.id,
                rule_id,
                self.prod_date,
                self.repair_level,
            )),
            _ => None,
        };

        let printed_at = Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
        let prod_date = self.prod_date.format("%Y-%m-%d").to_string();
        let records: Vec<PrintRecord> = self
            .sns
            .iter()
            .enumerate()
            .map(|(i, sn)| PrintRecord {
                id: 0,
                box_no: box_no.clone(),
                slot: (i + 1) as u32,
                name: product.name.clone(),
                spec: product.spec.clone(),
                model: product.model.clone(),
                color: product.color.clone(),
                code69: product.code69.clone(),
                sn: sn.clone(),
                prod_date: prod_date.clone(),
                printed_at: printed_at.clone(),
            })
            .collect();

        let committed_seq = match self.db.commit_box(&records, counter_key.as_ref()) {
            Ok(seq) => seq,
            Err(e) => {
                // The label is on the box but nothing was persisted. Keep
                // the serials so the failure is visible and recoverable.
                warn!(%box_no, error = %e, "commit failed after print");
                self.reopen_after_failure();
                return Err(e);
            }
        };

        info!(
            %box_no,
            records = records.len(),
            seq = ?committed_seq,
            "box committed"
        );

        // Start the next box: same product, empty list, fresh preview.
        self.sns.clear();
        self.phase = Phase::Collecting;
        self.refresh_preview()?;

        Ok(BoxCommit {
            box_no,
            records: records.len(),
            committed_seq,
            next_preview: self.preview_text().unwrap_or("NO_RULE").to_string(),
        })
    }

    /// Distinct boxes already printed today for the selected product.
    /// Display only.
    pub fn boxes_printed_today(&self) -> CoreResult<i64> {
        let Some(product) = &self.product else {
            return Err(CoreError::NoProductSelected);
        };
        self.db
            .boxes_printed_on(&product.name, Local::now().date_naive())
    }

    // ========================================================================
    // INTERNALS
    // ========================================================================

    /// After a failed submit the box is preserved; if it is still at full
    /// quantity it also stays closed to further scans.
    fn reopen_after_failure(&mut self) {
        let full = self
            .product
            .as_ref()
            .is_some_and(|p| p.qty > 0 && (self.sns.len() as u32) >= p.qty);
        self.phase = if full {
            Phase::Submitting
        } else {
            Phase::Collecting
        };
    }

    fn refresh_preview(&mut self) -> CoreResult<()> {
        let Some(product) = &self.product else {
            self.preview = None;
            return Ok(());
        };
        let number = BoxNumberGenerator::new(self.db).preview_on(
            product,
            self.repair_level,
            self.prod_date,
        )?;
        self.preview = Some(number);
        Ok(())
    }

    /// The flat map handed to the print backend: mapped product attributes,
    /// box number, batch, production date, and one entry per slot with
    /// empty strings for unfilled slots (so the template prints blank
    /// instead of a stale default).
    fn build_fields(&self, product: &Product, box_no: &str) -> BTreeMap<String, String> {
        let mapping = self.db.field_mapping();

        let source: BTreeMap<&str, String> = [
            ("name", product.name.clone()),
            ("spec", product.spec.clone()),
            ("model", product.model.clone()),
            ("color", product.color.clone()),
            ("sn4", product.sn4.clone()),
            ("sku", product.sku.clone()),
            ("code69", product.code69.trim().to_string()),
            ("qty", self.sns.len().to_string()),
            ("weight", product.weight.clone()),
            ("box_no", box_no.to_string()),
            ("prod_date", self.prod_date.format("%Y-%m-%d").to_string()),
            ("batch", self.repair_level.to_string()),
        ]
        .into_iter()
        .collect();

        let mut fields = BTreeMap::new();
        for (logical, backend) in &mapping {
            if let Some(value) = source.get(logical.as_str()) {
                fields.insert(backend.clone(), value.clone());
            }
        }

        // The barcode must never print blank because of a mapping hole.
        if !mapping.contains_key("code69") {
            fields.insert("Code69".to_string(), product.code69.trim().to_string());
        }
        if !mapping.contains_key("batch") {
            fields.insert("batch".to_string(), self.repair_level.to_string());
        }
        if !mapping.contains_key("prod_date") {
            fields.insert(
                "prod_date".to_string(),
                self.prod_date.format("%Y-%m-%d").to_string(),
            );
        }

        let full_qty = (product.qty as usize).max(self.sns.len());
        for slot in 0..full_qty {
            let value = self.sns.get(slot).cloned().unwrap_or_default();
            fields.insert((slot + 1).to_string(), value);
        }

        fields
    }
}

/// Reprint the label for an already-committed box from its stored records.
/// Rebuilds the field map the way the original print did and invokes the
/// backend again; records and the counter are never touched. Returns the
/// number of serials on the label.
pub fn reprint_box(
    db: &Database,
    printer: &mut dyn LabelPrinter,
    box_no: &str,
) -> CoreResult<usize> {
    let records = db.records_for_box(box_no)?;
    let Some(first) = records.first() else {
        return Err(CoreError::BoxNotFound(box_no.to_string()));
    };

    // The product row supplies what records do not carry: the template
    // path, the full box size, sku and weight.
    let product = db
        .get_product_by_name(&first.name)?
        .ok_or_else(|| CoreError::ProductNotFound(first.name.clone()))?;

    let root = db.get_setting(SETTING_TEMPLATE_ROOT)?;
    let template = resolve_template_path(root.as_deref(), &product.template_path);
    if product.template_path.is_empty() || !template.exists() {
        return Err(CoreError::TemplateMissing(template));
    }

    let mapping = db.field_mapping();
    let source: BTreeMap<&str, String> = [
        ("name", product.name.clone()),
        ("spec", first.spec.clone()),
        ("model", first.model.clone()),
        ("color", first.color.clone()),
        ("sn4", first.sn.chars().take(4).collect()),
        ("sku", product.sku.clone()),
        ("code69", first.code69.trim().to_string()),
        ("qty", records.len().to_string()),
        ("weight", product.weight.clone()),
        ("box_no", box_no.to_string()),
        ("prod_date", first.prod_date.clone()),
    ]
    .into_iter()
    .collect();

    let mut fields = BTreeMap::new();
    for (logical, backend) in &mapping {
        if let Some(value) = source.get(logical.as_str()) {
            fields.insert(backend.clone(), value.clone());
        }
    }
    // Same barcode and date guarantees as the first print.
    if !mapping.contains_key("code69") {
        fields.insert("Code69".to_string(), first.code69.trim().to_string());
    }
    if !mapping.contains_key("prod_date") {
        fields.insert("prod_date".to_string(), first.prod_date.clone());
    }

    // Serials go back to their packed slots; a partial box reprints its
    // blanks.
    let full_qty = (product.qty as usize).max(records.len());
    for slot in 1..=full_qty {
        fields.insert(slot.to_string(), String::new());
    }
    for record in &records {
        fields.insert(record.slot.to_string(), record.sn.clone());
    }

    if let Err(e) = printer.print(&template, &fields) {
        warn!(%box_no, error = %e, "reprint failed");
        return Err(CoreError::PrintBackendFailure(e.to_string()));
    }

    info!(%box_no, serials = records.len(), "box reprinted");
    Ok(records.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::printer::PrintError;
    use std::path::Path;

    /// Scripted backend: succeeds or fails on demand and keeps every job
    /// it was handed.
    struct FakePrinter {
        fail_next: bool,
        jobs: Vec<BTreeMap<String, String>>,
    }

    impl FakePrinter {
        fn new() -> Self {
            FakePrinter {
                fail_next: false,
                jobs: Vec::new(),
            }
        }
    }

    impl LabelPrinter for FakePrinter {
        fn print(
            &mut self,
            _template: &Path,
            fields: &BTreeMap<String, String>,
        ) -> Result<(), PrintError> {
            if self.fail_next {
                self.fail_next = false;
                return Err(PrintError::Unavailable("driver offline".to_string()));
            }
            self.jobs.push(fields.clone());
            Ok(())
        }
    }

    struct Fixture {
        db: Database,
        product_id: i64,
        _template_dir: tempfile::TempDir,
    }

    fn fixture(with_box_rule: bool, with_sn_rule: bool) -> Fixture {
        let db = Database::open_in_memory().unwrap();

        let template_dir = tempfile::tempdir().unwrap();
        std::fs::write(template_dir.path().join("widget.btw"), b"template").unwrap();
        db.set_setting(SETTING_TEMPLATE_ROOT, template_dir.path().to_str().unwrap())
            .unwrap();

        let rule_id = if with_box_rule {
            Some(
                db.insert_box_rule("monthly", "{SN4}-{YYYY}{MM}-{SEQ4}")
                    .unwrap(),
            )
        } else {
            None
        };
        let sn_rule_id = if with_sn_rule {
            Some(
                db.insert_sn_rule("standard", "{SN4}{BATCH}{SEQ4}", Some(9))
                    .unwrap(),
            )
        } else {
            None
        };

        let product_id = db
            .upsert_product(&Product {
                name: "Widget".to_string(),
                spec: "STD".to_string(),
                code69: "6901234567890".to_string(),
                sn4: "ABCD".to_string(),
                qty: 5,
                template_path: "widget.btw".to_string(),
                rule_id,
                sn_rule_id,
                ..Default::default()
            })
            .unwrap();

        Fixture {
            db,
            product_id,
            _template_dir: template_dir,
        }
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 15).unwrap()
    }

    fn scan_ok(coordinator: &mut PrintTransactionCoordinator<'_>, sn: &str) -> ScanOutcome {
        let outcome = coordinator.scan(sn).unwrap();
        assert!(
            matches!(outcome, ScanOutcome::Accepted { .. }),
            "expected {sn} to be accepted, got {outcome:?}"
        );
        outcome
    }

    #[test]
    fn test_starts_idle_and_selection_starts_collecting() {
        let mut fx = fixture(true, true);
        let mut coordinator = PrintTransactionCoordinator::new(&mut fx.db);
        assert_eq!(coordinator.phase(), Phase::Idle);
        assert!(matches!(
            coordinator.scan("ABCD00001"),
            Err(CoreError::NoProductSelected)
        ));

        coordinator.select_product(fx.product_id, 0).unwrap();
        assert_eq!(coordinator.phase(), Phase::Collecting);
        assert!(coordinator.preview_text().is_some());
    }

    #[test]
    fn test_scan_rejections_leave_state_untouched() {
        let mut fx = fixture(true, true);
        let mut coordinator = PrintTransactionCoordinator::new(&mut fx.db);
        coordinator.select_product(fx.product_id, 2).unwrap();
        coordinator.set_prod_date(date()).unwrap();

        scan_ok(&mut coordinator, "ABCD20001");

        // Duplicate in box.
        assert_eq!(
            coordinator.scan("ABCD20001").unwrap(),
            ScanOutcome::Rejected(Rejection::DuplicateInBox)
        );
        // Wrong prefix.
        assert_eq!(
            coordinator.scan("XXXX20002").unwrap(),
            ScanOutcome::Rejected(Rejection::PrefixMismatch {
                required: "ABCD".to_string()
            })
        );
        // Wrong digit count (caught by the fixed length first).
        assert_eq!(
            coordinator.scan("ABCD2001").unwrap(),
            ScanOutcome::Rejected(Rejection::LengthMismatch { required: 9 })
        );

        assert_eq!(coordinator.scanned().len(), 1);
        assert_eq!(coordinator.phase(), Phase::Collecting);
    }

    #[test]
    fn test_scanner_suffix_and_case_are_normalized() {
        let mut fx = fixture(true, true);
        let mut coordinator = PrintTransactionCoordinator::new(&mut fx.db);
        coordinator.select_product(fx.product_id, 2).unwrap();

        scan_ok(&mut coordinator, "abcd20001\r\n");
        assert_eq!(coordinator.scanned(), ["ABCD20001"]);

        // The same unit scanned again, differently mangled, is a duplicate.
        assert_eq!(
            coordinator.scan("ABCD20001\u{feff}").unwrap(),
            ScanOutcome::Rejected(Rejection::DuplicateInBox)
        );
    }

    #[test]
    fn test_full_box_success_commits_records_and_counter_once() {
        let mut fx = fixture(true, true);
        let mut coordinator = PrintTransactionCoordinator::new(&mut fx.db);
        coordinator.select_product(fx.product_id, 2).unwrap();
        coordinator.set_prod_date(date()).unwrap();
        assert_eq!(coordinator.preview_text(), Some("ABCD-202403-20001"));

        for i in 1..=5 {
            let outcome = scan_ok(&mut coordinator, &format!("ABCD2000{i}"));
            assert_eq!(
                outcome,
                ScanOutcome::Accepted {
                    slot: i,
                    box_full: i == 5
                }
            );
        }
        assert_eq!(coordinator.phase(), Phase::Submitting);

        let mut printer = FakePrinter::new();
        let commit = coordinator.submit(&mut printer).unwrap();

        assert_eq!(commit.box_no, "ABCD-202403-20001");
        assert_eq!(commit.records, 5);
        assert_eq!(commit.committed_seq, Some(20_001));
        assert_eq!(commit.next_preview, "ABCD-202403-20002");

        // Box reset for the next one.
        assert_eq!(coordinator.phase(), Phase::Collecting);
        assert!(coordinator.scanned().is_empty());

        // Records landed with slots 1..5.
        let records = fx.db.records_for_box("ABCD-202403-20001").unwrap();
        assert_eq!(records.len(), 5);
        for (i, record) in records.iter().enumerate() {
            assert_eq!(record.slot as usize, i + 1);
        }
        assert_eq!(printer.jobs.len(), 1, "backend invoked exactly once");
    }

    #[test]
    fn test_print_failure_preserves_box_and_counter() {
        let mut fx = fixture(true, true);
        let mut coordinator = PrintTransactionCoordinator::new(&mut fx.db);
        coordinator.select_product(fx.product_id, 2).unwrap();
        coordinator.set_prod_date(date()).unwrap();

        for i in 1..=5 {
            scan_ok(&mut coordinator, &format!("ABCD2000{i}"));
        }

        let mut printer = FakePrinter::new();
        printer.fail_next = true;
        let err = coordinator.submit(&mut printer).unwrap_err();
        assert!(matches!(err, CoreError::PrintBackendFailure(_)));

        // Nothing persisted; the full box stays intact and closed.
        assert_eq!(coordinator.phase(), Phase::Submitting);
        assert_eq!(coordinator.scanned().len(), 5);
        assert_eq!(fx.db.count_records().unwrap(), 0);

        // Retry with a working backend from the same state.
        let mut coordinator = PrintTransactionCoordinator::new(&mut fx.db);
        coordinator.select_product(fx.product_id, 2).unwrap();
        coordinator.set_prod_date(date()).unwrap();
        for i in 1..=5 {
            scan_ok(&mut coordinator, &format!("ABCD2000{i}"));
        }
        let commit = coordinator.submit(&mut FakePrinter::new()).unwrap();
        assert_eq!(commit.committed_seq, Some(20_001), "counter was never burned");
    }

    #[test]
    fn test_failed_print_keeps_full_box_closed_to_scans() {
        let mut fx = fixture(true, true);
        let mut coordinator = PrintTransactionCoordinator::new(&mut fx.db);
        coordinator.select_product(fx.product_id, 2).unwrap();
        coordinator.set_prod_date(date()).unwrap();
        for i in 1..=5 {
            scan_ok(&mut coordinator, &format!("ABCD2000{i}"));
        }

        let mut printer = FakePrinter::new();
        printer.fail_next = true;
        coordinator.submit(&mut printer).unwrap_err();

        // A sixth serial must not slip into a 5-unit box before the retry.
        assert!(matches!(
            coordinator.scan("ABCD20006"),
            Err(CoreError::BoxFull)
        ));
        assert_eq!(coordinator.scanned().len(), 5);

        // Retry from the same state still commits exactly the five.
        let commit = coordinator.submit(&mut FakePrinter::new()).unwrap();
        assert_eq!(commit.records, 5);
    }

    #[test]
    fn test_preview_is_stable_while_collecting() {
        let mut fx = fixture(true, true);
        let mut coordinator = PrintTransactionCoordinator::new(&mut fx.db);
        coordinator.select_product(fx.product_id, 2).unwrap();
        coordinator.set_prod_date(date()).unwrap();

        let before = coordinator.preview_text().unwrap().to_string();
        scan_ok(&mut coordinator, "ABCD20001");
        scan_ok(&mut coordinator, "ABCD20002");
        assert_eq!(coordinator.preview_text().unwrap(), before);
    }

    #[test]
    fn test_already_printed_serial_is_rejected_across_boxes() {
        let mut fx = fixture(true, true);
        let mut coordinator = PrintTransactionCoordinator::new(&mut fx.db);
        coordinator.select_product(fx.product_id, 2).unwrap();
        coordinator.set_prod_date(date()).unwrap();

        for i in 1..=5 {
            scan_ok(&mut coordinator, &format!("ABCD2000{i}"));
        }
        coordinator.submit(&mut FakePrinter::new()).unwrap();

        assert_eq!(
            coordinator.scan("ABCD20001").unwrap(),
            ScanOutcome::Rejected(Rejection::AlreadyPrinted)
        );
    }

    #[test]
    fn test_manual_removal_reopens_a_full_box() {
        let mut fx = fixture(true, true);
        let mut coordinator = PrintTransactionCoordinator::new(&mut fx.db);
        coordinator.select_product(fx.product_id, 2).unwrap();

        for i in 1..=5 {
            scan_ok(&mut coordinator, &format!("ABCD2000{i}"));
        }
        assert_eq!(coordinator.phase(), Phase::Submitting);

        coordinator.remove_slots(&[2, 4]);
        assert_eq!(coordinator.scanned(), ["ABCD20001", "ABCD20003", "ABCD20005"]);
        assert_eq!(coordinator.phase(), Phase::Collecting);

        // Out-of-range slots are ignored.
        coordinator.remove_slots(&[0, 99]);
        assert_eq!(coordinator.scanned().len(), 3);
    }

    #[test]
    fn test_partial_box_pads_remaining_slots_with_blanks() {
        let mut fx = fixture(true, true);
        let mut coordinator = PrintTransactionCoordinator::new(&mut fx.db);
        coordinator.select_product(fx.product_id, 2).unwrap();
        coordinator.set_prod_date(date()).unwrap();

        scan_ok(&mut coordinator, "ABCD20001");
        scan_ok(&mut coordinator, "ABCD20002");

        let mut printer = FakePrinter::new();
        let commit = coordinator.submit(&mut printer).unwrap();
        assert_eq!(commit.records, 2);

        let job = &printer.jobs[0];
        assert_eq!(job.get("1").map(String::as_str), Some("ABCD20001"));
        assert_eq!(job.get("2").map(String::as_str), Some("ABCD20002"));
        // Unfilled slots print blank, not the template default.
        assert_eq!(job.get("3").map(String::as_str), Some(""));
        assert_eq!(job.get("5").map(String::as_str), Some(""));
        // Mapped product fields and the box number travel along.
        assert_eq!(job.get("xianghao").map(String::as_str), Some("ABCD-202403-20001"));
        assert_eq!(job.get("mingcheng").map(String::as_str), Some("Widget"));
        assert_eq!(job.get("shuliang").map(String::as_str), Some("2"));
        assert_eq!(job.get("69").map(String::as_str), Some("6901234567890"));
    }

    #[test]
    fn test_no_rule_box_prints_but_never_commits_counter() {
        let mut fx = fixture(false, false);
        let mut coordinator = PrintTransactionCoordinator::new(&mut fx.db);
        coordinator.select_product(fx.product_id, 0).unwrap();
        assert_eq!(coordinator.preview_text(), Some("NO_RULE"));

        scan_ok(&mut coordinator, "ABCD00001");
        let commit = coordinator.submit(&mut FakePrinter::new()).unwrap();

        assert_eq!(commit.box_no, "NO_RULE");
        assert_eq!(commit.committed_seq, None);
        assert_eq!(fx.db.count_records().unwrap(), 1);

        // No counter row was created under any key.
        let counters: i64 = fx
            .db
            .conn()
            .query_row("SELECT COUNT(*) FROM box_counters", [], |row| row.get(0))
            .unwrap();
        assert_eq!(counters, 0);
    }

    #[test]
    fn test_missing_template_is_reported_before_printing() {
        let mut fx = fixture(true, true);
        fx.db
            .upsert_product(&Product {
                name: "Widget".to_string(),
                sn4: "ABCD".to_string(),
                qty: 5,
                template_path: "nope.btw".to_string(),
                rule_id: fx.db.get_product(fx.product_id).unwrap().unwrap().rule_id,
                ..Default::default()
            })
            .unwrap();

        let mut coordinator = PrintTransactionCoordinator::new(&mut fx.db);
        coordinator.select_product(fx.product_id, 0).unwrap();
        scan_ok(&mut coordinator, "ABCD00001");

        let mut printer = FakePrinter::new();
        let err = coordinator.submit(&mut printer).unwrap_err();
        assert!(matches!(err, CoreError::TemplateMissing(_)));
        assert!(printer.jobs.is_empty(), "backend must not be invoked");
        assert_eq!(coordinator.scanned().len(), 1, "box preserved");
    }

    #[test]
    fn test_reprint_replays_stored_box_without_touching_counter() {
        let mut fx = fixture(true, true);
        let mut coordinator = PrintTransactionCoordinator::new(&mut fx.db);
        coordinator.select_product(fx.product_id, 2).unwrap();
        coordinator.set_prod_date(date()).unwrap();
        scan_ok(&mut coordinator, "ABCD20001");
        scan_ok(&mut coordinator, "ABCD20002");
        let commit = coordinator.submit(&mut FakePrinter::new()).unwrap();

        let mut printer = FakePrinter::new();
        let serials = reprint_box(&fx.db, &mut printer, &commit.box_no).unwrap();
        assert_eq!(serials, 2);

        // Same label content as the first print.
        let job = &printer.jobs[0];
        assert_eq!(
            job.get("xianghao").map(String::as_str),
            Some("ABCD-202403-20001")
        );
        assert_eq!(job.get("mingcheng").map(String::as_str), Some("Widget"));
        assert_eq!(job.get("shuliang").map(String::as_str), Some("2"));
        assert_eq!(job.get("1").map(String::as_str), Some("ABCD20001"));
        assert_eq!(job.get("2").map(String::as_str), Some("ABCD20002"));
        assert_eq!(job.get("5").map(String::as_str), Some(""));

        // No new records, no counter movement.
        assert_eq!(fx.db.count_records().unwrap(), 2);
        let counter: i64 = fx
            .db
            .conn()
            .query_row("SELECT current_val FROM box_counters", [], |row| row.get(0))
            .unwrap();
        assert_eq!(counter, 20_001);

        assert!(matches!(
            reprint_box(&fx.db, &mut printer, "NO-SUCH-BOX"),
            Err(CoreError::BoxNotFound(_))
        ));
    }

    #[test]
    fn test_submit_empty_box_is_refused() {
        let mut fx = fixture(true, true);
        let mut coordinator = PrintTransactionCoordinator::new(&mut fx.db);
        coordinator.select_product(fx.product_id, 0).unwrap();

        assert!(matches!(
            coordinator.submit(&mut FakePrinter::new()),
            Err(CoreError::EmptyBox)
        ));
    }

    #[test]
    fn test_repair_level_switch_recompiles_validator_and_preview() {
        let mut fx = fixture(true, true);
        let mut coordinator = PrintTransactionCoordinator::new(&mut fx.db);
        coordinator.select_product(fx.product_id, 0).unwrap();
        coordinator.set_prod_date(date()).unwrap();
        assert_eq!(coordinator.preview_text(), Some("ABCD-202403-0001"));

        // Batch 0 serials pass, batch 2 serials do not.
        scan_ok(&mut coordinator, "ABCD00001");
        assert!(matches!(
            coordinator.scan("ABCD20002").unwrap(),
            ScanOutcome::Rejected(_)
        ));

        coordinator.set_repair_level(2).unwrap();
        assert_eq!(coordinator.preview_text(), Some("ABCD-202403-20001"));
        assert!(matches!(
            coordinator.scan("ABCD20002").unwrap(),
            ScanOutcome::Accepted { .. }
        ));
    }
}
