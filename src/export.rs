// CSV import/export for the product catalog and the print history.

use anyhow::{Context, Result};
use std::path::Path;

use crate::db::{Database, Product, RecordQuery};

/// Load products from a CSV file and upsert them by SN prefix.
/// Returns how many rows were imported.
pub fn import_products(db: &Database, csv_path: &Path) -> Result<usize> {
    let mut reader = csv::Reader::from_path(csv_path)
        .with_context(|| format!("Failed to open product CSV: {}", csv_path.display()))?;

    let mut imported = 0;
    for result in reader.deserialize() {
        let product: Product = result.context("Failed to deserialize product row")?;
        db.upsert_product(&product)
            .with_context(|| format!("Failed to store product '{}'", product.sn4))?;
        imported += 1;
    }

    Ok(imported)
}

/// Write matching print records to a CSV file. Returns how many rows were
/// written.
pub fn export_records(db: &Database, csv_path: &Path, query: &RecordQuery) -> Result<usize> {
    let records = db.search_records(query).context("History query failed")?;

    let mut writer = csv::Writer::from_path(csv_path)
        .with_context(|| format!("Failed to create CSV: {}", csv_path.display()))?;
    for record in &records {
        writer
            .serialize(record)
            .context("Failed to write record row")?;
    }
    writer.flush().context("Failed to flush CSV")?;

    Ok(records.len())
}
