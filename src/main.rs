use anyhow::{bail, Context, Result};
use std::env;
use std::path::{Path, PathBuf};

use boxline::{export_records, import_products, Database, RecordQuery};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = env::args().collect();
    let command = args.get(1).map(String::as_str).unwrap_or("help");

    match command {
        "init" => run_init(&db_path()),
        "import-products" => {
            let csv = args
                .get(2)
                .context("Usage: boxline import-products <csv>")?;
            run_import_products(&db_path(), Path::new(csv))
        }
        "export-records" => {
            let csv = args
                .get(2)
                .context("Usage: boxline export-records <csv> [keyword]")?;
            let keyword = args.get(3).cloned().unwrap_or_default();
            run_export_records(&db_path(), Path::new(csv), keyword)
        }
        "backup" => run_backup(&db_path()),
        "restore" => {
            let file = args
                .get(2)
                .context("Usage: boxline restore <backup-file>")?;
            run_restore(&db_path(), Path::new(file))
        }
        "status" => run_status(&db_path()),
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            print_usage();
            bail!("unknown command: {other}");
        }
    }
}

fn db_path() -> PathBuf {
    env::var("BOXLINE_DB")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("boxline.db"))
}

fn print_usage() {
    println!("boxline v{}", boxline::VERSION);
    println!();
    println!("Usage: boxline <command>");
    println!();
    println!("Commands:");
    println!("  init                      Create the database and default settings");
    println!("  import-products <csv>     Import/refresh the product catalog");
    println!("  export-records <csv> [kw] Export print history (optionally filtered)");
    println!("  backup                    Copy the database into the backup directory");
    println!("  restore <backup-file>     Replace the database with a backup copy");
    println!("  status                    Show catalog and history counts");
    println!();
    println!("The database path defaults to ./boxline.db (override with BOXLINE_DB).");
}

fn run_init(db_path: &Path) -> Result<()> {
    let db = Database::open(db_path).context("Failed to open database")?;
    let mapping = db.field_mapping();

    println!("✓ Database ready: {}", db_path.display());
    println!("✓ Field mapping entries: {}", mapping.len());
    Ok(())
}

fn run_import_products(db_path: &Path, csv: &Path) -> Result<()> {
    let db = Database::open(db_path).context("Failed to open database")?;

    let imported = import_products(&db, csv)?;
    println!("✓ Imported {} products from {}", imported, csv.display());
    Ok(())
}

fn run_export_records(db_path: &Path, csv: &Path, keyword: String) -> Result<()> {
    let db = Database::open(db_path).context("Failed to open database")?;

    let query = RecordQuery {
        keyword,
        ..Default::default()
    };
    let written = export_records(&db, csv, &query)?;
    println!("✓ Exported {} records to {}", written, csv.display());
    Ok(())
}

fn run_backup(db_path: &Path) -> Result<()> {
    let db = Database::open(db_path).context("Failed to open database")?;

    let target = db.backup(None).context("Backup failed")?;
    println!("✓ Backup written: {}", target.display());
    Ok(())
}

fn run_restore(db_path: &Path, backup: &Path) -> Result<()> {
    let mut db = Database::open(db_path).context("Failed to open database")?;

    db.restore(backup).context("Restore failed")?;
    println!("✓ Restored from {}", backup.display());
    Ok(())
}

fn run_status(db_path: &Path) -> Result<()> {
    let db = Database::open(db_path).context("Failed to open database")?;

    let products = db.list_products()?;
    let records = db.count_records()?;

    println!("Database: {}", db_path.display());
    println!("Products: {}", products.len());
    println!("Records:  {}", records);
    for product in &products {
        let rule = match product.rule_id {
            Some(id) => db
                .get_box_rule(id)?
                .map(|r| r.name)
                .unwrap_or_else(|| "missing".to_string()),
            None => "none".to_string(),
        };
        println!(
            "  [{}] {} (sn4 {}, box of {}, rule: {})",
            product.id, product.name, product.sn4, product.qty, rule
        );
    }
    Ok(())
}
