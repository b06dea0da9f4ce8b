use chrono::{Local, NaiveDate};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::config::{
    default_field_mapping, SETTING_BACKUP_PATH, SETTING_FIELD_MAPPING, SETTING_TEMPLATE_ROOT,
};
use crate::counter::{CounterKey, SequenceCounterStore};
use crate::error::{CoreError, CoreResult};
use crate::rules::{BoxRule, SnRule};

/// A product the station builds boxes for. `sn4` is the unique 4-character
/// serial prefix; `qty` is the full box size that closes a box automatically.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Product {
    #[serde(default)]
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub spec: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub color: String,
    pub sn4: String,
    #[serde(default)]
    pub sku: String,
    #[serde(default)]
    pub code69: String,
    pub qty: u32,
    #[serde(default)]
    pub weight: String,
    #[serde(default)]
    pub template_path: String,
    #[serde(default)]
    pub rule_id: Option<i64>,
    #[serde(default)]
    pub sn_rule_id: Option<i64>,
}

/// One printed unit: its box number, its 1-based slot inside the box, the
/// product attributes snapshotted at print time, and timestamps.
/// Append-only; written only as part of a successful commit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrintRecord {
    #[serde(default)]
    pub id: i64,
    pub box_no: String,
    pub slot: u32,
    pub name: String,
    pub spec: String,
    pub model: String,
    pub color: String,
    pub code69: String,
    pub sn: String,
    pub prod_date: String,
    pub printed_at: String,
}

/// History search filter. Keyword matches SN or box number as a substring.
#[derive(Debug, Clone, Default)]
pub struct RecordQuery {
    pub keyword: String,
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    pub limit: Option<u32>,
}

pub struct Database {
    conn: Connection,
    path: Option<PathBuf>,
}

impl Database {
    pub fn open<P: AsRef<Path>>(path: P) -> CoreResult<Self> {
        let conn = Connection::open(path.as_ref())?;
        let db = Database {
            conn,
            path: Some(path.as_ref().to_path_buf()),
        };
        db.setup()?;
        Ok(db)
    }

    pub fn open_in_memory() -> CoreResult<Self> {
        let db = Database {
            conn: Connection::open_in_memory()?,
            path: None,
        };
        db.setup()?;
        Ok(db)
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    fn setup(&self) -> CoreResult<()> {
        // WAL for crash recovery; the station must survive power cuts.
        self.conn.pragma_update(None, "journal_mode", "WAL")?;

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS products (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                spec TEXT,
                model TEXT,
                color TEXT,
                sn4 TEXT NOT NULL UNIQUE,
                sku TEXT,
                code69 TEXT,
                qty INTEGER,
                weight TEXT,
                template_path TEXT,
                rule_id INTEGER DEFAULT 0,
                sn_rule_id INTEGER DEFAULT 0
            )",
            [],
        )?;

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS box_rules (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                rule_string TEXT NOT NULL
            )",
            [],
        )?;

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS sn_rules (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                rule_string TEXT NOT NULL,
                length INTEGER DEFAULT 0
            )",
            [],
        )?;

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                box_no TEXT,
                box_sn_seq INTEGER,
                name TEXT,
                spec TEXT,
                model TEXT,
                color TEXT,
                code69 TEXT,
                sn TEXT,
                prod_date TEXT,
                print_date TEXT
            )",
            [],
        )?;

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS settings (key TEXT PRIMARY KEY, value TEXT)",
            [],
        )?;

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS box_counters (key TEXT PRIMARY KEY, current_val INTEGER)",
            [],
        )?;

        self.conn
            .execute("CREATE INDEX IF NOT EXISTS idx_records_sn ON records(sn)", [])?;
        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_records_box_no ON records(box_no)",
            [],
        )?;

        // Seed default settings on first run.
        let mapping_json =
            serde_json::to_string(&default_field_mapping()).unwrap_or_else(|_| "{}".to_string());
        self.conn.execute(
            "INSERT OR IGNORE INTO settings (key, value) VALUES (?1, ?2)",
            params![SETTING_FIELD_MAPPING, mapping_json],
        )?;
        self.conn.execute(
            "INSERT OR IGNORE INTO settings (key, value) VALUES (?1, 'backups')",
            params![SETTING_BACKUP_PATH],
        )?;
        self.conn.execute(
            "INSERT OR IGNORE INTO settings (key, value) VALUES (?1, 'templates')",
            params![SETTING_TEMPLATE_ROOT],
        )?;

        Ok(())
    }

    // ========================================================================
    // SETTINGS
    // ========================================================================

    pub fn get_setting(&self, key: &str) -> CoreResult<Option<String>> {
        let value = self
            .conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn set_setting(&self, key: &str, value: &str) -> CoreResult<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    /// The logical-field -> data-source mapping. A missing or unparseable
    /// settings row falls back to the built-in default mapping.
    pub fn field_mapping(&self) -> BTreeMap<String, String> {
        self.get_setting(SETTING_FIELD_MAPPING)
            .ok()
            .flatten()
            .and_then(|json| serde_json::from_str(&json).ok())
            .unwrap_or_else(default_field_mapping)
    }

    // ========================================================================
    // PRODUCTS
    // ========================================================================

    pub fn get_product(&self, id: i64) -> CoreResult<Option<Product>> {
        let product = self
            .conn
            .query_row(
                "SELECT id, name, spec, model, color, sn4, sku, code69, qty,
                        weight, template_path, rule_id, sn_rule_id
                 FROM products WHERE id = ?1",
                params![id],
                row_to_product,
            )
            .optional()?;
        Ok(product)
    }

    /// Look a product up by its display name. Names are what the records
    /// table stores, so this is the join used when replaying history.
    pub fn get_product_by_name(&self, name: &str) -> CoreResult<Option<Product>> {
        let product = self
            .conn
            .query_row(
                "SELECT id, name, spec, model, color, sn4, sku, code69, qty,
                        weight, template_path, rule_id, sn_rule_id
                 FROM products WHERE name = ?1",
                params![name],
                row_to_product,
            )
            .optional()?;
        Ok(product)
    }

    pub fn list_products(&self) -> CoreResult<Vec<Product>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, spec, model, color, sn4, sku, code69, qty,
                    weight, template_path, rule_id, sn_rule_id
             FROM products ORDER BY name",
        )?;
        let products = stmt
            .query_map([], row_to_product)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(products)
    }

    /// Insert or update a product, keyed by its unique SN prefix.
    /// Returns the row id.
    pub fn upsert_product(&self, product: &Product) -> CoreResult<i64> {
        self.conn.execute(
            "INSERT INTO products (name, spec, model, color, sn4, sku, code69,
                                   qty, weight, template_path, rule_id, sn_rule_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT(sn4) DO UPDATE SET
                name = excluded.name,
                spec = excluded.spec,
                model = excluded.model,
                color = excluded.color,
                sku = excluded.sku,
                code69 = excluded.code69,
                qty = excluded.qty,
                weight = excluded.weight,
                template_path = excluded.template_path,
                rule_id = excluded.rule_id,
                sn_rule_id = excluded.sn_rule_id",
            params![
                product.name,
                product.spec,
                product.model,
                product.color,
                product.sn4,
                product.sku,
                product.code69,
                product.qty,
                product.weight,
                product.template_path,
                product.rule_id.unwrap_or(0),
                product.sn_rule_id.unwrap_or(0),
            ],
        )?;
        let id = self.conn.query_row(
            "SELECT id FROM products WHERE sn4 = ?1",
            params![product.sn4],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    // ========================================================================
    // RULES (read-only inputs to the engine; editing is a config concern)
    // ========================================================================

    pub fn get_box_rule(&self, id: i64) -> CoreResult<Option<BoxRule>> {
        let rule = self
            .conn
            .query_row(
                "SELECT id, name, rule_string FROM box_rules WHERE id = ?1",
                params![id],
                |row| {
                    Ok(BoxRule {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        template: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(rule)
    }

    pub fn get_sn_rule(&self, id: i64) -> CoreResult<Option<SnRule>> {
        let rule = self
            .conn
            .query_row(
                "SELECT id, name, rule_string, length FROM sn_rules WHERE id = ?1",
                params![id],
                |row| {
                    let length: i64 = row.get(3)?;
                    Ok(SnRule {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        template: row.get(2)?,
                        length: if length > 0 { Some(length as usize) } else { None },
                    })
                },
            )
            .optional()?;
        Ok(rule)
    }

    pub fn insert_box_rule(&self, name: &str, template: &str) -> CoreResult<i64> {
        self.conn.execute(
            "INSERT INTO box_rules (name, rule_string) VALUES (?1, ?2)",
            params![name, template],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn insert_sn_rule(
        &self,
        name: &str,
        template: &str,
        length: Option<usize>,
    ) -> CoreResult<i64> {
        self.conn.execute(
            "INSERT INTO sn_rules (name, rule_string, length) VALUES (?1, ?2, ?3)",
            params![name, template, length.unwrap_or(0) as i64],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    // ========================================================================
    // RECORDS
    // ========================================================================

    /// Has this serial ever been printed? Checked before every validation
    /// pass so a unit can never land in two boxes.
    pub fn sn_exists(&self, sn: &str) -> CoreResult<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT id FROM records WHERE sn = ?1 LIMIT 1",
                params![sn],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn count_records(&self) -> CoreResult<i64> {
        let count = self
            .conn
            .query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Distinct boxes printed for a product on the given day. Display only.
    pub fn boxes_printed_on(&self, product_name: &str, date: NaiveDate) -> CoreResult<i64> {
        let day_prefix = format!("{}%", date.format("%Y-%m-%d"));
        let count = self.conn.query_row(
            "SELECT COUNT(DISTINCT box_no) FROM records
             WHERE name = ?1 AND print_date LIKE ?2",
            params![product_name, day_prefix],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn search_records(&self, query: &RecordQuery) -> CoreResult<Vec<PrintRecord>> {
        use rusqlite::types::Value;

        let keyword = format!("%{}%", query.keyword);
        let mut sql = String::from(
            "SELECT id, box_no, box_sn_seq, name, spec, model, color, code69,
                    sn, prod_date, print_date
             FROM records
             WHERE (sn LIKE ?1 OR box_no LIKE ?1)",
        );
        let mut bind: Vec<Value> = vec![Value::Text(keyword)];

        if let Some(from) = query.from {
            sql.push_str(" AND print_date >= ?");
            bind.push(Value::Text(format!("{} 00:00:00", from.format("%Y-%m-%d"))));
        }
        if let Some(to) = query.to {
            sql.push_str(" AND print_date <= ?");
            bind.push(Value::Text(format!("{} 23:59:59", to.format("%Y-%m-%d"))));
        }
        sql.push_str(" ORDER BY id DESC LIMIT ?");
        bind.push(Value::Integer(query.limit.unwrap_or(1000) as i64));

        let mut stmt = self.conn.prepare(&sql)?;
        let records = stmt
            .query_map(rusqlite::params_from_iter(bind), row_to_record)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    pub fn delete_records(&self, ids: &[i64]) -> CoreResult<usize> {
        let mut deleted = 0;
        for id in ids {
            deleted += self
                .conn
                .execute("DELETE FROM records WHERE id = ?1", params![id])?;
        }
        Ok(deleted)
    }

    /// Records for one box, ordered by slot. Used for reprinting a box.
    pub fn records_for_box(&self, box_no: &str) -> CoreResult<Vec<PrintRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, box_no, box_sn_seq, name, spec, model, color, code69,
                    sn, prod_date, print_date
             FROM records WHERE box_no = ?1 ORDER BY box_sn_seq",
        )?;
        let records = stmt
            .query_map(params![box_no], row_to_record)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    // ========================================================================
    // COMMIT BOUNDARY
    // ========================================================================

    /// Persist a printed box: all records plus (optionally) the counter
    /// advance, in ONE transaction. Either everything lands or nothing
    /// does - a counter failure must never leave records behind.
    pub fn commit_box(
        &mut self,
        records: &[PrintRecord],
        counter_key: Option<&CounterKey>,
    ) -> CoreResult<Option<i64>> {
        let tx = self.conn.transaction()?;

        for record in records {
            tx.execute(
                "INSERT INTO records (box_no, box_sn_seq, name, spec, model,
                                      color, code69, sn, prod_date, print_date)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    record.box_no,
                    record.slot,
                    record.name,
                    record.spec,
                    record.model,
                    record.color,
                    record.code69,
                    record.sn,
                    record.prod_date,
                    record.printed_at,
                ],
            )?;
        }

        let committed = match counter_key {
            Some(key) => Some(SequenceCounterStore::new(&tx).increment(key)?),
            None => None,
        };

        tx.commit()?;
        Ok(committed)
    }

    // ========================================================================
    // BACKUP
    // ========================================================================

    /// Copy the database file into the backup directory with a timestamped
    /// name. In-memory databases have nothing to back up.
    pub fn backup(&self, custom_dir: Option<&Path>) -> CoreResult<PathBuf> {
        let Some(source) = self.path.as_deref() else {
            return Err(CoreError::Io(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "in-memory database cannot be backed up",
            )));
        };

        let dir = match custom_dir {
            Some(d) => d.to_path_buf(),
            None => PathBuf::from(
                self.get_setting(SETTING_BACKUP_PATH)?
                    .unwrap_or_else(|| "backups".to_string()),
            ),
        };
        std::fs::create_dir_all(&dir)?;

        let stamp = Local::now().format("%Y%m%d_%H%M%S");
        let target = dir.join(format!("backup_{stamp}.db"));

        // Flush WAL content into the main file before copying.
        self.conn
            .query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
        std::fs::copy(source, &target)?;
        Ok(target)
    }

    /// Replace the live database file with a backup and reconnect. The
    /// previous file is kept next to it with an `.old` suffix.
    pub fn restore(&mut self, backup_file: &Path) -> CoreResult<()> {
        let Some(target) = self.path.clone() else {
            return Err(CoreError::Io(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "in-memory database cannot be restored",
            )));
        };
        if !backup_file.exists() {
            return Err(CoreError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("backup file not found: {}", backup_file.display()),
            )));
        }

        // Flush and release the file before swapping it out.
        self.conn
            .query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
        self.conn = Connection::open_in_memory()?;

        let mut old_name = target.clone().into_os_string();
        old_name.push(".old");
        if target.exists() {
            std::fs::rename(&target, PathBuf::from(old_name))?;
        }
        // The rename moves only the main file; a leftover journal must not
        // be replayed against the restored copy.
        for suffix in ["-wal", "-shm"] {
            let mut sidecar = target.clone().into_os_string();
            sidecar.push(suffix);
            let _ = std::fs::remove_file(PathBuf::from(sidecar));
        }
        std::fs::copy(backup_file, &target)?;

        *self = Database::open(&target)?;
        Ok(())
    }
}

fn row_to_product(row: &rusqlite::Row<'_>) -> rusqlite::Result<Product> {
    let rule_id: i64 = row.get(11)?;
    let sn_rule_id: i64 = row.get(12)?;
    Ok(Product {
        id: row.get(0)?,
        name: row.get(1)?,
        spec: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
        model: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
        color: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
        sn4: row.get(5)?,
        sku: row.get::<_, Option<String>>(6)?.unwrap_or_default(),
        code69: row.get::<_, Option<String>>(7)?.unwrap_or_default(),
        qty: row.get::<_, Option<u32>>(8)?.unwrap_or(0),
        weight: row.get::<_, Option<String>>(9)?.unwrap_or_default(),
        template_path: row.get::<_, Option<String>>(10)?.unwrap_or_default(),
        rule_id: if rule_id > 0 { Some(rule_id) } else { None },
        sn_rule_id: if sn_rule_id > 0 { Some(sn_rule_id) } else { None },
    })
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<PrintRecord> {
    Ok(PrintRecord {
        id: row.get(0)?,
        box_no: row.get(1)?,
        slot: row.get(2)?,
        name: row.get(3)?,
        spec: row.get(4)?,
        model: row.get(5)?,
        color: row.get(6)?,
        code69: row.get(7)?,
        sn: row.get(8)?,
        prod_date: row.get(9)?,
        printed_at: row.get(10)?,
    })
}
