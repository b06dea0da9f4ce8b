// Durable per-key sequence counters.
//
// One row per composite key in the `box_counters` table. The increment is a
// single upsert so that two commits racing on the same key cannot lose an
// update (a read-then-write here was the original lost-update bug).

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{CoreError, CoreResult};

/// Composite key for one counter: product, rule, year, month and repair
/// level. Each repair level owns a disjoint numeric range via `base_value`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterKey {
    pub product_id: i64,
    pub rule_id: i64,
    pub year: i32,
    pub month: u32,
    pub repair_level: u32,
}

impl CounterKey {
    pub fn new(
        product_id: i64,
        rule_id: i64,
        date: chrono::NaiveDate,
        repair_level: u32,
    ) -> Self {
        use chrono::Datelike;
        CounterKey {
            product_id,
            rule_id,
            year: date.year(),
            month: date.month(),
            repair_level,
        }
    }

    /// Storage key, compatible with databases written by older stations.
    pub fn storage_key(&self) -> String {
        format!(
            "P{}_R{}_{}_{}_{}",
            self.product_id, self.rule_id, self.year, self.month, self.repair_level
        )
    }

    /// Starting value for a never-seen key: repair level 2 counts from
    /// 20000, so its first committed box is 20001.
    pub fn base_value(&self) -> i64 {
        self.repair_level as i64 * 10_000
    }
}

/// Storage for the persistent counters. Borrow it from a plain connection
/// for reads and previews, or from an open transaction to tie the increment
/// to other writes.
pub struct SequenceCounterStore<'c> {
    conn: &'c Connection,
}

impl<'c> SequenceCounterStore<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        SequenceCounterStore { conn }
    }

    /// Current value for the key, or the repair-level base if never seen.
    pub fn get(&self, key: &CounterKey) -> CoreResult<i64> {
        let value: Option<i64> = self
            .conn
            .query_row(
                "SELECT current_val FROM box_counters WHERE key = ?1",
                params![key.storage_key()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| CoreError::CounterStoreFailure(e.to_string()))?;

        Ok(value.unwrap_or_else(|| key.base_value()))
    }

    /// Atomically advance the counter by one and return the new value.
    pub fn increment(&self, key: &CounterKey) -> CoreResult<i64> {
        self.conn
            .query_row(
                "INSERT INTO box_counters (key, current_val) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET current_val = current_val + 1
                 RETURNING current_val",
                params![key.storage_key(), key.base_value() + 1],
                |row| row.get(0),
            )
            .map_err(|e| CoreError::CounterStoreFailure(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use chrono::NaiveDate;

    fn key(repair_level: u32) -> CounterKey {
        let date = NaiveDate::from_ymd_opt(2024, 3, 15).unwrap();
        CounterKey::new(7, 3, date, repair_level)
    }

    #[test]
    fn test_storage_key_format() {
        assert_eq!(key(2).storage_key(), "P7_R3_2024_3_2");
    }

    #[test]
    fn test_fresh_key_reads_base_value() {
        let db = Database::open_in_memory().unwrap();
        let store = SequenceCounterStore::new(db.conn());

        assert_eq!(store.get(&key(0)).unwrap(), 0);
        assert_eq!(store.get(&key(2)).unwrap(), 20_000);
    }

    #[test]
    fn test_first_increment_lands_on_base_plus_one() {
        let db = Database::open_in_memory().unwrap();
        let store = SequenceCounterStore::new(db.conn());

        assert_eq!(store.increment(&key(2)).unwrap(), 20_001);
        assert_eq!(store.get(&key(2)).unwrap(), 20_001);
    }

    #[test]
    fn test_increment_is_monotonic_by_one() {
        let db = Database::open_in_memory().unwrap();
        let store = SequenceCounterStore::new(db.conn());

        for expected in 1..=5 {
            assert_eq!(store.increment(&key(0)).unwrap(), expected);
        }
    }

    #[test]
    fn test_keys_do_not_interfere() {
        let db = Database::open_in_memory().unwrap();
        let store = SequenceCounterStore::new(db.conn());

        store.increment(&key(0)).unwrap();
        store.increment(&key(0)).unwrap();
        store.increment(&key(2)).unwrap();

        assert_eq!(store.get(&key(0)).unwrap(), 2);
        assert_eq!(store.get(&key(2)).unwrap(), 20_001);
    }
}
