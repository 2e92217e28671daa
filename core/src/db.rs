use std::path::Path;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Local, NaiveDate, NaiveTime, TimeZone, Utc};
use rusqlite::{Connection, OptionalExtension, params, types::Type};
use uuid::Uuid;

use crate::models::{
    CachedIncrement, ExternalRecord, HealthRecord, LedgerApply, LedgerEntry, NewTimeBlock,
    ScheduleBinding, Template, TimeBlock, validate_day_of_week, validate_time_block,
};

const DATE_FMT: &str = "%Y-%m-%d";
const TIME_FMT: &str = "%H:%M";

pub struct Database {
    conn: Connection,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;
        let db = Database { conn };
        db.migrate()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Database { conn };
        db.migrate()?;
        Ok(db)
    }

    fn migrate(&self) -> Result<()> {
        let version: i64 = self
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))?;

        if version < 1 {
            self.conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS cached_increments (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    timestamp_ms INTEGER NOT NULL,
                    delta INTEGER NOT NULL,
                    synced INTEGER NOT NULL DEFAULT 0
                );

                CREATE TABLE IF NOT EXISTS step_ledger (
                    date TEXT PRIMARY KEY,
                    running_total INTEGER NOT NULL DEFAULT 0 CHECK (running_total >= 0),
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS applied_increments (
                    idempotency_key TEXT PRIMARY KEY,
                    date TEXT NOT NULL,
                    timestamp_ms INTEGER NOT NULL,
                    delta INTEGER NOT NULL,
                    applied_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS health_records (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    idempotency_key TEXT NOT NULL UNIQUE,
                    count INTEGER NOT NULL,
                    start_ms INTEGER NOT NULL,
                    end_ms INTEGER NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_cached_increments_timestamp ON cached_increments(timestamp_ms);
                CREATE INDEX IF NOT EXISTS idx_applied_increments_timestamp ON applied_increments(timestamp_ms);
                CREATE INDEX IF NOT EXISTS idx_health_records_end ON health_records(end_ms);

                CREATE TABLE IF NOT EXISTS config (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL
                );

                PRAGMA user_version = 1;",
            )?;
        }

        if version < 2 {
            self.conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS templates (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL UNIQUE,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS time_blocks (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    template_id INTEGER NOT NULL REFERENCES templates(id) ON DELETE CASCADE,
                    name TEXT NOT NULL,
                    start_time TEXT NOT NULL,
                    end_time TEXT NOT NULL,
                    target_steps INTEGER NOT NULL CHECK (target_steps >= 0)
                );

                CREATE TABLE IF NOT EXISTS day_assignments (
                    day_of_week INTEGER PRIMARY KEY CHECK (day_of_week BETWEEN 0 AND 6),
                    template_id INTEGER NOT NULL REFERENCES templates(id) ON DELETE CASCADE,
                    updated_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_time_blocks_template ON time_blocks(template_id);

                PRAGMA user_version = 2;",
            )?;
        }

        Ok(())
    }

    // --- Row mapping helpers ---

    fn millis_column(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
        let ms: i64 = row.get(idx)?;
        Utc.timestamp_millis_opt(ms)
            .single()
            .ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, ms))
    }

    fn date_column(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<NaiveDate> {
        let s: String = row.get(idx)?;
        NaiveDate::parse_from_str(&s, DATE_FMT)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    }

    fn time_column(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<NaiveTime> {
        let s: String = row.get(idx)?;
        NaiveTime::parse_from_str(&s, TIME_FMT)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    }

    fn cached_increment_from_row(row: &rusqlite::Row) -> rusqlite::Result<CachedIncrement> {
        Ok(CachedIncrement {
            id: row.get(0)?,
            timestamp: Self::millis_column(row, 1)?,
            delta: row.get(2)?,
            synced: row.get(3)?,
        })
    }

    fn ledger_entry_from_row(row: &rusqlite::Row) -> rusqlite::Result<LedgerEntry> {
        Ok(LedgerEntry {
            date: Self::date_column(row, 0)?,
            running_total: row.get(1)?,
        })
    }

    fn health_record_from_row(row: &rusqlite::Row) -> rusqlite::Result<HealthRecord> {
        Ok(HealthRecord {
            id: row.get(0)?,
            idempotency_key: row.get(1)?,
            count: row.get(2)?,
            start_time: Self::millis_column(row, 3)?,
            end_time: Self::millis_column(row, 4)?,
        })
    }

    fn time_block_from_row(row: &rusqlite::Row) -> rusqlite::Result<TimeBlock> {
        Ok(TimeBlock {
            id: row.get(0)?,
            template_id: row.get(1)?,
            name: row.get(2)?,
            start_time: Self::time_column(row, 3)?,
            end_time: Self::time_column(row, 4)?,
            target_steps: row.get(5)?,
        })
    }

    // --- Delta cache (sensor unit) ---

    pub fn insert_cached_increment(
        &self,
        timestamp: DateTime<Utc>,
        delta: i64,
    ) -> Result<CachedIncrement> {
        self.conn.execute(
            "INSERT INTO cached_increments (timestamp_ms, delta, synced) VALUES (?1, ?2, 0)",
            params![timestamp.timestamp_millis(), delta],
        )?;
        let id = self.conn.last_insert_rowid();
        Ok(CachedIncrement {
            id,
            timestamp,
            delta,
            synced: false,
        })
    }

    /// All cached rows, oldest first. `synced` narrows to one sync state.
    pub fn list_cached_increments(&self, synced: Option<bool>) -> Result<Vec<CachedIncrement>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, timestamp_ms, delta, synced FROM cached_increments
             WHERE ?1 IS NULL OR synced = ?1
             ORDER BY timestamp_ms ASC, id ASC",
        )?;
        let rows = stmt
            .query_map(params![synced], Self::cached_increment_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Unsynced rows strictly newer than `after`, oldest first.
    pub fn list_unsynced_increments_after(
        &self,
        after: DateTime<Utc>,
    ) -> Result<Vec<CachedIncrement>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, timestamp_ms, delta, synced FROM cached_increments
             WHERE synced = 0 AND timestamp_ms > ?1
             ORDER BY timestamp_ms ASC, id ASC",
        )?;
        let rows = stmt
            .query_map(
                params![after.timestamp_millis()],
                Self::cached_increment_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn mark_increments_synced(&self, ids: &[i64]) -> Result<usize> {
        let tx = self.conn.unchecked_transaction()?;
        let mut updated = 0;
        {
            let mut stmt = tx.prepare("UPDATE cached_increments SET synced = 1 WHERE id = ?1")?;
            for id in ids {
                updated += stmt.execute(params![id])?;
            }
        }
        tx.commit()?;
        Ok(updated)
    }

    /// Drops rows older than `cutoff` regardless of sync state.
    pub fn prune_increments_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let rows = self.conn.execute(
            "DELETE FROM cached_increments WHERE timestamp_ms < ?1",
            params![cutoff.timestamp_millis()],
        )?;
        Ok(rows)
    }

    // --- Step ledger (handheld unit) ---

    pub fn get_ledger_entry(&self, date: NaiveDate) -> Result<Option<LedgerEntry>> {
        let date_str = date.format(DATE_FMT).to_string();
        let entry = self
            .conn
            .query_row(
                "SELECT date, running_total FROM step_ledger WHERE date = ?1",
                params![date_str],
                Self::ledger_entry_from_row,
            )
            .optional()?;
        Ok(entry)
    }

    /// Creates a zero entry for `date` if none exists. Returns true when a row was created.
    pub fn ensure_ledger_entry(&self, date: NaiveDate) -> Result<bool> {
        let now = Local::now().to_rfc3339();
        let rows = self.conn.execute(
            "INSERT OR IGNORE INTO step_ledger (date, running_total, updated_at) VALUES (?1, 0, ?2)",
            params![date.format(DATE_FMT).to_string(), now],
        )?;
        Ok(rows > 0)
    }

    /// Folds `delta` into the entry for `date`, clamped at zero, once per idempotency key.
    pub fn apply_ledger_delta(
        &self,
        date: NaiveDate,
        idempotency_key: &str,
        timestamp: DateTime<Utc>,
        delta: i64,
    ) -> Result<LedgerApply> {
        let date_str = date.format(DATE_FMT).to_string();
        let now = Local::now().to_rfc3339();

        let tx = self.conn.unchecked_transaction()?;
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO applied_increments (idempotency_key, date, timestamp_ms, delta, applied_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                idempotency_key,
                date_str,
                timestamp.timestamp_millis(),
                delta,
                now
            ],
        )?;

        if inserted == 0 {
            let entry = self.get_ledger_entry(date)?.unwrap_or(LedgerEntry {
                date,
                running_total: 0,
            });
            tx.commit()?;
            return Ok(LedgerApply::Duplicate(entry));
        }

        tx.execute(
            "INSERT INTO step_ledger (date, running_total, updated_at) VALUES (?1, MAX(0, ?2), ?3)
             ON CONFLICT(date) DO UPDATE SET
                running_total = MAX(0, running_total + ?2),
                updated_at = excluded.updated_at",
            params![date_str, delta, now],
        )?;
        let running_total: i64 = tx.query_row(
            "SELECT running_total FROM step_ledger WHERE date = ?1",
            params![date_str],
            |row| row.get(0),
        )?;
        tx.commit()?;

        Ok(LedgerApply::Applied(LedgerEntry {
            date,
            running_total,
        }))
    }

    /// Stored entries between `start` and `end` inclusive, oldest first.
    pub fn get_ledger_entries(&self, start: NaiveDate, end: NaiveDate) -> Result<Vec<LedgerEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT date, running_total FROM step_ledger
             WHERE date >= ?1 AND date <= ?2
             ORDER BY date",
        )?;
        let entries = stmt
            .query_map(
                params![
                    start.format(DATE_FMT).to_string(),
                    end.format(DATE_FMT).to_string()
                ],
                Self::ledger_entry_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Sum of applied deltas whose timestamps fall in `[start, end)`.
    pub fn steps_between(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<i64> {
        let total: i64 = self.conn.query_row(
            "SELECT COALESCE(SUM(delta), 0) FROM applied_increments
             WHERE timestamp_ms >= ?1 AND timestamp_ms < ?2",
            params![start.timestamp_millis(), end.timestamp_millis()],
            |row| row.get(0),
        )?;
        Ok(total)
    }

    // --- Health store records ---

    /// Returns false when a record with the same idempotency key already exists.
    pub fn insert_health_record(&self, record: &ExternalRecord) -> Result<bool> {
        let rows = self.conn.execute(
            "INSERT OR IGNORE INTO health_records (idempotency_key, count, start_ms, end_ms)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                record.idempotency_key,
                record.count,
                record.start_time.timestamp_millis(),
                record.end_time.timestamp_millis()
            ],
        )?;
        Ok(rows > 0)
    }

    pub fn latest_health_record_end(&self) -> Result<Option<DateTime<Utc>>> {
        let max: Option<i64> =
            self.conn
                .query_row("SELECT MAX(end_ms) FROM health_records", [], |row| {
                    row.get(0)
                })?;
        max.map(crate::models::from_millis).transpose()
    }

    pub fn list_health_records(&self, limit: i64) -> Result<Vec<HealthRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, idempotency_key, count, start_ms, end_ms FROM health_records
             ORDER BY end_ms DESC, id DESC
             LIMIT ?1",
        )?;
        let records = stmt
            .query_map(params![limit], Self::health_record_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    // --- Templates & schedule ---

    pub fn create_template(&self, name: &str) -> Result<Template> {
        let name = name.trim();
        if name.is_empty() {
            bail!("Template name must not be empty");
        }
        if self.get_template_by_name(name)?.is_some() {
            bail!("Template '{name}' already exists");
        }
        let now = Local::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO templates (name, created_at) VALUES (?1, ?2)",
            params![name, now],
        )?;
        Ok(Template {
            id: self.conn.last_insert_rowid(),
            name: name.to_string(),
        })
    }

    pub fn get_template_by_id(&self, id: i64) -> Result<Template> {
        self.conn
            .query_row(
                "SELECT id, name FROM templates WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Template {
                        id: row.get(0)?,
                        name: row.get(1)?,
                    })
                },
            )
            .with_context(|| format!("Template {id} not found"))
    }

    pub fn get_template_by_name(&self, name: &str) -> Result<Option<Template>> {
        let template = self
            .conn
            .query_row(
                "SELECT id, name FROM templates WHERE name = ?1 COLLATE NOCASE",
                params![name],
                |row| {
                    Ok(Template {
                        id: row.get(0)?,
                        name: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(template)
    }

    pub fn list_templates(&self) -> Result<Vec<Template>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name FROM templates ORDER BY name")?;
        let templates = stmt
            .query_map([], |row| {
                Ok(Template {
                    id: row.get(0)?,
                    name: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(templates)
    }

    pub fn add_time_block(&self, block: &NewTimeBlock) -> Result<TimeBlock> {
        validate_time_block(block)?;
        self.get_template_by_id(block.template_id)?;
        self.conn.execute(
            "INSERT INTO time_blocks (template_id, name, start_time, end_time, target_steps)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                block.template_id,
                block.name.trim(),
                block.start_time.format(TIME_FMT).to_string(),
                block.end_time.format(TIME_FMT).to_string(),
                block.target_steps
            ],
        )?;
        Ok(TimeBlock {
            id: self.conn.last_insert_rowid(),
            template_id: block.template_id,
            name: block.name.trim().to_string(),
            start_time: block.start_time,
            end_time: block.end_time,
            target_steps: block.target_steps,
        })
    }

    pub fn get_time_blocks(&self, template_id: i64) -> Result<Vec<TimeBlock>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, template_id, name, start_time, end_time, target_steps
             FROM time_blocks WHERE template_id = ?1
             ORDER BY start_time, id",
        )?;
        let blocks = stmt
            .query_map(params![template_id], Self::time_block_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(blocks)
    }

    pub fn assign_day(&self, day_of_week: i64, template_id: i64) -> Result<ScheduleBinding> {
        validate_day_of_week(day_of_week)?;
        let template = self.get_template_by_id(template_id)?;
        let now = Local::now().to_rfc3339();
        self.conn.execute(
            "INSERT OR REPLACE INTO day_assignments (day_of_week, template_id, updated_at)
             VALUES (?1, ?2, ?3)",
            params![day_of_week, template_id, now],
        )?;
        Ok(ScheduleBinding {
            day_of_week,
            template_id,
            template_name: Some(template.name),
        })
    }

    pub fn get_day_assignment(&self, day_of_week: i64) -> Result<Option<ScheduleBinding>> {
        let binding = self
            .conn
            .query_row(
                "SELECT da.day_of_week, da.template_id, t.name
                 FROM day_assignments da JOIN templates t ON da.template_id = t.id
                 WHERE da.day_of_week = ?1",
                params![day_of_week],
                |row| {
                    Ok(ScheduleBinding {
                        day_of_week: row.get(0)?,
                        template_id: row.get(1)?,
                        template_name: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(binding)
    }

    pub fn get_all_day_assignments(&self) -> Result<Vec<ScheduleBinding>> {
        let mut stmt = self.conn.prepare(
            "SELECT da.day_of_week, da.template_id, t.name
             FROM day_assignments da JOIN templates t ON da.template_id = t.id
             ORDER BY da.day_of_week",
        )?;
        let bindings = stmt
            .query_map([], |row| {
                Ok(ScheduleBinding {
                    day_of_week: row.get(0)?,
                    template_id: row.get(1)?,
                    template_name: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(bindings)
    }

    pub fn clear_day_assignment(&self, day_of_week: i64) -> Result<bool> {
        let rows = self.conn.execute(
            "DELETE FROM day_assignments WHERE day_of_week = ?1",
            params![day_of_week],
        )?;
        Ok(rows > 0)
    }

    // --- Node identity ---

    pub fn get_or_create_node_id(&self) -> Result<String> {
        let existing: Option<String> = self
            .conn
            .query_row("SELECT value FROM config WHERE key = 'node_id'", [], |row| {
                row.get(0)
            })
            .optional()?;
        if let Some(id) = existing {
            return Ok(id);
        }

        let node_id = Uuid::new_v4().to_string();
        self.conn.execute(
            "INSERT INTO config (key, value) VALUES ('node_id', ?1)",
            params![node_id],
        )?;
        Ok(node_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{from_millis, idempotency_key_for};

    fn at(ms: i64) -> DateTime<Utc> {
        from_millis(ms).unwrap()
    }

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn hm(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn test_open_on_disk_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("handheld.db");

        let node_id = {
            let db = Database::open(&path).unwrap();
            db.ensure_ledger_entry(day(2024, 6, 15)).unwrap();
            db.get_or_create_node_id().unwrap()
        };

        let db = Database::open(&path).unwrap();
        assert_eq!(db.get_or_create_node_id().unwrap(), node_id);
        assert!(db.get_ledger_entry(day(2024, 6, 15)).unwrap().is_some());
    }

    #[test]
    fn test_cached_increments_ordered_by_timestamp() {
        let db = Database::open_in_memory().unwrap();
        db.insert_cached_increment(at(3_000), 30).unwrap();
        db.insert_cached_increment(at(1_000), 10).unwrap();
        db.insert_cached_increment(at(2_000), 20).unwrap();

        let rows = db.list_cached_increments(Some(false)).unwrap();
        let deltas: Vec<i64> = rows.iter().map(|r| r.delta).collect();
        assert_eq!(deltas, vec![10, 20, 30]);
        assert!(rows.iter().all(|r| !r.synced));
    }

    #[test]
    fn test_mark_synced_and_filter() {
        let db = Database::open_in_memory().unwrap();
        let a = db.insert_cached_increment(at(1_000), 10).unwrap();
        let b = db.insert_cached_increment(at(2_000), 20).unwrap();

        assert_eq!(db.mark_increments_synced(&[a.id]).unwrap(), 1);

        let unsynced = db.list_cached_increments(Some(false)).unwrap();
        assert_eq!(unsynced.len(), 1);
        assert_eq!(unsynced[0].id, b.id);

        let synced = db.list_cached_increments(Some(true)).unwrap();
        assert_eq!(synced.len(), 1);
        assert_eq!(synced[0].id, a.id);

        assert_eq!(db.list_cached_increments(None).unwrap().len(), 2);
    }

    #[test]
    fn test_unsynced_after_is_strict() {
        let db = Database::open_in_memory().unwrap();
        db.insert_cached_increment(at(1_000), 10).unwrap();
        db.insert_cached_increment(at(2_000), 20).unwrap();
        let c = db.insert_cached_increment(at(3_000), 30).unwrap();
        db.mark_increments_synced(&[c.id]).unwrap();

        let rows = db.list_unsynced_increments_after(at(1_000)).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].delta, 20);
    }

    #[test]
    fn test_prune_ignores_sync_state() {
        let db = Database::open_in_memory().unwrap();
        let old_synced = db.insert_cached_increment(at(1_000), 10).unwrap();
        db.mark_increments_synced(&[old_synced.id]).unwrap();
        db.insert_cached_increment(at(2_000), 20).unwrap();
        db.insert_cached_increment(at(5_000), 50).unwrap();

        assert_eq!(db.prune_increments_before(at(3_000)).unwrap(), 2);
        let left = db.list_cached_increments(None).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].delta, 50);
    }

    #[test]
    fn test_ledger_apply_accumulates() {
        let db = Database::open_in_memory().unwrap();
        let d = day(2024, 6, 15);

        let first = db
            .apply_ledger_delta(d, &idempotency_key_for(at(1_000)), at(1_000), 250)
            .unwrap();
        assert_eq!(first, LedgerApply::Applied(LedgerEntry { date: d, running_total: 250 }));

        let second = db
            .apply_ledger_delta(d, &idempotency_key_for(at(2_000)), at(2_000), 300)
            .unwrap();
        assert_eq!(second.entry().running_total, 550);
    }

    #[test]
    fn test_ledger_apply_is_idempotent_by_key() {
        let db = Database::open_in_memory().unwrap();
        let d = day(2024, 6, 15);
        let key = idempotency_key_for(at(1_000));

        db.apply_ledger_delta(d, &key, at(1_000), 250).unwrap();
        let again = db.apply_ledger_delta(d, &key, at(1_000), 250).unwrap();

        assert!(matches!(again, LedgerApply::Duplicate(_)));
        assert_eq!(db.get_ledger_entry(d).unwrap().unwrap().running_total, 250);
    }

    #[test]
    fn test_ledger_never_negative() {
        let db = Database::open_in_memory().unwrap();
        let d = day(2024, 6, 15);

        db.apply_ledger_delta(d, "k1", at(1_000), 100).unwrap();
        let after = db.apply_ledger_delta(d, "k2", at(2_000), -400).unwrap();
        assert_eq!(after.entry().running_total, 0);

        // A negative first delta on a fresh day also clamps.
        let d2 = day(2024, 6, 16);
        let fresh = db.apply_ledger_delta(d2, "k3", at(3_000), -5).unwrap();
        assert_eq!(fresh.entry().running_total, 0);
    }

    #[test]
    fn test_ensure_ledger_entry() {
        let db = Database::open_in_memory().unwrap();
        let d = day(2024, 6, 15);

        assert!(db.ensure_ledger_entry(d).unwrap());
        assert!(!db.ensure_ledger_entry(d).unwrap());
        assert_eq!(db.get_ledger_entry(d).unwrap().unwrap().running_total, 0);

        db.apply_ledger_delta(d, "k1", at(1_000), 40).unwrap();
        assert!(!db.ensure_ledger_entry(d).unwrap());
        assert_eq!(db.get_ledger_entry(d).unwrap().unwrap().running_total, 40);
    }

    #[test]
    fn test_ledger_range_and_steps_between() {
        let db = Database::open_in_memory().unwrap();
        db.apply_ledger_delta(day(2024, 6, 14), "a", at(1_000), 100).unwrap();
        db.apply_ledger_delta(day(2024, 6, 15), "b", at(2_000), 200).unwrap();
        db.apply_ledger_delta(day(2024, 6, 16), "c", at(3_000), 300).unwrap();

        let entries = db
            .get_ledger_entries(day(2024, 6, 15), day(2024, 6, 16))
            .unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].running_total, 200);

        assert_eq!(db.steps_between(at(1_000), at(3_000)).unwrap(), 300);
        assert_eq!(db.steps_between(at(3_001), at(9_000)).unwrap(), 0);
    }

    #[test]
    fn test_health_records_dedupe_by_key() {
        let db = Database::open_in_memory().unwrap();
        let record = ExternalRecord::for_increment(at(5_000), 120);

        assert!(db.insert_health_record(&record).unwrap());
        assert!(!db.insert_health_record(&record).unwrap());

        let records = db.list_health_records(10).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].count, 120);
        assert_eq!(db.latest_health_record_end().unwrap(), Some(at(5_000)));
    }

    #[test]
    fn test_latest_health_record_end_empty() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.latest_health_record_end().unwrap().is_none());
    }

    #[test]
    fn test_templates_blocks_and_assignments() {
        let db = Database::open_in_memory().unwrap();
        let workday = db.create_template("Workday").unwrap();
        assert!(db.create_template("workday").is_err());

        db.add_time_block(&NewTimeBlock {
            template_id: workday.id,
            name: "Evening".to_string(),
            start_time: hm(18, 0),
            end_time: hm(20, 0),
            target_steps: 3000,
        })
        .unwrap();
        db.add_time_block(&NewTimeBlock {
            template_id: workday.id,
            name: "Morning".to_string(),
            start_time: hm(7, 0),
            end_time: hm(9, 0),
            target_steps: 2000,
        })
        .unwrap();

        let blocks = db.get_time_blocks(workday.id).unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].name, "Morning");
        assert_eq!(blocks[0].start_time, hm(7, 0));

        let binding = db.assign_day(0, workday.id).unwrap();
        assert_eq!(binding.template_name.as_deref(), Some("Workday"));
        assert!(db.assign_day(7, workday.id).is_err());
        assert!(db.assign_day(1, 999).is_err());

        let fetched = db.get_day_assignment(0).unwrap().unwrap();
        assert_eq!(fetched.template_id, workday.id);
        assert!(db.get_day_assignment(1).unwrap().is_none());
        assert_eq!(db.get_all_day_assignments().unwrap().len(), 1);

        assert!(db.clear_day_assignment(0).unwrap());
        assert!(!db.clear_day_assignment(0).unwrap());
    }

    #[test]
    fn test_add_time_block_unknown_template() {
        let db = Database::open_in_memory().unwrap();
        let result = db.add_time_block(&NewTimeBlock {
            template_id: 42,
            name: "Walk".to_string(),
            start_time: hm(7, 0),
            end_time: hm(8, 0),
            target_steps: 500,
        });
        assert!(result.is_err());
    }
}
