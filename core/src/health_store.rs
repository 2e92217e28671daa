use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::db::Database;
use crate::models::ExternalRecord;

/// Export target for applied increments. Implementations dedupe by idempotency key.
#[async_trait]
pub trait HealthStore: Send + Sync {
    /// Returns false when a record with the same key was already present.
    async fn insert_record(&self, record: &ExternalRecord) -> Result<bool>;

    /// Latest `end_time` among stored records.
    async fn latest_end_time(&self) -> Result<Option<DateTime<Utc>>>;
}

/// Health store backed by the handheld database's `health_records` table.
pub struct SqliteHealthStore {
    db: Arc<Mutex<Database>>,
}

impl SqliteHealthStore {
    #[must_use]
    pub fn new(db: Arc<Mutex<Database>>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl HealthStore for SqliteHealthStore {
    async fn insert_record(&self, record: &ExternalRecord) -> Result<bool> {
        let db = self.db.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        db.insert_health_record(record)
    }

    async fn latest_end_time(&self) -> Result<Option<DateTime<Utc>>> {
        let db = self.db.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        db.latest_health_record_end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[tokio::test]
    async fn test_sqlite_store_dedupes_by_key() {
        let db = Arc::new(Mutex::new(Database::open_in_memory().unwrap()));
        let store = SqliteHealthStore::new(db.clone());
        let t = Utc.with_ymd_and_hms(2024, 6, 15, 9, 0, 0).unwrap();

        assert!(store.latest_end_time().await.unwrap().is_none());
        assert!(store.insert_record(&ExternalRecord::for_increment(t, 250)).await.unwrap());
        assert!(!store.insert_record(&ExternalRecord::for_increment(t, 250)).await.unwrap());
        assert_eq!(store.latest_end_time().await.unwrap(), Some(t));

        let records = db.lock().unwrap().list_health_records(10).unwrap();
        assert_eq!(records.len(), 1);
    }
}
