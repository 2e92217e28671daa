use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::db::Database;
use crate::models::{CachedIncrement, StepIncrement};

/// Durable queue of flushed increments on the sensor unit.
#[derive(Clone)]
pub struct DeltaCache {
    db: Arc<Mutex<Database>>,
}

impl DeltaCache {
    #[must_use]
    pub fn new(db: Arc<Mutex<Database>>) -> Self {
        Self { db }
    }

    fn lock(&self) -> MutexGuard<'_, Database> {
        self.db
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn append(&self, increment: &StepIncrement) -> Result<CachedIncrement> {
        let delta = i64::try_from(increment.delta).context("Step delta out of range")?;
        let cached = self
            .lock()
            .insert_cached_increment(increment.interval_end, delta)?;
        debug!(id = cached.id, delta, "cached increment");
        Ok(cached)
    }

    /// Unsynced rows, oldest first.
    pub fn list_unsynced(&self) -> Result<Vec<CachedIncrement>> {
        self.lock().list_cached_increments(Some(false))
    }

    /// Unsynced rows strictly newer than `after`, oldest first.
    pub fn list_unsynced_after(&self, after: DateTime<Utc>) -> Result<Vec<CachedIncrement>> {
        self.lock().list_unsynced_increments_after(after)
    }

    pub fn list_all(&self) -> Result<Vec<CachedIncrement>> {
        self.lock().list_cached_increments(None)
    }

    pub fn mark_synced(&self, ids: &[i64]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        self.lock().mark_increments_synced(ids)
    }

    pub fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let removed = self.lock().prune_increments_before(cutoff)?;
        if removed > 0 {
            info!(removed, %cutoff, "pruned cached increments");
        }
        Ok(removed)
    }
}
