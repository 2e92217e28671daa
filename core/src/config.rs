use std::time::Duration;

use chrono::TimeDelta;

use crate::batching::BatchPolicy;
use crate::retry::RetryPolicy;

/// Every tunable of the sync engine in one place.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub batch: BatchPolicy,
    pub retry: RetryPolicy,
    /// Cached increments older than this are pruned whether synced or not.
    pub retention: TimeDelta,
    pub snapshot_interval: Duration,
    pub prune_interval: Duration,
    /// Upper bound on a single transport push or send.
    pub transport_timeout: Duration,
    /// How far back to ask for history when the health store holds nothing yet.
    pub backfill_fallback: TimeDelta,
    pub stall_threshold: TimeDelta,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch: BatchPolicy::default(),
            retry: RetryPolicy::default(),
            retention: TimeDelta::hours(48),
            snapshot_interval: Duration::from_secs(15 * 60),
            prune_interval: Duration::from_secs(24 * 60 * 60),
            transport_timeout: Duration::from_secs(10),
            backfill_fallback: TimeDelta::hours(24),
            stall_threshold: TimeDelta::minutes(5),
        }
    }
}
