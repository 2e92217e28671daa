use std::fmt;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Prefix of every idempotency key written to the health store.
pub const IDEMPOTENCY_KEY_PREFIX: &str = "stepsync-steps-";

/// Steps taken since the previous increment, stamped with the end of the interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepIncrement {
    pub interval_end: DateTime<Utc>,
    pub delta: u64,
}

/// A flushed increment persisted on the sensor unit until pruned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CachedIncrement {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub delta: i64,
    pub synced: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Disconnected,
    Connected,
    Syncing,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Disconnected => "disconnected",
            Self::Connected => "connected",
            Self::Syncing => "syncing",
        };
        f.write_str(label)
    }
}

/// Authoritative per-day running total on the handheld unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerEntry {
    pub date: NaiveDate,
    pub running_total: i64,
}

/// Outcome of folding one increment into the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerApply {
    Applied(LedgerEntry),
    /// The idempotency key was already applied; the entry is returned unchanged.
    Duplicate(LedgerEntry),
}

impl LedgerApply {
    #[must_use]
    pub fn entry(&self) -> &LedgerEntry {
        match self {
            Self::Applied(e) | Self::Duplicate(e) => e,
        }
    }
}

/// One record exported to the external health store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExternalRecord {
    pub count: i64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub idempotency_key: String,
}

impl ExternalRecord {
    /// Increments are point-in-time records: start and end both sit at the interval end.
    /// Negative deltas export as zero.
    #[must_use]
    pub fn for_increment(timestamp: DateTime<Utc>, delta: i64) -> Self {
        Self {
            count: delta.max(0),
            start_time: timestamp,
            end_time: timestamp,
            idempotency_key: idempotency_key_for(timestamp),
        }
    }
}

#[must_use]
pub fn idempotency_key_for(start_time: DateTime<Utc>) -> String {
    format!("{IDEMPOTENCY_KEY_PREFIX}{}", start_time.timestamp_millis())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Template {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimeBlock {
    pub id: i64,
    pub template_id: i64,
    pub name: String,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub target_steps: i64,
}

impl TimeBlock {
    /// Whether `now` falls in `[start, end)`. Blocks with `start > end` wrap past midnight.
    #[must_use]
    pub fn contains(&self, now: NaiveTime) -> bool {
        if self.start_time <= self.end_time {
            now >= self.start_time && now < self.end_time
        } else {
            now >= self.start_time || now < self.end_time
        }
    }

    #[must_use]
    pub fn wraps_midnight(&self) -> bool {
        self.start_time > self.end_time
    }
}

#[derive(Debug, Clone)]
pub struct NewTimeBlock {
    pub template_id: i64,
    pub name: String,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub target_steps: i64,
}

/// Weekday (0 = Monday .. 6 = Sunday) to template assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduleBinding {
    pub day_of_week: i64,
    pub template_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template_name: Option<String>,
}

/// A record as held by the local health store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthRecord {
    pub id: i64,
    pub idempotency_key: String,
    pub count: i64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

pub fn validate_time_block(block: &NewTimeBlock) -> Result<()> {
    if block.name.trim().is_empty() {
        bail!("Time block name must not be empty");
    }
    if block.target_steps < 0 {
        bail!("Target steps must be non-negative");
    }
    if block.start_time == block.end_time {
        bail!("Time block start and end must differ");
    }
    Ok(())
}

pub fn validate_day_of_week(day: i64) -> Result<()> {
    if !(0..=6).contains(&day) {
        bail!("day_of_week must be 0-6 (Monday-Sunday), got {day}");
    }
    Ok(())
}

/// Convert epoch milliseconds from the wire or database into a UTC instant.
pub fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .with_context(|| format!("timestamp out of range: {ms}"))
}
