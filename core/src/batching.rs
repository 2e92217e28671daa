use chrono::{DateTime, Utc};
use tracing::debug;

use crate::models::StepIncrement;

/// Adaptive flush thresholds keyed on battery reserve.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchPolicy {
    pub normal_threshold: u64,
    pub low_battery_threshold: u64,
    /// Below this fraction of charge the larger threshold applies.
    pub low_battery_fraction: f64,
}

impl Default for BatchPolicy {
    fn default() -> Self {
        Self {
            normal_threshold: 250,
            low_battery_threshold: 1000,
            low_battery_fraction: 0.20,
        }
    }
}

impl BatchPolicy {
    #[must_use]
    pub fn threshold_for(&self, battery_fraction: f64) -> u64 {
        if battery_fraction < self.low_battery_fraction {
            self.low_battery_threshold
        } else {
            self.normal_threshold
        }
    }
}

/// Turns cumulative daily step readings into flushed increments.
#[derive(Debug)]
pub struct BatchingAgent {
    policy: BatchPolicy,
    last_total: Option<u64>,
    pending: u64,
}

impl BatchingAgent {
    #[must_use]
    pub fn new(policy: BatchPolicy) -> Self {
        Self {
            policy,
            last_total: None,
            pending: 0,
        }
    }

    /// Steps observed but not yet emitted.
    #[must_use]
    pub fn pending(&self) -> u64 {
        self.pending
    }

    /// Feed one cumulative reading. Returns an increment when the threshold is reached.
    ///
    /// The first reading after start only establishes a baseline. A reading
    /// below the previous one means the platform counter reset, so the new
    /// reading itself is the delta.
    pub fn observe(
        &mut self,
        total: u64,
        battery_fraction: f64,
        at: DateTime<Utc>,
    ) -> Option<StepIncrement> {
        let delta = match self.last_total {
            None => 0,
            Some(last) if total >= last => total - last,
            Some(last) => {
                debug!(last, total, "sensor counter reset");
                total
            }
        };
        self.last_total = Some(total);
        self.pending += delta;

        let threshold = self.policy.threshold_for(battery_fraction);
        if self.pending >= threshold {
            debug!(pending = self.pending, threshold, "batch threshold reached");
            self.flush(at)
        } else {
            None
        }
    }

    /// Emit whatever is pending, regardless of threshold. `None` when nothing is pending.
    pub fn flush(&mut self, at: DateTime<Utc>) -> Option<StepIncrement> {
        if self.pending == 0 {
            return None;
        }
        let delta = std::mem::take(&mut self.pending);
        Some(StepIncrement {
            interval_end: at,
            delta,
        })
    }
}
