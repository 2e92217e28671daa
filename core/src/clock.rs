use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Local, NaiveDate, TimeDelta, TimeZone, Utc};

/// Wall-clock source. Timers still run on tokio time; this only answers "what time is it".
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;

    fn local_now(&self) -> DateTime<Local> {
        self.now().with_timezone(&Local)
    }

    fn today(&self) -> NaiveDate {
        self.local_now().date_naive()
    }
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Settable clock for tests and scripted simulations.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    #[must_use]
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = now;
    }

    pub fn advance(&self, by: TimeDelta) {
        let mut guard = self.now.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        *guard += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// The next local calendar day and how long until it starts.
///
/// A midnight that does not exist locally (DST gap) resolves to the earliest
/// valid instant after it; if even that fails the wait falls back to a day.
#[must_use]
pub fn until_next_local_midnight(now: DateTime<Local>) -> (NaiveDate, Duration) {
    let today = now.date_naive();
    let next = today.succ_opt().unwrap_or(today);
    let midnight = next.and_hms_opt(0, 0, 0).and_then(|naive| {
        Local
            .from_local_datetime(&naive)
            .earliest()
            .or_else(|| Local.from_local_datetime(&(naive + TimeDelta::hours(1))).earliest())
    });

    let wait = midnight
        .and_then(|m| (m - now).to_std().ok())
        .unwrap_or(Duration::from_secs(24 * 60 * 60));
    (next, wait)
}
