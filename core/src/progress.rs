use anyhow::Result;
use chrono::{DateTime, Datelike, Local, NaiveDate, NaiveTime, TimeZone, Timelike, Utc};
use serde::Serialize;

use crate::db::Database;
use crate::models::{Template, TimeBlock};

const SECS_PER_DAY: i64 = 24 * 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Pace {
    Ahead,
    OnTrack,
    Behind,
}

#[derive(Debug, Clone, Serialize)]
pub struct BlockProgress {
    #[serde(flatten)]
    pub block: TimeBlock,
    /// Steps applied with timestamps inside this block's window on the report date.
    pub steps: i64,
    /// Share of the block's target that should be done by now.
    pub expected: i64,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProgressReport {
    pub date: NaiveDate,
    pub running_total: i64,
    pub daily_target: i64,
    pub fraction: f64,
    pub template: Option<Template>,
    pub active_block: Option<TimeBlock>,
    pub blocks: Vec<BlockProgress>,
    pub expected_by_now: i64,
    pub pace: Pace,
}

/// The block whose `[start, end)` contains `now`. Overlaps resolve to the earliest start.
#[must_use]
pub fn active_block(blocks: &[TimeBlock], now: NaiveTime) -> Option<&TimeBlock> {
    blocks
        .iter()
        .filter(|b| b.contains(now))
        .min_by_key(|b| b.start_time)
}

#[must_use]
pub fn daily_target(blocks: &[TimeBlock]) -> i64 {
    blocks.iter().map(|b| b.target_steps).sum()
}

/// `running_total / target`, or 0 when there is no target.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn progress_fraction(running_total: i64, target: i64) -> f64 {
    if target <= 0 {
        return 0.0;
    }
    running_total as f64 / target as f64
}

fn secs(t: NaiveTime) -> i64 {
    i64::from(t.num_seconds_from_midnight())
}

fn block_len_secs(block: &TimeBlock) -> i64 {
    (secs(block.end_time) - secs(block.start_time)).rem_euclid(SECS_PER_DAY)
}

/// Pro-rated target for one block at `now`: full once finished, partial while active.
#[must_use]
pub fn expected_for_block(block: &TimeBlock, now: NaiveTime) -> i64 {
    let len = block_len_secs(block);
    if len == 0 {
        return 0;
    }
    let elapsed = if block.contains(now) {
        (secs(now) - secs(block.start_time)).rem_euclid(SECS_PER_DAY)
    } else if !block.wraps_midnight() && now >= block.end_time {
        len
    } else {
        0
    };
    block.target_steps * elapsed / len
}

#[must_use]
pub fn expected_steps(blocks: &[TimeBlock], now: NaiveTime) -> i64 {
    blocks.iter().map(|b| expected_for_block(b, now)).sum()
}

/// Within 5% of the expected total counts as on track.
#[must_use]
pub fn pace(running_total: i64, expected: i64) -> Pace {
    let band = expected / 20;
    if running_total > expected + band {
        Pace::Ahead
    } else if running_total < expected - band {
        Pace::Behind
    } else {
        Pace::OnTrack
    }
}

/// Monday = 0 .. Sunday = 6, matching the schedule table.
#[must_use]
pub fn weekday_index(date: NaiveDate) -> i64 {
    i64::from(date.weekday().num_days_from_monday())
}

fn block_window(date: NaiveDate, block: &TimeBlock) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let end_date = if block.wraps_midnight() {
        date.succ_opt()?
    } else {
        date
    };
    let start = Local
        .from_local_datetime(&date.and_time(block.start_time))
        .earliest()?;
    let end = Local
        .from_local_datetime(&end_date.and_time(block.end_time))
        .earliest()?;
    Some((start.with_timezone(&Utc), end.with_timezone(&Utc)))
}

/// Read-side projection of the ledger onto the schedule for `date`, as seen at `now`.
pub fn build_report(db: &Database, date: NaiveDate, now: DateTime<Local>) -> Result<ProgressReport> {
    let running_total = db.get_ledger_entry(date)?.map_or(0, |e| e.running_total);

    let (template, blocks) = match db.get_day_assignment(weekday_index(date))? {
        Some(binding) => (
            Some(db.get_template_by_id(binding.template_id)?),
            db.get_time_blocks(binding.template_id)?,
        ),
        None => (None, Vec::new()),
    };

    let today = now.date_naive();
    let is_today = date == today;
    let target = daily_target(&blocks);

    let mut progress = Vec::with_capacity(blocks.len());
    for block in &blocks {
        let steps = match block_window(date, block) {
            Some((start, end)) => db.steps_between(start, end)?,
            None => 0,
        };
        let expected = if is_today {
            expected_for_block(block, now.time())
        } else if date < today {
            block.target_steps
        } else {
            0
        };
        progress.push(BlockProgress {
            block: block.clone(),
            steps,
            expected,
            active: is_today && block.contains(now.time()),
        });
    }

    let active = if is_today {
        active_block(&blocks, now.time()).cloned()
    } else {
        None
    };
    let expected_by_now = progress.iter().map(|p| p.expected).sum();

    Ok(ProgressReport {
        date,
        running_total,
        daily_target: target,
        fraction: progress_fraction(running_total, target),
        template,
        active_block: active,
        blocks: progress,
        expected_by_now,
        pace: pace(running_total, expected_by_now),
    })
}
