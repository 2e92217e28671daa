use anyhow::Result;
use chrono::{Local, TimeDelta};
use std::process;
use tabled::{
    Table, Tabled,
    settings::{Alignment, Modify, Style, object::Columns},
};

use stepsync_core::db::Database;
use stepsync_core::models::LedgerEntry;
use stepsync_core::progress::{Pace, build_report};

use super::helpers::{format_time, parse_date, truncate};

const MAX_HISTORY_DAYS: u32 = 366;

fn pace_label(pace: Pace) -> &'static str {
    match pace {
        Pace::Ahead => "ahead",
        Pace::OnTrack => "on track",
        Pace::Behind => "behind",
    }
}

pub(crate) fn cmd_today(db: &Database, date: Option<String>, json: bool) -> Result<()> {
    #[derive(Tabled)]
    struct BlockRow {
        #[tabled(rename = "")]
        marker: &'static str,
        #[tabled(rename = "Block")]
        name: String,
        #[tabled(rename = "Window")]
        window: String,
        #[tabled(rename = "Steps")]
        steps: i64,
        #[tabled(rename = "Expected")]
        expected: i64,
        #[tabled(rename = "Target")]
        target: i64,
    }

    let date = parse_date(date)?;
    let report = build_report(db, date, Local::now())?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("=== {} ===\n", report.date);
    let total = report.running_total;
    if report.daily_target > 0 {
        let target = report.daily_target;
        let pct = report.fraction * 100.0;
        println!("  STEPS: {total} / {target} ({pct:.0}%)");
        let expected = report.expected_by_now;
        println!(
            "  PACE: {} (expected {expected} by now)",
            pace_label(report.pace)
        );
    } else {
        println!("  STEPS: {total}");
    }

    let Some(template) = &report.template else {
        eprintln!("\nNo schedule for this day. Use `stepsync schedule assign` to set one.");
        return Ok(());
    };
    println!("  SCHEDULE: {}", template.name);
    if let Some(active) = &report.active_block {
        println!("  NOW: {}", active.name);
    }
    println!();

    let rows: Vec<BlockRow> = report
        .blocks
        .iter()
        .map(|b| BlockRow {
            marker: if b.active { "*" } else { "" },
            name: truncate(&b.block.name, 30),
            window: format!(
                "{}-{}",
                format_time(b.block.start_time),
                format_time(b.block.end_time)
            ),
            steps: b.steps,
            expected: b.expected,
            target: b.block.target_steps,
        })
        .collect();

    let table = Table::new(&rows)
        .with(Style::rounded())
        .with(Modify::new(Columns::new(3..)).with(Alignment::right()))
        .to_string();
    println!("{table}");

    Ok(())
}

pub(crate) fn cmd_history(db: &Database, days: u32, json: bool) -> Result<()> {
    #[derive(Tabled)]
    struct HistoryRow {
        #[tabled(rename = "Date")]
        date: String,
        #[tabled(rename = "Steps")]
        steps: i64,
    }

    if !(1..=MAX_HISTORY_DAYS).contains(&days) {
        anyhow::bail!("--days must be between 1 and {MAX_HISTORY_DAYS}");
    }

    let today = Local::now().date_naive();
    let start = today - TimeDelta::days(i64::from(days) - 1);
    let stored = db.get_ledger_entries(start, today)?;

    let entries: Vec<LedgerEntry> = (0..days)
        .map(|i| {
            let date = today - TimeDelta::days(i64::from(i));
            stored
                .iter()
                .find(|e| e.date == date)
                .cloned()
                .unwrap_or(LedgerEntry {
                    date,
                    running_total: 0,
                })
        })
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if entries.iter().all(|e| e.running_total == 0) {
        eprintln!("No steps recorded in the last {days} days");
        process::exit(2);
    }

    let rows: Vec<HistoryRow> = entries
        .iter()
        .map(|e| HistoryRow {
            date: e.date.format("%Y-%m-%d").to_string(),
            steps: e.running_total,
        })
        .collect();

    let table = Table::new(&rows)
        .with(Style::rounded())
        .with(Modify::new(Columns::new(1..)).with(Alignment::right()))
        .to_string();
    println!("{table}");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_days_are_bounded() {
        let db = Database::open_in_memory().unwrap();
        assert!(cmd_history(&db, 0, true).is_err());
        assert!(cmd_history(&db, MAX_HISTORY_DAYS + 1, true).is_err());
        assert!(cmd_history(&db, 4_000_000_000, true).is_err());
        assert!(cmd_history(&db, MAX_HISTORY_DAYS, true).is_ok());
    }
}
