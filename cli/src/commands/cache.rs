use anyhow::{Context, Result};
use chrono::{DateTime, Local, TimeDelta, Utc};
use tabled::{
    Table, Tabled,
    settings::{Alignment, Modify, Style, object::Columns},
};

use stepsync_core::cache::DeltaCache;
use stepsync_core::config::SyncConfig;

pub(crate) fn cmd_cache_list(cache: &DeltaCache, unsynced: bool, json: bool) -> Result<()> {
    #[derive(Tabled)]
    struct CacheRow {
        #[tabled(rename = "ID")]
        id: i64,
        #[tabled(rename = "Interval end")]
        timestamp: String,
        #[tabled(rename = "Steps")]
        delta: i64,
        #[tabled(rename = "Synced")]
        synced: &'static str,
    }

    let rows = if unsynced {
        cache.list_unsynced()?
    } else {
        cache.list_all()?
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    if rows.is_empty() {
        eprintln!("Delta cache is empty");
        return Ok(());
    }

    let pending: i64 = rows.iter().filter(|r| !r.synced).map(|r| r.delta).sum();
    let table_rows: Vec<CacheRow> = rows
        .iter()
        .map(|r| CacheRow {
            id: r.id,
            timestamp: r
                .timestamp
                .with_timezone(&Local)
                .format("%Y-%m-%d %H:%M:%S")
                .to_string(),
            delta: r.delta,
            synced: if r.synced { "yes" } else { "no" },
        })
        .collect();

    let table = Table::new(&table_rows)
        .with(Style::rounded())
        .with(Modify::new(Columns::new(2..3)).with(Alignment::right()))
        .to_string();
    println!("{table}");
    println!("  {} row(s), {pending} steps awaiting sync", rows.len());

    Ok(())
}

/// Prune cutoff for `--hours`. Unsynced rows are only pruned once they leave the
/// retention horizon, so a shorter window is refused.
fn prune_cutoff(now: DateTime<Utc>, hours: Option<i64>) -> Result<DateTime<Utc>> {
    let minimum = SyncConfig::default().retention;
    let retention = match hours {
        Some(h) => TimeDelta::try_hours(h).context("--hours is out of range")?,
        None => minimum,
    };
    if retention < minimum {
        anyhow::bail!(
            "--hours must be at least {}; newer rows may still be awaiting sync",
            minimum.num_hours()
        );
    }
    now.checked_sub_signed(retention)
        .context("--hours is out of range")
}

pub(crate) fn cmd_cache_prune(cache: &DeltaCache, hours: Option<i64>, json: bool) -> Result<()> {
    let cutoff = prune_cutoff(Utc::now(), hours)?;
    let removed = cache.prune_older_than(cutoff)?;

    if json {
        println!(
            "{}",
            serde_json::json!({ "removed": removed, "cutoff": cutoff })
        );
    } else {
        println!(
            "Removed {removed} row(s) older than {}",
            cutoff.with_timezone(&Local).format("%Y-%m-%d %H:%M")
        );
    }
    Ok(())
}
