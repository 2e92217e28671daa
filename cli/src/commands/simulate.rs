use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Local, NaiveDate, TimeDelta, TimeZone, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::info;

use stepsync_core::cache::DeltaCache;
use stepsync_core::clock::{Clock, ManualClock};
use stepsync_core::config::SyncConfig;
use stepsync_core::db::Database;
use stepsync_core::engine::{EngineDeps, ReconciliationEngine, SyncStats};
use stepsync_core::health_store::SqliteHealthStore;
use stepsync_core::models::ConnectionStatus;
use stepsync_core::sensor::{FixedPower, SensorDeps, SensorUnit};
use stepsync_core::transport::{InMemoryLink, TransportEvent};

const LINK_CAPACITY: usize = 64;
const MAX_INTERVAL_MINUTES: i64 = 24 * 60;

pub(crate) struct SimulationParams {
    /// Cumulative daily step counter readings, in order.
    pub readings: Vec<u64>,
    pub battery: f64,
    /// The link comes up just before this reading index (after the last one if out of range).
    pub offline_until: usize,
    pub interval: TimeDelta,
    pub start: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub(crate) struct SimulationSummary {
    pub readings: usize,
    pub sensor_steps: i64,
    pub cached_rows: usize,
    pub unsynced_rows: usize,
    pub pending: u64,
    pub ledger_date: NaiveDate,
    pub ledger_total: i64,
    pub status: ConnectionStatus,
    pub stats: SyncStats,
}

/// Deliver queued transport events on both sides until neither has anything left.
async fn settle(
    engine: &ReconciliationEngine,
    handheld_events: &mut mpsc::Receiver<TransportEvent>,
    sensor: &mut SensorUnit,
    sensor_events: &mut mpsc::Receiver<TransportEvent>,
) {
    loop {
        let mut progressed = false;
        while let Ok(event) = handheld_events.try_recv() {
            engine.handle_event(event).await;
            progressed = true;
        }
        while let Ok(event) = sensor_events.try_recv() {
            sensor.on_event(event).await;
            progressed = true;
        }
        if !progressed {
            break;
        }
    }
}

pub(crate) async fn run_simulation(
    params: &SimulationParams,
    handheld_db: Database,
    sensor_db: Database,
) -> Result<SimulationSummary> {
    if !(0.0..=1.0).contains(&params.battery) {
        bail!("Battery level must be between 0 and 1");
    }
    if params.interval <= TimeDelta::zero() {
        bail!("Reading interval must be positive");
    }

    let handheld_id = handheld_db.get_or_create_node_id()?;
    let sensor_id = sensor_db.get_or_create_node_id()?;
    let handheld_db = Arc::new(Mutex::new(handheld_db));
    let cache = DeltaCache::new(Arc::new(Mutex::new(sensor_db)));
    let clock = Arc::new(ManualClock::new(params.start));
    let config = SyncConfig::default();

    let (link, sensor_side, handheld_side) =
        InMemoryLink::new(&sensor_id, &handheld_id, LINK_CAPACITY);
    let mut sensor_events = sensor_side.events;
    let mut handheld_events = handheld_side.events;

    let engine = ReconciliationEngine::new(EngineDeps {
        db: handheld_db.clone(),
        store: Arc::new(SqliteHealthStore::new(handheld_db.clone())),
        transport: handheld_side.endpoint,
        clock: clock.clone(),
        config: config.clone(),
    });
    let mut sensor = SensorUnit::new(SensorDeps {
        cache: cache.clone(),
        transport: sensor_side.endpoint,
        power: Arc::new(FixedPower::new(params.battery)),
        clock: clock.clone(),
        config,
    });
    engine.ensure_day(clock.today());

    for (i, &reading) in params.readings.iter().enumerate() {
        if i == params.offline_until {
            info!(reading = i, "link up");
            link.connect().await?;
            settle(&engine, &mut handheld_events, &mut sensor, &mut sensor_events).await;
        }
        clock.advance(params.interval);
        sensor.on_reading(reading).await;
        settle(&engine, &mut handheld_events, &mut sensor, &mut sensor_events).await;
    }
    if params.offline_until >= params.readings.len() {
        info!("link up after last reading");
        link.connect().await?;
        settle(&engine, &mut handheld_events, &mut sensor, &mut sensor_events).await;
    }

    let rows = cache.list_all()?;
    let ledger_date = clock.today();
    let ledger_total = handheld_db
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .get_ledger_entry(ledger_date)?
        .map_or(0, |e| e.running_total);
    let snapshot = engine.snapshot();

    Ok(SimulationSummary {
        readings: params.readings.len(),
        sensor_steps: rows.iter().map(|r| r.delta).sum(),
        cached_rows: rows.len(),
        unsynced_rows: rows.iter().filter(|r| !r.synced).count(),
        pending: sensor.pending(),
        ledger_date,
        ledger_total,
        status: snapshot.status,
        stats: snapshot.stats,
    })
}

pub(crate) async fn cmd_simulate(
    readings: Vec<u64>,
    battery: f64,
    offline_until: Option<usize>,
    interval_minutes: i64,
    dbs: Option<(Database, Database)>,
    json: bool,
) -> Result<()> {
    if readings.is_empty() {
        bail!("Give at least one cumulative step reading");
    }
    if !(1..=MAX_INTERVAL_MINUTES).contains(&interval_minutes) {
        bail!("--interval must be between 1 and {MAX_INTERVAL_MINUTES} minutes");
    }
    let start = Local
        .from_local_datetime(
            &Local::now()
                .date_naive()
                .and_hms_opt(8, 0, 0)
                .context("invalid start time")?,
        )
        .earliest()
        .context("Local start time does not exist today")?
        .with_timezone(&Utc);

    let params = SimulationParams {
        readings,
        battery,
        offline_until: offline_until.unwrap_or(0),
        interval: TimeDelta::minutes(interval_minutes),
        start,
    };
    let (handheld_db, sensor_db) = match dbs {
        Some(dbs) => dbs,
        None => (Database::open_in_memory()?, Database::open_in_memory()?),
    };
    let summary = run_simulation(&params, handheld_db, sensor_db).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!("=== simulation ({} readings) ===\n", summary.readings);
    println!(
        "  SENSOR: {} steps in {} cached row(s), {} unsynced, {} pending",
        summary.sensor_steps, summary.cached_rows, summary.unsynced_rows, summary.pending
    );
    println!(
        "  HANDHELD: {} steps on {} ({})",
        summary.ledger_total, summary.ledger_date, summary.status
    );
    let stats = &summary.stats;
    println!(
        "  SYNC: {} applied, {} duplicate(s), {} store failure(s), {} discarded, {} backfill request(s)",
        stats.applied,
        stats.duplicates,
        stats.store_failures,
        stats.discarded,
        stats.backfills_requested
    );
    if let Some(failure) = &stats.last_failure {
        eprintln!("  Last failure: {failure}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(readings: Vec<u64>, battery: f64, offline_until: usize) -> SimulationParams {
        SimulationParams {
            readings,
            battery,
            offline_until,
            interval: TimeDelta::minutes(1),
            start: Local
                .with_ymd_and_hms(2024, 6, 17, 8, 0, 0)
                .unwrap()
                .with_timezone(&Utc),
        }
    }

    async fn run(p: &SimulationParams) -> SimulationSummary {
        run_simulation(
            p,
            Database::open_in_memory().unwrap(),
            Database::open_in_memory().unwrap(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_live_sync_reaches_ledger() {
        let summary = run(&params(vec![0, 100, 300, 600, 900], 0.9, 0)).await;

        assert_eq!(summary.cached_rows, 3);
        assert_eq!(summary.unsynced_rows, 0);
        assert_eq!(summary.sensor_steps, 900);
        assert_eq!(summary.ledger_total, 900);
        assert_eq!(summary.stats.applied, 3);
        assert_eq!(summary.status, ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn test_offline_increments_arrive_by_backfill() {
        let summary = run(&params(vec![0, 100, 300, 600, 900], 0.9, 5)).await;

        assert_eq!(summary.cached_rows, 3);
        assert_eq!(summary.unsynced_rows, 0);
        assert_eq!(summary.ledger_total, 900);
        assert_eq!(summary.stats.applied, 3);
        assert!(summary.stats.backfills_requested >= 1);
    }

    #[tokio::test]
    async fn test_pending_steps_flush_when_link_comes_up() {
        // Low battery holds 400 steps back; connecting flushes them.
        let summary = run(&params(vec![0, 400], 0.1, 2)).await;

        assert_eq!(summary.pending, 0);
        assert_eq!(summary.cached_rows, 1);
        assert_eq!(summary.ledger_total, 400);
    }

    #[tokio::test]
    async fn test_reconnect_flush_keeps_offline_rows() {
        // 300 steps cached offline and 100 still pending when the link comes up.
        let summary = run(&params(vec![0, 300, 400], 0.9, 3)).await;

        assert_eq!(summary.cached_rows, 2);
        assert_eq!(summary.unsynced_rows, 0);
        assert_eq!(summary.ledger_total, 400);
        assert_eq!(summary.stats.applied, 2);
    }

    #[tokio::test]
    async fn test_rejects_out_of_range_interval() {
        for minutes in [0, -5, 24 * 60 + 1, i64::MAX] {
            let result = cmd_simulate(
                vec![0, 300],
                0.9,
                None,
                minutes,
                Some((
                    Database::open_in_memory().unwrap(),
                    Database::open_in_memory().unwrap(),
                )),
                true,
            )
            .await;
            assert!(result.is_err(), "interval {minutes} accepted");
        }
    }

    #[tokio::test]
    async fn test_rejects_bad_battery() {
        let p = params(vec![0], 1.5, 0);
        let result = run_simulation(
            &p,
            Database::open_in_memory().unwrap(),
            Database::open_in_memory().unwrap(),
        )
        .await;
        assert!(result.is_err());
    }
}
