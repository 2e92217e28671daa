//! Sensor-unit runtime: batching, durable caching, live push and backfill answers.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, error, info, warn};

use crate::batching::BatchingAgent;
use crate::cache::DeltaCache;
use crate::clock::Clock;
use crate::config::SyncConfig;
use crate::models::{CachedIncrement, StepIncrement, from_millis};
use crate::protocol::{HistoricalEntry, SyncMessage};
use crate::transport::{
    PeerId, PeerTransport, TransportEvent, push_sync_message, send_sync_message,
};

/// Battery reserve as a fraction in `[0, 1]`.
pub trait PowerSource: Send + Sync {
    fn battery_fraction(&self) -> f64;
}

/// A battery level that only changes when told to.
pub struct FixedPower {
    fraction: Mutex<f64>,
}

impl FixedPower {
    #[must_use]
    pub fn new(fraction: f64) -> Self {
        Self {
            fraction: Mutex::new(fraction),
        }
    }

    pub fn set(&self, fraction: f64) {
        *self
            .fraction
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = fraction;
    }
}

impl PowerSource for FixedPower {
    fn battery_fraction(&self) -> f64 {
        *self
            .fraction
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

pub struct SensorDeps {
    pub cache: DeltaCache,
    pub transport: Arc<dyn PeerTransport>,
    pub power: Arc<dyn PowerSource>,
    pub clock: Arc<dyn Clock>,
    pub config: SyncConfig,
}

pub struct SensorUnit {
    deps: SensorDeps,
    agent: BatchingAgent,
    peer: Option<PeerId>,
}

impl SensorUnit {
    #[must_use]
    pub fn new(deps: SensorDeps) -> Self {
        let agent = BatchingAgent::new(deps.config.batch);
        Self {
            deps,
            agent,
            peer: None,
        }
    }

    #[must_use]
    pub fn pending(&self) -> u64 {
        self.agent.pending()
    }

    /// Feed one cumulative daily step reading.
    pub async fn on_reading(&mut self, total: u64) {
        let battery = self.deps.power.battery_fraction();
        if let Some(increment) = self.agent.observe(total, battery, self.deps.clock.now()) {
            self.deliver(increment).await;
        }
    }

    pub async fn on_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::PeerConnected(peer) => {
                info!(%peer, "peer connected");
                self.peer = Some(peer.clone());
                // Announce before flushing: the handheld takes its backfill
                // watermark when it sees the announcement.
                if let Err(e) = send_sync_message(
                    self.deps.transport.as_ref(),
                    &peer,
                    &SyncMessage::PeerConnected,
                    self.deps.config.transport_timeout,
                )
                .await
                {
                    warn!(%peer, error = %e, "could not announce reachability");
                }
                if let Some(increment) = self.agent.flush(self.deps.clock.now()) {
                    self.deliver(increment).await;
                }
            }
            TransportEvent::PeerDisconnected(peer) => {
                info!(%peer, "peer disconnected");
                self.peer = None;
            }
            TransportEvent::ItemChanged { path, payload }
            | TransportEvent::MessageReceived { path, payload, .. } => {
                match SyncMessage::decode(&path, &payload) {
                    Ok(SyncMessage::RequestHistoricalData { last_known_time }) => {
                        self.answer_backfill(last_known_time).await;
                    }
                    Ok(other) => debug!(path = other.path(), "ignoring message"),
                    Err(e) => warn!(path = %path, error = %e, "discarding payload"),
                }
            }
        }
    }

    /// Cache an increment, then try to push it live. It stays unsynced if the push fails.
    ///
    /// Older unsynced rows go out in the same push as a history response, so a
    /// live increment never lands on the handheld ahead of the backlog.
    async fn deliver(&self, increment: StepIncrement) -> Option<CachedIncrement> {
        let cached = match self.deps.cache.append(&increment) {
            Ok(cached) => cached,
            Err(e) => {
                error!(delta = increment.delta, error = %format!("{e:#}"), "could not cache increment");
                return None;
            }
        };

        let backlog = match self.deps.cache.list_unsynced() {
            Ok(rows) if rows.iter().any(|row| row.id != cached.id) => rows,
            Ok(_) => Vec::new(),
            Err(e) => {
                warn!(error = %format!("{e:#}"), "could not read unsynced backlog");
                Vec::new()
            }
        };

        let (message, ids) = if backlog.is_empty() {
            let message = SyncMessage::StepUpdate {
                step_delta: cached.delta,
                timestamp: Some(cached.timestamp.timestamp_millis()),
            };
            (message, vec![cached.id])
        } else {
            debug!(rows = backlog.len(), "pushing increment with unsynced backlog");
            history_response(&backlog)
        };

        match push_sync_message(
            self.deps.transport.as_ref(),
            &message,
            self.deps.config.transport_timeout,
        )
        .await
        {
            Ok(()) => {
                debug!(id = cached.id, delta = cached.delta, "increment pushed");
                self.mark_synced(&ids);
                Some(CachedIncrement {
                    synced: true,
                    ..cached
                })
            }
            Err(e) => {
                debug!(id = cached.id, error = %e, "push failed, left for backfill");
                Some(cached)
            }
        }
    }

    async fn answer_backfill(&self, last_known_time: i64) {
        let rows = match from_millis(last_known_time)
            .and_then(|after| self.deps.cache.list_unsynced_after(after))
        {
            Ok(rows) => rows,
            Err(e) => {
                warn!(last_known_time, error = %format!("{e:#}"), "cannot answer history request");
                return;
            }
        };

        let (message, ids) = history_response(&rows);
        match push_sync_message(
            self.deps.transport.as_ref(),
            &message,
            self.deps.config.transport_timeout,
        )
        .await
        {
            Ok(()) => {
                info!(count = ids.len(), "answered history request");
                self.mark_synced(&ids);
            }
            Err(e) => warn!(error = %e, "history response not delivered"),
        }
    }

    fn mark_synced(&self, ids: &[i64]) {
        if let Err(e) = self.deps.cache.mark_synced(ids) {
            error!(error = %format!("{e:#}"), "could not mark increments synced");
        }
    }

    /// Persist the unflushed accumulator so a crash cannot lose it, and push it
    /// like any other increment.
    pub async fn snapshot(&mut self) -> Option<CachedIncrement> {
        let increment = self.agent.flush(self.deps.clock.now())?;
        let cached = self.deliver(increment).await?;
        debug!(id = cached.id, delta = cached.delta, synced = cached.synced, "snapshot cached");
        Some(cached)
    }

    /// Drop cached rows older than the retention horizon.
    pub fn prune(&self) -> Result<usize> {
        let cutoff = self.deps.clock.now() - self.deps.config.retention;
        self.deps.cache.prune_older_than(cutoff)
    }

    async fn run(
        mut self,
        mut readings: mpsc::Receiver<u64>,
        mut events: mpsc::Receiver<TransportEvent>,
    ) {
        let snapshot_every = self.deps.config.snapshot_interval;
        let prune_every = self.deps.config.prune_interval;
        let mut snapshot_tick = interval_at(Instant::now() + snapshot_every, snapshot_every);
        let mut prune_tick = interval_at(Instant::now() + prune_every, prune_every);
        snapshot_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        prune_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut readings_open = true;

        loop {
            tokio::select! {
                reading = readings.recv(), if readings_open => match reading {
                    Some(total) => self.on_reading(total).await,
                    None => {
                        debug!("sensor feed closed");
                        readings_open = false;
                    }
                },
                event = events.recv() => match event {
                    Some(event) => self.on_event(event).await,
                    None => {
                        info!("transport event stream closed");
                        break;
                    }
                },
                _ = snapshot_tick.tick() => {
                    self.snapshot().await;
                }
                _ = prune_tick.tick() => {
                    if let Err(e) = self.prune() {
                        error!(error = %format!("{e:#}"), "prune failed");
                    }
                }
            }
        }
    }

    /// Run the unit on a background task until the transport event stream closes.
    pub fn spawn(
        self,
        readings: mpsc::Receiver<u64>,
        events: mpsc::Receiver<TransportEvent>,
    ) -> SensorHandle {
        SensorHandle {
            task: tokio::spawn(self.run(readings, events)),
        }
    }
}

fn history_response(rows: &[CachedIncrement]) -> (SyncMessage, Vec<i64>) {
    let message = SyncMessage::HistoricalDataResponse {
        historical_data: rows
            .iter()
            .map(|row| HistoricalEntry {
                step_delta: row.delta,
                timestamp: row.timestamp.timestamp_millis(),
            })
            .collect(),
    };
    (message, rows.iter().map(|row| row.id).collect())
}

pub struct SensorHandle {
    task: JoinHandle<()>,
}

impl SensorHandle {
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn shutdown(self) {
        self.task.abort();
        let _ = self.task.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use chrono::{Local, TimeDelta, TimeZone, Utc};

    use crate::clock::ManualClock;
    use crate::db::Database;
    use crate::engine::{EngineDeps, ReconciliationEngine};
    use crate::health_store::SqliteHealthStore;
    use crate::transport::{InMemoryLink, LinkSide};

    struct Rig {
        link: InMemoryLink,
        handheld: LinkSide,
        sensor_events: mpsc::Receiver<TransportEvent>,
        cache: DeltaCache,
        clock: Arc<ManualClock>,
        power: Arc<FixedPower>,
        unit: SensorUnit,
    }

    fn rig(battery: f64) -> Rig {
        let (link, sensor, handheld) = InMemoryLink::new("sensor", "handheld", 32);
        let cache = DeltaCache::new(Arc::new(Mutex::new(Database::open_in_memory().unwrap())));
        let clock = Arc::new(ManualClock::new(
            Local
                .with_ymd_and_hms(2024, 6, 15, 9, 0, 0)
                .unwrap()
                .with_timezone(&Utc),
        ));
        let power = Arc::new(FixedPower::new(battery));
        let unit = SensorUnit::new(SensorDeps {
            cache: cache.clone(),
            transport: sensor.endpoint.clone(),
            power: power.clone(),
            clock: clock.clone(),
            config: SyncConfig::default(),
        });
        Rig {
            link,
            handheld,
            sensor_events: sensor.events,
            cache,
            clock,
            power,
            unit,
        }
    }

    impl Rig {
        async fn connect(&mut self) {
            self.link.connect().await.unwrap();
            let event = self.sensor_events.recv().await.unwrap();
            self.unit.on_event(event).await;
            // PeerConnected signal, then the reachability announcement.
            assert_eq!(
                self.handheld.events.recv().await,
                Some(TransportEvent::PeerConnected("sensor".to_string()))
            );
        }

        fn next_handheld(&mut self) -> SyncMessage {
            match self.handheld.events.try_recv().unwrap() {
                TransportEvent::ItemChanged { path, payload }
                | TransportEvent::MessageReceived { path, payload, .. } => {
                    SyncMessage::decode(&path, &payload).unwrap()
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_flush_at_threshold_is_cached() {
        let mut rig = rig(0.5);
        rig.unit.on_reading(1_000).await;
        rig.unit.on_reading(1_250).await;

        let rows = rig.cache.list_unsynced().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].delta, 250);
        assert_eq!(rig.unit.pending(), 0);
    }

    #[tokio::test]
    async fn test_low_battery_defers_flush() {
        let mut rig = rig(0.1);
        rig.unit.on_reading(0).await;
        rig.unit.on_reading(260).await;
        assert!(rig.cache.list_all().unwrap().is_empty());

        rig.unit.on_reading(1_000).await;
        let rows = rig.cache.list_all().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].delta, 1_000);

        rig.power.set(0.8);
        rig.unit.on_reading(1_260).await;
        assert_eq!(rig.cache.list_all().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_connect_announces_then_flushes_pending() {
        let mut rig = rig(0.9);
        rig.unit.on_reading(500).await;
        rig.unit.on_reading(600).await;
        assert_eq!(rig.unit.pending(), 100);

        rig.connect().await;

        assert_eq!(rig.next_handheld(), SyncMessage::PeerConnected);
        assert_eq!(
            rig.next_handheld(),
            SyncMessage::StepUpdate {
                step_delta: 100,
                timestamp: Some(rig.clock.now().timestamp_millis()),
            }
        );
        assert!(rig.cache.list_unsynced().unwrap().is_empty());
        assert_eq!(rig.cache.list_all().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rejected_push_is_answered_by_backfill() {
        let mut rig = rig(0.9);
        rig.connect().await;
        assert_eq!(rig.next_handheld(), SyncMessage::PeerConnected);

        rig.link.set_rejecting(true);
        rig.unit.on_reading(0).await;
        rig.unit.on_reading(300).await;
        let stuck = rig.cache.list_unsynced().unwrap();
        assert_eq!(stuck.len(), 1);
        rig.link.set_rejecting(false);

        let request = SyncMessage::RequestHistoricalData {
            last_known_time: (rig.clock.now() - TimeDelta::hours(24)).timestamp_millis(),
        };
        rig.unit
            .on_event(TransportEvent::ItemChanged {
                path: request.path().to_string(),
                payload: request.encode().unwrap(),
            })
            .await;

        assert_eq!(
            rig.next_handheld(),
            SyncMessage::HistoricalDataResponse {
                historical_data: vec![HistoricalEntry {
                    step_delta: 300,
                    timestamp: stuck[0].timestamp.timestamp_millis(),
                }],
            }
        );
        assert!(rig.cache.list_unsynced().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_history_request_filters_by_time() {
        let mut rig = rig(0.9);
        let old = rig
            .cache
            .append(&StepIncrement {
                interval_end: rig.clock.now() - TimeDelta::hours(2),
                delta: 40,
            })
            .unwrap();
        rig.cache
            .append(&StepIncrement {
                interval_end: rig.clock.now(),
                delta: 60,
            })
            .unwrap();
        rig.connect().await;
        assert_eq!(rig.next_handheld(), SyncMessage::PeerConnected);

        let request = SyncMessage::RequestHistoricalData {
            last_known_time: old.timestamp.timestamp_millis(),
        };
        rig.unit
            .on_event(TransportEvent::MessageReceived {
                from: "handheld".to_string(),
                path: request.path().to_string(),
                payload: request.encode().unwrap(),
            })
            .await;

        let SyncMessage::HistoricalDataResponse { historical_data } = rig.next_handheld() else {
            panic!("expected history response");
        };
        assert_eq!(historical_data.len(), 1);
        assert_eq!(historical_data[0].step_delta, 60);

        // The older row was not part of the answer and is still pending.
        let unsynced = rig.cache.list_unsynced().unwrap();
        assert_eq!(unsynced.len(), 1);
        assert_eq!(unsynced[0].id, old.id);
    }

    #[tokio::test]
    async fn test_flush_carries_unsynced_backlog() {
        let mut rig = rig(0.9);
        rig.unit.on_reading(0).await;
        rig.clock.advance(TimeDelta::minutes(1));
        rig.unit.on_reading(250).await;
        let offline = rig.cache.list_unsynced().unwrap();
        assert_eq!(offline.len(), 1);

        rig.clock.advance(TimeDelta::minutes(1));
        rig.unit.on_reading(350).await;
        rig.connect().await;

        assert_eq!(rig.next_handheld(), SyncMessage::PeerConnected);
        assert_eq!(
            rig.next_handheld(),
            SyncMessage::HistoricalDataResponse {
                historical_data: vec![
                    HistoricalEntry {
                        step_delta: 250,
                        timestamp: offline[0].timestamp.timestamp_millis(),
                    },
                    HistoricalEntry {
                        step_delta: 100,
                        timestamp: rig.clock.now().timestamp_millis(),
                    },
                ],
            }
        );
        assert!(rig.cache.list_unsynced().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_is_pushed_when_connected() {
        let mut rig = rig(0.9);
        rig.connect().await;
        assert_eq!(rig.next_handheld(), SyncMessage::PeerConnected);

        rig.unit.on_reading(0).await;
        rig.unit.on_reading(120).await;
        let cached = rig.unit.snapshot().await.unwrap();
        assert!(cached.synced);
        assert_eq!(
            rig.next_handheld(),
            SyncMessage::StepUpdate {
                step_delta: 120,
                timestamp: Some(rig.clock.now().timestamp_millis()),
            }
        );
        assert!(rig.cache.list_unsynced().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_and_prune() {
        let mut rig = rig(0.9);
        rig.unit.on_reading(0).await;
        rig.unit.on_reading(120).await;

        // No peer, so the snapshot stays unsynced.
        let cached = rig.unit.snapshot().await.unwrap();
        assert_eq!(cached.delta, 120);
        assert!(!cached.synced);
        assert_eq!(rig.unit.pending(), 0);
        assert!(rig.unit.snapshot().await.is_none());

        rig.clock.advance(TimeDelta::hours(49));
        rig.unit.on_reading(400).await;
        assert_eq!(rig.cache.list_all().unwrap().len(), 2);

        assert_eq!(rig.unit.prune().unwrap(), 1);
        let left = rig.cache.list_all().unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].delta, 280);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_unit_snapshots_on_interval() {
        let rig = rig(0.9);
        let cache = rig.cache.clone();
        let (readings_tx, readings) = mpsc::channel(8);
        let (_events_tx, events) = mpsc::channel(8);
        let handle = rig.unit.spawn(readings, events);

        readings_tx.send(1_000).await.unwrap();
        readings_tx.send(1_090).await.unwrap();
        tokio::time::sleep(Duration::from_secs(14 * 60)).await;
        assert!(cache.list_all().unwrap().is_empty());

        tokio::time::sleep(Duration::from_secs(2 * 60)).await;
        let rows = cache.list_unsynced().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].delta, 90);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_backfills_offline_increments() {
        let rig = rig(0.9);
        let Rig {
            link,
            handheld,
            sensor_events,
            cache,
            clock,
            unit,
            ..
        } = rig;

        let handheld_db = Arc::new(Mutex::new(Database::open_in_memory().unwrap()));
        let engine = ReconciliationEngine::new(EngineDeps {
            db: handheld_db.clone(),
            store: Arc::new(SqliteHealthStore::new(handheld_db.clone())),
            transport: handheld.endpoint.clone(),
            clock: clock.clone(),
            config: SyncConfig::default(),
        });
        let engine_handle = engine.spawn(handheld.events);

        let (readings_tx, readings) = mpsc::channel(8);
        let sensor_handle = unit.spawn(readings, sensor_events);

        // Two increments while the link is down.
        for (total, expected_rows) in [(0, 0), (250, 1), (500, 2)] {
            readings_tx.send(total).await.unwrap();
            while cache.list_all().unwrap().len() < expected_rows {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            clock.advance(TimeDelta::minutes(1));
        }
        assert_eq!(cache.list_unsynced().unwrap().len(), 2);

        link.connect().await.unwrap();
        let mut monitor = engine_handle.monitor();
        monitor.wait_for(|s| s.stats.applied == 2).await.unwrap();

        let today = clock.today();
        let entry = handheld_db
            .lock()
            .unwrap()
            .get_ledger_entry(today)
            .unwrap()
            .unwrap();
        assert_eq!(entry.running_total, 500);
        assert_eq!(handheld_db.lock().unwrap().list_health_records(10).unwrap().len(), 2);
        assert!(cache.list_unsynced().unwrap().is_empty());

        sensor_handle.shutdown().await;
        engine_handle.shutdown().await;
    }
    fn handheld_engine(
        handheld: &LinkSide,
        clock: Arc<ManualClock>,
    ) -> (Arc<Mutex<Database>>, ReconciliationEngine) {
        let handheld_db = Arc::new(Mutex::new(Database::open_in_memory().unwrap()));
        let engine = ReconciliationEngine::new(EngineDeps {
            db: handheld_db.clone(),
            store: Arc::new(SqliteHealthStore::new(handheld_db.clone())),
            transport: handheld.endpoint.clone(),
            clock,
            config: SyncConfig::default(),
        });
        (handheld_db, engine)
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_with_pending_steps_keeps_offline_rows() {
        let Rig {
            link,
            handheld,
            sensor_events,
            cache,
            clock,
            unit,
            ..
        } = rig(0.9);
        let (handheld_db, engine) = handheld_engine(&handheld, clock.clone());
        let engine_handle = engine.spawn(handheld.events);
        let (readings_tx, readings) = mpsc::channel(8);
        let sensor_handle = unit.spawn(readings, sensor_events);

        // One cached row of 250 and 100 steps still pending while offline.
        for (total, expected_rows) in [(0, 0), (250, 1), (350, 1)] {
            readings_tx.send(total).await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
            assert_eq!(cache.list_all().unwrap().len(), expected_rows);
            clock.advance(TimeDelta::minutes(1));
        }

        link.connect().await.unwrap();
        let mut monitor = engine_handle.monitor();
        monitor.wait_for(|s| s.stats.applied == 2).await.unwrap();

        let entry = handheld_db
            .lock()
            .unwrap()
            .get_ledger_entry(clock.today())
            .unwrap()
            .unwrap();
        assert_eq!(entry.running_total, 350);
        assert!(cache.list_unsynced().unwrap().is_empty());

        sensor_handle.shutdown().await;
        engine_handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_then_live_flush_reaches_ledger() {
        let Rig {
            link,
            handheld,
            sensor_events,
            cache,
            clock,
            unit,
            ..
        } = rig(0.9);
        let (handheld_db, engine) = handheld_engine(&handheld, clock.clone());
        let engine_handle = engine.spawn(handheld.events);
        let (readings_tx, readings) = mpsc::channel(8);
        let sensor_handle = unit.spawn(readings, sensor_events);

        link.connect().await.unwrap();
        let mut monitor = engine_handle.monitor();
        monitor
            .wait_for(|s| s.stats.backfills_requested == 1)
            .await
            .unwrap();

        readings_tx.send(0).await.unwrap();
        readings_tx.send(120).await.unwrap();
        tokio::time::sleep(Duration::from_secs(15 * 60)).await;
        monitor.wait_for(|s| s.stats.applied == 1).await.unwrap();

        clock.advance(TimeDelta::minutes(1));
        readings_tx.send(370).await.unwrap();
        monitor.wait_for(|s| s.stats.applied == 2).await.unwrap();

        let entry = handheld_db
            .lock()
            .unwrap()
            .get_ledger_entry(clock.today())
            .unwrap()
            .unwrap();
        assert_eq!(entry.running_total, 370);
        assert!(cache.list_unsynced().unwrap().is_empty());

        sensor_handle.shutdown().await;
        engine_handle.shutdown().await;
    }
}
