//! Handheld-side reconciliation: connection status, idempotent ledger apply,
//! health store export with retry, and historical backfill.

use std::fmt::Display;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Result, anyhow};
use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, until_next_local_midnight};
use crate::config::SyncConfig;
use crate::db::Database;
use crate::health_store::HealthStore;
use crate::models::{ConnectionStatus, ExternalRecord, LedgerApply, from_millis};
use crate::protocol::{HISTORICAL_DATA_RESPONSE_PATH, HistoricalEntry, SyncMessage};
use crate::retry::with_retry;
use crate::transport::{PeerTransport, TransportEvent, push_sync_message};

/// Everything the engine talks to, handed in at construction.
pub struct EngineDeps {
    pub db: Arc<Mutex<Database>>,
    pub store: Arc<dyn HealthStore>,
    pub transport: Arc<dyn PeerTransport>,
    pub clock: Arc<dyn Clock>,
    pub config: SyncConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    pub applied: u64,
    pub duplicates: u64,
    pub store_failures: u64,
    pub discarded: u64,
    pub backfills_requested: u64,
    pub last_failure: Option<String>,
}

/// Observable engine state: current status, when it was entered, and counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineSnapshot {
    pub status: ConnectionStatus,
    pub since: DateTime<Utc>,
    pub stats: SyncStats,
}

impl EngineSnapshot {
    /// True when the engine has been `Syncing` for longer than `threshold`.
    #[must_use]
    pub fn is_stalled(&self, now: DateTime<Utc>, threshold: TimeDelta) -> bool {
        self.status == ConnectionStatus::Syncing && now - self.since > threshold
    }
}

enum Command {
    MidnightReset(NaiveDate),
    RequestBackfill,
}

pub struct ReconciliationEngine {
    deps: EngineDeps,
    state: watch::Sender<EngineSnapshot>,
}

impl ReconciliationEngine {
    #[must_use]
    pub fn new(deps: EngineDeps) -> Self {
        let (state, _) = watch::channel(EngineSnapshot {
            status: ConnectionStatus::Disconnected,
            since: deps.clock.now(),
            stats: SyncStats::default(),
        });
        Self { deps, state }
    }

    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        self.state.borrow().status
    }

    #[must_use]
    pub fn snapshot(&self) -> EngineSnapshot {
        self.state.borrow().clone()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<EngineSnapshot> {
        self.state.subscribe()
    }

    fn lock_db(&self) -> MutexGuard<'_, Database> {
        self.deps
            .db
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn set_status(&self, status: ConnectionStatus) {
        let now = self.deps.clock.now();
        self.state.send_if_modified(|snap| {
            if snap.status == status {
                return false;
            }
            debug!(from = %snap.status, to = %status, "connection status changed");
            snap.status = status;
            snap.since = now;
            true
        });
    }

    fn record(&self, update: impl FnOnce(&mut SyncStats)) {
        self.state.send_modify(|snap| update(&mut snap.stats));
    }

    fn discard(&self, path: &str, reason: &dyn Display) {
        warn!(path, error = %reason, "discarding payload");
        self.record(|s| s.discarded += 1);
    }

    /// Process one transport callback. Never fails; problems are logged and counted.
    pub async fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::PeerConnected(peer) => {
                info!(%peer, "peer connected");
                self.set_status(ConnectionStatus::Connected);
            }
            TransportEvent::PeerDisconnected(peer) => {
                info!(%peer, "peer disconnected");
                self.set_status(ConnectionStatus::Disconnected);
            }
            TransportEvent::ItemChanged { path, payload } => {
                self.handle_payload(&path, &payload).await;
            }
            TransportEvent::MessageReceived {
                from,
                path,
                payload,
            } => {
                debug!(%from, path = %path, "message received");
                self.handle_payload(&path, &payload).await;
            }
        }
    }

    async fn handle_payload(&self, path: &str, payload: &[u8]) {
        match SyncMessage::decode(path, payload) {
            Ok(SyncMessage::StepUpdate {
                step_delta,
                timestamp,
            }) => {
                let timestamp = match timestamp.map(from_millis).transpose() {
                    Ok(Some(ts)) => ts,
                    Ok(None) => self.deps.clock.now(),
                    Err(e) => return self.discard(path, &format!("{e:#}")),
                };
                self.apply_unit(&[(timestamp, step_delta)]).await;
            }
            Ok(SyncMessage::HistoricalDataResponse { historical_data }) => {
                self.apply_backfill(historical_data).await;
            }
            Ok(SyncMessage::PeerConnected) => {
                self.set_status(ConnectionStatus::Connected);
                self.request_backfill().await;
            }
            Ok(SyncMessage::RequestHistoricalData { .. }) => {
                self.discard(path, &"history requests are served by the sensor unit");
            }
            Err(e) => self.discard(path, &e),
        }
    }

    /// Applies a backfill response in ascending timestamp order as one unit of work.
    pub async fn apply_backfill(&self, entries: Vec<HistoricalEntry>) {
        let mut work = Vec::with_capacity(entries.len());
        for entry in entries {
            match from_millis(entry.timestamp) {
                Ok(ts) => work.push((ts, entry.step_delta)),
                Err(e) => self.discard(HISTORICAL_DATA_RESPONSE_PATH, &format!("{e:#}")),
            }
        }
        if work.is_empty() {
            debug!("backfill response carried nothing to apply");
            return;
        }
        work.sort_by_key(|&(ts, _)| ts);
        info!(count = work.len(), "applying backfill");
        self.apply_unit(&work).await;
    }

    async fn apply_unit(&self, work: &[(DateTime<Utc>, i64)]) {
        // Receiving data implies the link is up.
        if self.status() == ConnectionStatus::Disconnected {
            self.set_status(ConnectionStatus::Connected);
        }
        self.set_status(ConnectionStatus::Syncing);
        for &(timestamp, delta) in work {
            self.apply_increment(timestamp, delta).await;
        }
        self.set_status(ConnectionStatus::Connected);
    }

    /// Export one increment to the health store, then fold it into today's ledger entry.
    ///
    /// The ledger is updated whether or not the export succeeded. Returns `None`
    /// only when the ledger write itself failed.
    pub async fn apply_increment(&self, timestamp: DateTime<Utc>, delta: i64) -> Option<LedgerApply> {
        let record = ExternalRecord::for_increment(timestamp, delta);
        let key = record.idempotency_key.clone();

        let store = self.deps.store.clone();
        let outcome = with_retry(&self.deps.config.retry, "health store write", |_| {
            let store = store.clone();
            let record = record.clone();
            async move { store.insert_record(&record).await }
        })
        .await;

        match outcome.result {
            Ok(true) => debug!(key = %key, attempts = outcome.attempts, "health record written"),
            Ok(false) => debug!(key = %key, "health record already present"),
            Err(e) => {
                error!(key = %key, attempts = outcome.attempts, error = %format!("{e:#}"), "health store write failed");
                self.record(|s| {
                    s.store_failures += 1;
                    s.last_failure = Some(format!("health store write for {key}: {e:#}"));
                });
            }
        }

        let date = self.deps.clock.today();
        let applied = self.lock_db().apply_ledger_delta(date, &key, timestamp, delta);
        match applied {
            Ok(result @ LedgerApply::Applied(_)) => {
                info!(%date, delta, total = result.entry().running_total, "ledger updated");
                self.record(|s| s.applied += 1);
                Some(result)
            }
            Ok(result) => {
                debug!(key = %key, "increment already applied");
                self.record(|s| s.duplicates += 1);
                Some(result)
            }
            Err(e) => {
                error!(key = %key, error = %format!("{e:#}"), "ledger update failed");
                self.record(|s| s.last_failure = Some(format!("ledger update for {key}: {e:#}")));
                None
            }
        }
    }

    /// Ask the sensor unit for everything newer than the last exported record.
    pub async fn request_backfill(&self) {
        let now = self.deps.clock.now();
        let fallback = now - self.deps.config.backfill_fallback;
        let last_known = match self.deps.store.latest_end_time().await {
            Ok(latest) => latest.unwrap_or(fallback),
            Err(e) => {
                warn!(error = %format!("{e:#}"), "could not read last export time");
                fallback
            }
        };

        let message = SyncMessage::RequestHistoricalData {
            last_known_time: last_known.timestamp_millis(),
        };
        match push_sync_message(
            self.deps.transport.as_ref(),
            &message,
            self.deps.config.transport_timeout,
        )
        .await
        {
            Ok(()) => {
                info!(%last_known, "requested historical data");
                self.record(|s| s.backfills_requested += 1);
            }
            Err(e) => warn!(error = %e, "backfill request not delivered"),
        }
    }

    /// Make sure `date` has a ledger entry. Returns true when one was created.
    pub fn ensure_day(&self, date: NaiveDate) -> bool {
        let created = self.lock_db().ensure_ledger_entry(date);
        match created {
            Ok(true) => {
                info!(%date, "started new ledger day");
                true
            }
            Ok(false) => false,
            Err(e) => {
                error!(%date, error = %format!("{e:#}"), "could not create ledger entry");
                false
            }
        }
    }

    async fn handle_command(&self, command: Command) {
        match command {
            Command::MidnightReset(date) => {
                self.ensure_day(date);
            }
            Command::RequestBackfill => self.request_backfill().await,
        }
    }

    /// Start the worker and the midnight scheduler. All event handling runs on the worker.
    pub fn spawn(self, mut events: mpsc::Receiver<TransportEvent>) -> EngineHandle {
        let monitor = self.subscribe();
        let clock = self.deps.clock.clone();
        let (commands_tx, mut commands) = mpsc::channel(16);
        let mut tasks = JoinSet::new();

        tasks.spawn(async move {
            self.ensure_day(self.deps.clock.today());
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Some(event) => self.handle_event(event).await,
                        None => {
                            info!("transport event stream closed");
                            break;
                        }
                    },
                    Some(command) = commands.recv() => self.handle_command(command).await,
                }
            }
        });

        let midnight_tx = commands_tx.clone();
        tasks.spawn(async move {
            loop {
                let (date, wait) = until_next_local_midnight(clock.local_now());
                tokio::time::sleep(wait.max(Duration::from_secs(1))).await;
                if midnight_tx.send(Command::MidnightReset(date)).await.is_err() {
                    break;
                }
            }
        });

        EngineHandle {
            tasks,
            monitor,
            commands: commands_tx,
        }
    }
}

/// Owns the engine's background tasks. Dropping or shutting it down cancels them.
pub struct EngineHandle {
    tasks: JoinSet<()>,
    monitor: watch::Receiver<EngineSnapshot>,
    commands: mpsc::Sender<Command>,
}

impl EngineHandle {
    #[must_use]
    pub fn monitor(&self) -> watch::Receiver<EngineSnapshot> {
        self.monitor.clone()
    }

    #[must_use]
    pub fn snapshot(&self) -> EngineSnapshot {
        self.monitor.borrow().clone()
    }

    pub async fn request_backfill(&self) -> Result<()> {
        self.commands
            .send(Command::RequestBackfill)
            .await
            .map_err(|_| anyhow!("Reconciliation engine has stopped"))
    }

    /// Abort the worker and scheduler, cancelling any in-flight retry.
    pub async fn shutdown(mut self) {
        self.tasks.abort_all();
        while self.tasks.join_next().await.is_some() {}
    }
}
