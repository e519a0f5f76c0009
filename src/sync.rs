//! Sync orchestrator.
//!
//! One run: probe connectivity, upload every pending entity in dependency
//! order, replay the outbox, then refresh reference data. Runs never overlap;
//! a run that has been "syncing" for longer than the stale-lock timeout is
//! treated as dead and replaced.
//!
//! Status moves `idle -> syncing -> success|error -> idle` (or straight back
//! to `idle` when offline) and is pushed to subscribers.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::SyncConfig;
use crate::connectivity::{self, ConnectivityProbe};
use crate::download::{self, DownloadReport};
use crate::entities;
use crate::error::Result;
use crate::outbox::{self, RetryPolicy};
use crate::remote::RemoteTable;
use crate::store::{LocalStore, StoreProvider};
use crate::upload::{self, SyncReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Idle,
    Syncing,
    Success,
    Error,
}

/// What one completed run did.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub uploads: Vec<(String, SyncReport)>,
    pub outbox: SyncReport,
    pub download: DownloadReport,
}

impl RunSummary {
    /// Uploads and outbox replays combined.
    pub fn pushed(&self) -> SyncReport {
        let mut total = self.outbox;
        for (_, report) in &self.uploads {
            total += *report;
        }
        total
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Completed(RunSummary),
    /// The probe reported no connectivity; nothing was attempted.
    Offline,
    /// Another run holds the lock.
    AlreadyRunning,
}

/// Unsynced rows per table plus pending outbox entries.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct PendingCounts {
    pub tables: BTreeMap<String, i64>,
    pub outbox: i64,
}

impl PendingCounts {
    pub fn total(&self) -> i64 {
        self.tables.values().sum::<i64>() + self.outbox
    }
}

type Listener = Arc<dyn Fn(SyncStatus) + Send + Sync>;
type Listeners = Mutex<BTreeMap<u64, Listener>>;

/// Handle returned by [`SyncEngine::on_sync_status_change`].
pub struct Subscription {
    listeners: Weak<Listeners>,
    id: u64,
}

impl Subscription {
    pub fn unsubscribe(self) {
        if let Some(listeners) = self.listeners.upgrade() {
            lock(&listeners).remove(&self.id);
        }
    }
}

/// Handle of the background timer started by
/// [`SyncEngine::start_periodic_sync`]. Dropping it also stops the timer.
pub struct PeriodicSync {
    cancel_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl PeriodicSync {
    /// Stop scheduling runs. A run already in progress finishes.
    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }

    /// Cancel and wait for the timer task to exit.
    pub async fn stop(self) {
        self.cancel();
        if let Err(e) = self.handle.await {
            warn!(error = %e, "periodic sync task ended abnormally");
        }
    }
}

#[derive(Debug, Default)]
struct RunLock {
    since: Option<DateTime<Utc>>,
    generation: u64,
}

/// Releases the run lock unless a newer run has taken it over.
struct RunGuard<'a> {
    lock: &'a Mutex<RunLock>,
    generation: u64,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        let mut lock = lock(self.lock);
        if lock.generation == self.generation {
            lock.since = None;
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct SyncEngine {
    store: Arc<StoreProvider>,
    remote: Arc<dyn RemoteTable>,
    probe: Arc<dyn ConnectivityProbe>,
    config: SyncConfig,
    run_lock: Mutex<RunLock>,
    status: Mutex<SyncStatus>,
    last_sync: Mutex<Option<DateTime<Utc>>>,
    listeners: Arc<Listeners>,
    next_listener_id: AtomicU64,
    debounce_generation: AtomicU64,
}

impl SyncEngine {
    pub fn new(
        store: Arc<StoreProvider>,
        remote: Arc<dyn RemoteTable>,
        probe: Arc<dyn ConnectivityProbe>,
        config: SyncConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            remote,
            probe,
            config,
            run_lock: Mutex::new(RunLock::default()),
            status: Mutex::new(SyncStatus::Idle),
            last_sync: Mutex::new(None),
            listeners: Arc::new(Mutex::new(BTreeMap::new())),
            next_listener_id: AtomicU64::new(1),
            debounce_generation: AtomicU64::new(0),
        })
    }

    /// Build an engine whose configuration includes the overrides stored in
    /// `local_settings`.
    pub async fn with_stored_config(
        store: Arc<StoreProvider>,
        remote: Arc<dyn RemoteTable>,
        probe: Arc<dyn ConnectivityProbe>,
    ) -> Result<Arc<Self>> {
        let local = store.ensure_ready().await?;
        let config = local
            .with_transaction(|tx| Ok(SyncConfig::load(tx.connection())))
            .await?;
        debug!(?config, "loaded sync configuration");
        Ok(Self::new(store, remote, probe, config))
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn remote(&self) -> &dyn RemoteTable {
        self.remote.as_ref()
    }

    pub async fn is_online(&self) -> bool {
        connectivity::is_online(self.probe.as_ref(), self.config.probe_timeout()).await
    }

    pub async fn ensure_store_ready(&self) -> Result<Arc<LocalStore>> {
        self.store.ensure_ready().await
    }

    pub fn status(&self) -> SyncStatus {
        *lock(&self.status)
    }

    pub fn last_sync(&self) -> Option<DateTime<Utc>> {
        *lock(&self.last_sync)
    }

    /// True while a run holds the lock.
    pub fn is_syncing(&self) -> bool {
        lock(&self.run_lock).since.is_some()
    }

    pub fn on_sync_status_change<F>(&self, listener: F) -> Subscription
    where
        F: Fn(SyncStatus) + Send + Sync + 'static,
    {
        let id = self.next_listener_id.fetch_add(1, Ordering::SeqCst);
        lock(&self.listeners).insert(id, Arc::new(listener));
        Subscription {
            listeners: Arc::downgrade(&self.listeners),
            id,
        }
    }

    /// Publish `status` on behalf of the run holding `generation`. A run that
    /// lost the lock to a newer one stays quiet.
    fn emit(&self, generation: u64, status: SyncStatus) {
        if lock(&self.run_lock).generation != generation {
            debug!(?status, generation, "superseded run, status not published");
            return;
        }
        *lock(&self.status) = status;
        let listeners: Vec<Listener> = lock(&self.listeners).values().cloned().collect();
        for listener in listeners {
            listener(status);
        }
    }

    fn try_acquire(&self) -> Option<RunGuard<'_>> {
        let mut run = lock(&self.run_lock);
        let now = Utc::now();
        if let Some(since) = run.since {
            let age = (now - since).to_std().unwrap_or_default();
            if age < self.config.stale_lock_timeout() {
                return None;
            }
            warn!(
                started_at = %since.to_rfc3339(),
                age_secs = age.as_secs(),
                "clearing stale sync lock"
            );
        }
        run.since = Some(now);
        run.generation += 1;
        Some(RunGuard {
            lock: &self.run_lock,
            generation: run.generation,
        })
    }

    /// Run one full sync and wait for it.
    ///
    /// Per-record failures are absorbed into the summary; only unexpected
    /// failures (local store errors) are returned, after the status has
    /// moved through `error`.
    pub async fn sync_all(&self) -> Result<SyncOutcome> {
        let Some(guard) = self.try_acquire() else {
            debug!("sync already running, skipping");
            return Ok(SyncOutcome::AlreadyRunning);
        };
        let generation = guard.generation;

        self.emit(generation, SyncStatus::Syncing);
        match self.run().await {
            Ok(None) => {
                info!("offline, sync run skipped");
                self.emit(generation, SyncStatus::Idle);
                Ok(SyncOutcome::Offline)
            }
            Ok(Some(summary)) => {
                *lock(&self.last_sync) = Some(Utc::now());
                let pushed = summary.pushed();
                info!(
                    attempted = pushed.attempted,
                    synced = pushed.synced,
                    failed = pushed.failed,
                    downloaded = summary.download.rows_written(),
                    "sync run complete"
                );
                self.emit(generation, SyncStatus::Success);
                self.emit(generation, SyncStatus::Idle);
                Ok(SyncOutcome::Completed(summary))
            }
            Err(e) => {
                error!(error = %e, "sync run failed");
                self.emit(generation, SyncStatus::Error);
                self.emit(generation, SyncStatus::Idle);
                Err(e)
            }
        }
    }

    async fn run(&self) -> Result<Option<RunSummary>> {
        if !self.is_online().await {
            return Ok(None);
        }
        let store = self.ensure_store_ready().await?;
        let remote = self.remote.as_ref();

        let mut summary = RunSummary::default();
        for spec in upload::UPLOAD_ORDER {
            let report = upload::sync_pending(&store, remote, spec).await?;
            summary.uploads.push((spec.local_table.to_string(), report));
        }
        summary.outbox =
            outbox::process_sync_queue(&store, remote, &RetryPolicy::from_config(&self.config))
                .await?;
        summary.download = download::download_data(&store, remote).await?;
        Ok(Some(summary))
    }

    /// Schedule a run after `delay`. Calls arriving within the delay restart
    /// it, so a burst of changes yields one run.
    pub fn sync_all_debounced(self: &Arc<Self>, delay: Duration) {
        let generation = self.debounce_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if engine.debounce_generation.load(Ordering::SeqCst) != generation {
                return;
            }
            if let Err(e) = engine.sync_all().await {
                warn!(error = %e, "debounced sync failed");
            }
        });
    }

    /// Run [`sync_all`](Self::sync_all) every `interval`, first tick one
    /// interval from now.
    pub fn start_periodic_sync(self: &Arc<Self>, interval: Duration) -> PeriodicSync {
        let interval = interval.max(Duration::from_millis(1));
        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        let engine = Arc::clone(self);

        let handle = tokio::spawn(async move {
            info!(interval_ms = interval.as_millis() as u64, "periodic sync started");
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    changed = cancel_rx.changed() => {
                        if changed.is_err() || *cancel_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = engine.sync_all().await {
                            warn!(error = %e, "periodic sync failed");
                        }
                    }
                }
            }
            info!("periodic sync stopped");
        });

        PeriodicSync { cancel_tx, handle }
    }

    pub async fn pending_counts(&self) -> Result<PendingCounts> {
        let store = self.ensure_store_ready().await?;
        let mut counts = PendingCounts::default();
        for spec in entities::ALL {
            let row = store
                .query_one(
                    format!("SELECT COUNT(*) AS n FROM {} WHERE synced = 0", spec.local_table),
                    vec![],
                )
                .await?;
            let n = row
                .and_then(|r| r.get("n").and_then(Value::as_i64))
                .unwrap_or(0);
            counts.tables.insert(spec.local_table.to_string(), n);
        }
        counts.outbox = outbox::pending_count(&store).await?;
        Ok(counts)
    }

    #[cfg(test)]
    fn force_syncing_since(&self, since: DateTime<Utc>) {
        let mut run = lock(&self.run_lock);
        run.since = Some(since);
        run.generation += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectivity::ManualProbe;
    use crate::remote::MemoryRemote;
    use serde_json::json;

    struct Harness {
        _dir: tempfile::TempDir,
        engine: Arc<SyncEngine>,
        remote: Arc<MemoryRemote>,
        probe: Arc<ManualProbe>,
        events: Arc<Mutex<Vec<SyncStatus>>>,
    }

    impl Harness {
        fn new(online: bool) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let store = Arc::new(StoreProvider::new(
                dir.path().join("pos.db"),
                Duration::from_secs(10),
            ));
            let remote = Arc::new(MemoryRemote::new());
            let probe = Arc::new(ManualProbe::new(online));
            let engine = SyncEngine::new(
                store,
                remote.clone(),
                probe.clone(),
                SyncConfig::default(),
            );
            let events = Arc::new(Mutex::new(Vec::new()));
            let sink = events.clone();
            // Dropping the handle does not unsubscribe.
            let _subscription = engine.on_sync_status_change(move |s| sink.lock().unwrap().push(s));
            Self {
                _dir: dir,
                engine,
                remote,
                probe,
                events,
            }
        }

        fn events(&self) -> Vec<SyncStatus> {
            self.events.lock().unwrap().clone()
        }

        fn runs(&self) -> usize {
            self.events()
                .iter()
                .filter(|s| **s == SyncStatus::Syncing)
                .count()
        }

        async fn store(&self) -> Arc<LocalStore> {
            self.engine.ensure_store_ready().await.unwrap()
        }
    }

    async fn seed_unsynced_sale(store: &LocalStore) {
        store
            .execute(
                "INSERT INTO sales (id, total_amount, created_at, synced) VALUES ('s1', 4.0, '2026-10-18T09:00:00Z', 0)",
                vec![],
            )
            .await
            .unwrap();
        store
            .execute(
                "INSERT INTO sale_items (id, sale_id, product_id, quantity, unit_price, subtotal, synced)
                 VALUES ('si1', 's1', 'p1', 2, 2.0, 4.0, 0)",
                vec![],
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_offline_run_goes_straight_back_to_idle() {
        let h = Harness::new(false);
        let store = h.store().await;
        seed_unsynced_sale(&store).await;

        let outcome = h.engine.sync_all().await.unwrap();
        assert_eq!(outcome, SyncOutcome::Offline);
        assert_eq!(h.events(), vec![SyncStatus::Syncing, SyncStatus::Idle]);
        assert!(h.remote.rows("sales").is_empty());
        assert!(!h.engine.is_syncing());
        assert!(h.engine.last_sync().is_none());
    }

    #[tokio::test]
    async fn test_online_run_uploads_and_is_idempotent() {
        let h = Harness::new(true);
        let store = h.store().await;
        seed_unsynced_sale(&store).await;

        let outcome = h.engine.sync_all().await.unwrap();
        let SyncOutcome::Completed(summary) = outcome else {
            panic!("expected a completed run, got {outcome:?}");
        };
        assert_eq!(summary.uploads[0].0, "sales");
        assert_eq!(summary.pushed().synced, 1);
        assert_eq!(
            h.events(),
            vec![SyncStatus::Syncing, SyncStatus::Success, SyncStatus::Idle]
        );
        assert!(h.remote.get("sales", "s1").is_some());
        assert!(h.remote.get("sale_items", "si1").is_some());
        assert_eq!(h.engine.status(), SyncStatus::Idle);
        assert!(h.engine.last_sync().is_some());

        let writes = h.remote.write_count();
        let before = store.query_all("SELECT * FROM sales", vec![]).await.unwrap();

        let outcome = h.engine.sync_all().await.unwrap();
        assert!(matches!(outcome, SyncOutcome::Completed(s) if s.pushed().attempted == 0));
        assert_eq!(h.remote.write_count(), writes);
        assert_eq!(h.remote.rows("sales").len(), 1);
        let after = store.query_all("SELECT * FROM sales", vec![]).await.unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_overlapping_run_is_refused() {
        let h = Harness::new(true);
        h.engine.force_syncing_since(Utc::now());

        let outcome = h.engine.sync_all().await.unwrap();
        assert_eq!(outcome, SyncOutcome::AlreadyRunning);
        assert!(h.events().is_empty());
    }

    #[tokio::test]
    async fn test_stale_lock_is_cleared() {
        let h = Harness::new(true);
        h.engine
            .force_syncing_since(Utc::now() - chrono::Duration::minutes(3));

        let outcome = h.engine.sync_all().await.unwrap();
        assert!(matches!(outcome, SyncOutcome::Completed(_)));
        assert_eq!(h.runs(), 1);
        assert!(!h.engine.is_syncing());
    }

    #[tokio::test]
    async fn test_superseded_run_does_not_publish() {
        let h = Harness::new(true);
        let stale = h.engine.try_acquire().unwrap();
        h.engine
            .force_syncing_since(Utc::now() - chrono::Duration::minutes(3));
        let current = h.engine.try_acquire().unwrap();

        h.engine.emit(current.generation, SyncStatus::Syncing);
        h.engine.emit(stale.generation, SyncStatus::Success);
        h.engine.emit(stale.generation, SyncStatus::Idle);
        assert_eq!(h.events(), vec![SyncStatus::Syncing]);
        assert_eq!(h.engine.status(), SyncStatus::Syncing);

        drop(stale);
        assert!(h.engine.is_syncing());
        drop(current);
        assert!(!h.engine.is_syncing());
    }

    #[tokio::test]
    async fn test_store_failure_ends_in_error_and_releases_lock() {
        let h = Harness::new(true);
        let store = h.store().await;
        store.execute("DROP TABLE sync_queue", vec![]).await.unwrap();

        assert!(h.engine.sync_all().await.is_err());
        assert_eq!(
            h.events(),
            vec![SyncStatus::Syncing, SyncStatus::Error, SyncStatus::Idle]
        );
        assert!(!h.engine.is_syncing());
    }

    #[tokio::test]
    async fn test_debounce_collapses_bursts() {
        let h = Harness::new(true);
        h.store().await;

        for _ in 0..5 {
            h.engine.sync_all_debounced(Duration::from_millis(50));
        }
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(h.runs(), 1);
    }

    #[tokio::test]
    async fn test_periodic_sync_runs_until_stopped() {
        let h = Harness::new(true);
        h.store().await;

        let periodic = h.engine.start_periodic_sync(Duration::from_millis(60));
        tokio::time::sleep(Duration::from_millis(400)).await;
        periodic.stop().await;

        let runs = h.runs();
        assert!(runs >= 2, "expected at least two runs, got {runs}");
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(h.runs(), runs);
    }

    #[tokio::test]
    async fn test_unsubscribed_listener_is_not_called() {
        let h = Harness::new(false);
        let calls = Arc::new(AtomicU64::new(0));
        let counter = calls.clone();
        let subscription = h.engine.on_sync_status_change(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        h.engine.sync_all().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        subscription.unsubscribe();
        h.engine.sync_all().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_pending_counts() {
        let h = Harness::new(false);
        let store = h.store().await;
        seed_unsynced_sale(&store).await;
        store
            .with_transaction(|tx| {
                outbox::enqueue(tx, "products", outbox::Operation::Update, "p1", &json!({ "stock": 1 }))
            })
            .await
            .unwrap();

        let counts = h.engine.pending_counts().await.unwrap();
        assert_eq!(counts.tables["sales"], 1);
        assert_eq!(counts.tables["sale_items"], 1);
        assert_eq!(counts.outbox, 1);
        assert_eq!(counts.total(), 3);

        h.probe.set_online(true);
        h.engine.sync_all().await.unwrap();
        let counts = h.engine.pending_counts().await.unwrap();
        assert_eq!(counts.tables["sales"], 0);
    }
}
