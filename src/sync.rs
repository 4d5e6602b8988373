//! Sync scheduler - drains the offline queue against the remote service
//!
//! A drain walks the pending queue entries in enqueue order, one at a time.
//! Delivered entries are removed and their source record is marked synced;
//! failed entries keep their place with an updated error and a backoff
//! deadline. Drains never overlap: a drain requested while another is running
//! returns `DrainOutcome::AlreadyRunning`.
//!
//! The background task drains on a fixed interval and immediately when the
//! network comes back.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::{debug, info, warn};
use rand::Rng;
use serde::Serialize;
use tokio::sync::{Mutex, Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::error::{OffsyncError, Result};
use crate::queue::{OfflineQueue, QueuedEntry};
use crate::remote::{DEFAULT_REMOTE_TIMEOUT, Remote, save_with_timeout};
use crate::store::{LocalStore, RecordKey, now_iso, now_ms};

/// Configuration for the sync scheduler
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Interval between timer drains
    pub interval: Duration,
    /// Backoff after the first failure
    pub backoff_initial: Duration,
    /// Upper bound for the exponential part of the backoff
    pub backoff_max: Duration,
    /// Extra random delay as a fraction of the backoff (0.0 - 1.0)
    pub jitter: f64,
    /// Deadline for each delivery attempt
    pub remote_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            backoff_initial: Duration::from_secs(1),
            backoff_max: Duration::from_secs(300),
            jitter: 0.2,
            remote_timeout: DEFAULT_REMOTE_TIMEOUT,
        }
    }
}

impl SyncConfig {
    /// Exponential backoff for the given attempt count, without jitter.
    ///
    /// Attempt 1 waits `backoff_initial`, each later attempt doubles it, capped
    /// at `backoff_max`.
    pub fn base_backoff(&self, attempts: u32) -> Duration {
        let exp = attempts.saturating_sub(1).min(30);
        self.backoff_initial
            .checked_mul(1u32 << exp)
            .unwrap_or(self.backoff_max)
            .min(self.backoff_max)
    }

    /// Backoff with random jitter added.
    pub fn backoff_with_jitter(&self, attempts: u32) -> Duration {
        let base = self.base_backoff(attempts);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return base;
        }
        let fraction: f64 = rand::rng().random_range(0.0..=jitter);
        base + base.mul_f64(fraction)
    }
}

/// Why a drain ran
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DrainTrigger {
    /// Periodic tick; honours per-entry backoff
    Timer,
    /// Connectivity came back; ignores backoff
    NetworkRestored,
    /// Explicit request; ignores backoff
    Manual,
}

impl DrainTrigger {
    fn respects_backoff(&self) -> bool {
        matches!(self, DrainTrigger::Timer)
    }
}

/// What one drain did
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub trigger: DrainTrigger,
    /// Entries a delivery was attempted for
    pub attempted: usize,
    pub delivered: usize,
    pub failed: usize,
    /// Entries skipped because their backoff had not expired
    pub deferred: usize,
    /// Entries held back behind an earlier failure on the same endpoint
    pub blocked: usize,
    pub finished_at: String,
}

impl DrainReport {
    fn new(trigger: DrainTrigger) -> Self {
        Self {
            trigger,
            attempted: 0,
            delivered: 0,
            failed: 0,
            deferred: 0,
            blocked: 0,
            finished_at: String::new(),
        }
    }
}

/// Result of asking for a drain
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
    Completed(DrainReport),
    /// Another drain held the lock
    AlreadyRunning,
    /// Timer drain skipped while the network is known to be down
    Offline,
}

/// Observable state of the sync layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    pub online: bool,
    pub draining: bool,
    pub pending: usize,
    pub evicted: u64,
    pub in_flight: Option<RecordKey>,
    pub last_drain: Option<DrainReport>,
}

/// Shared online/offline flag with a wake-up for the scheduler.
#[derive(Debug)]
pub struct NetworkMonitor {
    online: AtomicBool,
    restored: Notify,
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self {
            online: AtomicBool::new(true),
            restored: Notify::new(),
        }
    }
}

impl NetworkMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Record a connectivity change. Going from offline to online wakes the
    /// scheduler for an immediate drain.
    pub fn set_online(&self, online: bool) {
        let was_online = self.online.swap(online, Ordering::SeqCst);
        if online && !was_online {
            info!("Network restored");
            self.restored.notify_one();
        } else if !online && was_online {
            info!("Network lost");
        }
    }

    async fn wait_restored(&self) {
        self.restored.notified().await;
    }
}

/// Drains the offline queue.
pub struct SyncScheduler {
    store: Arc<LocalStore>,
    queue: Arc<OfflineQueue>,
    remote: Arc<dyn Remote>,
    network: Arc<NetworkMonitor>,
    config: SyncConfig,
    drain_lock: Mutex<()>,
    in_flight: std::sync::Mutex<Option<RecordKey>>,
    last_drain: std::sync::Mutex<Option<DrainReport>>,
}

impl std::fmt::Debug for SyncScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncScheduler")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SyncScheduler {
    pub fn new(
        store: Arc<LocalStore>,
        queue: Arc<OfflineQueue>,
        remote: Arc<dyn Remote>,
        network: Arc<NetworkMonitor>,
        config: SyncConfig,
    ) -> Self {
        Self {
            store,
            queue,
            remote,
            network,
            config,
            drain_lock: Mutex::new(()),
            in_flight: std::sync::Mutex::new(None),
            last_drain: std::sync::Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn network(&self) -> &Arc<NetworkMonitor> {
        &self.network
    }

    /// True while a drain holds the lock.
    pub fn is_draining(&self) -> bool {
        self.drain_lock.try_lock().is_err()
    }

    /// Run one drain pass.
    pub async fn drain(&self, trigger: DrainTrigger) -> Result<DrainOutcome> {
        let Ok(_guard) = self.drain_lock.try_lock() else {
            debug!("Drain ({:?}) skipped, another drain is running", trigger);
            return Ok(DrainOutcome::AlreadyRunning);
        };

        if trigger == DrainTrigger::Timer && !self.network.is_online() {
            debug!("Timer drain skipped while offline");
            return Ok(DrainOutcome::Offline);
        }

        let pending = self.queue.pending().await?;
        let mut report = DrainReport::new(trigger);
        let mut blocked_endpoints: HashSet<String> = HashSet::new();
        let now = now_ms();

        for queued in pending {
            let endpoint = queued.entry.endpoint.clone();

            if blocked_endpoints.contains(&endpoint) {
                report.blocked += 1;
                continue;
            }

            if trigger.respects_backoff() && !queued.entry.is_due(now) {
                report.deferred += 1;
                blocked_endpoints.insert(endpoint);
                continue;
            }

            report.attempted += 1;
            if self.deliver(queued).await {
                report.delivered += 1;
            } else {
                report.failed += 1;
                blocked_endpoints.insert(endpoint);
            }
        }

        report.finished_at = now_iso();
        if report.attempted > 0 || report.deferred > 0 {
            info!(
                "Drain ({:?}) finished: {} delivered, {} failed, {} deferred, {} blocked",
                trigger, report.delivered, report.failed, report.deferred, report.blocked
            );
        }

        *self.last_drain.lock().unwrap_or_else(|e| e.into_inner()) = Some(report.clone());
        Ok(DrainOutcome::Completed(report))
    }

    /// Deliver one entry. Returns true when the remote acknowledged it.
    async fn deliver(&self, queued: QueuedEntry) -> bool {
        let QueuedEntry { key, entry, .. } = queued;
        self.set_in_flight(Some(key.clone()));

        let result = save_with_timeout(
            self.remote.as_ref(),
            &entry.endpoint,
            &entry.data,
            self.config.remote_timeout,
        )
        .await;

        let delivered = match result {
            Ok(ack) => {
                if let Some(source) = &entry.source {
                    match self
                        .store
                        .mark_synced_if(
                            &source.collection,
                            &source.key,
                            ack.server_id.clone(),
                            entry.data.clone(),
                        )
                        .await
                    {
                        Ok(true) => {}
                        Ok(false) => debug!(
                            "Delivered {}/{} but the record changed or was already synced, leaving it as is",
                            source.collection, source.key
                        ),
                        Err(e) => warn!(
                            "Delivered {}/{} but could not mark it synced: {}",
                            source.collection, source.key, e
                        ),
                    }
                }
                if let Err(e) = self.queue.remove(&key).await {
                    warn!("Delivered queue entry {} but could not remove it: {}", key, e);
                }
                debug!("Delivered queue entry {} to {}", key, entry.endpoint);
                true
            }
            Err(err) => {
                let attempts = entry.attempts + 1;
                let delay = self.config.backoff_with_jitter(attempts);
                let next_attempt_at = now_ms() + delay.as_millis() as i64;
                if err.is_retryable() {
                    debug!(
                        "Delivery of {} to {} failed (attempt {}): {}; retry in {:?}",
                        key, entry.endpoint, attempts, err, delay
                    );
                } else {
                    warn!(
                        "Delivery of {} to {} rejected (attempt {}): {}; retry in {:?}",
                        key, entry.endpoint, attempts, err, delay
                    );
                }
                if let Err(e) = self
                    .queue
                    .record_failure(&key, &err.to_string(), Some(next_attempt_at))
                    .await
                {
                    warn!("Could not record failure for queue entry {}: {}", key, e);
                }
                false
            }
        };

        self.set_in_flight(None);
        delivered
    }

    fn set_in_flight(&self, key: Option<RecordKey>) {
        *self.in_flight.lock().unwrap_or_else(|e| e.into_inner()) = key;
    }

    /// Snapshot of the sync state.
    pub async fn status(&self) -> Result<SyncStatus> {
        Ok(SyncStatus {
            online: self.network.is_online(),
            draining: self.is_draining(),
            pending: self.queue.len().await?,
            evicted: self.queue.evicted(),
            in_flight: self.in_flight.lock().unwrap_or_else(|e| e.into_inner()).clone(),
            last_drain: self.last_drain.lock().unwrap_or_else(|e| e.into_inner()).clone(),
        })
    }

    /// Start the background drain task.
    pub fn spawn(self: Arc<Self>) -> SyncHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let scheduler = self.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(scheduler.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!("Sync scheduler started (interval {:?})", scheduler.config.interval);

            loop {
                let trigger = tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = scheduler.network.wait_restored() => DrainTrigger::NetworkRestored,
                    _ = ticker.tick() => DrainTrigger::Timer,
                };

                if let Err(e) = scheduler.drain(trigger).await {
                    warn!("Drain ({:?}) failed: {}", trigger, e);
                }
            }

            info!("Sync scheduler stopped");
        });

        SyncHandle {
            scheduler: self,
            shutdown_tx,
            task: Some(task),
        }
    }
}

/// Handle to the running background drain task.
pub struct SyncHandle {
    scheduler: Arc<SyncScheduler>,
    shutdown_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for SyncHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncHandle")
            .field("running", &self.task.is_some())
            .finish_non_exhaustive()
    }
}

impl SyncHandle {
    pub fn scheduler(&self) -> &Arc<SyncScheduler> {
        &self.scheduler
    }

    /// Forward an online/offline signal.
    pub fn set_online(&self, online: bool) {
        self.scheduler.network.set_online(online);
    }

    /// Stop the task and wait for an in-progress drain to finish.
    pub async fn shutdown(mut self) -> Result<()> {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.task.take() {
            task.await
                .map_err(|e| OffsyncError::Storage(format!("sync task failed: {}", e)))?;
        }
        Ok(())
    }
}
