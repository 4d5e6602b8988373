//! Service lifecycle - builds and owns every component
//!
//! `SyncService::init` wires the flat store, the local store, the offline
//! queue, the scheduler and the facade together, runs the legacy migration
//! and optionally starts the background drain task. `close` stops the task
//! and releases the store.

use std::sync::Arc;

use log::{info, warn};

use crate::config::Config;
use crate::error::Result;
use crate::facade::ApiFacade;
use crate::migrate::{MigrationReport, Migrator};
use crate::queue::{DEFAULT_QUEUE_CAPACITY, OfflineQueue};
use crate::remote::Remote;
use crate::store::{BackendKind, FlatStore, LocalStore, StoreOptions};
use crate::sync::{DrainOutcome, DrainTrigger, NetworkMonitor, SyncConfig, SyncHandle, SyncScheduler, SyncStatus};

/// Everything `SyncService::init` needs besides the stores and the remote.
#[derive(Debug, Clone)]
pub struct ServiceOptions {
    pub store: StoreOptions,
    pub queue_capacity: usize,
    pub sync: SyncConfig,
    /// Run this migrator on init; `None` skips migration
    pub migrator: Option<Migrator>,
    /// Start the background drain task on init
    pub start_scheduler: bool,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            store: StoreOptions::fallback_only(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            sync: SyncConfig::default(),
            migrator: Some(Migrator::default()),
            start_scheduler: false,
        }
    }
}

impl ServiceOptions {
    pub fn from_config(config: &Config) -> Self {
        let storage = &config.storage;
        let mut store = if storage.force_fallback {
            StoreOptions::fallback_only()
        } else {
            StoreOptions::structured(storage.db_path())
        };
        if let Some(bytes) = storage.max_db_bytes {
            store = store.with_max_db_bytes(bytes);
        }

        Self {
            store,
            queue_capacity: config.sync.queue_capacity,
            sync: config.sync_config(),
            migrator: config.migration.enabled.then(Migrator::default),
            start_scheduler: false,
        }
    }

    pub fn with_scheduler(mut self) -> Self {
        self.start_scheduler = true;
        self
    }
}

/// The persistence layer as one object.
pub struct SyncService {
    store: Arc<LocalStore>,
    queue: Arc<OfflineQueue>,
    network: Arc<NetworkMonitor>,
    scheduler: Arc<SyncScheduler>,
    facade: ApiFacade,
    handle: Option<SyncHandle>,
    migration: Option<MigrationReport>,
}

impl std::fmt::Debug for SyncService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncService")
            .field("backend", &self.store.backend_kind())
            .field("scheduler_running", &self.handle.is_some())
            .finish_non_exhaustive()
    }
}

impl SyncService {
    /// Build the service from explicit parts.
    pub async fn init(options: ServiceOptions, flat: Arc<FlatStore>, remote: Arc<dyn Remote>) -> Result<Self> {
        let store = Arc::new(LocalStore::new(options.store, flat.clone()));
        let backend = store.open().await;
        if backend == BackendKind::Fallback {
            warn!("Running on the fallback store");
        }

        let migration = match &options.migrator {
            Some(migrator) => Some(migrator.run(&store, &flat).await),
            None => None,
        };

        let queue = Arc::new(OfflineQueue::new(store.clone(), options.queue_capacity));
        let network = Arc::new(NetworkMonitor::new());
        let timeout = options.sync.remote_timeout;
        let scheduler = Arc::new(SyncScheduler::new(
            store.clone(),
            queue.clone(),
            remote.clone(),
            network.clone(),
            options.sync,
        ));
        let facade = ApiFacade::new(store.clone(), queue.clone(), remote, network.clone(), timeout);

        let mut service = Self {
            store,
            queue,
            network,
            scheduler,
            facade,
            handle: None,
            migration,
        };
        if options.start_scheduler {
            service.start_scheduler();
        }

        info!("Sync service initialized on {} store", backend);
        Ok(service)
    }

    /// Build the service from configuration, opening stores under `storage.data_dir`.
    pub async fn from_config(config: &Config, remote: Arc<dyn Remote>) -> Result<Self> {
        let flat = Arc::new(FlatStore::open(
            config.storage.flat_path(),
            config.storage.fallback_capacity_bytes,
        )?);
        Self::init(ServiceOptions::from_config(config), flat, remote).await
    }

    /// Start the background drain task if it is not running.
    pub fn start_scheduler(&mut self) {
        if self.handle.is_none() {
            self.handle = Some(self.scheduler.clone().spawn());
        }
    }

    pub fn facade(&self) -> &ApiFacade {
        &self.facade
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<OfflineQueue> {
        &self.queue
    }

    pub fn scheduler(&self) -> &Arc<SyncScheduler> {
        &self.scheduler
    }

    /// Report of the migration run during init.
    pub fn migration_report(&self) -> Option<&MigrationReport> {
        self.migration.as_ref()
    }

    /// Forward a host online/offline signal.
    pub fn set_online(&self, online: bool) {
        self.network.set_online(online);
    }

    /// Drain the queue now, ignoring backoff.
    pub async fn drain_now(&self) -> Result<DrainOutcome> {
        self.scheduler.drain(DrainTrigger::Manual).await
    }

    pub async fn status(&self) -> Result<SyncStatus> {
        self.scheduler.status().await
    }

    /// Stop the background task, wait for a running drain, release the store.
    pub async fn close(mut self) -> Result<()> {
        if let Some(handle) = self.handle.take() {
            handle.shutdown().await?;
        }
        self.store.close().await?;
        info!("Sync service closed");
        Ok(())
    }
}
