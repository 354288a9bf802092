//! Container-and-volume provisioning subsystem: worker-local container
//! and volume stores, image preparation, and the aggregate garbage
//! collector that sits between a scheduler and the remote container/blob
//! daemons (§1–§2).
//!
//! [`Provisioner`] is the composition root: it owns the local store and
//! wires the Lock Registry (C1), Volume Client (C4), Image Preparer
//! (C5), Container Provider (C6), and Aggregate Collector (C8) together
//! against whatever `RuntimeDaemon`/`BlobDaemon`/`ImageResourceFetcher`
//! a deployment supplies.

pub mod config;
pub mod container;
pub mod container_provider;
pub mod daemon;
pub mod db;
pub mod gc;
pub mod image;
pub mod locks;
pub mod resource_user;
pub mod retry;
pub mod util;
pub mod volume_client;

pub use config::ProvisionerConfig;
pub use container::Container;
pub use container_provider::{ContainerProvider, ContainerRequest, InputMount};
pub use daemon::{BlobDaemon, RuntimeDaemon};
pub use db::Database;
pub use gc::AggregateCollector;
pub use image::{ImagePreparer, ImageResourceFetcher, ImageSpec};
pub use locks::{LockRegistry, LockService};
pub use resource_user::ResourceUser;
pub use volume_client::VolumeClient;

use std::sync::Arc;

/// Everything a deployment needs to drive C1/C4/C5/C6/C8 against one
/// local store. `C2`/`C3` (the Volume/Container Stores) and `C7`
/// (`ResourceUser`) are cheap enough to construct ad hoc from
/// `Provisioner::db` that they aren't cached here.
pub struct Provisioner {
    pub db: Database,
    pub volumes: Arc<VolumeClient>,
    pub images: Arc<ImagePreparer>,
    pub containers: Arc<ContainerProvider>,
    pub gc: Arc<AggregateCollector>,
}

impl Provisioner {
    /// Wires every component together from a config and the three
    /// external collaborators named in §6 (`RuntimeDaemon`, `BlobDaemon`,
    /// `ImageResourceFetcher`). The lock registry is always the
    /// in-process `LockRegistry` — a multi-node deployment swaps this
    /// constructor out for one that takes a shared `LockService`.
    pub fn bootstrap(
        db: Database,
        config: &ProvisionerConfig,
        runtime: Arc<dyn RuntimeDaemon>,
        blobs: Arc<dyn BlobDaemon>,
        resource_fetcher: Arc<dyn ImageResourceFetcher>,
    ) -> Self {
        let locks = Arc::new(LockRegistry::new());
        let volumes = Arc::new(VolumeClient::new(
            db.volumes(),
            locks.clone(),
            blobs.clone(),
            config.lock_retry_step,
            config.max_retry_attempts,
        ));
        let images = Arc::new(ImagePreparer::new(volumes.clone(), blobs.clone(), resource_fetcher, db.workers()));
        let containers = Arc::new(ContainerProvider::new(
            db.containers(),
            db.volumes(),
            volumes.clone(),
            blobs.clone(),
            images.clone(),
            locks,
            runtime.clone(),
            config.lock_retry_step,
            config.max_retry_attempts,
            config.http_proxy_url.clone(),
            config.https_proxy_url.clone(),
            config.no_proxy.clone(),
        ));
        let gc = Arc::new(AggregateCollector::new(
            db.clone(),
            runtime,
            blobs,
            config.build_stall_timeout,
            config.image_resource_retention_hours,
        ));

        Self {
            db,
            volumes,
            images,
            containers,
            gc,
        }
    }

    /// Opens (or creates) the on-disk store at `config.db_path` and
    /// bootstraps every component against it.
    pub fn open(
        config: &ProvisionerConfig,
        runtime: Arc<dyn RuntimeDaemon>,
        blobs: Arc<dyn BlobDaemon>,
        resource_fetcher: Arc<dyn ImageResourceFetcher>,
    ) -> provisioner_types::ProvisionResult<Self> {
        let db = Database::open(&config.db_path)?;
        Ok(Self::bootstrap(db, config, runtime, blobs, resource_fetcher))
    }

    /// Runs the aggregate collector on `config.gc_tick_interval` until
    /// the process exits. Intended to be spawned as its own task.
    pub async fn run_gc_loop(&self, config: &ProvisionerConfig) {
        let mut ticker = tokio::time::interval(config.gc_tick_interval);
        loop {
            ticker.tick().await;
            match self.gc.run_once().await {
                Ok(metrics) => tracing::debug!(duration_ms = %metrics.total_duration_ms, "gc pass complete"),
                Err(err) => tracing::warn!(%err, "gc pass failed to start"),
            }
        }
    }
}
