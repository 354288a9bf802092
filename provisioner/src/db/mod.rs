//! Local transactional store for the provisioning subsystem.
//!
//! Stands in for "the relational store" of §6: in this codebase it is a
//! single SQLite file per ATC instance, opened in WAL mode. Every
//! operation exposed by the sub-stores in this module (`volumes`,
//! `containers`, `resource_configs`, `resource_caches`, `resource_uses`,
//! `workers`, `builds`) runs as one `IMMEDIATE` transaction, matching
//! §4.2's "each single DB operation is an atomic transaction" — the
//! higher-level find-or-create loops in `volume_client`/`container_provider`
//! compose several of these atomically-transactional calls non-atomically,
//! which is why they need the lock registry in between.

mod schema;

pub mod builds;
pub mod containers;
pub mod resource_caches;
pub mod resource_configs;
pub mod resource_uses;
pub mod teams;
pub mod volumes;
pub mod workers;

use parking_lot::{Mutex, MutexGuard};
use provisioner_types::ProvisionResult;
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;

pub use builds::BuildStore;
pub use containers::ContainerStore;
pub use resource_caches::ResourceCacheStore;
pub use resource_configs::ResourceConfigStore;
pub use resource_uses::ResourceUseStore;
pub use teams::TeamStore;
pub use volumes::VolumeStore;
pub use workers::WorkerStore;

/// SQLite database handle, cloneable and thread-safe via `parking_lot::Mutex`.
///
/// Domain-specific stores wrap this to provide their own narrow APIs
/// rather than exposing raw SQL to callers.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create the database at `path`.
    pub fn open(path: &Path) -> ProvisionResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| provisioner_types::ProvisionError::Database(e.to_string()))?;
        }
        let conn = Connection::open(path)?;
        Self::configure_and_init(conn)
    }

    /// Open an in-memory database. Used by tests and by short-lived
    /// tooling that doesn't need durability across restarts.
    pub fn open_in_memory() -> ProvisionResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::configure_and_init(conn)
    }

    fn configure_and_init(conn: Connection) -> ProvisionResult<Self> {
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=FULL;
            PRAGMA foreign_keys=ON;
            PRAGMA busy_timeout=30000;
            ",
        )?;

        schema::init(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    pub fn volumes(&self) -> VolumeStore {
        VolumeStore::new(self.clone())
    }

    pub fn containers(&self) -> ContainerStore {
        ContainerStore::new(self.clone())
    }

    pub fn resource_configs(&self) -> ResourceConfigStore {
        ResourceConfigStore::new(self.clone())
    }

    pub fn resource_caches(&self) -> ResourceCacheStore {
        ResourceCacheStore::new(self.clone())
    }

    pub fn resource_uses(&self) -> ResourceUseStore {
        ResourceUseStore::new(self.clone())
    }

    pub fn workers(&self) -> WorkerStore {
        WorkerStore::new(self.clone())
    }

    pub fn builds(&self) -> BuildStore {
        BuildStore::new(self.clone())
    }

    pub fn teams(&self) -> TeamStore {
        TeamStore::new(self.clone())
    }
}
