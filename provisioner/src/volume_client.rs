//! Volume Client (C4, §4.4): the find-or-create protocols that turn the
//! Volume Store's two-phase rows and the blob daemon's actual volumes
//! into one converged result, even when two callers race for the same
//! volume.
//!
//! Every protocol here follows the same shape: look for an existing row
//! without a lock (the common case — no contention), and only take the
//! per-entity advisory lock when there's a `creating` row to finish or a
//! brand-new row to insert. Holding the lock across the daemon call and
//! the DB promotion is the "linearization point" that makes concurrent
//! callers converge on one daemon object instead of leaking N of them.

use crate::daemon::{BlobDaemon, VolumeSpec, VolumeStrategy};
use crate::db::volumes::{CreatedVolume, CreatingVolume, VolumeStore};
use crate::locks::{LockId, LockService};
use crate::retry::{retry_on_conflict, Attempt};
use provisioner_types::ids::{ContainerId, ResourceCacheId, TeamId, WorkerName};
use provisioner_types::ProvisionResult;
use std::sync::Arc;
use std::time::Duration;

pub struct VolumeClient {
    volumes: VolumeStore,
    locks: Arc<dyn LockService>,
    daemon: Arc<dyn BlobDaemon>,
    retry_step: Duration,
    max_attempts: u32,
}

impl VolumeClient {
    pub fn new(
        volumes: VolumeStore,
        locks: Arc<dyn LockService>,
        daemon: Arc<dyn BlobDaemon>,
        retry_step: Duration,
        max_attempts: u32,
    ) -> Self {
        Self {
            volumes,
            locks,
            daemon,
            retry_step,
            max_attempts,
        }
    }

    /// `FindOrCreateVolumeForContainer` (§4.4): a fresh empty (or
    /// imported) volume bound to `container` at `mount_path`.
    pub async fn find_or_create_volume_for_container(
        &self,
        team: TeamId,
        worker: &WorkerName,
        container: ContainerId,
        mount_path: &str,
        strategy: VolumeStrategy,
        privileged: bool,
    ) -> ProvisionResult<CreatedVolume> {
        retry_on_conflict(self.retry_step, self.max_attempts, || {
            let strategy = strategy.clone();
            async move {
                let (_, created) = self
                    .volumes
                    .find_container_volume(worker, container, mount_path)?;
                if let Some(created) = created {
                    return Ok(Attempt::Done(created));
                }

                let lock_scope = LockId::for_container(container.0);
                let Some(_guard) = self.locks.acquire(lock_scope).await? else {
                    return Ok(Attempt::Retry);
                };

                // Recheck under the lock: the in-flight `creating` row, or
                // a `created` row, may have appeared while we waited.
                let (creating, created) = self
                    .volumes
                    .find_container_volume(worker, container, mount_path)?;
                if let Some(created) = created {
                    return Ok(Attempt::Done(created));
                }

                let row = match creating {
                    Some(row) => row,
                    None => self
                        .volumes
                        .create_container_volume(team, worker, container, mount_path)?,
                };
                self.converge(&row, strategy, privileged).await.map(Attempt::Done)
            }
        })
        .await
    }

    /// `FindOrCreateCOWVolumeForContainer` (§4.4): a copy-on-write child of
    /// `parent`, which invariant 4 requires to already be `created`.
    pub async fn find_or_create_cow_volume_for_container(
        &self,
        parent: &CreatedVolume,
        container: ContainerId,
        mount_path: &str,
        privileged: bool,
    ) -> ProvisionResult<CreatedVolume> {
        let strategy = VolumeStrategy::Cow(parent.handle.clone());
        retry_on_conflict(self.retry_step, self.max_attempts, || {
            let strategy = strategy.clone();
            async move {
                let (_, created) = self
                    .volumes
                    .find_container_volume(&parent.worker, container, mount_path)?;
                if let Some(created) = created {
                    return Ok(Attempt::Done(created));
                }

                let lock_scope = LockId::for_container(container.0);
                let Some(_guard) = self.locks.acquire(lock_scope).await? else {
                    return Ok(Attempt::Retry);
                };

                let (creating, created) = self
                    .volumes
                    .find_container_volume(&parent.worker, container, mount_path)?;
                if let Some(created) = created {
                    return Ok(Attempt::Done(created));
                }

                let row = match creating {
                    Some(row) => row,
                    None => self
                        .volumes
                        .create_child_for_container(parent, container, mount_path)?,
                };
                self.converge(&row, strategy, privileged).await.map(Attempt::Done)
            }
        })
        .await
    }

    /// `FindOrCreateVolumeForBaseResourceType` (§4.4): imported once per
    /// worker per base type, then reused as the COW base for every
    /// container using that type's image.
    pub async fn find_or_create_volume_for_base_resource_type(
        &self,
        team: TeamId,
        worker: &WorkerName,
        type_name: &str,
        import_path: &str,
        privileged: bool,
    ) -> ProvisionResult<CreatedVolume> {
        retry_on_conflict(self.retry_step, self.max_attempts, || async move {
            let (_, created) = self.volumes.find_base_resource_type_volume(worker, type_name)?;
            if let Some(created) = created {
                return Ok(Attempt::Done(created));
            }

            let lock_scope = LockId::for_volume(base_type_lock_seed(worker, type_name));
            let Some(_guard) = self.locks.acquire(lock_scope).await? else {
                return Ok(Attempt::Retry);
            };

            let (creating, created) = self.volumes.find_base_resource_type_volume(worker, type_name)?;
            if let Some(created) = created {
                return Ok(Attempt::Done(created));
            }

            let row = match creating {
                Some(row) => row,
                None => self
                    .volumes
                    .create_base_resource_type_volume(team, worker, type_name)?,
            };
            self.converge(&row, VolumeStrategy::Import(import_path.to_string()), privileged)
                .await
                .map(Attempt::Done)
        })
        .await
    }

    /// `CreateVolumeForResourceCache` (§4.4): no find step — always
    /// creates a new row, owned by the cache.
    pub async fn create_volume_for_resource_cache(
        &self,
        team: TeamId,
        worker: &WorkerName,
        cache: ResourceCacheId,
        privileged: bool,
    ) -> ProvisionResult<CreatedVolume> {
        let row = self.volumes.create_for_resource_cache(team, worker, cache)?;
        self.converge(&row, VolumeStrategy::Empty, privileged).await
    }

    /// `LookupVolume` (§4.4): DB row plus a daemon existence check. A row
    /// whose daemon object has vanished is not surfaced as an error — the
    /// caller sees `None`, matching §7's "missing on the daemon side ⇒
    /// treat as already-destroyed".
    pub async fn lookup_volume(
        &self,
        worker: &WorkerName,
        handle: &provisioner_types::ids::Handle,
    ) -> ProvisionResult<Option<CreatedVolume>> {
        let Some(row) = self.volumes.find_created_volume(worker, handle)? else {
            return Ok(None);
        };
        if self.daemon.lookup(worker, handle).await? {
            Ok(Some(row))
        } else {
            Ok(None)
        }
    }

    /// Finish a `creating` row: check whether the daemon object already
    /// exists (a previous attempt may have created it but crashed before
    /// promoting the DB row), create it if not, then promote.
    async fn converge(
        &self,
        row: &CreatingVolume,
        strategy: VolumeStrategy,
        privileged: bool,
    ) -> ProvisionResult<CreatedVolume> {
        let exists = self.daemon.lookup(&row.worker, &row.handle).await?;
        if !exists {
            let spec = VolumeSpec {
                handle: row.handle.clone(),
                strategy,
                privileged,
            };
            self.daemon.create(&row.worker, &spec).await?;
        }
        self.volumes.mark_created(row)
    }
}

fn base_type_lock_seed(worker: &WorkerName, type_name: &str) -> i64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in worker.0.bytes().chain(type_name.bytes()) {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash as i64
}
