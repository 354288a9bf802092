//! Container Provider (C6, §4.6): the `findOrCreate` reconciliation
//! protocol shared by build, resource-check, and resource-get containers,
//! built on top of the Container Store (C3), Volume Client (C4), Image
//! Preparer (C5), and the Lock Registry (C1).
//!
//! The three public entry points differ only in which store call finds
//! an existing row, which one inserts a new one, and which extra input
//! volumes they assemble — the reconciliation shape (find, check the
//! daemon, resolve the image, assemble mounts, create-or-skip, promote)
//! is identical, so it lives once in `converge`.

use crate::daemon::{BlobDaemon, BindMountSpec, ContainerSpec, RuntimeDaemon, VolumeStrategy};
use crate::db::containers::{ContainerStore, CreatedContainer, CreatingContainer};
use crate::db::volumes::CreatedVolume;
use crate::image::{ArtifactRef, CustomResourceType, ImagePreparer, ImageSpec};
use crate::locks::{LockId, LockService};
use crate::retry::{retry_on_conflict, Attempt};
use crate::volume_client::VolumeClient;
use provisioner_types::ids::{BuildId, ContainerId, ResourceCacheId, ResourceConfigId, TeamId, WorkerName};
use provisioner_types::ProvisionResult;
use std::sync::Arc;
use std::time::Duration;

/// A volume produced by an earlier build step, to be mounted at `path`.
#[derive(Debug, Clone)]
pub struct InputMount {
    pub path: String,
    pub artifact: ArtifactRef,
}

/// The inputs a `findOrCreate` call shares across all three container
/// kinds, beyond the fields that distinguish them (§4.6 step 6/7).
#[derive(Debug, Clone)]
pub struct ContainerRequest {
    pub metadata: serde_json::Value,
    pub image: ImageSpec,
    pub resource_types: Vec<CustomResourceType>,
    pub dir: Option<String>,
    pub inputs: Vec<InputMount>,
    pub outputs: Vec<String>,
    pub env: Vec<(String, String)>,
    pub user: Option<String>,
    pub resource_cache_volume: Option<ResourceCacheId>,
}

pub struct ContainerProvider {
    containers: ContainerStore,
    volume_store: crate::db::volumes::VolumeStore,
    volumes: Arc<VolumeClient>,
    blobs: Arc<dyn BlobDaemon>,
    images: Arc<ImagePreparer>,
    locks: Arc<dyn LockService>,
    runtime: Arc<dyn RuntimeDaemon>,
    retry_step: Duration,
    max_attempts: u32,
    http_proxy_url: Option<String>,
    https_proxy_url: Option<String>,
    no_proxy: Option<String>,
}

impl ContainerProvider {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        containers: ContainerStore,
        volume_store: crate::db::volumes::VolumeStore,
        volumes: Arc<VolumeClient>,
        blobs: Arc<dyn BlobDaemon>,
        images: Arc<ImagePreparer>,
        locks: Arc<dyn LockService>,
        runtime: Arc<dyn RuntimeDaemon>,
        retry_step: Duration,
        max_attempts: u32,
        http_proxy_url: Option<String>,
        https_proxy_url: Option<String>,
        no_proxy: Option<String>,
    ) -> Self {
        Self {
            containers,
            volume_store,
            volumes,
            blobs,
            images,
            locks,
            runtime,
            retry_step,
            max_attempts,
            http_proxy_url,
            https_proxy_url,
            no_proxy,
        }
    }

    /// `FindOrCreateBuildContainer` (§4.6).
    pub async fn find_or_create_build_container(
        &self,
        team: TeamId,
        worker: &WorkerName,
        build_id: BuildId,
        plan_id: &str,
        request: &ContainerRequest,
    ) -> ProvisionResult<crate::container::Container> {
        retry_on_conflict(self.retry_step, self.max_attempts, || async {
            let (creating, created) = self.containers.find_build_container_on_worker(worker, build_id, plan_id)?;
            if let Some(created) = created {
                return self.load_existing(created).await.map(Attempt::Done);
            }
            let row = match creating {
                Some(row) => row,
                None => self
                    .containers
                    .create_build_container(team, worker, build_id, plan_id, &request.metadata)?,
            };
            self.converge(row, team, request).await
        })
        .await
    }

    /// `FindOrCreateResourceCheckContainer` (§4.6).
    pub async fn find_or_create_resource_check_container(
        &self,
        team: TeamId,
        worker: &WorkerName,
        resource_config_id: ResourceConfigId,
        request: &ContainerRequest,
    ) -> ProvisionResult<crate::container::Container> {
        retry_on_conflict(self.retry_step, self.max_attempts, || async {
            let (creating, created) = self
                .containers
                .find_resource_check_container_on_worker(worker, resource_config_id)?;
            if let Some(created) = created {
                return self.load_existing(created).await.map(Attempt::Done);
            }
            let row = match creating {
                Some(row) => row,
                None => self
                    .containers
                    .create_resource_check_container(team, worker, resource_config_id, &request.metadata)?,
            };
            self.converge(row, team, request).await
        })
        .await
    }

    /// `CreateResourceGetContainer` (§4.6): the find callback always
    /// returns nothing — get containers are never deduplicated, so there
    /// is no caller to race with over this row's lock.
    pub async fn create_resource_get_container(
        &self,
        team: TeamId,
        worker: &WorkerName,
        resource_cache_id: ResourceCacheId,
        request: &ContainerRequest,
    ) -> ProvisionResult<crate::container::Container> {
        let row = self
            .containers
            .create_resource_get_container(team, worker, resource_cache_id, &request.metadata)?;
        match self.converge(row, team, request).await? {
            Attempt::Done(container) => Ok(container),
            Attempt::Retry => Err(provisioner_types::ProvisionError::InvariantViolation(
                "unexpected lock contention creating a fresh resource-get container".into(),
            )),
        }
    }

    /// `FindCreatedContainerByHandle` (§4.6): looked up on the daemon and
    /// in the store; a miss on either side is "not found", not an error.
    pub async fn find_created_container_by_handle(
        &self,
        worker: &WorkerName,
        handle: &provisioner_types::ids::Handle,
        team: TeamId,
    ) -> ProvisionResult<Option<crate::container::Container>> {
        if !self.runtime.lookup(worker, handle).await? {
            return Ok(None);
        }
        let Some(row) = self.containers.find_created_by_handle(worker, handle, team)? else {
            return Ok(None);
        };
        Ok(Some(self.load_existing(row).await?))
    }

    async fn load_existing(&self, row: CreatedContainer) -> ProvisionResult<crate::container::Container> {
        if !self.runtime.lookup(&row.worker, &row.handle).await? {
            return Err(provisioner_types::ProvisionError::InvariantViolation(
                "created container row with no daemon object".into(),
            ));
        }
        let mounts = self
            .volumes_for(row.id)?
            .into_iter()
            .map(|v| {
                let path = v.mount_path.clone();
                (v, path)
            })
            .collect();
        Ok(crate::container::Container::new(
            self.runtime.clone(),
            row.id,
            row.worker,
            row.handle,
            row.team,
            None,
            mounts,
        ))
    }

    fn volumes_for(&self, container: ContainerId) -> ProvisionResult<Vec<CreatedVolume>> {
        self.volume_store.find_volumes_for_container(container)
    }

    /// Steps 4–8: resolve the image, assemble the bind-mount list,
    /// acquire the container-creating lock, create on the daemon if the
    /// object isn't already there (crash recovery), and promote.
    async fn converge(
        &self,
        row: CreatingContainer,
        team: TeamId,
        request: &ContainerRequest,
    ) -> ProvisionResult<Attempt<crate::container::Container>> {
        let lock_scope = LockId::for_container(row.id.0);
        let Some(_guard) = self.locks.acquire(lock_scope).await? else {
            // Another agent is converging this exact row; restart from
            // the top so the caller's find step can pick up whatever
            // state that agent left behind.
            return Ok(Attempt::Retry);
        };

        let image = self
            .images
            .fetch_for_container(&request.image, team, &row.worker, row.id, &request.resource_types)
            .await?;

        let mut mounts = Vec::new();

        let scratch = self
            .volumes
            .find_or_create_volume_for_container(team, &row.worker, row.id, "/scratch", VolumeStrategy::Empty, image.privileged)
            .await?;
        mounts.push(self.bind(&scratch));

        if let Some(dir) = &request.dir {
            if !request.inputs.iter().any(|i| &i.path == dir) {
                let workdir = self
                    .volumes
                    .find_or_create_volume_for_container(team, &row.worker, row.id, dir, VolumeStrategy::Empty, image.privileged)
                    .await?;
                mounts.push(self.bind(&workdir));
            }
        }

        for input in &request.inputs {
            let vol = self
                .resolve_input_volume(team, &row.worker, row.id, input, image.privileged)
                .await?;
            mounts.push(self.bind(&vol));
        }

        for output in &request.outputs {
            let vol = self
                .volumes
                .find_or_create_volume_for_container(team, &row.worker, row.id, output, VolumeStrategy::Empty, image.privileged)
                .await?;
            mounts.push(self.bind(&vol));
        }

        if let Some(cache) = request.resource_cache_volume {
            if let Some(vol) = self.volume_store.find_resource_cache_volume(cache)? {
                mounts.push(self.bind(&vol));
            }
        }

        let exists = self.runtime.lookup(&row.worker, &row.handle).await?;
        if !exists {
            let user = request.user.clone().or_else(|| image.metadata.user.clone());
            let mut env: Vec<(String, String)> = image.metadata.env.iter().filter_map(|kv| split_env(kv)).collect();
            env.extend(request.env.iter().cloned());
            if let Some(url) = &self.http_proxy_url {
                env.push(("http_proxy".into(), url.clone()));
            }
            if let Some(url) = &self.https_proxy_url {
                env.push(("https_proxy".into(), url.clone()));
            }
            if let Some(no_proxy) = &self.no_proxy {
                env.push(("no_proxy".into(), no_proxy.clone()));
            }
            let spec = ContainerSpec {
                handle: row.handle.clone(),
                image: image.url.clone(),
                env,
                user,
                mounts: mounts.iter().map(|(v, path)| BindMountSpec {
                    volume_handle: v.handle.clone(),
                    mount_path: path.clone(),
                    read_only: false,
                }).collect(),
                privileged: image.privileged,
            };
            self.runtime.create(&row.worker, &spec).await?;
        }

        let created = self.containers.mark_created(&row, team)?;
        let user = request.user.clone().or(image.metadata.user);
        Ok(Attempt::Done(crate::container::Container::new(
            self.runtime.clone(),
            created.id,
            created.worker,
            created.handle,
            created.team,
            user,
            mounts,
        )))
    }

    fn bind(&self, volume: &CreatedVolume) -> (CreatedVolume, String) {
        (volume.clone(), volume.mount_path.clone())
    }

    async fn resolve_input_volume(
        &self,
        team: TeamId,
        worker: &WorkerName,
        container: ContainerId,
        input: &InputMount,
        privileged: bool,
    ) -> ProvisionResult<CreatedVolume> {
        if input.artifact.worker == *worker {
            let parent = self
                .volumes
                .lookup_volume(&input.artifact.worker, &input.artifact.handle)
                .await?
                .ok_or_else(|| {
                    provisioner_types::ProvisionError::InvariantViolation(
                        "missing-created-volume-in-baggageclaim".into(),
                    )
                })?;
            self.volumes
                .find_or_create_cow_volume_for_container(&parent, container, &input.path, privileged)
                .await
        } else {
            let local = self
                .volumes
                .find_or_create_volume_for_container(team, worker, container, &input.path, VolumeStrategy::Empty, privileged)
                .await?;
            self.blobs
                .stream_in(&input.artifact.worker, &input.artifact.handle, worker, &local.handle)
                .await?;
            Ok(local)
        }
    }
}

fn split_env(entry: &str) -> Option<(String, String)> {
    entry.split_once('=').map(|(k, v)| (k.to_string(), v.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::{FakeBlobDaemon, FakeRuntimeDaemon};
    use crate::db::Database;
    use crate::image::{ImagePreparer, ImageResourceFetch, ImageResourceFetcher, ImageResourceRequest};
    use crate::locks::LockRegistry;
    use provisioner_types::model::{BaseResourceType, Worker};
    use std::time::Duration;

    struct UnusedFetcher;

    #[async_trait::async_trait]
    impl ImageResourceFetcher for UnusedFetcher {
        async fn fetch(&self, _request: ImageResourceRequest) -> ProvisionResult<ImageResourceFetch> {
            Err(provisioner_types::ProvisionError::InvalidState("not exercised in this test".into()))
        }
    }

    fn provider() -> (ContainerProvider, Database, TeamId, WorkerName, Arc<FakeRuntimeDaemon>) {
        let db = Database::open_in_memory().unwrap();
        let conn = db.conn();
        conn.execute("INSERT INTO teams (name) VALUES ('main')", []).unwrap();
        drop(conn);
        let worker = WorkerName("worker-1".into());
        db.workers()
            .register(&Worker {
                name: worker.clone(),
                team: None,
                tags: vec![],
                base_resource_types: vec![BaseResourceType {
                    name: "git".into(),
                    image: "/images/git.tar".into(),
                    version: "1".into(),
                    privileged: true,
                }],
                expires_at: chrono::Utc::now() + chrono::Duration::hours(1),
            })
            .unwrap();

        let locks = Arc::new(LockRegistry::new());
        let blobs = Arc::new(FakeBlobDaemon::new());
        let runtime = Arc::new(FakeRuntimeDaemon::new());
        let volumes = Arc::new(VolumeClient::new(
            db.volumes(),
            locks.clone(),
            blobs.clone(),
            Duration::from_millis(1),
            20,
        ));
        let images = Arc::new(ImagePreparer::new(volumes.clone(), blobs.clone(), Arc::new(UnusedFetcher), db.workers()));
        let provider = ContainerProvider::new(
            db.containers(),
            db.volumes(),
            volumes,
            blobs,
            images,
            locks,
            runtime.clone(),
            Duration::from_millis(1),
            20,
            None,
            None,
            None,
        );
        (provider, db, TeamId(1), worker, runtime)
    }

    fn provider_with_proxy() -> (ContainerProvider, Database, TeamId, WorkerName, Arc<FakeRuntimeDaemon>) {
        let db = Database::open_in_memory().unwrap();
        let conn = db.conn();
        conn.execute("INSERT INTO teams (name) VALUES ('main')", []).unwrap();
        drop(conn);
        let worker = WorkerName("worker-1".into());
        db.workers()
            .register(&Worker {
                name: worker.clone(),
                team: None,
                tags: vec![],
                base_resource_types: vec![],
                expires_at: chrono::Utc::now() + chrono::Duration::hours(1),
            })
            .unwrap();

        let locks = Arc::new(LockRegistry::new());
        let blobs = Arc::new(FakeBlobDaemon::new());
        let runtime = Arc::new(FakeRuntimeDaemon::new());
        let volumes = Arc::new(VolumeClient::new(
            db.volumes(),
            locks.clone(),
            blobs.clone(),
            Duration::from_millis(1),
            20,
        ));
        let images = Arc::new(ImagePreparer::new(volumes.clone(), blobs.clone(), Arc::new(UnusedFetcher), db.workers()));
        let provider = ContainerProvider::new(
            db.containers(),
            db.volumes(),
            volumes,
            blobs,
            images,
            locks,
            runtime.clone(),
            Duration::from_millis(1),
            20,
            Some("http://proxy:8080".into()),
            Some("https://proxy:8443".into()),
            Some("localhost".into()),
        );
        (provider, db, TeamId(1), worker, runtime)
    }

    fn request(image: ImageSpec) -> ContainerRequest {
        ContainerRequest {
            metadata: serde_json::json!({}),
            image,
            resource_types: vec![],
            dir: None,
            inputs: vec![],
            outputs: vec![],
            env: vec![],
            user: None,
            resource_cache_volume: None,
        }
    }

    #[tokio::test]
    async fn find_or_create_build_container_is_idempotent() {
        let (provider, db, team, worker, runtime) = provider();
        db.conn()
            .execute("INSERT INTO builds (team_id, status) VALUES (1, 'started')", [])
            .unwrap();
        let req = request(ImageSpec::Url("docker://busybox".into()));
        let first = provider
            .find_or_create_build_container(team, &worker, BuildId(1), "plan-1", &req)
            .await
            .unwrap();
        let second = provider
            .find_or_create_build_container(team, &worker, BuildId(1), "plan-1", &req)
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(*runtime.create_calls.lock(), 1);
    }

    #[tokio::test]
    async fn privileged_propagates_from_base_type_to_every_volume() {
        let (provider, db, team, worker, _runtime) = provider();
        db.conn()
            .execute("INSERT INTO builds (team_id, status) VALUES (1, 'started')", [])
            .unwrap();
        let req = request(ImageSpec::ResourceType { name: "git".into() });
        let container = provider
            .find_or_create_build_container(team, &worker, BuildId(1), "plan-2", &req)
            .await
            .unwrap();
        // Only /scratch is mounted for this request (no dir/inputs/outputs).
        assert_eq!(container.volume_mounts().len(), 1);
    }

    #[tokio::test]
    async fn find_or_create_recovers_a_creating_row_with_no_daemon_object() {
        let (provider, db, team, worker, runtime) = provider();
        db.conn()
            .execute("INSERT INTO builds (team_id, status) VALUES (1, 'started')", [])
            .unwrap();
        // Simulate a prior attempt that inserted the row but crashed
        // before the daemon ever saw a `Create` call.
        db.containers()
            .create_build_container(team, &worker, BuildId(1), "plan-1", &serde_json::json!({}))
            .unwrap();
        assert_eq!(*runtime.create_calls.lock(), 0);

        let req = request(ImageSpec::Url("docker://busybox".into()));
        let container = provider
            .find_or_create_build_container(team, &worker, BuildId(1), "plan-1", &req)
            .await
            .unwrap();

        assert_eq!(*runtime.create_calls.lock(), 1);
        assert!(runtime.contains(&worker, &container.handle));
    }

    #[tokio::test]
    async fn configured_proxy_settings_are_appended_to_the_daemon_create_env() {
        let (provider, db, team, worker, runtime) = provider_with_proxy();
        db.conn()
            .execute("INSERT INTO builds (team_id, status) VALUES (1, 'started')", [])
            .unwrap();
        let req = request(ImageSpec::Url("docker://busybox".into()));
        let container = provider
            .find_or_create_build_container(team, &worker, BuildId(1), "plan-1", &req)
            .await
            .unwrap();

        let spec = runtime.spec_for(&worker, &container.handle).unwrap();
        assert!(spec.env.contains(&("http_proxy".to_string(), "http://proxy:8080".to_string())));
        assert!(spec.env.contains(&("https_proxy".to_string(), "https://proxy:8443".to_string())));
        assert!(spec.env.contains(&("no_proxy".to_string(), "localhost".to_string())));
    }

    #[tokio::test]
    async fn unset_proxy_settings_leave_env_untouched() {
        let (provider, db, team, worker, runtime) = provider();
        db.conn()
            .execute("INSERT INTO builds (team_id, status) VALUES (1, 'started')", [])
            .unwrap();
        let req = request(ImageSpec::Url("docker://busybox".into()));
        let container = provider
            .find_or_create_build_container(team, &worker, BuildId(1), "plan-1", &req)
            .await
            .unwrap();

        let spec = runtime.spec_for(&worker, &container.handle).unwrap();
        assert!(spec.env.iter().all(|(k, _)| k != "http_proxy" && k != "https_proxy" && k != "no_proxy"));
    }

    #[tokio::test]
    async fn get_containers_are_never_deduplicated() {
        let (provider, db, team, worker, _runtime) = provider();
        let conn = db.conn();
        conn.execute("INSERT INTO resource_configs (digest, source) VALUES ('d1', '{}')", [])
            .unwrap();
        conn.execute(
            "INSERT INTO resource_caches (digest, resource_config_id, version, params) VALUES ('c1', 1, '{}', '{}')",
            [],
        )
        .unwrap();
        drop(conn);

        let req = request(ImageSpec::Url("docker://busybox".into()));
        let first = provider
            .create_resource_get_container(team, &worker, ResourceCacheId(1), &req)
            .await
            .unwrap();
        let second = provider
            .create_resource_get_container(team, &worker, ResourceCacheId(1), &req)
            .await
            .unwrap();
        assert_ne!(first.id, second.id);
    }
}
