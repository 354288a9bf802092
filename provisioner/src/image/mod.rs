//! Image Preparer (C5, §4.5): resolves an `ImageSpec` to a fetched root
//! filesystem volume, using whichever of five strategies the spec's
//! shape selects. Image objects are scoped to one find-or-create call
//! (§3 "Ownership and lifecycle") — nothing here is persisted beyond the
//! volume and container rows the strategies create along the way.

pub mod metadata;
pub mod spec;

use crate::daemon::{BlobDaemon, VolumeStrategy};
use crate::db::workers::WorkerStore;
use crate::volume_client::VolumeClient;
use async_trait::async_trait;
use metadata::Metadata;
use provisioner_types::ids::{ContainerId, TeamId, WorkerName};
use provisioner_types::{ProvisionError, ProvisionResult};
pub use spec::{ArtifactRef, CustomResourceType, FetchedImage, ImageSpec};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

const ROOTFS_MOUNT_PATH: &str = "/images/rootfs";

/// External image-resource fetcher (§6): resolves a resource's own
/// check+get into a fetched artifact. Recursing into the container
/// provider to run that check+get is genuinely external to this crate
/// (§1's "resource checks ... task runs" belong to the scheduler); this
/// crate only consumes the result.
#[async_trait]
pub trait ImageResourceFetcher: Send + Sync {
    async fn fetch(&self, request: ImageResourceRequest) -> ProvisionResult<ImageResourceFetch>;
}

#[derive(Debug, Clone)]
pub struct ImageResourceRequest {
    pub type_name: String,
    pub source: serde_json::Value,
    pub version: Option<serde_json::Value>,
    pub params: serde_json::Value,
    pub team: TeamId,
    pub privileged: bool,
}

#[derive(Debug, Clone)]
pub struct ImageResourceFetch {
    pub worker: WorkerName,
    pub volume_handle: provisioner_types::ids::Handle,
    pub metadata: Metadata,
    pub version: serde_json::Value,
}

pub struct ImagePreparer {
    volumes: Arc<VolumeClient>,
    blobs: Arc<dyn BlobDaemon>,
    resource_fetcher: Arc<dyn ImageResourceFetcher>,
    workers: WorkerStore,
}

impl ImagePreparer {
    pub fn new(
        volumes: Arc<VolumeClient>,
        blobs: Arc<dyn BlobDaemon>,
        resource_fetcher: Arc<dyn ImageResourceFetcher>,
        workers: WorkerStore,
    ) -> Self {
        Self {
            volumes,
            blobs,
            resource_fetcher,
            workers,
        }
    }

    /// `FetchForContainer` (§4.5). Recursive for strategy 5's custom
    /// resource type chain, so the body is boxed to make the `async fn`
    /// self-recursion compile.
    pub fn fetch_for_container<'a>(
        &'a self,
        image_spec: &'a ImageSpec,
        team: TeamId,
        worker: &'a WorkerName,
        container: ContainerId,
        resource_types: &'a [CustomResourceType],
    ) -> Pin<Box<dyn Future<Output = ProvisionResult<FetchedImage>> + Send + 'a>> {
        Box::pin(async move {
            match image_spec {
                // Strategy 1: raw pre-existing rootfs, used as-is.
                ImageSpec::Url(url) => Ok(FetchedImage {
                    url: url.clone(),
                    metadata: Metadata::default(),
                    privileged: false,
                    version: None,
                }),

                // Strategies 2/3: an artifact from an earlier build step,
                // local or remote to this worker.
                ImageSpec::ArtifactSource(artifact) => {
                    self.fetch_artifact(artifact, team, worker, container).await
                }

                // Strategy 4: delegate to the resource's own check+get,
                // then COW-wrap the result on this worker.
                ImageSpec::Resource {
                    type_name,
                    source,
                    version,
                    params,
                } => {
                    let fetched = self
                        .resource_fetcher
                        .fetch(ImageResourceRequest {
                            type_name: type_name.clone(),
                            source: source.clone(),
                            version: version.clone(),
                            params: params.clone(),
                            team,
                            privileged: false,
                        })
                        .await?;
                    let artifact = ArtifactRef {
                        worker: fetched.worker.clone(),
                        handle: fetched.volume_handle.clone(),
                    };
                    let mut image = self.fetch_artifact(&artifact, team, worker, container).await?;
                    image.metadata = fetched.metadata;
                    image.version = Some(fetched.version);
                    Ok(image)
                }

                // Strategy 5: a named resource type, custom or base.
                ImageSpec::ResourceType { name } => {
                    if let Some(custom) = resource_types.iter().find(|t| &t.name == name) {
                        // Exclude the current type from the parent list
                        // handed to the recursive call so a cycle through
                        // custom types cannot recurse forever.
                        let remaining: Vec<CustomResourceType> = resource_types
                            .iter()
                            .filter(|t| &t.name != name)
                            .cloned()
                            .collect();
                        let nested = ImageSpec::Resource {
                            type_name: custom.type_name.clone(),
                            source: custom.source.clone(),
                            version: None,
                            params: serde_json::json!({}),
                        };
                        let mut image = self
                            .fetch_for_container(&nested, team, worker, container, &remaining)
                            .await?;
                        image.privileged = custom.privileged;
                        Ok(image)
                    } else {
                        self.fetch_base_type(name, team, worker, container).await
                    }
                }
            }
        })
    }

    async fn fetch_artifact(
        &self,
        artifact: &ArtifactRef,
        team: TeamId,
        worker: &WorkerName,
        container: ContainerId,
    ) -> ProvisionResult<FetchedImage> {
        let meta_bytes = self.blobs.read_metadata(&artifact.worker, &artifact.handle).await?;
        let metadata = Metadata::from_json(&meta_bytes)?;

        let rootfs_handle = if artifact.worker == *worker {
            // Strategy 2: the artifact already lives on this worker, so a
            // COW child over it is enough.
            let parent = self
                .volumes
                .lookup_volume(&artifact.worker, &artifact.handle)
                .await?
                .ok_or_else(|| {
                    ProvisionError::InvariantViolation("missing-created-volume-in-baggageclaim".into())
                })?;
            self.volumes
                .find_or_create_cow_volume_for_container(&parent, container, ROOTFS_MOUNT_PATH, false)
                .await?
                .handle
        } else {
            // Strategy 3: stream the artifact in from the worker that has it.
            let local = self
                .volumes
                .find_or_create_volume_for_container(
                    team,
                    worker,
                    container,
                    ROOTFS_MOUNT_PATH,
                    VolumeStrategy::Empty,
                    false,
                )
                .await?;
            self.blobs
                .stream_in(&artifact.worker, &artifact.handle, worker, &local.handle)
                .await?;
            local.handle
        };

        Ok(FetchedImage {
            url: format!("raw://{rootfs_handle}/rootfs"),
            metadata,
            privileged: false,
            version: None,
        })
    }

    async fn fetch_base_type(
        &self,
        type_name: &str,
        team: TeamId,
        worker: &WorkerName,
        container: ContainerId,
    ) -> ProvisionResult<FetchedImage> {
        let _ = container; // base-type volumes are worker-scoped, not container-scoped
        let worker_row = self
            .workers
            .get(worker)?
            .ok_or_else(|| ProvisionError::NotFound(format!("worker {worker}")))?;
        let base = worker_row
            .base_resource_types
            .iter()
            .find(|b| b.name == type_name)
            .ok_or_else(|| ProvisionError::InvariantViolation(format!("unknown resource type {type_name}")))?
            .clone();

        let vol = self
            .volumes
            .find_or_create_volume_for_base_resource_type(team, worker, type_name, &base.image, base.privileged)
            .await?;

        Ok(FetchedImage {
            url: format!("raw://{}", vol.handle),
            metadata: Metadata::default(),
            privileged: base.privileged,
            version: Some(serde_json::json!({ type_name: base.version })),
        })
    }
}
