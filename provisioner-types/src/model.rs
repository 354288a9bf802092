//! Domain model shared between the store layer and its callers (§3).

use crate::ids::{
    BuildId, ContainerId, JobId, PipelineId, ResourceCacheId, ResourceConfigId, ResourceId,
    ResourceTypeId, TeamId, VolumeId, WorkerName,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Terminal vs. non-terminal build statuses (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BuildStatus {
    Pending,
    Started,
    Succeeded,
    Failed,
    Errored,
    Aborted,
}

impl BuildStatus {
    /// succeeded/failed/errored/aborted — invariant 6 and the GC
    /// preservation rules in §4.8 are both phrased in terms of this.
    pub fn is_terminal(self) -> bool {
        !matches!(self, BuildStatus::Pending | BuildStatus::Started)
    }
}

/// A build without a `job` is a "one-off build" (§3); the distinction
/// drives the resource-cache-use preservation rule in §4.8.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BuildScope {
    OneOff,
    Job(JobId),
}

/// Two-phase lifecycle shared by containers and volumes (§3 invariant 2,
/// design note in §9). Promotion is one-directional: creating → created →
/// destroying, never back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleState {
    Creating,
    Created,
    Destroying,
}

/// Who owns a container (§3): a build step/plan, a resource check, or a
/// resource-version fetch ("get").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContainerOwner {
    Build { build_id: BuildId, plan_id: Option<String> },
    ResourceCheck { resource_config_id: ResourceConfigId },
    ResourceGet { resource_cache_id: ResourceCacheId },
}

/// Who owns a volume (§3): a container, a resource cache, a base resource
/// type on some worker, or nothing yet (freshly imported, pre-attach).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolumeOwner {
    Container(ContainerId),
    ResourceCache(ResourceCacheId),
    BaseResourceType { worker: WorkerName, type_name: String },
    None,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Team {
    pub id: TeamId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseResourceType {
    pub name: String,
    pub image: String,
    pub version: String,
    pub privileged: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Worker {
    pub name: WorkerName,
    pub team: Option<TeamId>,
    pub tags: Vec<String>,
    pub base_resource_types: Vec<BaseResourceType>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: PipelineId,
    pub team: TeamId,
    pub name: String,
    pub paused: bool,
    pub public: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub id: ResourceId,
    pub pipeline: PipelineId,
    pub name: String,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceType {
    pub id: ResourceTypeId,
    pub pipeline: PipelineId,
    pub name: String,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Build {
    pub id: BuildId,
    pub scope: BuildScope,
    pub team: TeamId,
    pub status: BuildStatus,
    pub completed: bool,
    pub end_time: Option<DateTime<Utc>>,
}

/// Mount mode for a bind mount (§4.6 step 7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MountMode {
    ReadWrite,
    ReadOnly,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindMount {
    pub volume: VolumeId,
    pub mount_path: String,
    pub mode: MountMode,
}
