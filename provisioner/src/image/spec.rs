//! Image Preparer (C5, §4.5) types: the spec a caller hands in, and the
//! fetched result a container provider consumes.

use super::metadata::Metadata;
use provisioner_types::ids::{Handle, WorkerName};

/// A previously-fetched artifact volume, wherever it lives.
#[derive(Debug, Clone)]
pub struct ArtifactRef {
    pub worker: WorkerName,
    pub handle: Handle,
}

/// A pipeline-declared custom resource type (§4.5 strategy 5): itself a
/// resource, so its image may recurse into another custom type before
/// bottoming out at a worker base type.
#[derive(Debug, Clone)]
pub struct CustomResourceType {
    pub name: String,
    pub type_name: String,
    pub source: serde_json::Value,
    pub privileged: bool,
}

/// Which of the five strategies in §4.5 applies, resolved by the caller
/// from the shape of the original (optional-fields) spec — an enum
/// variant per strategy is the idiomatic encoding of "first matching
/// field wins".
#[derive(Debug, Clone)]
pub enum ImageSpec {
    /// Strategy 1: a raw pre-existing rootfs URL, used unchanged.
    Url(String),
    /// Strategies 2/3: an artifact produced by an earlier build step.
    ArtifactSource(ArtifactRef),
    /// Strategy 4: fetched via a resource's own check+get.
    Resource {
        type_name: String,
        source: serde_json::Value,
        version: Option<serde_json::Value>,
        params: serde_json::Value,
    },
    /// Strategy 5: a named resource type, custom or base.
    ResourceType { name: String },
}

#[derive(Debug, Clone)]
pub struct FetchedImage {
    pub url: String,
    pub metadata: Metadata,
    pub privileged: bool,
    pub version: Option<serde_json::Value>,
}
