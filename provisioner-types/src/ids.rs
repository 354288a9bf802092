//! Typed identifiers.
//!
//! Newtypes instead of bare `i64`/`String` so the store APIs in
//! `provisioner::db` can't accidentally swap a build id for a worker id —
//! the compiler catches it.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(v: i64) -> Self {
                $name(v)
            }
        }
    };
}

id_newtype!(TeamId);
id_newtype!(WorkerIdNum);
id_newtype!(BuildId);
id_newtype!(JobId);
id_newtype!(PipelineId);
id_newtype!(ResourceId);
id_newtype!(ResourceTypeId);
id_newtype!(ResourceConfigId);
id_newtype!(ResourceCacheId);
id_newtype!(ContainerId);
id_newtype!(VolumeId);

/// A worker is addressed by name, not a synthetic numeric id — matching
/// the data model's "Worker: a named node" (§3).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerName(pub String);

impl fmt::Display for WorkerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorkerName {
    fn from(s: &str) -> Self {
        WorkerName(s.to_string())
    }
}

impl From<String> for WorkerName {
    fn from(s: String) -> Self {
        WorkerName(s)
    }
}

/// An opaque identifier for a container or volume, unique per worker and
/// never reused (invariant 1, §3). Shared verbatim with the runtime/blob
/// daemon as the handle they key their own objects by.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Handle(pub String);

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Handle {
    /// Mint a fresh handle. ULIDs are lexically sortable and collision-free
    /// across processes without a central allocator, which is what we
    /// need here: two workers (or two retries against the same worker)
    /// must never hand out the same handle.
    pub fn generate() -> Self {
        Handle(ulid::Ulid::new().to_string())
    }
}

impl From<&str> for Handle {
    fn from(s: &str) -> Self {
        Handle(s.to_string())
    }
}

impl From<String> for Handle {
    fn from(s: String) -> Self {
        Handle(s)
    }
}
