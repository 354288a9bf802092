//! Shared identifiers, domain model, and error types for the
//! container-and-volume provisioning subsystem.
//!
//! Split out from `provisioner` the way a runtime's "shared" crate
//! usually is: these types cross the boundary between the store layer,
//! the worker-facing clients, and their callers, so they live somewhere
//! both sides can depend on without the store pulling in client code or
//! vice versa.

pub mod error;
pub mod ids;
pub mod model;

pub use error::{ConflictKind, ProvisionError, ProvisionResult};
