//! Error kinds surfaced by the provisioning subsystem (see design §7).

use std::fmt;

/// Result alias used across the provisioning subsystem.
pub type ProvisionResult<T> = Result<T, ProvisionError>;

/// Errors the core surfaces to its callers.
///
/// `Busy` (lock not acquired) is intentionally not a variant here — it is
/// an internal signal that callers turn into a backoff loop, never an
/// error value that escapes a `find_or_create` call.
#[derive(thiserror::Error, Debug)]
pub enum ProvisionError {
    /// The caller should restart its find-or-create transaction from the
    /// top; a concurrent actor changed state it depended on.
    #[error("retryable conflict: {0}")]
    Conflict(#[from] ConflictKind),

    /// A state was observed that the invariants say cannot happen absent
    /// operator error (e.g. a `created` row with no daemon object). Not
    /// retryable; surfaced as fatal.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// The requested row/handle/object does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The local transactional store returned an error.
    #[error("database error: {0}")]
    Database(String),

    /// The runtime daemon or blob daemon RPC failed in a way that isn't
    /// one of the specific cases above.
    #[error("transport error: {0}")]
    Transport(String),

    /// The caller's cancellation token fired while the operation was
    /// in flight.
    #[error("operation cancelled")]
    Cancelled,

    /// A precondition the caller is responsible for didn't hold (e.g.
    /// asking to remove an active container).
    #[error("invalid state: {0}")]
    InvalidState(String),
}

/// The four named retryable-conflict kinds from §4.2/§7. Each one means
/// "someone else mutated the row you were about to act on; reload and
/// retry your whole operation."
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    ResourceConfigDisappeared,
    ResourceConfigAlreadyExists,
    ResourceConfigParentDisappeared,
    UserDisappeared,
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConflictKind::ResourceConfigDisappeared => "resource-config-disappeared",
            ConflictKind::ResourceConfigAlreadyExists => "resource-config-already-exists",
            ConflictKind::ResourceConfigParentDisappeared => "resource-config-parent-disappeared",
            ConflictKind::UserDisappeared => "user-disappeared",
        };
        f.write_str(s)
    }
}

impl std::error::Error for ConflictKind {}

impl From<rusqlite::Error> for ProvisionError {
    fn from(e: rusqlite::Error) -> Self {
        ProvisionError::Database(e.to_string())
    }
}
