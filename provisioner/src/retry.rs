//! Retry-on-conflict as an explicit result kind (design note §9): the
//! caller's retry policy is a visible loop here, not hidden exception
//! control flow buried in the store layer.

use provisioner_types::{ProvisionError, ProvisionResult};
use std::future::Future;
use std::time::Duration;

/// Outcome of one attempt at an operation that can lose a race.
pub enum Attempt<T> {
    Done(T),
    /// Someone else mutated the row this attempt depended on; retry from
    /// the top.
    Retry,
}

/// Fixed-delay retry loop (§4.4: "sleep one step (fixed delay) and loop").
/// `attempt` is re-invoked until it returns `Attempt::Done`, `attempts`
/// is exhausted, or it returns a non-conflict error (surfaced
/// immediately — only conflicts and lock contention are retried).
pub async fn retry_on_conflict<T, F, Fut>(
    step: Duration,
    max_attempts: u32,
    mut attempt: F,
) -> ProvisionResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ProvisionResult<Attempt<T>>>,
{
    for n in 0..max_attempts {
        match attempt().await {
            Ok(Attempt::Done(value)) => return Ok(value),
            Ok(Attempt::Retry) => {
                tracing::debug!(attempt = n, "retrying after conflict");
                tokio::time::sleep(step).await;
            }
            Err(ProvisionError::Conflict(kind)) => {
                tracing::debug!(attempt = n, %kind, "retrying after conflict");
                tokio::time::sleep(step).await;
            }
            Err(other) => return Err(other),
        }
    }
    Err(ProvisionError::InvariantViolation(
        "exceeded retry budget without converging".into(),
    ))
}
