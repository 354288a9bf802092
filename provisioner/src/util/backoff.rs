//! Fixed-delay backoff helper shared by the lock-retry loop and the GC
//! tick scheduler (design note §9: "sleep one step (fixed delay) and
//! loop" rather than an exponential curve — the retry budget in
//! `crate::retry` is short-lived enough that backoff growth isn't worth
//! the extra state).

use std::time::Duration;

/// Sleep for `step`, then return. A thin wrapper so call sites read as
/// intent ("backoff::wait") rather than a bare `tokio::time::sleep`.
pub async fn wait(step: Duration) {
    tokio::time::sleep(step).await;
}
