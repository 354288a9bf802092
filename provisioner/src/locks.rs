//! Lock Registry (C1, §4.1): named advisory locks keyed by a typed id,
//! acquire-or-fail semantics with release on every exit path.
//!
//! `Busy` (lock not acquired) is not an error value — it's a plain `bool`
//! the caller turns into a backoff loop, per §7 ("Busy ... internal only;
//! transforms into a backoff + loop, not surfaced").

use async_trait::async_trait;
use provisioner_types::ProvisionResult;
use std::collections::HashSet;
use std::sync::Arc;
use parking_lot::Mutex;

/// A lock id is a stable 64-bit namespace value derived from the
/// container/volume row's integer id (§4.1: "derived deterministically …
/// e.g. a stable hash into a 64-bit namespace"). Two different entity
/// kinds must never collide, so the namespace tag is mixed into the hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockId(pub i64);

impl LockId {
    pub fn for_container(id: i64) -> Self {
        Self(mix(0xC0, id))
    }

    pub fn for_volume(id: i64) -> Self {
        Self(mix(0x70, id))
    }
}

fn mix(namespace: u8, id: i64) -> i64 {
    // FNV-1a over the namespace byte and the id's little-endian bytes —
    // cheap, stable across processes, good enough dispersion for an
    // advisory-lock keyspace that only needs to avoid same-process
    // same-namespace collisions.
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in std::iter::once(namespace).chain(id.to_le_bytes()) {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash as i64
}

/// RAII guard: dropping it releases the lock. Holding this across an
/// `.await` is fine and expected — acquiring the lock, rechecking the
/// daemon, creating, and promoting the DB row all happen while one guard
/// is alive (§4.4's "linearization point").
pub struct LockGuard {
    id: LockId,
    registry: Arc<LockRegistryInner>,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.registry.held.lock().remove(&self.id);
    }
}

/// Trait so `volume_client`/`container_provider` can be tested against an
/// in-process registry without a real distributed lock service backing
/// them (§6: "Lock service: Acquire(id) -> (lock, acquired, err)").
#[async_trait]
pub trait LockService: Send + Sync {
    async fn acquire(&self, id: LockId) -> ProvisionResult<Option<LockGuard>>;
}

struct LockRegistryInner {
    held: Mutex<HashSet<LockId>>,
}

/// In-process lock registry. A multi-node deployment would back this with
/// a row in the relational store (`pg_advisory_lock`-style) or a
/// dedicated lock service; the in-process form is what single-node
/// callers and tests use, and it implements the same `LockService`
/// contract so nothing downstream needs to know the difference.
#[derive(Clone)]
pub struct LockRegistry {
    inner: Arc<LockRegistryInner>,
}

impl Default for LockRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl LockRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(LockRegistryInner {
                held: Mutex::new(HashSet::new()),
            }),
        }
    }
}

#[async_trait]
impl LockService for LockRegistry {
    async fn acquire(&self, id: LockId) -> ProvisionResult<Option<LockGuard>> {
        let mut held = self.inner.held.lock();
        if held.contains(&id) {
            return Ok(None);
        }
        held.insert(id);
        drop(held);
        Ok(Some(LockGuard {
            id,
            registry: Arc::clone(&self.inner),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_acquire_is_busy_until_released() {
        let registry = LockRegistry::new();
        let id = LockId::for_container(1);
        let guard = registry.acquire(id).await.unwrap();
        assert!(guard.is_some());

        assert!(registry.acquire(id).await.unwrap().is_none());

        drop(guard);
        assert!(registry.acquire(id).await.unwrap().is_some());
    }

    #[test]
    fn different_namespaces_dont_collide_for_same_numeric_id() {
        assert_ne!(LockId::for_container(7), LockId::for_volume(7));
    }
}
