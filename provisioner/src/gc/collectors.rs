//! The eight ordered steps of §4.8, one `Collector` each. Every collector
//! swallows its own item-level errors (logged, not propagated) so a bad
//! row never stops the pass from reaching the collector behind it.

use super::{Collector, GcContext};
use async_trait::async_trait;
use provisioner_types::ProvisionResult;

pub struct BuildCollector;

#[async_trait]
impl Collector for BuildCollector {
    async fn run(&self, ctx: &GcContext) -> ProvisionResult<()> {
        match ctx.db.builds().collect_stalled(ctx.stall_after) {
            Ok(ids) if !ids.is_empty() => tracing::info!(count = ids.len(), "stalled builds errored out"),
            Ok(_) => {}
            Err(err) => tracing::warn!(%err, "build collector failed"),
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "builds"
    }
}

pub struct WorkerCollector;

#[async_trait]
impl Collector for WorkerCollector {
    async fn run(&self, ctx: &GcContext) -> ProvisionResult<()> {
        let expired = match ctx.db.workers().find_expired(chrono::Utc::now()) {
            Ok(workers) => workers,
            Err(err) => {
                tracing::warn!(%err, "worker collector failed to list expired workers");
                return Ok(());
            }
        };
        for worker in expired {
            if let Err(err) = ctx.db.workers().prune(&worker) {
                tracing::warn!(%err, %worker, "failed to prune expired worker");
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "workers"
    }
}

pub struct ResourceCacheUseCollector;

#[async_trait]
impl Collector for ResourceCacheUseCollector {
    async fn run(&self, ctx: &GcContext) -> ProvisionResult<()> {
        let store = ctx.db.resource_uses();
        let ids = match store.find_deletable_cache_uses(ctx.image_resource_retention_hours) {
            Ok(ids) => ids,
            Err(err) => {
                tracing::warn!(%err, "resource-cache-use collector failed to list candidates");
                return Ok(());
            }
        };
        for id in ids {
            if let Err(err) = store.delete_cache_use(id) {
                tracing::warn!(%err, id, "failed to delete resource cache use");
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "resource_cache_uses"
    }
}

pub struct ResourceConfigUseCollector;

#[async_trait]
impl Collector for ResourceConfigUseCollector {
    async fn run(&self, ctx: &GcContext) -> ProvisionResult<()> {
        let store = ctx.db.resource_uses();
        let ids = match store.find_deletable_config_uses() {
            Ok(ids) => ids,
            Err(err) => {
                tracing::warn!(%err, "resource-config-use collector failed to list candidates");
                return Ok(());
            }
        };
        for id in ids {
            if let Err(err) = store.delete_config_use(id) {
                tracing::warn!(%err, id, "failed to delete resource config use");
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "resource_config_uses"
    }
}

pub struct ResourceConfigCollector;

#[async_trait]
impl Collector for ResourceConfigCollector {
    async fn run(&self, ctx: &GcContext) -> ProvisionResult<()> {
        let store = ctx.db.resource_configs();
        let ids = match store.find_deletable() {
            Ok(ids) => ids,
            Err(err) => {
                tracing::warn!(%err, "resource-config collector failed to list candidates");
                return Ok(());
            }
        };
        for id in ids {
            if let Err(err) = store.delete(id) {
                tracing::warn!(%err, %id, "failed to delete resource config");
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "resource_configs"
    }
}

pub struct ResourceCacheCollector;

#[async_trait]
impl Collector for ResourceCacheCollector {
    async fn run(&self, ctx: &GcContext) -> ProvisionResult<()> {
        let store = ctx.db.resource_caches();
        let ids = match store.find_deletable() {
            Ok(ids) => ids,
            Err(err) => {
                tracing::warn!(%err, "resource-cache collector failed to list candidates");
                return Ok(());
            }
        };
        for id in ids {
            if let Err(err) = store.delete(id) {
                tracing::warn!(%err, %id, "failed to delete resource cache");
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "resource_caches"
    }
}

pub struct ContainerCollector;

#[async_trait]
impl Collector for ContainerCollector {
    async fn run(&self, ctx: &GcContext) -> ProvisionResult<()> {
        let store = ctx.db.containers();

        // Reap rows a previous pass already marked `destroying` but
        // didn't finish (e.g. the daemon call failed that tick).
        match store.find_destroying() {
            Ok(rows) => {
                for (id, worker, handle) in rows {
                    match ctx.runtime.destroy(&worker, &handle).await {
                        Ok(()) => {
                            if let Err(err) = store.delete(id) {
                                tracing::warn!(%err, %id, "failed to delete destroyed container row");
                            }
                        }
                        Err(err) => tracing::warn!(%err, %id, %worker, "failed to destroy container on daemon"),
                    }
                }
            }
            Err(err) => tracing::warn!(%err, "container collector failed to list destroying rows"),
        }

        let mut candidates = Vec::new();
        match store.find_for_completed_builds() {
            Ok(ids) => candidates.extend(ids),
            Err(err) => tracing::warn!(%err, "container collector failed to list completed-build containers"),
        }
        match store.find_idle_resource_check_containers() {
            Ok(ids) => candidates.extend(ids),
            Err(err) => tracing::warn!(%err, "container collector failed to list idle resource-check containers"),
        }
        for id in candidates {
            if let Err(err) = store.mark_destroying(id) {
                tracing::warn!(%err, %id, "failed to mark container destroying");
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "containers"
    }
}

pub struct VolumeCollector;

#[async_trait]
impl Collector for VolumeCollector {
    async fn run(&self, ctx: &GcContext) -> ProvisionResult<()> {
        let store = ctx.db.volumes();

        match store.find_destroying() {
            Ok(rows) => {
                for (id, worker, handle) in rows {
                    match ctx.blobs.destroy(&worker, &handle).await {
                        Ok(()) => {
                            if let Err(err) = store.delete(id) {
                                tracing::warn!(%err, %id, "failed to delete destroyed volume row");
                            }
                        }
                        Err(err) => tracing::warn!(%err, %id, %worker, "failed to destroy volume on daemon"),
                    }
                }
            }
            Err(err) => tracing::warn!(%err, "volume collector failed to list destroying rows"),
        }

        match store.find_unowned() {
            Ok(ids) => {
                for id in ids {
                    if let Err(err) = store.mark_destroying(id) {
                        tracing::warn!(%err, %id, "failed to mark volume destroying");
                    }
                }
            }
            Err(err) => tracing::warn!(%err, "volume collector failed to list unowned volumes"),
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "volumes"
    }
}
