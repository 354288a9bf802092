//! Aggregate Collector (C8, §4.8): an ordered garbage-collection pass run
//! each tick over the eight §4.8 steps. Every collector catches and logs
//! its own errors (see `collectors`), so one bad row never stops the pass
//! short of the volume collector at the end — matching §7's "log and
//! continue on any error, never abort the pass".
//!
//! Earlier drafts of this module ran the eight steps through a generic
//! `Stage`/`PipelineTask` executor borrowed wholesale from elsewhere in
//! this codebase. That executor supported a `Parallel` stage mode this
//! pass never uses (§4.8's steps are strictly ordered) and forced every
//! collector's context through a `Clone` bound it didn't need, so it's
//! gone: `Collector` below is sized to exactly what an aggregate-collector
//! pass does and nothing more.

mod collectors;
mod metrics;

pub use collectors::{
    BuildCollector, ContainerCollector, ResourceCacheCollector, ResourceCacheUseCollector,
    ResourceConfigCollector, ResourceConfigUseCollector, VolumeCollector, WorkerCollector,
};
pub use metrics::{CollectorMetrics, GcPassMetrics};

use crate::daemon::{BlobDaemon, RuntimeDaemon};
use crate::db::Database;
use async_trait::async_trait;
use provisioner_types::ProvisionResult;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Shared state every collector reads from for one tick.
pub struct GcContext {
    pub db: Database,
    pub runtime: Arc<dyn RuntimeDaemon>,
    pub blobs: Arc<dyn BlobDaemon>,
    pub stall_after: chrono::Duration,
    pub image_resource_retention_hours: i64,
}

/// One step of an aggregate-collector pass (§4.8). A collector's `run`
/// still returns `ProvisionResult` so the `?` operator reads naturally
/// inside its body, but every implementation in `collectors` catches and
/// logs its own errors and always resolves `Ok(())` — `run_once` never
/// actually sees an `Err` cross this boundary.
#[async_trait]
pub trait Collector: Send + Sync {
    async fn run(&self, ctx: &GcContext) -> ProvisionResult<()>;
    fn name(&self) -> &str;
}

/// Drives the eight §4.8 collectors, in order, on a fixed tick interval
/// (the interval itself lives in `ProvisionerConfig`; this type only
/// knows how to run one pass).
pub struct AggregateCollector {
    ctx: Arc<GcContext>,
}

impl AggregateCollector {
    pub fn new(
        db: Database,
        runtime: Arc<dyn RuntimeDaemon>,
        blobs: Arc<dyn BlobDaemon>,
        stall_after: Duration,
        image_resource_retention_hours: i64,
    ) -> Self {
        Self {
            ctx: Arc::new(GcContext {
                db,
                runtime,
                blobs,
                stall_after: chrono::Duration::from_std(stall_after).unwrap_or_else(|_| chrono::Duration::hours(1)),
                image_resource_retention_hours,
            }),
        }
    }

    /// Runs one pass in the §4.8 order, timing each step. The returned
    /// metrics are for observability only — a `GcPassMetrics::collector_duration_ms`
    /// lookup by name, should anything need to track tick latency.
    pub async fn run_once(&self) -> ProvisionResult<GcPassMetrics> {
        let steps: Vec<Box<dyn Collector>> = vec![
            Box::new(BuildCollector),
            Box::new(WorkerCollector),
            Box::new(ResourceCacheUseCollector),
            Box::new(ResourceConfigUseCollector),
            Box::new(ResourceConfigCollector),
            Box::new(ResourceCacheCollector),
            Box::new(ContainerCollector),
            Box::new(VolumeCollector),
        ];

        let pass_start = Instant::now();
        let mut collectors = Vec::with_capacity(steps.len());
        for step in steps {
            let started = Instant::now();
            step.run(&self.ctx).await?;
            collectors.push(CollectorMetrics {
                name: step.name().to_string(),
                duration_ms: started.elapsed().as_millis(),
            });
        }

        Ok(GcPassMetrics {
            total_duration_ms: pass_start.elapsed().as_millis(),
            collectors,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::{FakeBlobDaemon, FakeRuntimeDaemon};
    use crate::db::resource_configs::ConfigOrigin;
    use provisioner_types::ids::BuildId;

    fn collector(db: Database) -> AggregateCollector {
        AggregateCollector::new(
            db,
            Arc::new(FakeRuntimeDaemon::new()),
            Arc::new(FakeBlobDaemon::new()),
            Duration::from_secs(3600),
            24,
        )
    }

    #[tokio::test]
    async fn stalled_build_is_errored_out_by_a_pass() {
        let db = Database::open_in_memory().unwrap();
        let conn = db.conn();
        conn.execute("INSERT INTO teams (name) VALUES ('main')", []).unwrap();
        conn.execute(
            "INSERT INTO builds (team_id, status, start_time) VALUES (1, 'started', datetime('now', '-2 hours'))",
            [],
        )
        .unwrap();
        drop(conn);

        collector(db.clone()).run_once().await.unwrap();

        let conn = db.conn();
        let status: String = conn
            .query_row("SELECT status FROM builds WHERE id = 1", [], |row| row.get(0))
            .unwrap();
        assert_eq!(status, "errored");
    }

    #[tokio::test]
    async fn latest_job_build_use_survives_a_pass_while_the_earlier_ones_job_use_does_not() {
        let db = Database::open_in_memory().unwrap();
        let conn = db.conn();
        conn.execute("INSERT INTO teams (name) VALUES ('main')", []).unwrap();
        conn.execute("INSERT INTO pipelines (team_id, name) VALUES (1, 'p')", []).unwrap();
        conn.execute("INSERT INTO jobs (pipeline_id, name) VALUES (1, 'j')", []).unwrap();
        conn.execute(
            "INSERT INTO builds (team_id, job_id, status, completed) VALUES (1, 1, 'succeeded', 1)",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO builds (team_id, job_id, status, completed) VALUES (1, 1, 'succeeded', 1)",
            [],
        )
        .unwrap();
        drop(conn);

        let config = db
            .resource_configs()
            .find_or_create(&ConfigOrigin::BaseType("git".into()), &serde_json::json!({}))
            .unwrap();
        let cache = db
            .resource_caches()
            .find_or_create(config, &serde_json::json!({"ref": "a"}), &serde_json::json!({}))
            .unwrap();
        let uses = db.resource_uses();
        uses.use_cache(crate::db::resource_uses::UseOwner::Build(BuildId(1)), cache, false)
            .unwrap();
        uses.use_cache(crate::db::resource_uses::UseOwner::Build(BuildId(2)), cache, false)
            .unwrap();

        collector(db.clone()).run_once().await.unwrap();

        assert_eq!(uses.count_cache_uses(cache).unwrap(), 1);
        let conn = db.conn();
        let owner_build: i64 = conn
            .query_row("SELECT build_id FROM resource_cache_uses", [], |row| row.get(0))
            .unwrap();
        assert_eq!(owner_build, 2);
    }

    #[tokio::test]
    async fn expired_worker_is_pruned() {
        let db = Database::open_in_memory().unwrap();
        db.workers()
            .register(&provisioner_types::model::Worker {
                name: "stale".into(),
                team: None,
                tags: vec![],
                base_resource_types: vec![],
                expires_at: chrono::Utc::now() - chrono::Duration::seconds(1),
            })
            .unwrap();

        collector(db.clone()).run_once().await.unwrap();

        assert!(db.workers().get(&"stale".into()).unwrap().is_none());
    }

    #[tokio::test]
    async fn unowned_volume_is_destroyed_over_two_passes() {
        let db = Database::open_in_memory().unwrap();
        let conn = db.conn();
        conn.execute("INSERT INTO teams (name) VALUES ('main')", []).unwrap();
        conn.execute(
            "INSERT INTO workers (name, expires_at) VALUES ('w1', '2999-01-01T00:00:00Z')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO volumes (worker_name, handle, state, team_id, mount_path) VALUES ('w1', 'h1', 'created', 1, '/x')",
            [],
        )
        .unwrap();
        drop(conn);

        let runtime = Arc::new(FakeRuntimeDaemon::new());
        let blobs = Arc::new(FakeBlobDaemon::new());
        let ac = AggregateCollector::new(db.clone(), runtime, blobs, Duration::from_secs(3600), 24);

        ac.run_once().await.unwrap();
        let conn = db.conn();
        let state: String = conn.query_row("SELECT state FROM volumes WHERE id = 1", [], |row| row.get(0)).unwrap();
        assert_eq!(state, "destroying");
        drop(conn);

        ac.run_once().await.unwrap();
        let count: i64 = db.conn().query_row("SELECT COUNT(*) FROM volumes", [], |row| row.get(0)).unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn idle_resource_check_container_is_destroyed_over_two_passes() {
        let db = Database::open_in_memory().unwrap();
        let conn = db.conn();
        conn.execute("INSERT INTO teams (name) VALUES ('main')", []).unwrap();
        conn.execute(
            "INSERT INTO workers (name, expires_at) VALUES ('w1', '2999-01-01T00:00:00Z')",
            [],
        )
        .unwrap();
        drop(conn);

        let config = db
            .resource_configs()
            .find_or_create(&ConfigOrigin::BaseType("git".into()), &serde_json::json!({}))
            .unwrap();
        let creating = db
            .containers()
            .create_resource_check_container(
                provisioner_types::ids::TeamId(1),
                &"w1".into(),
                config,
                &serde_json::json!({}),
            )
            .unwrap();
        db.containers().mark_created(&creating, provisioner_types::ids::TeamId(1)).unwrap();

        let runtime = Arc::new(FakeRuntimeDaemon::new());
        runtime
            .create(
                &"w1".into(),
                &crate::daemon::ContainerSpec {
                    handle: creating.handle.clone(),
                    image: "busybox".into(),
                    env: vec![],
                    user: None,
                    mounts: vec![],
                    privileged: false,
                },
            )
            .await
            .unwrap();

        let ac = AggregateCollector::new(db.clone(), runtime.clone(), Arc::new(FakeBlobDaemon::new()), Duration::from_secs(3600), 24);

        ac.run_once().await.unwrap();
        let conn = db.conn();
        let state: String = conn.query_row("SELECT state FROM containers WHERE id = 1", [], |row| row.get(0)).unwrap();
        assert_eq!(state, "destroying");
        drop(conn);

        ac.run_once().await.unwrap();
        assert!(!runtime.contains(&"w1".into(), &creating.handle));
        let count: i64 = db.conn().query_row("SELECT COUNT(*) FROM containers", [], |row| row.get(0)).unwrap();
        assert_eq!(count, 0);
    }
}
