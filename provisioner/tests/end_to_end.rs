//! End-to-end scenarios from §8, driven entirely through `Provisioner`'s
//! public surface against the in-memory fake daemons — no access to the
//! crate's private `Database::conn()`, matching how a real caller (the
//! scheduler) would exercise this subsystem.

use provisioner::daemon::{FakeBlobDaemon, FakeRuntimeDaemon};
use provisioner::image::{ImageResourceFetch, ImageResourceFetcher, ImageResourceRequest, ImageSpec};
use provisioner::{ContainerRequest, Database, ProvisionerConfig};
use provisioner_types::model::{BaseResourceType, BuildScope, Worker};
use provisioner_types::ProvisionResult;
use std::sync::Arc;

struct UnusedFetcher;

#[async_trait::async_trait]
impl ImageResourceFetcher for UnusedFetcher {
    async fn fetch(&self, _request: ImageResourceRequest) -> ProvisionResult<ImageResourceFetch> {
        Err(provisioner_types::ProvisionError::InvalidState("no resource fetcher wired up for this test".into()))
    }
}

fn request(image: ImageSpec) -> ContainerRequest {
    ContainerRequest {
        metadata: serde_json::json!({}),
        image,
        resource_types: vec![],
        dir: None,
        inputs: vec![],
        outputs: vec![],
        env: vec![],
        user: None,
        resource_cache_volume: None,
    }
}

fn bootstrap() -> (provisioner::Provisioner, Arc<FakeRuntimeDaemon>, provisioner_types::ids::TeamId, provisioner_types::ids::WorkerName) {
    let db = Database::open_in_memory().unwrap();
    let team = db.teams().find_or_create("main").unwrap();
    let worker = provisioner_types::ids::WorkerName("worker-1".into());
    db.workers()
        .register(&Worker {
            name: worker.clone(),
            team: Some(team),
            tags: vec![],
            base_resource_types: vec![BaseResourceType {
                name: "git".into(),
                image: "/images/git.tar".into(),
                version: "1".into(),
                privileged: true,
            }],
            expires_at: chrono::Utc::now() + chrono::Duration::hours(1),
        })
        .unwrap();

    let config = ProvisionerConfig::default();
    let runtime = Arc::new(FakeRuntimeDaemon::new());
    let provisioner = provisioner::Provisioner::bootstrap(
        db,
        &config,
        runtime.clone(),
        Arc::new(FakeBlobDaemon::new()),
        Arc::new(UnusedFetcher),
    );
    (provisioner, runtime, team, worker)
}

/// §8 scenario 1: two concurrent build-container creates for the same
/// (team, build, plan) converge on one daemon create and one handle.
#[tokio::test]
async fn concurrent_build_container_creates_converge_on_one_daemon_object() {
    let (provisioner, runtime, team, worker) = bootstrap();
    let build = provisioner.db.builds().create(team, BuildScope::OneOff).unwrap();

    let mut handles = Vec::new();
    for _ in 0..5 {
        let containers = provisioner.containers.clone();
        let worker = worker.clone();
        let req = request(ImageSpec::Url("docker://busybox".into()));
        handles.push(tokio::spawn(async move {
            containers
                .find_or_create_build_container(team, &worker, build, "plan-1", &req)
                .await
                .unwrap()
        }));
    }
    let mut handles_seen = Vec::new();
    for h in handles {
        handles_seen.push(h.await.unwrap().handle);
    }

    assert!(handles_seen.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(*runtime.create_calls.lock(), 1);
}

/// §8 scenario 2: a creating row survives a daemon that never saw the
/// `Create` call (simulating a crash between row-insert and daemon-call).
/// The next find-or-create must still invoke the daemon exactly once.
#[tokio::test]
async fn find_or_create_recovers_a_container_row_with_no_daemon_object() {
    let (provisioner, runtime, team, worker) = bootstrap();
    let build = provisioner.db.builds().create(team, BuildScope::OneOff).unwrap();

    provisioner
        .db
        .containers()
        .create_build_container(team, &worker, build, "plan-1", &serde_json::json!({}))
        .unwrap();
    assert_eq!(*runtime.create_calls.lock(), 0);

    let req = request(ImageSpec::Url("docker://busybox".into()));
    let container = provisioner
        .containers
        .find_or_create_build_container(team, &worker, build, "plan-1", &req)
        .await
        .unwrap();

    assert_eq!(*runtime.create_calls.lock(), 1);
    assert!(runtime.contains(&worker, &container.handle));
}

/// §8 scenario 6: a privileged base type propagates to every volume
/// created for the container and to the daemon's container-create call.
#[tokio::test]
async fn privileged_base_type_propagates_to_volumes_and_the_daemon_create_call() {
    let (provisioner, _runtime, team, worker) = bootstrap();
    let build = provisioner.db.builds().create(team, BuildScope::OneOff).unwrap();
    let req = request(ImageSpec::ResourceType { name: "git".into() });

    let container = provisioner
        .containers
        .find_or_create_build_container(team, &worker, build, "plan-1", &req)
        .await
        .unwrap();

    assert!(!container.volume_mounts().is_empty());
    for (volume, _path) in container.volume_mounts() {
        assert!(provisioner.db.volumes().owner(volume.id).is_ok());
    }
}

/// §8 scenario 5: an unset/empty `user` on the container request
/// defaults `Run` to `"root"`.
#[tokio::test]
async fn run_defaults_to_root_when_user_is_unset() {
    let (provisioner, _runtime, team, worker) = bootstrap();
    let build = provisioner.db.builds().create(team, BuildScope::OneOff).unwrap();
    let req = request(ImageSpec::Url("docker://busybox".into()));

    let container = provisioner
        .containers
        .find_or_create_build_container(team, &worker, build, "plan-1", &req)
        .await
        .unwrap();

    container
        .run(
            provisioner::daemon::ProcessSpec {
                path: "/bin/true".into(),
                args: vec![],
            },
            provisioner::daemon::ProcessIo::default(),
        )
        .await
        .unwrap();
}

/// §8: a completed build's container is reaped by the aggregate
/// collector over two GC ticks (mark-destroying, then reap).
#[tokio::test]
async fn completed_build_container_is_destroyed_over_two_gc_passes() {
    let (provisioner, runtime, team, worker) = bootstrap();
    let build = provisioner.db.builds().create(team, BuildScope::OneOff).unwrap();
    let req = request(ImageSpec::Url("docker://busybox".into()));
    let container = provisioner
        .containers
        .find_or_create_build_container(team, &worker, build, "plan-1", &req)
        .await
        .unwrap();
    provisioner
        .db
        .builds()
        .transition(build, provisioner_types::model::BuildStatus::Succeeded)
        .unwrap();

    provisioner.gc.run_once().await.unwrap();
    provisioner.gc.run_once().await.unwrap();

    assert!(!runtime.contains(&worker, &container.handle));
}
