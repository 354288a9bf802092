//! External interfaces (§6): the per-worker runtime daemon that actually
//! creates OCI containers and the blob daemon that actually creates
//! filesystem volumes. This subsystem only ever talks to these through
//! their trait objects — the real daemons live in the worker process and
//! are reached over whatever transport that worker uses; tests and local
//! tooling get an in-memory fake that implements the same contract.

use async_trait::async_trait;
use provisioner_types::ids::{Handle, WorkerName};
use provisioner_types::ProvisionResult;
use std::collections::HashMap;
use std::sync::Arc;
use parking_lot::Mutex;

/// How a volume's initial content is populated (§4.4/§6).
#[derive(Debug, Clone)]
pub enum VolumeStrategy {
    /// An empty volume (scratch, outputs, COW base for a fresh container).
    Empty,
    /// Seeded from a tarball or directory already on the worker's disk.
    Import(String),
    /// A copy-on-write child of an existing volume, addressed by its
    /// daemon-side handle.
    Cow(Handle),
}

#[derive(Debug, Clone)]
pub struct VolumeSpec {
    pub handle: Handle,
    pub strategy: VolumeStrategy,
    pub privileged: bool,
}

/// A bind mount inside a container's namespace (§3 `BindMount`, §4.7 step
/// "bind-mount assembly").
#[derive(Debug, Clone)]
pub struct BindMountSpec {
    pub volume_handle: Handle,
    pub mount_path: String,
    pub read_only: bool,
}

#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub handle: Handle,
    pub image: String,
    pub env: Vec<(String, String)>,
    pub user: Option<String>,
    pub mounts: Vec<BindMountSpec>,
    pub privileged: bool,
}

/// A process to run inside an already-created container (§4.7 `Run`).
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub path: String,
    pub args: Vec<String>,
}

/// Stdin for a `Run` call; stdout/stderr are returned in `ProcessOutput`
/// rather than streamed, matching the fake daemon's capture-everything
/// model (a real daemon's transport streams both directions).
#[derive(Debug, Clone, Default)]
pub struct ProcessIo {
    pub stdin: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_status: i32,
}

/// Runtime daemon (§6): "Create(spec) -> (handle, err)", "Lookup(handle)
/// -> (exists, err)", "Destroy(handle) -> err". Idempotent destroy:
/// destroying a handle that's already gone is not an error (§7 "missing
/// on the daemon side ⇒ treat as already-destroyed").
#[async_trait]
pub trait RuntimeDaemon: Send + Sync {
    async fn create(&self, worker: &WorkerName, spec: &ContainerSpec) -> ProvisionResult<()>;
    async fn lookup(&self, worker: &WorkerName, handle: &Handle) -> ProvisionResult<bool>;
    async fn destroy(&self, worker: &WorkerName, handle: &Handle) -> ProvisionResult<()>;

    /// Run a process inside a created container (§4.7), with `user`
    /// already resolved by the caller (the container's stored property,
    /// defaulted to `"root"`).
    async fn run(
        &self,
        worker: &WorkerName,
        handle: &Handle,
        process: &ProcessSpec,
        user: &str,
        io: ProcessIo,
    ) -> ProvisionResult<ProcessOutput>;
}

/// Blob daemon (§6): the volume-side equivalent of `RuntimeDaemon`.
#[async_trait]
pub trait BlobDaemon: Send + Sync {
    async fn create(&self, worker: &WorkerName, spec: &VolumeSpec) -> ProvisionResult<()>;
    async fn lookup(&self, worker: &WorkerName, handle: &Handle) -> ProvisionResult<bool>;
    async fn destroy(&self, worker: &WorkerName, handle: &Handle) -> ProvisionResult<()>;

    /// Stream an artifact volume's contents from `from_worker` to a
    /// freshly created empty volume on `to_worker` (§4.5 strategy 3:
    /// "artifact volume elsewhere").
    async fn stream_in(
        &self,
        from_worker: &WorkerName,
        from_handle: &Handle,
        to_worker: &WorkerName,
        to_handle: &Handle,
    ) -> ProvisionResult<()>;

    /// Read the metadata file written beside an artifact volume's rootfs
    /// (§4.5: "parse metadata from the artifact's metadata file").
    async fn read_metadata(&self, worker: &WorkerName, handle: &Handle) -> ProvisionResult<Vec<u8>>;
}

/// In-memory fake used by tests (and by `cfg(test)` integration suites)
/// to exercise the §4.4/§4.6 find-or-create protocols without a real
/// worker process. Tracks which handles exist per worker and counts
/// `create` calls so a test can assert "exactly one daemon create won
/// the race" (§8).
#[derive(Default)]
pub struct FakeRuntimeDaemon {
    state: Arc<Mutex<HashMap<(WorkerName, Handle), ContainerSpec>>>,
    pub create_calls: Arc<Mutex<u32>>,
    /// The `user` argument of every `run` call, in order — tests assert
    /// on this to check the default-to-"root" propagation (§8 scenario 5).
    pub run_calls: Arc<Mutex<Vec<String>>>,
}

impl FakeRuntimeDaemon {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, worker: &WorkerName, handle: &Handle) -> bool {
        self.state.lock().contains_key(&(worker.clone(), handle.clone()))
    }

    /// The `ContainerSpec` a `create` call was given for this handle, if
    /// any — tests assert on it to check env/mount assembly (§8 scenario 6).
    pub fn spec_for(&self, worker: &WorkerName, handle: &Handle) -> Option<ContainerSpec> {
        self.state.lock().get(&(worker.clone(), handle.clone())).cloned()
    }
}

#[async_trait]
impl RuntimeDaemon for FakeRuntimeDaemon {
    async fn create(&self, worker: &WorkerName, spec: &ContainerSpec) -> ProvisionResult<()> {
        *self.create_calls.lock() += 1;
        self.state
            .lock()
            .insert((worker.clone(), spec.handle.clone()), spec.clone());
        Ok(())
    }

    async fn lookup(&self, worker: &WorkerName, handle: &Handle) -> ProvisionResult<bool> {
        Ok(self.contains(worker, handle))
    }

    async fn destroy(&self, worker: &WorkerName, handle: &Handle) -> ProvisionResult<()> {
        self.state.lock().remove(&(worker.clone(), handle.clone()));
        Ok(())
    }

    async fn run(
        &self,
        worker: &WorkerName,
        handle: &Handle,
        _process: &ProcessSpec,
        user: &str,
        io: ProcessIo,
    ) -> ProvisionResult<ProcessOutput> {
        if !self.contains(worker, handle) {
            return Err(provisioner_types::ProvisionError::NotFound(format!("container {handle}")));
        }
        self.run_calls.lock().push(user.to_string());
        Ok(ProcessOutput {
            stdout: io.stdin.unwrap_or_default(),
            stderr: Vec::new(),
            exit_status: 0,
        })
    }
}

#[derive(Default)]
pub struct FakeBlobDaemon {
    state: Arc<Mutex<HashMap<(WorkerName, Handle), VolumeSpec>>>,
    metadata: Arc<Mutex<HashMap<(WorkerName, Handle), Vec<u8>>>>,
    pub create_calls: Arc<Mutex<u32>>,
}

impl FakeBlobDaemon {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, worker: &WorkerName, handle: &Handle) -> bool {
        self.state.lock().contains_key(&(worker.clone(), handle.clone()))
    }

    /// Test hook: seed the metadata file an artifact volume would carry.
    pub fn set_metadata(&self, worker: &WorkerName, handle: &Handle, bytes: Vec<u8>) {
        self.metadata.lock().insert((worker.clone(), handle.clone()), bytes);
    }
}

#[async_trait]
impl BlobDaemon for FakeBlobDaemon {
    async fn create(&self, worker: &WorkerName, spec: &VolumeSpec) -> ProvisionResult<()> {
        *self.create_calls.lock() += 1;
        self.state
            .lock()
            .insert((worker.clone(), spec.handle.clone()), spec.clone());
        Ok(())
    }

    async fn lookup(&self, worker: &WorkerName, handle: &Handle) -> ProvisionResult<bool> {
        Ok(self.contains(worker, handle))
    }

    async fn destroy(&self, worker: &WorkerName, handle: &Handle) -> ProvisionResult<()> {
        self.state.lock().remove(&(worker.clone(), handle.clone()));
        Ok(())
    }

    async fn stream_in(
        &self,
        from_worker: &WorkerName,
        from_handle: &Handle,
        to_worker: &WorkerName,
        to_handle: &Handle,
    ) -> ProvisionResult<()> {
        let spec = self
            .state
            .lock()
            .get(&(from_worker.clone(), from_handle.clone()))
            .cloned();
        if let Some(mut spec) = spec {
            spec.handle = to_handle.clone();
            self.state.lock().insert((to_worker.clone(), to_handle.clone()), spec);
        }
        let meta = self
            .metadata
            .lock()
            .get(&(from_worker.clone(), from_handle.clone()))
            .cloned();
        if let Some(meta) = meta {
            self.metadata.lock().insert((to_worker.clone(), to_handle.clone()), meta);
        }
        Ok(())
    }

    async fn read_metadata(&self, worker: &WorkerName, handle: &Handle) -> ProvisionResult<Vec<u8>> {
        Ok(self
            .metadata
            .lock()
            .get(&(worker.clone(), handle.clone()))
            .cloned()
            .unwrap_or_else(|| b"{}".to_vec()))
    }
}
