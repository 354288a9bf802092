//! Run-time Container Binding (§4.7): the handle-shaped object a caller
//! holds after a Container Provider find-or-create call. Scoped to one
//! call (§3 "Ownership and lifecycle") — nothing here is persisted beyond
//! what the Container Store and Volume Store already track.

use crate::daemon::{ProcessIo, ProcessOutput, ProcessSpec, RuntimeDaemon};
use crate::db::volumes::CreatedVolume;
use provisioner_types::ids::{ContainerId, Handle, TeamId, WorkerName};
use provisioner_types::ProvisionResult;
use std::sync::Arc;

pub struct Container {
    runtime: Arc<dyn RuntimeDaemon>,
    pub id: ContainerId,
    pub worker: WorkerName,
    pub handle: Handle,
    pub team: TeamId,
    user: Option<String>,
    volume_mounts: Vec<(CreatedVolume, String)>,
}

impl Container {
    pub fn new(
        runtime: Arc<dyn RuntimeDaemon>,
        id: ContainerId,
        worker: WorkerName,
        handle: Handle,
        team: TeamId,
        user: Option<String>,
        volume_mounts: Vec<(CreatedVolume, String)>,
    ) -> Self {
        Self {
            runtime,
            id,
            worker,
            handle,
            team,
            user,
            volume_mounts,
        }
    }

    /// `Run` (§4.7): forwards to the daemon with `user` injected from the
    /// container's stored properties, defaulting to `"root"` when unset
    /// or empty.
    pub async fn run(&self, process: ProcessSpec, io: ProcessIo) -> ProvisionResult<ProcessOutput> {
        let user = match &self.user {
            Some(u) if !u.is_empty() => u.as_str(),
            _ => "root",
        };
        self.runtime.run(&self.worker, &self.handle, &process, user, io).await
    }

    /// `VolumeMounts` (§4.7): the (Volume, mountPath) pairs recorded on
    /// the created row.
    pub fn volume_mounts(&self) -> &[(CreatedVolume, String)] {
        &self.volume_mounts
    }

    /// `Destroy` (§4.6): removes the daemon object; the caller is
    /// responsible for marking the store row `destroying` so the
    /// collector reaps it.
    pub async fn destroy(&self) -> ProvisionResult<()> {
        self.runtime.destroy(&self.worker, &self.handle).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::{ContainerSpec, FakeRuntimeDaemon};

    #[tokio::test]
    async fn run_defaults_to_root_when_user_unset() {
        let daemon = Arc::new(FakeRuntimeDaemon::new());
        let worker = WorkerName("w1".into());
        let handle = Handle::generate();
        daemon
            .create(
                &worker,
                &ContainerSpec {
                    handle: handle.clone(),
                    image: "busybox".into(),
                    env: vec![],
                    user: None,
                    mounts: vec![],
                    privileged: false,
                },
            )
            .await
            .unwrap();

        let container = Container::new(daemon.clone(), ContainerId(1), worker, handle, TeamId(1), None, vec![]);
        container
            .run(ProcessSpec { path: "/bin/true".into(), args: vec![] }, ProcessIo::default())
            .await
            .unwrap();
        assert_eq!(daemon.run_calls.lock().as_slice(), ["root"]);
    }

    #[tokio::test]
    async fn run_uses_stored_user_when_non_empty() {
        let daemon = Arc::new(FakeRuntimeDaemon::new());
        let worker = WorkerName("w1".into());
        let handle = Handle::generate();
        daemon
            .create(
                &worker,
                &ContainerSpec {
                    handle: handle.clone(),
                    image: "busybox".into(),
                    env: vec![],
                    user: None,
                    mounts: vec![],
                    privileged: false,
                },
            )
            .await
            .unwrap();

        let container = Container::new(
            daemon.clone(),
            ContainerId(1),
            worker,
            handle,
            TeamId(1),
            Some("build".into()),
            vec![],
        );
        container
            .run(ProcessSpec { path: "/bin/true".into(), args: vec![] }, ProcessIo::default())
            .await
            .unwrap();
        assert_eq!(daemon.run_calls.lock().as_slice(), ["build"]);
    }
}
