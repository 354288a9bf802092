//! Container Store (C3, §4.2): the same two-phase lifecycle as volumes,
//! owned by (team, worker, and one of: build+plan, resource config,
//! resource cache).

use super::Database;
use provisioner_types::ids::{BuildId, ContainerId, Handle, ResourceCacheId, ResourceConfigId, TeamId, WorkerName};
use provisioner_types::model::ContainerOwner;
use provisioner_types::{ConflictKind, ProvisionError, ProvisionResult};
use rusqlite::{OptionalExtension, params};

#[derive(Debug, Clone)]
pub struct CreatingContainer {
    pub id: ContainerId,
    pub worker: WorkerName,
    pub handle: Handle,
}

#[derive(Debug, Clone)]
pub struct CreatedContainer {
    pub id: ContainerId,
    pub worker: WorkerName,
    pub handle: Handle,
    pub team: TeamId,
}

#[derive(Clone)]
pub struct ContainerStore {
    db: Database,
}

impl ContainerStore {
    pub(super) fn new(db: Database) -> Self {
        Self { db }
    }

    fn insert(
        &self,
        team: TeamId,
        worker: &WorkerName,
        owner: &ContainerOwner,
        metadata: &serde_json::Value,
    ) -> ProvisionResult<CreatingContainer> {
        let handle = Handle::generate();
        let conn = self.db.conn();
        let metadata_json = metadata.to_string();
        match owner {
            ContainerOwner::Build { build_id, plan_id } => {
                conn.execute(
                    "INSERT INTO containers (worker_name, handle, state, team_id, build_id, plan_id, metadata)
                     VALUES (?1, ?2, 'creating', ?3, ?4, ?5, ?6)",
                    params![worker.0, handle.0, team.0, build_id.0, plan_id, metadata_json],
                )?;
            }
            ContainerOwner::ResourceCheck { resource_config_id } => {
                conn.execute(
                    "INSERT INTO containers (worker_name, handle, state, team_id, resource_config_id, metadata)
                     VALUES (?1, ?2, 'creating', ?3, ?4, ?5)",
                    params![worker.0, handle.0, team.0, resource_config_id.0, metadata_json],
                )?;
            }
            ContainerOwner::ResourceGet { resource_cache_id } => {
                conn.execute(
                    "INSERT INTO containers (worker_name, handle, state, team_id, resource_cache_id, metadata)
                     VALUES (?1, ?2, 'creating', ?3, ?4, ?5)",
                    params![worker.0, handle.0, team.0, resource_cache_id.0, metadata_json],
                )?;
            }
        }
        let id = ContainerId(conn.last_insert_rowid());
        Ok(CreatingContainer {
            id,
            worker: worker.clone(),
            handle,
        })
    }

    /// `CreateBuildContainer` (§4.2).
    pub fn create_build_container(
        &self,
        team: TeamId,
        worker: &WorkerName,
        build_id: BuildId,
        plan_id: &str,
        metadata: &serde_json::Value,
    ) -> ProvisionResult<CreatingContainer> {
        self.insert(
            team,
            worker,
            &ContainerOwner::Build {
                build_id,
                plan_id: Some(plan_id.to_string()),
            },
            metadata,
        )
    }

    /// `CreateResourceCheckContainer` (§4.2).
    pub fn create_resource_check_container(
        &self,
        team: TeamId,
        worker: &WorkerName,
        resource_config_id: ResourceConfigId,
        metadata: &serde_json::Value,
    ) -> ProvisionResult<CreatingContainer> {
        self.insert(
            team,
            worker,
            &ContainerOwner::ResourceCheck { resource_config_id },
            metadata,
        )
    }

    /// `CreateResourceGetContainer` (§4.2/§4.6): get containers are never
    /// deduplicated, so this is the only entry point — there is no
    /// matching `find_resource_get_container`.
    pub fn create_resource_get_container(
        &self,
        team: TeamId,
        worker: &WorkerName,
        resource_cache_id: ResourceCacheId,
        metadata: &serde_json::Value,
    ) -> ProvisionResult<CreatingContainer> {
        self.insert(
            team,
            worker,
            &ContainerOwner::ResourceGet { resource_cache_id },
            metadata,
        )
    }

    /// `FindBuildContainerOnWorker` (§4.2): at most one creating/created
    /// row per (worker, build, plan).
    pub fn find_build_container_on_worker(
        &self,
        worker: &WorkerName,
        build_id: BuildId,
        plan_id: &str,
    ) -> ProvisionResult<(Option<CreatingContainer>, Option<CreatedContainer>)> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT id, handle, state, team_id FROM containers
             WHERE worker_name = ?1 AND build_id = ?2 AND plan_id = ?3
             AND state IN ('creating', 'created')",
        )?;
        let mut rows = stmt.query(params![worker.0, build_id.0, plan_id])?;
        Self::split_rows(worker, rows.next()?.map(Self::row_tuple).transpose()?, &mut rows)
    }

    /// `FindResourceCheckContainerOnWorker` (§4.2).
    pub fn find_resource_check_container_on_worker(
        &self,
        worker: &WorkerName,
        resource_config_id: ResourceConfigId,
    ) -> ProvisionResult<(Option<CreatingContainer>, Option<CreatedContainer>)> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT id, handle, state, team_id FROM containers
             WHERE worker_name = ?1 AND resource_config_id = ?2
             AND state IN ('creating', 'created')",
        )?;
        let mut rows = stmt.query(params![worker.0, resource_config_id.0])?;
        Self::split_rows(worker, rows.next()?.map(Self::row_tuple).transpose()?, &mut rows)
    }

    fn row_tuple(row: &rusqlite::Row) -> rusqlite::Result<(i64, String, String, i64)> {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
    }

    fn split_rows(
        worker: &WorkerName,
        first: Option<(i64, String, String, i64)>,
        rows: &mut rusqlite::Rows,
    ) -> ProvisionResult<(Option<CreatingContainer>, Option<CreatedContainer>)> {
        let mut creating = None;
        let mut created = None;
        let mut next = first;
        loop {
            let Some((id, handle, state, team)) = next else {
                break;
            };
            match state.as_str() {
                "creating" => {
                    creating = Some(CreatingContainer {
                        id: ContainerId(id),
                        worker: worker.clone(),
                        handle: handle.into(),
                    })
                }
                "created" => {
                    created = Some(CreatedContainer {
                        id: ContainerId(id),
                        worker: worker.clone(),
                        handle: handle.into(),
                        team: TeamId(team),
                    })
                }
                other => {
                    return Err(ProvisionError::InvariantViolation(format!(
                        "unexpected container state {other}"
                    )));
                }
            }
            next = rows.next()?.map(Self::row_tuple).transpose()?;
        }
        Ok((creating, created))
    }

    /// `FindCreatedContainerByHandle` (§4.6): looked up purely in the
    /// store here; the caller also checks the runtime daemon and treats a
    /// miss on either side as "not found, no error".
    pub fn find_created_by_handle(
        &self,
        worker: &WorkerName,
        handle: &Handle,
        team: TeamId,
    ) -> ProvisionResult<Option<CreatedContainer>> {
        let conn = self.db.conn();
        conn.query_row(
            "SELECT id FROM containers
             WHERE worker_name = ?1 AND handle = ?2 AND team_id = ?3 AND state = 'created'",
            params![worker.0, handle.0, team.0],
            |row| {
                Ok(CreatedContainer {
                    id: ContainerId(row.get(0)?),
                    worker: worker.clone(),
                    handle: handle.clone(),
                    team,
                })
            },
        )
        .optional()
        .map_err(Into::into)
    }

    /// `CreatingContainer.Created()` (§4.6 step 8).
    pub fn mark_created(&self, container: &CreatingContainer, team: TeamId) -> ProvisionResult<CreatedContainer> {
        let conn = self.db.conn();
        let affected = conn.execute(
            "UPDATE containers SET state = 'created' WHERE id = ?1 AND state = 'creating'",
            params![container.id.0],
        )?;
        if affected == 0 {
            return Err(ProvisionError::Conflict(ConflictKind::UserDisappeared));
        }
        Ok(CreatedContainer {
            id: container.id,
            worker: container.worker.clone(),
            handle: container.handle.clone(),
            team,
        })
    }

    /// `CreatedContainer.Destroying()` (§4.6 "Destroy"): marks the row for
    /// the GC to reap after the runtime daemon object is gone.
    pub fn mark_destroying(&self, id: ContainerId) -> ProvisionResult<()> {
        let conn = self.db.conn();
        conn.execute(
            "UPDATE containers SET state = 'destroying' WHERE id = ?1 AND state = 'created'",
            params![id.0],
        )?;
        Ok(())
    }

    pub fn delete(&self, id: ContainerId) -> ProvisionResult<()> {
        let conn = self.db.conn();
        conn.execute("DELETE FROM containers WHERE id = ?1", params![id.0])?;
        Ok(())
    }

    pub fn find_destroying(&self) -> ProvisionResult<Vec<(ContainerId, WorkerName, Handle)>> {
        let conn = self.db.conn();
        let mut stmt = conn
            .prepare("SELECT id, worker_name, handle FROM containers WHERE state = 'destroying'")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                ContainerId(row.get(0)?),
                WorkerName(row.get(1)?),
                Handle(row.get(2)?),
            ))
        })?;
        rows.collect::<Result<_, _>>().map_err(Into::into)
    }

    /// Containers whose build has completed (§4.8 step 7, "build
    /// finished") and are still `created`.
    pub fn find_for_completed_builds(&self) -> ProvisionResult<Vec<ContainerId>> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT c.id FROM containers c
             JOIN builds b ON b.id = c.build_id
             WHERE c.state = 'created' AND b.completed = 1",
        )?;
        let rows = stmt.query_map([], |row| Ok(ContainerId(row.get(0)?)))?;
        rows.collect::<Result<_, _>>().map_err(Into::into)
    }

    /// Resource-check containers whose resource config no longer has any
    /// use (§4.8 step 7, "resource-check is idle").
    pub fn find_idle_resource_check_containers(&self) -> ProvisionResult<Vec<ContainerId>> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT c.id FROM containers c
             WHERE c.state = 'created' AND c.resource_config_id IS NOT NULL
             AND NOT EXISTS (
                 SELECT 1 FROM resource_config_uses u WHERE u.resource_config_id = c.resource_config_id
             )",
        )?;
        let rows = stmt.query_map([], |row| Ok(ContainerId(row.get(0)?)))?;
        rows.collect::<Result<_, _>>().map_err(Into::into)
    }

    pub fn worker_of(&self, id: ContainerId) -> ProvisionResult<WorkerName> {
        let conn = self.db.conn();
        conn.query_row(
            "SELECT worker_name FROM containers WHERE id = ?1",
            params![id.0],
            |row| row.get(0).map(WorkerName),
        )
        .map_err(Into::into)
    }

    pub fn handle_of(&self, id: ContainerId) -> ProvisionResult<Handle> {
        let conn = self.db.conn();
        conn.query_row(
            "SELECT handle FROM containers WHERE id = ?1",
            params![id.0],
            |row| row.get(0).map(Handle),
        )
        .map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Database, TeamId, WorkerName) {
        let db = Database::open_in_memory().unwrap();
        let conn = db.conn();
        conn.execute("INSERT INTO teams (name) VALUES ('main')", [])
            .unwrap();
        conn.execute(
            "INSERT INTO workers (name, expires_at) VALUES ('worker-1', '2999-01-01T00:00:00Z')",
            [],
        )
        .unwrap();
        drop(conn);
        (db, TeamId(1), WorkerName("worker-1".into()))
    }

    #[test]
    fn create_find_promote_build_container() {
        let (db, team, worker) = setup();
        let conn = db.conn();
        conn.execute("INSERT INTO builds (team_id, status) VALUES (1, 'started')", [])
            .unwrap();
        drop(conn);
        let store = db.containers();

        let creating = store
            .create_build_container(team, &worker, BuildId(1), "plan-1", &serde_json::json!({}))
            .unwrap();
        let (found_creating, found_created) = store
            .find_build_container_on_worker(&worker, BuildId(1), "plan-1")
            .unwrap();
        assert!(found_created.is_none());
        assert_eq!(found_creating.unwrap().id, creating.id);

        let created = store.mark_created(&creating, team).unwrap();
        let (found_creating, found_created) = store
            .find_build_container_on_worker(&worker, BuildId(1), "plan-1")
            .unwrap();
        assert!(found_creating.is_none());
        assert_eq!(found_created.unwrap().id, created.id);
    }

    #[test]
    fn get_containers_are_never_found_again() {
        let (db, team, worker) = setup();
        let conn = db.conn();
        conn.execute(
            "INSERT INTO resource_configs (digest, source) VALUES ('d1', '{}')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO resource_caches (digest, resource_config_id, version, params) VALUES ('c1', 1, '{}', '{}')",
            [],
        )
        .unwrap();
        drop(conn);
        let store = db.containers();
        store
            .create_resource_get_container(team, &worker, ResourceCacheId(1), &serde_json::json!({}))
            .unwrap();
        store
            .create_resource_get_container(team, &worker, ResourceCacheId(1), &serde_json::json!({}))
            .unwrap();
        // There is intentionally no find_resource_get_container_on_worker:
        // get containers are never deduplicated.
    }
}
