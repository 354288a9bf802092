//! Volume Store (C2, §4.2): two-phase `creating → created → destroying`
//! lifecycle for volumes, with parent/child COW links and an owner of
//! container, resource cache, base-resource-type, or none.

use super::Database;
use provisioner_types::ids::{ContainerId, ResourceCacheId, TeamId, VolumeId, WorkerName};
use provisioner_types::model::VolumeOwner;
use provisioner_types::{ConflictKind, ProvisionError, ProvisionResult};
use rusqlite::{OptionalExtension, params};

/// A volume row in the `creating` state: the DB row exists, the daemon
/// object may or may not. Scoped to one find-or-create call (§3
/// "Ownership and lifecycle").
#[derive(Debug, Clone)]
pub struct CreatingVolume {
    pub id: VolumeId,
    pub worker: WorkerName,
    pub handle: provisioner_types::ids::Handle,
    pub mount_path: String,
    pub team: TeamId,
}

/// A volume row in the `created` state: both the DB row and (we assume,
/// until proven otherwise by a daemon lookup) the daemon object exist.
#[derive(Debug, Clone)]
pub struct CreatedVolume {
    pub id: VolumeId,
    pub worker: WorkerName,
    pub handle: provisioner_types::ids::Handle,
    pub mount_path: String,
    pub team: TeamId,
    pub parent: Option<VolumeId>,
}

#[derive(Clone)]
pub struct VolumeStore {
    db: Database,
}

impl VolumeStore {
    pub(super) fn new(db: Database) -> Self {
        Self { db }
    }

    /// `CreateContainerVolume` (§4.2): allocate a fresh handle, row in
    /// `creating`, owned by `container` at `mount_path`.
    pub fn create_container_volume(
        &self,
        team: TeamId,
        worker: &WorkerName,
        container: ContainerId,
        mount_path: &str,
    ) -> ProvisionResult<CreatingVolume> {
        let handle = provisioner_types::ids::Handle::generate();
        let conn = self.db.conn();
        conn.execute(
            "INSERT INTO volumes (worker_name, handle, state, container_id, mount_path, team_id)
             VALUES (?1, ?2, 'creating', ?3, ?4, ?5)",
            params![worker.0, handle.0, container.0, mount_path, team.0],
        )?;
        let id = VolumeId(conn.last_insert_rowid());
        Ok(CreatingVolume {
            id,
            worker: worker.clone(),
            handle,
            mount_path: mount_path.to_string(),
            team,
        })
    }

    /// `CreateChildForContainer` (§4.4): a COW child of `parent`, owned by
    /// `container`. The parent must be `created` (invariant 4); this is
    /// enforced by the `INSERT ... SELECT` only matching a created parent
    /// row, so a parent destroyed concurrently makes the insert affect
    /// zero rows rather than create a dangling child.
    pub fn create_child_for_container(
        &self,
        parent: &CreatedVolume,
        container: ContainerId,
        mount_path: &str,
    ) -> ProvisionResult<CreatingVolume> {
        let handle = provisioner_types::ids::Handle::generate();
        let conn = self.db.conn();
        let affected = conn.execute(
            "INSERT INTO volumes (worker_name, handle, state, parent_volume_id, container_id, mount_path, team_id)
             SELECT worker_name, ?2, 'creating', id, ?3, ?4, team_id
             FROM volumes WHERE id = ?1 AND state = 'created'",
            params![parent.id.0, handle.0, container.0, mount_path],
        )?;
        if affected == 0 {
            return Err(ProvisionError::Conflict(ConflictKind::UserDisappeared));
        }
        let id = VolumeId(conn.last_insert_rowid());
        Ok(CreatingVolume {
            id,
            worker: parent.worker.clone(),
            handle,
            mount_path: mount_path.to_string(),
            team: parent.team,
        })
    }

    /// `CreateVolumeForBaseResourceType` import row (§4.4).
    pub fn create_base_resource_type_volume(
        &self,
        team: TeamId,
        worker: &WorkerName,
        type_name: &str,
    ) -> ProvisionResult<CreatingVolume> {
        let handle = provisioner_types::ids::Handle::generate();
        let conn = self.db.conn();
        conn.execute(
            "INSERT INTO volumes (worker_name, handle, state, base_resource_type_name, mount_path, team_id)
             VALUES (?1, ?2, 'creating', ?3, '', ?4)",
            params![worker.0, handle.0, type_name, team.0],
        )?;
        let id = VolumeId(conn.last_insert_rowid());
        Ok(CreatingVolume {
            id,
            worker: worker.clone(),
            handle,
            mount_path: String::new(),
            team,
        })
    }

    /// `CreateVolumeForResourceCache` (§4.4): no find step, always
    /// creates, owner is the resource cache.
    pub fn create_for_resource_cache(
        &self,
        team: TeamId,
        worker: &WorkerName,
        cache: ResourceCacheId,
    ) -> ProvisionResult<CreatingVolume> {
        let handle = provisioner_types::ids::Handle::generate();
        let conn = self.db.conn();
        conn.execute(
            "INSERT INTO volumes (worker_name, handle, state, resource_cache_id, mount_path, team_id)
             VALUES (?1, ?2, 'creating', ?3, '', ?4)",
            params![worker.0, handle.0, cache.0, team.0],
        )?;
        let id = VolumeId(conn.last_insert_rowid());
        Ok(CreatingVolume {
            id,
            worker: worker.clone(),
            handle,
            mount_path: String::new(),
            team,
        })
    }

    /// `FindContainerVolume` (§4.2): at most one of the two options is
    /// `Some`.
    pub fn find_container_volume(
        &self,
        worker: &WorkerName,
        container: ContainerId,
        mount_path: &str,
    ) -> ProvisionResult<(Option<CreatingVolume>, Option<CreatedVolume>)> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT id, handle, state, team_id, parent_volume_id FROM volumes
             WHERE worker_name = ?1 AND container_id = ?2 AND mount_path = ?3
             AND state IN ('creating', 'created')",
        )?;
        let mut rows = stmt.query(params![worker.0, container.0, mount_path])?;

        let mut creating = None;
        let mut created = None;
        while let Some(row) = rows.next()? {
            let id = VolumeId(row.get(0)?);
            let handle: String = row.get(1)?;
            let state: String = row.get(2)?;
            let team = TeamId(row.get(3)?);
            let parent: Option<i64> = row.get(4)?;
            match state.as_str() {
                "creating" => {
                    creating = Some(CreatingVolume {
                        id,
                        worker: worker.clone(),
                        handle: handle.into(),
                        mount_path: mount_path.to_string(),
                        team,
                    })
                }
                "created" => {
                    created = Some(CreatedVolume {
                        id,
                        worker: worker.clone(),
                        handle: handle.into(),
                        mount_path: mount_path.to_string(),
                        team,
                        parent: parent.map(VolumeId),
                    })
                }
                other => {
                    return Err(ProvisionError::InvariantViolation(format!(
                        "unexpected volume state {other}"
                    )));
                }
            }
        }
        Ok((creating, created))
    }

    /// `FindVolumesForContainer` (§4.2): all `created` volumes bound to a
    /// container, used to rebuild a `Container`'s bind-mount list on
    /// reattach (§4.7).
    pub fn find_volumes_for_container(
        &self,
        container: ContainerId,
    ) -> ProvisionResult<Vec<CreatedVolume>> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT id, worker_name, handle, team_id, mount_path, parent_volume_id
             FROM volumes WHERE container_id = ?1 AND state = 'created'",
        )?;
        let rows = stmt.query_map(params![container.0], |row| {
            Ok(CreatedVolume {
                id: VolumeId(row.get(0)?),
                worker: WorkerName(row.get(1)?),
                handle: row.get::<_, String>(2)?.into(),
                team: TeamId(row.get(3)?),
                mount_path: row.get(4)?,
                parent: row.get::<_, Option<i64>>(5)?.map(VolumeId),
            })
        })?;
        rows.collect::<Result<_, _>>().map_err(Into::into)
    }

    /// `FindBaseResourceTypeVolume` (§4.4): the one import volume per
    /// (worker, base type), looked up by name rather than by handle since
    /// the caller doesn't have a handle until this returns one.
    pub fn find_base_resource_type_volume(
        &self,
        worker: &WorkerName,
        type_name: &str,
    ) -> ProvisionResult<(Option<CreatingVolume>, Option<CreatedVolume>)> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT id, handle, state, team_id FROM volumes
             WHERE worker_name = ?1 AND base_resource_type_name = ?2
             AND state IN ('creating', 'created')",
        )?;
        let mut rows = stmt.query(params![worker.0, type_name])?;

        let mut creating = None;
        let mut created = None;
        while let Some(row) = rows.next()? {
            let id = VolumeId(row.get(0)?);
            let handle: String = row.get(1)?;
            let state: String = row.get(2)?;
            let team = TeamId(row.get(3)?);
            match state.as_str() {
                "creating" => {
                    creating = Some(CreatingVolume {
                        id,
                        worker: worker.clone(),
                        handle: handle.into(),
                        mount_path: String::new(),
                        team,
                    })
                }
                "created" => {
                    created = Some(CreatedVolume {
                        id,
                        worker: worker.clone(),
                        handle: handle.into(),
                        mount_path: String::new(),
                        team,
                        parent: None,
                    })
                }
                other => {
                    return Err(ProvisionError::InvariantViolation(format!(
                        "unexpected volume state {other}"
                    )));
                }
            }
        }
        Ok((creating, created))
    }

    /// The volume a resource cache's fetched content lives on, if one has
    /// been created (§4.6 step 6, the "optional resource-cache volume").
    pub fn find_resource_cache_volume(
        &self,
        cache: ResourceCacheId,
    ) -> ProvisionResult<Option<CreatedVolume>> {
        let conn = self.db.conn();
        conn.query_row(
            "SELECT id, worker_name, handle, team_id, mount_path, parent_volume_id
             FROM volumes WHERE resource_cache_id = ?1 AND state = 'created'",
            params![cache.0],
            |row| {
                Ok(CreatedVolume {
                    id: VolumeId(row.get(0)?),
                    worker: WorkerName(row.get(1)?),
                    handle: row.get::<_, String>(2)?.into(),
                    team: TeamId(row.get(3)?),
                    mount_path: row.get(4)?,
                    parent: row.get::<_, Option<i64>>(5)?.map(VolumeId),
                })
            },
        )
        .optional()
        .map_err(Into::into)
    }

    /// `FindCreatedVolume` (§4.4 `LookupVolume`'s DB half): by handle.
    pub fn find_created_volume(
        &self,
        worker: &WorkerName,
        handle: &provisioner_types::ids::Handle,
    ) -> ProvisionResult<Option<CreatedVolume>> {
        let conn = self.db.conn();
        conn.query_row(
            "SELECT id, mount_path, team_id, parent_volume_id FROM volumes
             WHERE worker_name = ?1 AND handle = ?2 AND state = 'created'",
            params![worker.0, handle.0],
            |row| {
                Ok(CreatedVolume {
                    id: VolumeId(row.get(0)?),
                    worker: worker.clone(),
                    handle: handle.clone(),
                    mount_path: row.get(1)?,
                    team: TeamId(row.get(2)?),
                    parent: row.get::<_, Option<i64>>(3)?.map(VolumeId),
                })
            },
        )
        .optional()
        .map_err(Into::into)
    }

    /// `CreatingVolume.Created()` (§4.2): atomic `creating → created`.
    /// Fails with `ResourceConfigDisappeared`-style conflict if another
    /// process already promoted or destroyed the row — the caller is
    /// expected to treat that as "concurrent creator won" and retry.
    pub fn mark_created(&self, volume: &CreatingVolume) -> ProvisionResult<CreatedVolume> {
        let conn = self.db.conn();
        let affected = conn.execute(
            "UPDATE volumes SET state = 'created' WHERE id = ?1 AND state = 'creating'",
            params![volume.id.0],
        )?;
        if affected == 0 {
            return Err(ProvisionError::Conflict(ConflictKind::UserDisappeared));
        }
        let parent: Option<i64> = conn
            .query_row(
                "SELECT parent_volume_id FROM volumes WHERE id = ?1",
                params![volume.id.0],
                |row| row.get(0),
            )
            .optional()?
            .flatten();
        Ok(CreatedVolume {
            id: volume.id,
            worker: volume.worker.clone(),
            handle: volume.handle.clone(),
            mount_path: volume.mount_path.clone(),
            team: volume.team,
            parent: parent.map(VolumeId),
        })
    }

    /// Atomic `created → destroying`, performed by the GC (§4.8).
    pub fn mark_destroying(&self, id: VolumeId) -> ProvisionResult<()> {
        let conn = self.db.conn();
        conn.execute(
            "UPDATE volumes SET state = 'destroying' WHERE id = ?1 AND state = 'created'",
            params![id.0],
        )?;
        Ok(())
    }

    pub fn delete(&self, id: VolumeId) -> ProvisionResult<()> {
        let conn = self.db.conn();
        conn.execute("DELETE FROM volumes WHERE id = ?1", params![id.0])?;
        Ok(())
    }

    /// All `destroying` volumes, for the volume collector to reap on the
    /// blob daemon (§4.8 step 8).
    pub fn find_destroying(&self) -> ProvisionResult<Vec<(VolumeId, WorkerName, provisioner_types::ids::Handle)>> {
        let conn = self.db.conn();
        let mut stmt =
            conn.prepare("SELECT id, worker_name, handle FROM volumes WHERE state = 'destroying'")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                VolumeId(row.get(0)?),
                WorkerName(row.get(1)?),
                provisioner_types::ids::Handle(row.get(2)?),
            ))
        })?;
        rows.collect::<Result<_, _>>().map_err(Into::into)
    }

    /// Volumes with `state = 'created'` and no live owner: no container
    /// row, no resource cache with a use, no base-resource-type
    /// reference still declared by the worker. The volume collector
    /// transitions these to `destroying` (§4.8 step 8, §8 invariant "no
    /// owner after a GC pass ⇒ eventually destroyed").
    pub fn find_unowned(&self) -> ProvisionResult<Vec<VolumeId>> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT v.id FROM volumes v
             WHERE v.state = 'created'
             AND (v.container_id IS NULL OR NOT EXISTS (SELECT 1 FROM containers c WHERE c.id = v.container_id))
             AND (v.resource_cache_id IS NULL OR NOT EXISTS (
                    SELECT 1 FROM resource_cache_uses u WHERE u.resource_cache_id = v.resource_cache_id
             ))
             AND v.base_resource_type_name IS NULL",
        )?;
        let rows = stmt.query_map([], |row| Ok(VolumeId(row.get(0)?)))?;
        rows.collect::<Result<_, _>>().map_err(Into::into)
    }

    pub fn owner(&self, id: VolumeId) -> ProvisionResult<VolumeOwner> {
        let conn = self.db.conn();
        conn.query_row(
            "SELECT container_id, resource_cache_id, base_resource_type_name, worker_name FROM volumes WHERE id = ?1",
            params![id.0],
            |row| {
                let container: Option<i64> = row.get(0)?;
                let cache: Option<i64> = row.get(1)?;
                let brt: Option<String> = row.get(2)?;
                let worker: String = row.get(3)?;
                Ok(match (container, cache, brt) {
                    (Some(c), _, _) => VolumeOwner::Container(ContainerId(c)),
                    (_, Some(c), _) => VolumeOwner::ResourceCache(ResourceCacheId(c)),
                    (_, _, Some(name)) => VolumeOwner::BaseResourceType {
                        worker: WorkerName(worker),
                        type_name: name,
                    },
                    _ => VolumeOwner::None,
                })
            },
        )
        .map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

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

    fn insert_container(db: &Database, worker: &WorkerName, handle: &str) -> ContainerId {
        let conn = db.conn();
        conn.execute(
            "INSERT INTO containers (worker_name, handle, state, team_id) VALUES (?1, ?2, 'created', 1)",
            params![worker.0, handle],
        )
        .unwrap();
        ContainerId(conn.last_insert_rowid())
    }

    #[test]
    fn create_then_find_then_promote() {
        let (db, team, worker) = setup();
        let container = insert_container(&db, &worker, "h-scratch");
        let store = db.volumes();
        let creating = store
            .create_container_volume(team, &worker, container, "/scratch")
            .unwrap();

        let (found_creating, found_created) = store
            .find_container_volume(&worker, container, "/scratch")
            .unwrap();
        assert!(found_created.is_none());
        assert_eq!(found_creating.unwrap().id, creating.id);

        let created = store.mark_created(&creating).unwrap();

        let (found_creating, found_created) = store
            .find_container_volume(&worker, container, "/scratch")
            .unwrap();
        assert!(found_creating.is_none());
        assert_eq!(found_created.unwrap().id, created.id);
    }

    #[test]
    fn double_promote_is_conflict() {
        let (db, team, worker) = setup();
        let container = insert_container(&db, &worker, "h-1");
        let store = db.volumes();
        let creating = store
            .create_container_volume(team, &worker, container, "/scratch")
            .unwrap();
        store.mark_created(&creating).unwrap();
        let err = store.mark_created(&creating).unwrap_err();
        assert!(matches!(err, ProvisionError::Conflict(ConflictKind::UserDisappeared)));
    }

    #[test]
    fn cow_child_requires_created_parent() {
        let (db, team, worker) = setup();
        let parent_container = insert_container(&db, &worker, "h-parent");
        let child_container = insert_container(&db, &worker, "h-child");
        let store = db.volumes();
        let parent_creating = store
            .create_container_volume(team, &worker, parent_container, "/parent")
            .unwrap();

        // Parent still `creating`: CreatedVolume type can't even be
        // constructed for it without going through mark_created, so the
        // invariant is enforced at the type level for callers using this
        // store's public API.
        let parent = store.mark_created(&parent_creating).unwrap();
        let child = store
            .create_child_for_container(&parent, child_container, "/child")
            .unwrap();
        assert_eq!(child.mount_path, "/child");
    }
}
