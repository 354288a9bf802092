//! Worker registry. The ATC's worker heartbeat/registration protocol is
//! genuinely external to this subsystem (§1) — this store only keeps the
//! columns the provisioning and GC logic read: name, team scope, tags,
//! declared base resource types, and heartbeat expiry.

use super::Database;
use provisioner_types::ids::{TeamId, WorkerName};
use provisioner_types::model::{BaseResourceType, Worker};
use provisioner_types::ProvisionResult;
use rusqlite::{OptionalExtension, params};

#[derive(Clone)]
pub struct WorkerStore {
    db: Database,
}

impl WorkerStore {
    pub(super) fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn register(&self, worker: &Worker) -> ProvisionResult<()> {
        let conn = self.db.conn();
        conn.execute(
            "INSERT INTO workers (name, team_id, tags, base_resource_types, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(name) DO UPDATE SET
                team_id = excluded.team_id,
                tags = excluded.tags,
                base_resource_types = excluded.base_resource_types,
                expires_at = excluded.expires_at",
            params![
                worker.name.0,
                worker.team.map(|t| t.0),
                serde_json::to_string(&worker.tags).unwrap(),
                serde_json::to_string(&worker.base_resource_types).unwrap(),
                worker.expires_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, name: &WorkerName) -> ProvisionResult<Option<Worker>> {
        let conn = self.db.conn();
        let row = conn
            .query_row(
                "SELECT team_id, tags, base_resource_types, expires_at FROM workers WHERE name = ?1",
                params![name.0],
                |row| {
                    let team: Option<i64> = row.get(0)?;
                    let tags: String = row.get(1)?;
                    let brts: String = row.get(2)?;
                    let expires_at: String = row.get(3)?;
                    Ok((team, tags, brts, expires_at))
                },
            )
            .optional()?;
        Ok(row.map(|(team, tags, brts, expires_at)| Worker {
            name: name.clone(),
            team: team.map(TeamId),
            tags: serde_json::from_str(&tags).unwrap_or_default(),
            base_resource_types: serde_json::from_str::<Vec<BaseResourceType>>(&brts).unwrap_or_default(),
            expires_at: chrono::DateTime::parse_from_rfc3339(&expires_at)
                .map(|d| d.with_timezone(&chrono::Utc))
                .unwrap_or_else(|_| chrono::Utc::now()),
        }))
    }

    /// Worker collector (§4.8 step 2): names whose heartbeat has expired.
    pub fn find_expired(&self, now: chrono::DateTime<chrono::Utc>) -> ProvisionResult<Vec<WorkerName>> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare("SELECT name FROM workers WHERE expires_at < ?1")?;
        let rows = stmt.query_map(params![now.to_rfc3339()], |row| row.get(0).map(WorkerName))?;
        rows.collect::<Result<_, _>>().map_err(Into::into)
    }

    pub fn prune(&self, name: &WorkerName) -> ProvisionResult<()> {
        let conn = self.db.conn();
        conn.execute("DELETE FROM workers WHERE name = ?1", params![name.0])?;
        Ok(())
    }
}
