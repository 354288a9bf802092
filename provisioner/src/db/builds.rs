//! Build status bookkeeping. Scheduling policy and the build-log event
//! stream are external to this subsystem (§1); the GC's build collector
//! (§4.8 step 1) only needs the narrow contract this store provides:
//! stalled `started` builds age out to `errored`, and a status
//! transition sets the `completed` flag the rest of the GC pipeline reads.

use super::Database;
use provisioner_types::ids::{BuildId, TeamId};
use provisioner_types::model::{BuildScope, BuildStatus};
use provisioner_types::ProvisionResult;
use rusqlite::params;

fn status_str(status: BuildStatus) -> &'static str {
    match status {
        BuildStatus::Pending => "pending",
        BuildStatus::Started => "started",
        BuildStatus::Succeeded => "succeeded",
        BuildStatus::Failed => "failed",
        BuildStatus::Errored => "errored",
        BuildStatus::Aborted => "aborted",
    }
}

#[derive(Clone)]
pub struct BuildStore {
    db: Database,
}

impl BuildStore {
    pub(super) fn new(db: Database) -> Self {
        Self { db }
    }

    /// Starts a new build (one-off or belonging to a job) in the
    /// `started` state, matching the state a real ATC build row is in by
    /// the time anything in this subsystem first sees it.
    pub fn create(&self, team: TeamId, scope: BuildScope) -> ProvisionResult<BuildId> {
        let conn = self.db.conn();
        let job_id = match scope {
            BuildScope::OneOff => None,
            BuildScope::Job(id) => Some(id.0),
        };
        conn.execute(
            "INSERT INTO builds (team_id, job_id, status, start_time) VALUES (?1, ?2, 'started', datetime('now'))",
            params![team.0, job_id],
        )?;
        Ok(BuildId(conn.last_insert_rowid()))
    }

    pub fn transition(&self, id: BuildId, status: BuildStatus) -> ProvisionResult<()> {
        let conn = self.db.conn();
        let completed = status.is_terminal();
        conn.execute(
            "UPDATE builds SET status = ?2, completed = ?3,
             end_time = CASE WHEN ?3 = 1 AND end_time IS NULL THEN datetime('now') ELSE end_time END
             WHERE id = ?1",
            params![id.0, status_str(status), completed],
        )?;
        Ok(())
    }

    /// Build collector (§4.8 step 1): `started` builds that have been
    /// running longer than `stall_after` are presumed dead and move to
    /// `errored`. Returns the ids transitioned.
    pub fn collect_stalled(&self, stall_after: chrono::Duration) -> ProvisionResult<Vec<BuildId>> {
        let conn = self.db.conn();
        let cutoff = (chrono::Utc::now() - stall_after).to_rfc3339();
        let mut stmt = conn.prepare(
            "SELECT id FROM builds WHERE status = 'started' AND start_time IS NOT NULL AND start_time < ?1",
        )?;
        let ids: Vec<BuildId> = stmt
            .query_map(params![cutoff], |row| row.get(0).map(BuildId))?
            .collect::<Result<_, _>>()?;
        drop(stmt);
        for id in &ids {
            conn.execute(
                "UPDATE builds SET status = 'errored', completed = 1, end_time = datetime('now') WHERE id = ?1",
                params![id.0],
            )?;
        }
        Ok(ids)
    }
}
