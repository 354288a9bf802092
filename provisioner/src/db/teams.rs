//! Team registry. Like `workers`, this store only keeps the column the
//! provisioning/GC logic actually needs — the name, unique per team —
//! the rest of a team's identity (auth, billing) belongs to the ATC
//! proper and is out of scope here (§3 "Minimal upstream entities").

use super::Database;
use provisioner_types::ids::TeamId;
use provisioner_types::ProvisionResult;
use rusqlite::{params, OptionalExtension};

#[derive(Clone)]
pub struct TeamStore {
    db: Database,
}

impl TeamStore {
    pub(super) fn new(db: Database) -> Self {
        Self { db }
    }

    /// Registers a team by name, returning its existing id if one
    /// already exists rather than erroring — callers (tests and
    /// bootstrap tooling alike) just want "the id for this team name",
    /// not a distinct create-vs-fetch protocol.
    pub fn find_or_create(&self, name: &str) -> ProvisionResult<TeamId> {
        let conn = self.db.conn();
        conn.execute(
            "INSERT INTO teams (name) VALUES (?1) ON CONFLICT(name) DO NOTHING",
            params![name],
        )?;
        let id: i64 = conn.query_row("SELECT id FROM teams WHERE name = ?1", params![name], |row| row.get(0))?;
        Ok(TeamId(id))
    }

    pub fn find(&self, name: &str) -> ProvisionResult<Option<TeamId>> {
        let conn = self.db.conn();
        conn.query_row("SELECT id FROM teams WHERE name = ?1", params![name], |row| row.get(0))
            .optional()
            .map(|row| row.map(TeamId))
            .map_err(Into::into)
    }
}
