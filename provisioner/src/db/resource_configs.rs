//! ResourceConfig store: a content-addressed record of "configuration of
//! a resource instance" = (base type OR parent resource config, source),
//! deduplicated so two resources with identical source share one row
//! (§3, SPEC_FULL.md §4.2 addendum).

use super::Database;
use provisioner_types::ids::ResourceConfigId;
use provisioner_types::{ConflictKind, ProvisionError, ProvisionResult};
use rusqlite::{OptionalExtension, params};
use sha2::{Digest, Sha256};

/// What a resource config is rooted in: either a worker base type by
/// name, or a parent resource config (for custom resource types that are
/// themselves resources, §4.5 strategy 5).
#[derive(Debug, Clone)]
pub enum ConfigOrigin {
    BaseType(String),
    Parent(ResourceConfigId),
}

fn digest(origin: &ConfigOrigin, source: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    match origin {
        ConfigOrigin::BaseType(name) => {
            hasher.update(b"base:");
            hasher.update(name.as_bytes());
        }
        ConfigOrigin::Parent(id) => {
            hasher.update(b"parent:");
            hasher.update(id.0.to_le_bytes());
        }
    }
    hasher.update(b":");
    hasher.update(source.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Clone)]
pub struct ResourceConfigStore {
    db: Database,
}

impl ResourceConfigStore {
    pub(super) fn new(db: Database) -> Self {
        Self { db }
    }

    /// Find-or-create by digest. Concurrent creators race on the `UNIQUE`
    /// constraint over `digest`; the loser's `INSERT OR IGNORE` affects
    /// zero rows and it falls through to the `SELECT`, converging on one
    /// row — this is the "DB constraint violation ⇒ concurrent creator
    /// won" rule from §4.4 applied to resource configs.
    pub fn find_or_create(
        &self,
        origin: &ConfigOrigin,
        source: &serde_json::Value,
    ) -> ProvisionResult<ResourceConfigId> {
        let digest = digest(origin, source);
        let conn = self.db.conn();

        let (base_type, parent): (Option<String>, Option<i64>) = match origin {
            ConfigOrigin::BaseType(name) => (Some(name.clone()), None),
            ConfigOrigin::Parent(id) => (None, Some(id.0)),
        };

        conn.execute(
            "INSERT OR IGNORE INTO resource_configs (digest, base_type, parent_resource_config_id, source)
             VALUES (?1, ?2, ?3, ?4)",
            params![digest, base_type, parent, source.to_string()],
        )?;

        conn.query_row(
            "SELECT id FROM resource_configs WHERE digest = ?1",
            params![digest],
            |row| row.get(0).map(ResourceConfigId),
        )
        .map_err(Into::into)
    }

    /// `ResourceConfigParentDisappeared` guard: if `origin` is
    /// `Parent(id)` and that row no longer exists, creation must fail
    /// with the named conflict rather than insert a dangling
    /// `parent_resource_config_id` (foreign keys alone would give an
    /// opaque SQLite error instead of the typed conflict callers retry
    /// on).
    pub fn find_or_create_checked(
        &self,
        origin: &ConfigOrigin,
        source: &serde_json::Value,
    ) -> ProvisionResult<ResourceConfigId> {
        if let ConfigOrigin::Parent(parent_id) = origin {
            let conn = self.db.conn();
            let exists: bool = conn
                .query_row(
                    "SELECT 1 FROM resource_configs WHERE id = ?1",
                    params![parent_id.0],
                    |_| Ok(true),
                )
                .optional()?
                .unwrap_or(false);
            if !exists {
                return Err(ProvisionError::Conflict(ConflictKind::ResourceConfigParentDisappeared));
            }
        }
        self.find_or_create(origin, source)
    }

    pub fn exists(&self, id: ResourceConfigId) -> ProvisionResult<bool> {
        let conn = self.db.conn();
        Ok(conn
            .query_row(
                "SELECT 1 FROM resource_configs WHERE id = ?1",
                params![id.0],
                |_| Ok(true),
            )
            .optional()?
            .unwrap_or(false))
    }

    /// Invariant 5: eligible for deletion once no uses and no caches
    /// reference it.
    pub fn find_deletable(&self) -> ProvisionResult<Vec<ResourceConfigId>> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT rc.id FROM resource_configs rc
             WHERE NOT EXISTS (SELECT 1 FROM resource_config_uses u WHERE u.resource_config_id = rc.id)
             AND NOT EXISTS (SELECT 1 FROM resource_caches c WHERE c.resource_config_id = rc.id)",
        )?;
        let rows = stmt.query_map([], |row| Ok(ResourceConfigId(row.get(0)?)))?;
        rows.collect::<Result<_, _>>().map_err(Into::into)
    }

    pub fn delete(&self, id: ResourceConfigId) -> ProvisionResult<()> {
        let conn = self.db.conn();
        conn.execute("DELETE FROM resource_configs WHERE id = ?1", params![id.0])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_source_dedupes_to_one_row() {
        let db = Database::open_in_memory().unwrap();
        let store = db.resource_configs();
        let source = serde_json::json!({"uri": "https://example.com/repo.git"});
        let a = store
            .find_or_create(&ConfigOrigin::BaseType("git".into()), &source)
            .unwrap();
        let b = store
            .find_or_create(&ConfigOrigin::BaseType("git".into()), &source)
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn different_source_gets_different_config() {
        let db = Database::open_in_memory().unwrap();
        let store = db.resource_configs();
        let a = store
            .find_or_create(&ConfigOrigin::BaseType("git".into()), &serde_json::json!({"uri": "a"}))
            .unwrap();
        let b = store
            .find_or_create(&ConfigOrigin::BaseType("git".into()), &serde_json::json!({"uri": "b"}))
            .unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn missing_parent_is_a_named_conflict() {
        let db = Database::open_in_memory().unwrap();
        let store = db.resource_configs();
        let err = store
            .find_or_create_checked(&ConfigOrigin::Parent(ResourceConfigId(999)), &serde_json::json!({}))
            .unwrap_err();
        assert!(matches!(
            err,
            ProvisionError::Conflict(ConflictKind::ResourceConfigParentDisappeared)
        ));
    }
}
