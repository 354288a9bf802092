//! ResourceCache store: a content-addressed record of a specific fetched
//! artifact — (resource config, version, params hash) (§3).

use super::Database;
use provisioner_types::ids::{ResourceCacheId, ResourceConfigId};
use provisioner_types::ProvisionResult;
use rusqlite::params;
use sha2::{Digest, Sha256};

fn digest(config: ResourceConfigId, version: &serde_json::Value, params_value: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(config.0.to_le_bytes());
    hasher.update(b":");
    hasher.update(version.to_string().as_bytes());
    hasher.update(b":");
    hasher.update(params_value.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Clone)]
pub struct ResourceCacheStore {
    db: Database,
}

impl ResourceCacheStore {
    pub(super) fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn find_or_create(
        &self,
        config: ResourceConfigId,
        version: &serde_json::Value,
        params_value: &serde_json::Value,
    ) -> ProvisionResult<ResourceCacheId> {
        let digest = digest(config, version, params_value);
        let conn = self.db.conn();
        conn.execute(
            "INSERT OR IGNORE INTO resource_caches (digest, resource_config_id, version, params)
             VALUES (?1, ?2, ?3, ?4)",
            params![digest, config.0, version.to_string(), params_value.to_string()],
        )?;
        conn.query_row(
            "SELECT id FROM resource_caches WHERE digest = ?1",
            params![digest],
            |row| row.get(0).map(ResourceCacheId),
        )
        .map_err(Into::into)
    }

    pub fn resource_config_of(&self, id: ResourceCacheId) -> ProvisionResult<ResourceConfigId> {
        let conn = self.db.conn();
        conn.query_row(
            "SELECT resource_config_id FROM resource_caches WHERE id = ?1",
            params![id.0],
            |row| row.get(0).map(ResourceConfigId),
        )
        .map_err(Into::into)
    }

    /// Eligible for deletion once no uses reference it.
    pub fn find_deletable(&self) -> ProvisionResult<Vec<ResourceCacheId>> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT c.id FROM resource_caches c
             WHERE NOT EXISTS (SELECT 1 FROM resource_cache_uses u WHERE u.resource_cache_id = c.id)",
        )?;
        let rows = stmt.query_map([], |row| Ok(ResourceCacheId(row.get(0)?)))?;
        rows.collect::<Result<_, _>>().map_err(Into::into)
    }

    pub fn delete(&self, id: ResourceCacheId) -> ProvisionResult<()> {
        let conn = self.db.conn();
        conn.execute("DELETE FROM resource_caches WHERE id = ?1", params![id.0])?;
        Ok(())
    }
}
