//! ResourceConfigUse / ResourceCacheUse rows: many-to-one from (build |
//! resource | resource type) to a config/cache, living exactly as long as
//! the using entity cares (§3). The deletion queries here encode the
//! preservation rules of §4.8 directly as SQL predicates rather than
//! fetching rows into Rust and filtering, so "what gets kept" is a single
//! readable statement per rule.

use super::Database;
use provisioner_types::ids::{
    BuildId, ResourceCacheId, ResourceConfigId, ResourceId, ResourceTypeId,
};
use provisioner_types::ProvisionResult;
use rusqlite::params;

/// The tagged owner columns a use row can point at. Mirrors
/// `ResourceUser` (C7) but at the storage layer — see
/// `crate::resource_user` for the caller-facing sum type these are built
/// from.
#[derive(Debug, Clone, Copy)]
pub enum UseOwner {
    Build(BuildId),
    Resource(ResourceId),
    ResourceType(ResourceTypeId),
}

#[derive(Clone)]
pub struct ResourceUseStore {
    db: Database,
}

impl ResourceUseStore {
    pub(super) fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn use_config(&self, owner: UseOwner, config: ResourceConfigId) -> ProvisionResult<()> {
        let conn = self.db.conn();
        match owner {
            UseOwner::Build(id) => conn.execute(
                "INSERT INTO resource_config_uses (resource_config_id, build_id) VALUES (?1, ?2)",
                params![config.0, id.0],
            ),
            UseOwner::Resource(id) => conn.execute(
                "INSERT INTO resource_config_uses (resource_config_id, resource_id) VALUES (?1, ?2)",
                params![config.0, id.0],
            ),
            UseOwner::ResourceType(id) => conn.execute(
                "INSERT INTO resource_config_uses (resource_config_id, resource_type_id) VALUES (?1, ?2)",
                params![config.0, id.0],
            ),
        }?;
        Ok(())
    }

    pub fn use_cache(
        &self,
        owner: UseOwner,
        cache: ResourceCacheId,
        is_image_resource_use: bool,
    ) -> ProvisionResult<()> {
        let conn = self.db.conn();
        match owner {
            UseOwner::Build(id) => conn.execute(
                "INSERT INTO resource_cache_uses (resource_cache_id, build_id, is_image_resource_use) VALUES (?1, ?2, ?3)",
                params![cache.0, id.0, is_image_resource_use],
            ),
            UseOwner::Resource(id) => conn.execute(
                "INSERT INTO resource_cache_uses (resource_cache_id, resource_id, is_image_resource_use) VALUES (?1, ?2, ?3)",
                params![cache.0, id.0, is_image_resource_use],
            ),
            UseOwner::ResourceType(id) => conn.execute(
                "INSERT INTO resource_cache_uses (resource_cache_id, resource_type_id, is_image_resource_use) VALUES (?1, ?2, ?3)",
                params![cache.0, id.0, is_image_resource_use],
            ),
        }?;
        Ok(())
    }

    pub fn count_cache_uses(&self, cache: ResourceCacheId) -> ProvisionResult<i64> {
        let conn = self.db.conn();
        conn.query_row(
            "SELECT COUNT(*) FROM resource_cache_uses WHERE resource_cache_id = ?1",
            params![cache.0],
            |row| row.get(0),
        )
        .map_err(Into::into)
    }

    /// §4.8 resource-cache-use preservation rules, as one query per rule:
    ///
    /// 1. Image-resource uses: kept 24h after the owning build's end time,
    ///    then collected — independent of the one-off/job rule below.
    /// 2. One-off build uses: deletable once the build is terminal.
    /// 3. Job build uses: deletable once terminal AND a later build (by
    ///    id) of the same job exists — the latest build of each job keeps
    ///    its uses.
    /// 4. Resource/resource-type uses: deletable once the owner is
    ///    inactive or its pipeline is paused.
    pub fn find_deletable_cache_uses(&self, image_resource_retention_hours: i64) -> ProvisionResult<Vec<i64>> {
        let conn = self.db.conn();
        let mut ids = Vec::new();

        let mut stmt = conn.prepare(
            "SELECT u.id FROM resource_cache_uses u
             JOIN builds b ON b.id = u.build_id
             WHERE u.is_image_resource_use = 1
             AND b.end_time IS NOT NULL
             AND julianday('now') - julianday(b.end_time) > (?1 / 24.0)",
        )?;
        ids.extend(
            stmt.query_map(params![image_resource_retention_hours], |row| row.get::<_, i64>(0))?
                .collect::<Result<Vec<_>, _>>()?,
        );

        let mut stmt = conn.prepare(
            "SELECT u.id FROM resource_cache_uses u
             JOIN builds b ON b.id = u.build_id
             WHERE u.is_image_resource_use = 0
             AND b.job_id IS NULL
             AND b.status NOT IN ('pending', 'started')",
        )?;
        ids.extend(stmt.query_map([], |row| row.get::<_, i64>(0))?.collect::<Result<Vec<_>, _>>()?);

        let mut stmt = conn.prepare(
            "SELECT u.id FROM resource_cache_uses u
             JOIN builds b ON b.id = u.build_id
             WHERE u.is_image_resource_use = 0
             AND b.job_id IS NOT NULL
             AND b.status NOT IN ('pending', 'started')
             AND EXISTS (SELECT 1 FROM builds b2 WHERE b2.job_id = b.job_id AND b2.id > b.id)",
        )?;
        ids.extend(stmt.query_map([], |row| row.get::<_, i64>(0))?.collect::<Result<Vec<_>, _>>()?);

        let mut stmt = conn.prepare(
            "SELECT u.id FROM resource_cache_uses u
             JOIN resources r ON r.id = u.resource_id
             JOIN pipelines p ON p.id = r.pipeline_id
             WHERE r.active = 0 OR p.paused = 1",
        )?;
        ids.extend(stmt.query_map([], |row| row.get::<_, i64>(0))?.collect::<Result<Vec<_>, _>>()?);

        let mut stmt = conn.prepare(
            "SELECT u.id FROM resource_cache_uses u
             JOIN resource_types rt ON rt.id = u.resource_type_id
             JOIN pipelines p ON p.id = rt.pipeline_id
             WHERE rt.active = 0 OR p.paused = 1",
        )?;
        ids.extend(stmt.query_map([], |row| row.get::<_, i64>(0))?.collect::<Result<Vec<_>, _>>()?);

        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }

    /// Same preservation rules as cache uses, applied to config uses
    /// (invariant 6); config uses have no image-resource carve-out since
    /// that's a cache-level concept (SaveImageResourceVersion records a
    /// cache use, not a config use).
    pub fn find_deletable_config_uses(&self) -> ProvisionResult<Vec<i64>> {
        let conn = self.db.conn();
        let mut ids = Vec::new();

        let mut stmt = conn.prepare(
            "SELECT u.id FROM resource_config_uses u
             JOIN builds b ON b.id = u.build_id
             WHERE b.job_id IS NULL
             AND b.status NOT IN ('pending', 'started')",
        )?;
        ids.extend(stmt.query_map([], |row| row.get::<_, i64>(0))?.collect::<Result<Vec<_>, _>>()?);

        let mut stmt = conn.prepare(
            "SELECT u.id FROM resource_config_uses u
             JOIN builds b ON b.id = u.build_id
             WHERE b.job_id IS NOT NULL
             AND b.status NOT IN ('pending', 'started')
             AND EXISTS (SELECT 1 FROM builds b2 WHERE b2.job_id = b.job_id AND b2.id > b.id)",
        )?;
        ids.extend(stmt.query_map([], |row| row.get::<_, i64>(0))?.collect::<Result<Vec<_>, _>>()?);

        let mut stmt = conn.prepare(
            "SELECT u.id FROM resource_config_uses u
             JOIN resources r ON r.id = u.resource_id
             JOIN pipelines p ON p.id = r.pipeline_id
             WHERE r.active = 0 OR p.paused = 1",
        )?;
        ids.extend(stmt.query_map([], |row| row.get::<_, i64>(0))?.collect::<Result<Vec<_>, _>>()?);

        let mut stmt = conn.prepare(
            "SELECT u.id FROM resource_config_uses u
             JOIN resource_types rt ON rt.id = u.resource_type_id
             JOIN pipelines p ON p.id = rt.pipeline_id
             WHERE rt.active = 0 OR p.paused = 1",
        )?;
        ids.extend(stmt.query_map([], |row| row.get::<_, i64>(0))?.collect::<Result<Vec<_>, _>>()?);

        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }

    pub fn delete_cache_use(&self, id: i64) -> ProvisionResult<()> {
        let conn = self.db.conn();
        conn.execute("DELETE FROM resource_cache_uses WHERE id = ?1", params![id])?;
        Ok(())
    }

    pub fn delete_config_use(&self, id: i64) -> ProvisionResult<()> {
        let conn = self.db.conn();
        conn.execute("DELETE FROM resource_config_uses WHERE id = ?1", params![id])?;
        Ok(())
    }
}
