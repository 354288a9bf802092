//! Resource-User Model (C7, §4.3): "who is using this resource
//! cache/config" as a tagged sum type, pattern-matched at the use-creation
//! site to pick the right foreign-key column (design note §9: "prefer
//! this over multiple inheritance or duck typing").

use crate::db::resource_uses::UseOwner;
use crate::db::ResourceUseStore;
use provisioner_types::ids::{BuildId, ResourceCacheId, ResourceConfigId, ResourceId, ResourceTypeId};
use provisioner_types::ProvisionResult;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceUser {
    ForBuild(BuildId),
    ForResource(ResourceId),
    ForResourceType(ResourceTypeId),
}

impl ResourceUser {
    pub fn use_resource_config(
        &self,
        store: &ResourceUseStore,
        config: ResourceConfigId,
    ) -> ProvisionResult<()> {
        store.use_config(self.as_owner(), config)
    }

    pub fn use_resource_cache(
        &self,
        store: &ResourceUseStore,
        cache: ResourceCacheId,
    ) -> ProvisionResult<()> {
        store.use_cache(self.as_owner(), cache, false)
    }

    /// Uses recorded by `SaveImageResourceVersion` follow the separate
    /// 24h-after-build-end retention rule in §4.8, so they're tagged
    /// distinctly from an ordinary resource-cache use.
    pub fn save_image_resource_version(
        &self,
        store: &ResourceUseStore,
        cache: ResourceCacheId,
    ) -> ProvisionResult<()> {
        store.use_cache(self.as_owner(), cache, true)
    }

    fn as_owner(&self) -> UseOwner {
        match self {
            ResourceUser::ForBuild(id) => UseOwner::Build(*id),
            ResourceUser::ForResource(id) => UseOwner::Resource(*id),
            ResourceUser::ForResourceType(id) => UseOwner::ResourceType(*id),
        }
    }
}

impl fmt::Display for ResourceUser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceUser::ForBuild(id) => write!(f, "build #{id}"),
            ResourceUser::ForResource(id) => write!(f, "resource #{id}"),
            ResourceUser::ForResourceType(id) => write!(f, "resource type #{id}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::resource_configs::ConfigOrigin;
    use crate::db::Database;

    #[test]
    fn build_user_description() {
        let user = ResourceUser::ForBuild(BuildId(42));
        assert_eq!(user.to_string(), "build #42");
    }

    #[test]
    fn use_resource_config_inserts_owned_by_build() {
        let db = Database::open_in_memory().unwrap();
        let conn = db.conn();
        conn.execute("INSERT INTO teams (name) VALUES ('main')", []).unwrap();
        conn.execute("INSERT INTO builds (team_id, status) VALUES (1, 'started')", [])
            .unwrap();
        drop(conn);

        let config = db
            .resource_configs()
            .find_or_create(&ConfigOrigin::BaseType("git".into()), &serde_json::json!({}))
            .unwrap();
        let user = ResourceUser::ForBuild(BuildId(1));
        user.use_resource_config(&db.resource_uses(), config).unwrap();

        let conn = db.conn();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM resource_config_uses WHERE build_id = 1", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }
}
