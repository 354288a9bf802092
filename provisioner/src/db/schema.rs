//! Embedded schema for the subsystem's own tables (§6, SUPPLEMENT in
//! SPEC_FULL.md §2). Additive-only migrations: new columns/tables get a
//! new numbered block appended to `MIGRATIONS`, never an edit to an
//! existing one.

use provisioner_types::ProvisionResult;
use rusqlite::Connection;

pub const SCHEMA_VERSION: i32 = 1;

/// Ordered, additive list of schema statements. Each entry is applied via
/// `CREATE TABLE IF NOT EXISTS` / `CREATE INDEX IF NOT EXISTS` so opening
/// an already-initialized database is a no-op.
fn all_schemas() -> Vec<&'static str> {
    vec![
        "CREATE TABLE IF NOT EXISTS schema_version (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            version INTEGER NOT NULL,
            updated_at TEXT NOT NULL
        )",
        "CREATE TABLE IF NOT EXISTS teams (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE
        )",
        "CREATE TABLE IF NOT EXISTS workers (
            name TEXT PRIMARY KEY,
            team_id INTEGER REFERENCES teams(id),
            tags TEXT NOT NULL DEFAULT '[]',
            base_resource_types TEXT NOT NULL DEFAULT '[]',
            expires_at TEXT NOT NULL
        )",
        "CREATE TABLE IF NOT EXISTS pipelines (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            team_id INTEGER NOT NULL REFERENCES teams(id),
            name TEXT NOT NULL,
            paused INTEGER NOT NULL DEFAULT 0,
            public INTEGER NOT NULL DEFAULT 0,
            UNIQUE(team_id, name)
        )",
        "CREATE TABLE IF NOT EXISTS jobs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            pipeline_id INTEGER NOT NULL REFERENCES pipelines(id),
            name TEXT NOT NULL,
            UNIQUE(pipeline_id, name)
        )",
        "CREATE TABLE IF NOT EXISTS resources (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            pipeline_id INTEGER NOT NULL REFERENCES pipelines(id),
            name TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 1,
            UNIQUE(pipeline_id, name)
        )",
        "CREATE TABLE IF NOT EXISTS resource_types (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            pipeline_id INTEGER NOT NULL REFERENCES pipelines(id),
            name TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 1,
            UNIQUE(pipeline_id, name)
        )",
        "CREATE TABLE IF NOT EXISTS builds (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            team_id INTEGER NOT NULL REFERENCES teams(id),
            job_id INTEGER REFERENCES jobs(id),
            status TEXT NOT NULL,
            completed INTEGER NOT NULL DEFAULT 0,
            start_time TEXT,
            end_time TEXT
        )",
        "CREATE INDEX IF NOT EXISTS idx_builds_job ON builds(job_id)",
        "CREATE TABLE IF NOT EXISTS resource_configs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            digest TEXT NOT NULL UNIQUE,
            base_type TEXT,
            parent_resource_config_id INTEGER REFERENCES resource_configs(id),
            source TEXT NOT NULL
        )",
        "CREATE TABLE IF NOT EXISTS resource_caches (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            digest TEXT NOT NULL UNIQUE,
            resource_config_id INTEGER NOT NULL REFERENCES resource_configs(id),
            version TEXT NOT NULL,
            params TEXT NOT NULL
        )",
        "CREATE TABLE IF NOT EXISTS resource_config_uses (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            resource_config_id INTEGER NOT NULL REFERENCES resource_configs(id),
            build_id INTEGER REFERENCES builds(id),
            resource_id INTEGER REFERENCES resources(id),
            resource_type_id INTEGER REFERENCES resource_types(id)
        )",
        "CREATE INDEX IF NOT EXISTS idx_rcu_config ON resource_config_uses(resource_config_id)",
        "CREATE TABLE IF NOT EXISTS resource_cache_uses (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            resource_cache_id INTEGER NOT NULL REFERENCES resource_caches(id),
            build_id INTEGER REFERENCES builds(id),
            resource_id INTEGER REFERENCES resources(id),
            resource_type_id INTEGER REFERENCES resource_types(id),
            is_image_resource_use INTEGER NOT NULL DEFAULT 0
        )",
        "CREATE INDEX IF NOT EXISTS idx_rchu_cache ON resource_cache_uses(resource_cache_id)",
        "CREATE TABLE IF NOT EXISTS containers (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            worker_name TEXT NOT NULL REFERENCES workers(name),
            handle TEXT NOT NULL,
            state TEXT NOT NULL,
            team_id INTEGER NOT NULL REFERENCES teams(id),
            build_id INTEGER REFERENCES builds(id),
            plan_id TEXT,
            resource_config_id INTEGER REFERENCES resource_configs(id),
            resource_cache_id INTEGER REFERENCES resource_caches(id),
            metadata TEXT NOT NULL DEFAULT '{}',
            UNIQUE(worker_name, handle)
        )",
        "CREATE INDEX IF NOT EXISTS idx_containers_build ON containers(build_id)",
        "CREATE INDEX IF NOT EXISTS idx_containers_rc ON containers(resource_config_id)",
        "CREATE TABLE IF NOT EXISTS volumes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            worker_name TEXT NOT NULL REFERENCES workers(name),
            handle TEXT NOT NULL,
            state TEXT NOT NULL,
            parent_volume_id INTEGER REFERENCES volumes(id),
            container_id INTEGER REFERENCES containers(id),
            resource_cache_id INTEGER REFERENCES resource_caches(id),
            base_resource_type_name TEXT,
            mount_path TEXT NOT NULL,
            team_id INTEGER NOT NULL REFERENCES teams(id),
            UNIQUE(worker_name, handle)
        )",
        "CREATE INDEX IF NOT EXISTS idx_volumes_container ON volumes(container_id, mount_path)",
        "CREATE INDEX IF NOT EXISTS idx_volumes_cache ON volumes(resource_cache_id)",
    ]
}

pub fn init(conn: &Connection) -> ProvisionResult<()> {
    for stmt in all_schemas() {
        conn.execute_batch(stmt)?;
    }

    let current: Option<i32> = conn
        .query_row(
            "SELECT version FROM schema_version WHERE id = 1",
            [],
            |row| row.get(0),
        )
        .ok();

    match current {
        None => {
            let now = chrono::Utc::now().to_rfc3339();
            conn.execute(
                "INSERT INTO schema_version (id, version, updated_at) VALUES (1, ?1, ?2)",
                rusqlite::params![SCHEMA_VERSION, now],
            )?;
            tracing::info!(version = SCHEMA_VERSION, "initialized provisioner schema");
        }
        Some(v) if v > SCHEMA_VERSION => {
            return Err(provisioner_types::ProvisionError::Database(format!(
                "database schema version {} is newer than supported {}",
                v, SCHEMA_VERSION
            )));
        }
        _ => {}
    }

    Ok(())
}
