//! Ambient configuration (SPEC_FULL.md §1 addendum): the numeric/duration
//! knobs the design leaves as "an implementer decision" — lock-retry
//! backoff step, image-resource-use retention window, DB path, and GC
//! tick interval. Plain fields with a `Default` impl, overridable via
//! `PROVISIONER_`-prefixed environment variables parsed with
//! `std::env`/`FromStr`, no config-loading crate.

use std::path::PathBuf;
use std::time::Duration;

/// Knobs every suspension point in §5 and the aggregate collector in
/// §4.8 read from.
#[derive(Debug, Clone)]
pub struct ProvisionerConfig {
    /// Fixed-delay sleep between retries in the lock-contention and
    /// conflict-retry loops (§4.4 "sleep one step (fixed delay) and loop").
    pub lock_retry_step: Duration,
    /// Number of attempts `retry_on_conflict` makes before giving up.
    pub max_retry_attempts: u32,
    /// How long an image-resource use is kept after its owning build
    /// ends before the resource-cache-use collector reaps it (§4.8).
    pub image_resource_retention_hours: i64,
    /// How long a `started` build may run before the build collector
    /// presumes it dead and errors it out (§4.8 step 1).
    pub build_stall_timeout: Duration,
    /// Path to the SQLite file backing the local store (§6).
    pub db_path: PathBuf,
    /// Interval between aggregate-collector passes.
    pub gc_tick_interval: Duration,
    /// `http_proxy` appended to every container's env when the image
    /// doesn't already set it (§4.6 step 7).
    pub http_proxy_url: Option<String>,
    /// `https_proxy` appended to every container's env (§4.6 step 7).
    pub https_proxy_url: Option<String>,
    /// `no_proxy` appended to every container's env (§4.6 step 7).
    pub no_proxy: Option<String>,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            lock_retry_step: Duration::from_millis(50),
            max_retry_attempts: 20,
            image_resource_retention_hours: 24,
            build_stall_timeout: Duration::from_secs(3600),
            db_path: PathBuf::from("provisioner.db"),
            gc_tick_interval: Duration::from_secs(30),
            http_proxy_url: None,
            https_proxy_url: None,
            no_proxy: None,
        }
    }
}

impl ProvisionerConfig {
    /// Starts from [`Default`] and overlays any `PROVISIONER_*`
    /// environment variables that are set and parse cleanly; an unset or
    /// unparseable variable is left at its default rather than failing
    /// startup.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(v) = env_u64("PROVISIONER_LOCK_RETRY_STEP_MS") {
            config.lock_retry_step = Duration::from_millis(v);
        }
        if let Some(v) = env_parse::<u32>("PROVISIONER_MAX_RETRY_ATTEMPTS") {
            config.max_retry_attempts = v;
        }
        if let Some(v) = env_parse::<i64>("PROVISIONER_IMAGE_RESOURCE_RETENTION_HOURS") {
            config.image_resource_retention_hours = v;
        }
        if let Some(v) = env_u64("PROVISIONER_BUILD_STALL_TIMEOUT_SECS") {
            config.build_stall_timeout = Duration::from_secs(v);
        }
        if let Ok(v) = std::env::var("PROVISIONER_DB_PATH") {
            config.db_path = PathBuf::from(v);
        }
        if let Some(v) = env_u64("PROVISIONER_GC_TICK_INTERVAL_SECS") {
            config.gc_tick_interval = Duration::from_secs(v);
        }
        if let Ok(v) = std::env::var("PROVISIONER_HTTP_PROXY_URL") {
            config.http_proxy_url = Some(v);
        }
        if let Ok(v) = std::env::var("PROVISIONER_HTTPS_PROXY_URL") {
            config.https_proxy_url = Some(v);
        }
        if let Ok(v) = std::env::var("PROVISIONER_NO_PROXY") {
            config.no_proxy = Some(v);
        }

        config
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_u64(key: &str) -> Option<u64> {
    env_parse(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_24h_retention_named_in_the_design() {
        let config = ProvisionerConfig::default();
        assert_eq!(config.image_resource_retention_hours, 24);
    }

    #[test]
    fn unset_env_var_leaves_the_default() {
        std::env::remove_var("PROVISIONER_MAX_RETRY_ATTEMPTS");
        let config = ProvisionerConfig::from_env();
        assert_eq!(config.max_retry_attempts, 20);
    }

    #[test]
    fn malformed_env_var_falls_back_to_default_rather_than_panicking() {
        std::env::set_var("PROVISIONER_MAX_RETRY_ATTEMPTS", "not-a-number");
        let config = ProvisionerConfig::from_env();
        assert_eq!(config.max_retry_attempts, 20);
        std::env::remove_var("PROVISIONER_MAX_RETRY_ATTEMPTS");
    }

    #[test]
    fn well_formed_env_var_overrides_the_default() {
        std::env::set_var("PROVISIONER_GC_TICK_INTERVAL_SECS", "5");
        let config = ProvisionerConfig::from_env();
        assert_eq!(config.gc_tick_interval, Duration::from_secs(5));
        std::env::remove_var("PROVISIONER_GC_TICK_INTERVAL_SECS");
    }

    #[test]
    fn proxy_settings_default_to_unset() {
        let config = ProvisionerConfig::default();
        assert!(config.http_proxy_url.is_none());
        assert!(config.https_proxy_url.is_none());
        assert!(config.no_proxy.is_none());
    }

    #[test]
    fn proxy_env_vars_are_picked_up() {
        std::env::set_var("PROVISIONER_HTTP_PROXY_URL", "http://proxy:8080");
        std::env::set_var("PROVISIONER_NO_PROXY", "localhost");
        let config = ProvisionerConfig::from_env();
        assert_eq!(config.http_proxy_url.as_deref(), Some("http://proxy:8080"));
        assert_eq!(config.no_proxy.as_deref(), Some("localhost"));
        assert!(config.https_proxy_url.is_none());
        std::env::remove_var("PROVISIONER_HTTP_PROXY_URL");
        std::env::remove_var("PROVISIONER_NO_PROXY");
    }
}
