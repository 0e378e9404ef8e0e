use serde::Deserialize;

/// Runtime tuning for the executor and job worker loops. Every field can be
/// overridden through the environment; unparsable values fall back to the
/// defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Connection string handed to the store backend.
    pub database_url: String,

    /// Name recorded on executor registrations.
    pub application_name: String,

    /// Fallback polling interval for work pickup, in seconds (fractional
    /// values allowed). Notifications are best effort; this is the floor.
    pub poll_interval_secs: f64,

    /// How often a live executor refreshes its heartbeat, in seconds. The
    /// reaper treats anything older than twice this as a dead session.
    pub heartbeat_interval_secs: u64,

    /// How often an executor sweeps for dead peers, in seconds.
    pub reap_interval_secs: u64,

    /// Upper bound on workflow runs a single executor works concurrently.
    pub max_concurrent_runs: usize,

    /// Database connection pool size.
    pub db_pool_size: u32,

    /// Identity stamped on audit-relevant writes, when the caller has one.
    pub acting_principal: Option<String>,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL").unwrap_or_default(),
            application_name: std::env::var("APPLICATION_NAME")
                .unwrap_or_else(|_| "capstan".to_owned()),
            poll_interval_secs: env_parse("POLL_INTERVAL_SECS", 1.0),
            heartbeat_interval_secs: env_parse("HEARTBEAT_INTERVAL_SECS", 5),
            reap_interval_secs: env_parse("REAP_INTERVAL_SECS", 30),
            max_concurrent_runs: env_parse("MAX_CONCURRENT_RUNS", 4),
            db_pool_size: env_parse("DB_POOL_SIZE", 10),
            acting_principal: std::env::var("ACTING_PRINCIPAL").ok(),
        }
    }
}

impl EngineConfig {
    /// Heartbeats older than this are considered dead sessions.
    pub const fn session_timeout_secs(&self) -> u64 {
        self.heartbeat_interval_secs * 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = EngineConfig::default();
        assert!(config.poll_interval_secs > 0.0);
        assert!(config.heartbeat_interval_secs > 0);
        assert!(config.reap_interval_secs > 0);
        assert!(config.max_concurrent_runs > 0);
        assert!(config.db_pool_size > 0);
        assert_eq!(
            config.session_timeout_secs(),
            config.heartbeat_interval_secs * 2
        );
    }
}
