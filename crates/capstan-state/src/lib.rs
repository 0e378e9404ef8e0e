//! Store backends for the capstan workflow engine.
//!
//! Both backends implement the full set of store traits from
//! `capstan-core` on a single cloneable handle. Postgres relies on
//! `FOR UPDATE SKIP LOCKED` row leases and `LISTEN`/`NOTIFY`; SQLite gets
//! the same observable semantics from its serialized writer and an
//! in-process topic hub.

pub mod notify;

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "postgres")]
pub use postgres::PostgresStore;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

use capstan_core::config::EngineConfig;

/// Backend-independent connection options.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Database connection pool size. In-memory SQLite always uses a single
    /// connection regardless of this value.
    pub pool_size: u32,

    /// Heartbeats older than this many seconds mark an executor session as
    /// dead for liveness checks and the reaper.
    pub session_timeout_secs: u64,

    /// Identity stamped on audit-relevant writes, when the caller has one.
    pub acting_principal: Option<String>,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            pool_size: 10,
            session_timeout_secs: 10,
            acting_principal: None,
        }
    }
}

impl StoreOptions {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            pool_size: config.db_pool_size,
            session_timeout_secs: config.session_timeout_secs(),
            acting_principal: config.acting_principal.clone(),
        }
    }
}
