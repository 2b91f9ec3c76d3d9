//! Parley SDK configuration.
//!
//! Configuration is loaded from environment variables. The database URL is
//! redacted in Debug output.

use secrecy::SecretString;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Default window for acquiring an entity lock before `LockUnavailable`.
pub const DEFAULT_LOCK_WAIT_MS: u64 = 5_000;

/// Default grace period for a conversation handler to produce an immediate
/// reply before the sender is parked.
pub const DEFAULT_SYNC_REPLY_GRACE_MS: u64 = 100;

/// Default event dispatch queue capacity.
pub const DEFAULT_EVENT_QUEUE_CAPACITY: usize = 1_024;

/// Default maximum connections for the SDK-owned Postgres pool.
pub const DEFAULT_MAX_DB_CONNECTIONS: u32 = 10;

/// Default SDK instance id prefix.
pub const DEFAULT_INSTANCE_ID_PREFIX: &str = "parley";

/// SDK configuration.
///
/// Loaded from environment variables with sensible defaults.
#[derive(Clone)]
pub struct Config {
    /// Postgres connection URL. Required only when the SDK owns its pool
    /// (`Parley::connect`); instances built over injected backends may omit
    /// it. Protected to prevent accidental logging.
    pub database_url: Option<SecretString>,

    /// Unique identifier for this SDK instance, used in logs.
    pub instance_id: String,

    /// Window for acquiring an entity lock, in milliseconds.
    pub lock_wait_ms: u64,

    /// Synchronous-reply grace period, in milliseconds.
    pub sync_reply_grace_ms: u64,

    /// Event dispatch queue capacity.
    pub event_queue_capacity: usize,

    /// Maximum connections for the SDK-owned Postgres pool.
    pub max_db_connections: u32,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field(
                "database_url",
                &self.database_url.as_ref().map(|_| "[REDACTED]"),
            )
            .field("instance_id", &self.instance_id)
            .field("lock_wait_ms", &self.lock_wait_ms)
            .field("sync_reply_grace_ms", &self.sync_reply_grace_ms)
            .field("event_queue_capacity", &self.event_queue_capacity)
            .field("max_db_connections", &self.max_db_connections)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let database_url = vars
            .get("PARLEY_DATABASE_URL")
            .or_else(|| vars.get("DATABASE_URL"))
            .cloned()
            .map(SecretString::from);

        let lock_wait_ms = vars
            .get("PARLEY_LOCK_WAIT_MS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_LOCK_WAIT_MS);

        let sync_reply_grace_ms = vars
            .get("PARLEY_SYNC_REPLY_GRACE_MS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_SYNC_REPLY_GRACE_MS);

        let event_queue_capacity = vars
            .get("PARLEY_EVENT_QUEUE_CAPACITY")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_EVENT_QUEUE_CAPACITY);

        let max_db_connections = vars
            .get("PARLEY_MAX_DB_CONNECTIONS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_MAX_DB_CONNECTIONS);

        if event_queue_capacity == 0 {
            return Err(ConfigError::InvalidValue(
                "PARLEY_EVENT_QUEUE_CAPACITY must be non-zero".to_string(),
            ));
        }

        // Generate an instance id when not supplied
        let instance_id = vars.get("PARLEY_INSTANCE_ID").cloned().unwrap_or_else(|| {
            let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
            let uuid_suffix = uuid::Uuid::new_v4().to_string();
            let short_suffix = uuid_suffix.get(..8).unwrap_or("00000000");
            format!("{DEFAULT_INSTANCE_ID_PREFIX}-{hostname}-{short_suffix}")
        });

        Ok(Config {
            database_url,
            instance_id,
            lock_wait_ms,
            sync_reply_grace_ms,
            event_queue_capacity,
            max_db_connections,
        })
    }

    /// Lock acquisition window as a [`Duration`].
    pub fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock_wait_ms)
    }

    /// Synchronous-reply grace period as a [`Duration`].
    pub fn sync_reply_grace(&self) -> Duration {
        Duration::from_millis(self.sync_reply_grace_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            instance_id: format!(
                "{DEFAULT_INSTANCE_ID_PREFIX}-{}",
                uuid::Uuid::new_v4().simple()
            ),
            lock_wait_ms: DEFAULT_LOCK_WAIT_MS,
            sync_reply_grace_ms: DEFAULT_SYNC_REPLY_GRACE_MS,
            event_queue_capacity: DEFAULT_EVENT_QUEUE_CAPACITY,
            max_db_connections: DEFAULT_MAX_DB_CONNECTIONS,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    #[test]
    fn test_from_vars_defaults() {
        let config = Config::from_vars(&HashMap::new()).expect("config should load");

        assert!(config.database_url.is_none());
        assert_eq!(config.lock_wait_ms, DEFAULT_LOCK_WAIT_MS);
        assert_eq!(config.sync_reply_grace_ms, DEFAULT_SYNC_REPLY_GRACE_MS);
        assert_eq!(config.event_queue_capacity, DEFAULT_EVENT_QUEUE_CAPACITY);
        assert_eq!(config.max_db_connections, DEFAULT_MAX_DB_CONNECTIONS);
        assert!(config.instance_id.starts_with("parley-"));
    }

    #[test]
    fn test_from_vars_custom_values() {
        let vars = HashMap::from([
            (
                "PARLEY_DATABASE_URL".to_string(),
                "postgres://localhost/parley".to_string(),
            ),
            ("PARLEY_INSTANCE_ID".to_string(), "parley-test-01".to_string()),
            ("PARLEY_LOCK_WAIT_MS".to_string(), "250".to_string()),
            ("PARLEY_SYNC_REPLY_GRACE_MS".to_string(), "50".to_string()),
            ("PARLEY_EVENT_QUEUE_CAPACITY".to_string(), "64".to_string()),
            ("PARLEY_MAX_DB_CONNECTIONS".to_string(), "4".to_string()),
        ]);

        let config = Config::from_vars(&vars).expect("config should load");

        assert_eq!(
            config.database_url.as_ref().unwrap().expose_secret(),
            "postgres://localhost/parley"
        );
        assert_eq!(config.instance_id, "parley-test-01");
        assert_eq!(config.lock_wait(), Duration::from_millis(250));
        assert_eq!(config.sync_reply_grace(), Duration::from_millis(50));
        assert_eq!(config.event_queue_capacity, 64);
        assert_eq!(config.max_db_connections, 4);
    }

    #[test]
    fn test_database_url_fallback_var() {
        let vars = HashMap::from([(
            "DATABASE_URL".to_string(),
            "postgres://db.internal/parley".to_string(),
        )]);

        let config = Config::from_vars(&vars).expect("config should load");
        assert_eq!(
            config.database_url.unwrap().expose_secret(),
            "postgres://db.internal/parley"
        );
    }

    #[test]
    fn test_zero_queue_capacity_rejected() {
        let vars = HashMap::from([("PARLEY_EVENT_QUEUE_CAPACITY".to_string(), "0".to_string())]);

        let result = Config::from_vars(&vars);
        assert!(matches!(result, Err(ConfigError::InvalidValue(_))));
    }

    #[test]
    fn test_debug_redacts_database_url() {
        let vars = HashMap::from([(
            "PARLEY_DATABASE_URL".to_string(),
            "postgres://user:hunter2@db/parley".to_string(),
        )]);

        let config = Config::from_vars(&vars).expect("config should load");
        let debug_output = format!("{config:?}");

        assert!(debug_output.contains("[REDACTED]"));
        assert!(!debug_output.contains("hunter2"));
    }
}
