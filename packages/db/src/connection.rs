//! Database connection management for the trigger store backends.

use surrealdb::Surreal;
use surrealdb::engine::any::{Any, connect};
use surrealdb::opt::auth::Root;
use thiserror::Error;

/// Database connection wrapper.
pub type Database = Surreal<Any>;

/// Storage engine behind the trigger store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backend {
    /// In-process memory engine; nothing survives a restart.
    Memory,
    /// Embedded RocksDB (requires the `rocksdb` feature).
    RocksDb { path: String },
    /// Embedded SurrealKV (requires the `surrealkv` feature).
    SurrealKv { path: String },
    /// A remote server over websocket (requires the `remote` feature).
    Remote { url: String },
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Memory => "memory",
            Backend::RocksDb { .. } => "rocksdb",
            Backend::SurrealKv { .. } => "surrealkv",
            Backend::Remote { .. } => "remote",
        }
    }

    /// Endpoint understood by the `any` engine.
    pub fn endpoint(&self) -> String {
        match self {
            Backend::Memory => "mem://".to_string(),
            Backend::RocksDb { path } => format!("rocksdb://{path}"),
            Backend::SurrealKv { path } => format!("surrealkv://{path}"),
            Backend::Remote { url } => url.clone(),
        }
    }

    /// Parse a connection string such as `mem://`, `rocksdb://data/sched`
    /// or `ws://localhost:8000`.
    pub fn from_connection_string(s: &str) -> Result<Self, DbError> {
        let s = s.trim();
        if s == "mem://" || s == "memory" {
            return Ok(Backend::Memory);
        }
        if let Some(path) = s.strip_prefix("rocksdb://") {
            return non_empty_path(path).map(|path| Backend::RocksDb { path });
        }
        if let Some(path) = s.strip_prefix("surrealkv://") {
            return non_empty_path(path).map(|path| Backend::SurrealKv { path });
        }
        if ["ws://", "wss://"].iter().any(|p| s.starts_with(p)) {
            return Ok(Backend::Remote { url: s.to_string() });
        }
        Err(DbError::InvalidConfig(format!(
            "unsupported connection string '{s}' (expected mem://, rocksdb://, surrealkv:// or ws://)"
        )))
    }
}

fn non_empty_path(path: &str) -> Result<String, DbError> {
    let path = path.trim();
    if path.is_empty() {
        Err(DbError::InvalidConfig("database path must not be empty".into()))
    } else {
        Ok(path.to_string())
    }
}

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub backend: Backend,
    /// Namespace to use
    pub namespace: String,
    /// Database name to use
    pub database: String,
    /// Optional root credentials for authentication
    pub credentials: Option<(String, String)>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Memory,
            namespace: "scheduler".to_string(),
            database: "main".to_string(),
            credentials: None,
        }
    }
}

impl StoreConfig {
    /// Create a config for in-memory testing.
    pub fn memory() -> Self {
        Self::default()
    }

    /// Create a config for RocksDB persistence (requires rocksdb feature).
    pub fn rocksdb(path: impl Into<String>) -> Self {
        Self {
            backend: Backend::RocksDb { path: path.into() },
            ..Default::default()
        }
    }

    /// Create a config for SurrealKV persistence (requires surrealkv feature).
    pub fn surrealkv(path: impl Into<String>) -> Self {
        Self {
            backend: Backend::SurrealKv { path: path.into() },
            ..Default::default()
        }
    }

    /// Create a config for a remote server (requires remote feature).
    pub fn remote(url: impl Into<String>) -> Self {
        Self {
            backend: Backend::Remote { url: url.into() },
            ..Default::default()
        }
    }

    /// Set the namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Set the database name.
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    /// Set root credentials for authentication.
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.credentials = Some((username.into(), password.into()));
        self
    }

    /// Build a config from environment variables.
    ///
    /// Selection rules:
    /// - If `SCHEDULER_DB_CONNECTION` is set: parse it as a connection string
    /// - Else if `SCHEDULER_DB_BACKEND` is set: use it (`memory`, `rocksdb`, `surrealkv`, `remote`)
    /// - Otherwise: default to memory
    ///
    /// Backend env vars:
    /// - `SCHEDULER_DB_PATH` (rocksdb/surrealkv, default: `./data/scheduler`)
    /// - `SCHEDULER_DB_URL` (remote, required)
    ///
    /// Common:
    /// - `SCHEDULER_DB_NAMESPACE`, `SCHEDULER_DB_DATABASE`
    /// - `SCHEDULER_DB_USER` and `SCHEDULER_DB_PASS` (optional root credentials)
    pub fn from_env() -> Result<Self, DbError> {
        let path = || {
            env_non_empty("SCHEDULER_DB_PATH").unwrap_or_else(|| "./data/scheduler".to_string())
        };

        let backend = if let Some(conn) = env_non_empty("SCHEDULER_DB_CONNECTION") {
            Backend::from_connection_string(&conn)?
        } else {
            match env_non_empty("SCHEDULER_DB_BACKEND").as_deref() {
                None | Some("memory") | Some("mem") => Backend::Memory,
                Some("rocksdb") => Backend::RocksDb { path: path() },
                Some("surrealkv") => Backend::SurrealKv { path: path() },
                Some("remote") => Backend::Remote {
                    url: env_non_empty("SCHEDULER_DB_URL").ok_or_else(|| {
                        DbError::InvalidConfig(
                            "SCHEDULER_DB_URL is required for remote backend".into(),
                        )
                    })?,
                },
                Some(other) => {
                    return Err(DbError::InvalidConfig(format!(
                        "unsupported SCHEDULER_DB_BACKEND={other} (expected memory|rocksdb|surrealkv|remote)"
                    )));
                }
            }
        };

        let mut cfg = Self {
            backend,
            ..Default::default()
        };
        if let Some(ns) = env_non_empty("SCHEDULER_DB_NAMESPACE") {
            cfg.namespace = ns;
        }
        if let Some(database) = env_non_empty("SCHEDULER_DB_DATABASE") {
            cfg.database = database;
        }
        if let (Some(user), Some(pass)) = (
            env_non_empty("SCHEDULER_DB_USER"),
            env_non_empty("SCHEDULER_DB_PASS"),
        ) {
            cfg.credentials = Some((user, pass));
        }
        Ok(cfg)
    }
}

fn env_non_empty(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Database errors.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("Connection error: {0}")]
    Connection(#[from] surrealdb::Error),
    #[error("Query error: {0}")]
    Query(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Invalid trigger: {0}")]
    Trigger(#[from] sched_core::TriggerError),
    #[error("Timed out waiting for lock '{0}'")]
    LockTimeout(String),
}

impl DbError {
    /// Whether retrying the operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, DbError::Connection(_) | DbError::LockTimeout(_))
    }
}

impl From<serde_json::Error> for DbError {
    fn from(e: serde_json::Error) -> Self {
        DbError::Serialization(e.to_string())
    }
}

/// Open a connection for the given configuration.
pub async fn connect_db(config: &StoreConfig) -> Result<Database, DbError> {
    let endpoint = config.backend.endpoint();
    tracing::info!("Connecting to {} store: {}", config.backend.as_str(), endpoint);

    let db = connect(&endpoint).await?;

    // Authenticate if credentials provided
    if let Some((username, password)) = &config.credentials {
        db.signin(Root { username, password }).await?;
    }

    // Select namespace and database
    db.use_ns(&config.namespace)
        .use_db(&config.database)
        .await?;

    tracing::info!(
        "Connected to store: {}/{}",
        config.namespace,
        config.database
    );

    Ok(db)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_connection_strings() {
        assert_eq!(
            Backend::from_connection_string("mem://").ok(),
            Some(Backend::Memory)
        );
        assert_eq!(
            Backend::from_connection_string("rocksdb://data/q").ok(),
            Some(Backend::RocksDb {
                path: "data/q".into()
            })
        );
        assert_eq!(
            Backend::from_connection_string("surrealkv://kv").ok(),
            Some(Backend::SurrealKv { path: "kv".into() })
        );
        assert_eq!(
            Backend::from_connection_string("ws://localhost:8000").ok(),
            Some(Backend::Remote {
                url: "ws://localhost:8000".into()
            })
        );
        assert!(Backend::from_connection_string("rocksdb://").is_err());
        assert!(Backend::from_connection_string("postgres://x").is_err());
    }
}
