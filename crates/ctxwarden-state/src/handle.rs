//! SurrealDB connection handling
//!
//! Resolves an endpoint (explicit URL, cloud credentials from the
//! environment, or a local surrealkv directory), signs in when credentials
//! are present, selects namespace/database and runs the schema migrations.

use surrealdb::engine::any::Any;
use surrealdb::opt::auth::{Database, Root};
use surrealdb::Surreal;
use tracing::info;

use crate::error::StateError;
use crate::migrations;
use crate::Result;

/// Default local database location used when nothing else is configured
pub const DEFAULT_LOCAL_PATH: &str = ".ctxwarden/db";

/// Credentials for an authenticated SurrealDB endpoint
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    /// Whether this is a root user (true) or database user (false)
    pub is_root: bool,
}

/// Configuration for a SurrealDB connection
#[derive(Debug, Clone)]
pub struct SurrealConfig {
    /// Endpoint URL: `mem://`, `surrealkv://<path>`, `ws://…` or `wss://…`
    pub endpoint: String,
    /// Namespace (default: "ctxwarden")
    pub namespace: String,
    /// Database name (default: "main")
    pub database: String,
    pub credentials: Option<Credentials>,
}

impl SurrealConfig {
    /// Unauthenticated configuration for an endpoint URL
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            namespace: "ctxwarden".to_string(),
            database: "main".to_string(),
            credentials: None,
        }
    }

    /// In-process, non-persistent database
    pub fn in_memory() -> Self {
        Self::new("mem://")
    }

    /// Local on-disk database under `path`
    pub fn local(path: &str) -> Self {
        Self::new(format!("surrealkv://{path}"))
    }

    /// Set custom namespace
    pub fn with_namespace(mut self, ns: impl Into<String>) -> Self {
        self.namespace = ns.into();
        self
    }

    /// Set custom database
    pub fn with_database(mut self, db: impl Into<String>) -> Self {
        self.database = db.into();
        self
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
        is_root: bool,
    ) -> Self {
        self.credentials = Some(Credentials {
            username: username.into(),
            password: password.into(),
            is_root,
        });
        self
    }

    /// Create from environment variables
    ///
    /// Resolution order:
    /// 1. SURREALDB_ENDPOINT + SURREALDB_USERNAME + SURREALDB_PASSWORD
    ///    (optional SURREALDB_NAMESPACE, SURREALDB_DATABASE, SURREALDB_ROOT)
    /// 2. SURREALDB_URL (unauthenticated)
    /// 3. local surrealkv database at [`DEFAULT_LOCAL_PATH`]
    pub fn from_env() -> Self {
        let namespace =
            std::env::var("SURREALDB_NAMESPACE").unwrap_or_else(|_| "ctxwarden".to_string());
        let database = std::env::var("SURREALDB_DATABASE").unwrap_or_else(|_| "main".to_string());

        let cloud = (
            std::env::var("SURREALDB_ENDPOINT"),
            std::env::var("SURREALDB_USERNAME"),
            std::env::var("SURREALDB_PASSWORD"),
        );
        if let (Ok(endpoint), Ok(username), Ok(password)) = cloud {
            let is_root = std::env::var("SURREALDB_ROOT")
                .map(|v| v.eq_ignore_ascii_case("true"))
                .unwrap_or(false);
            return Self::new(endpoint)
                .with_namespace(namespace)
                .with_database(database)
                .with_credentials(username, password, is_root);
        }

        if let Ok(url) = std::env::var("SURREALDB_URL") {
            return Self::new(url)
                .with_namespace(namespace)
                .with_database(database);
        }

        Self::local(DEFAULT_LOCAL_PATH)
            .with_namespace(namespace)
            .with_database(database)
    }

    fn local_dir(&self) -> Option<&str> {
        self.endpoint.strip_prefix("surrealkv://")
    }
}

/// Open a connection described by `config` and initialise the schema.
pub async fn connect(config: &SurrealConfig) -> Result<Surreal<Any>> {
    if let Some(dir) = config.local_dir() {
        std::fs::create_dir_all(dir).map_err(|e| {
            StateError::Connection(format!("Failed to create database directory {dir}: {e}"))
        })?;
    }

    let db = surrealdb::engine::any::connect(config.endpoint.as_str())
        .await
        .map_err(|e| {
            StateError::Connection(format!("Failed to connect to {}: {e}", config.endpoint))
        })?;

    if let Some(creds) = &config.credentials {
        if creds.is_root {
            db.signin(Root {
                username: &creds.username,
                password: &creds.password,
            })
            .await
            .map_err(|e| StateError::Connection(format!("Root auth failed: {e}")))?;
        } else {
            db.signin(Database {
                namespace: &config.namespace,
                database: &config.database,
                username: &creds.username,
                password: &creds.password,
            })
            .await
            .map_err(|e| StateError::Connection(format!("DB auth failed: {e}")))?;
        }
    }

    db.use_ns(config.namespace.as_str())
        .use_db(config.database.as_str())
        .await
        .map_err(|e| StateError::Connection(e.to_string()))?;

    migrations::init_schema(&db).await?;
    info!(endpoint = %config.endpoint, "SurrealDB connected");
    Ok(db)
}
