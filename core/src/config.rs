//! Route configuration
//!
//! A route binds a client `(database, user)` pair to a backend storage and a
//! pool policy. Routes may also carry the settings of the auth query used to
//! look up client passwords on a backend.

use crate::error::{CoreError, Result};
use log::warn;
use serde::{Deserialize, Serialize};

/// Default PostgreSQL port
pub const DEFAULT_PORT: u16 = 5432;

/// Default number of server connections per route
pub const DEFAULT_POOL_SIZE: usize = 10;

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_pool_size() -> usize {
    DEFAULT_POOL_SIZE
}

/// Backend storage a route connects to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Backend host name or address
    pub host: String,

    /// Backend port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Database to connect to; defaults to the route database
    #[serde(default)]
    pub database: Option<String>,

    /// User to connect as; defaults to the route user
    #[serde(default)]
    pub user: Option<String>,

    /// Password for cleartext or MD5 backend authentication
    #[serde(default)]
    pub password: Option<String>,
}

impl StorageConfig {
    /// Address in `host:port` form
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Route configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteConfig {
    /// Client database name this route matches
    pub database: String,

    /// Client user name this route matches
    pub user: String,

    /// Backend storage
    pub storage: StorageConfig,

    /// Maximum number of server connections
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Discard session state before a pooled connection is reused
    #[serde(default)]
    pub pool_discard: bool,

    /// Query returning `(user, password)` for the authenticating user
    #[serde(default)]
    pub auth_query: Option<String>,

    /// Database the auth query runs in
    #[serde(default)]
    pub auth_query_db: Option<String>,

    /// User the auth query runs as
    #[serde(default)]
    pub auth_query_user: Option<String>,
}

impl RouteConfig {
    /// Create a route with default pool settings and no auth query
    pub fn new(database: &str, user: &str, storage: StorageConfig) -> Self {
        Self {
            database: database.to_string(),
            user: user.to_string(),
            storage,
            pool_size: DEFAULT_POOL_SIZE,
            pool_discard: false,
            auth_query: None,
            auth_query_db: None,
            auth_query_user: None,
        }
    }

    /// Database used on the backend
    pub fn storage_database(&self) -> &str {
        self.storage.database.as_deref().unwrap_or(&self.database)
    }

    /// User used on the backend
    pub fn storage_user(&self) -> &str {
        self.storage.user.as_deref().unwrap_or(&self.user)
    }

    /// Auth query settings, if the route has a complete auth query configured
    pub fn auth_query_spec(&self) -> Option<AuthQuerySpec> {
        let query = self.auth_query.as_ref()?;

        match (&self.auth_query_db, &self.auth_query_user) {
            (Some(database), Some(user)) => Some(AuthQuerySpec {
                query: query.clone(),
                database: database.clone(),
                user: user.clone(),
            }),
            _ => {
                warn!(
                    "route {}.{}: auth_query requires auth_query_db and auth_query_user",
                    self.database, self.user
                );
                None
            }
        }
    }

    /// Validate the route
    pub fn validate(&self) -> Result<()> {
        if self.database.is_empty() || self.user.is_empty() {
            return Err(CoreError::ConfigError(
                "route database and user must not be empty".to_string(),
            ));
        }

        if self.storage.host.is_empty() {
            return Err(CoreError::ConfigError(format!(
                "route {}.{}: storage host is not set",
                self.database, self.user
            )));
        }

        if self.pool_size == 0 {
            return Err(CoreError::ConfigError(format!(
                "route {}.{}: pool_size must be greater than zero",
                self.database, self.user
            )));
        }

        if self.auth_query.is_some()
            && (self.auth_query_db.is_none() || self.auth_query_user.is_none())
        {
            return Err(CoreError::ConfigError(format!(
                "route {}.{}: auth_query requires auth_query_db and auth_query_user",
                self.database, self.user
            )));
        }

        Ok(())
    }
}

/// Settings of one auth query execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthQuerySpec {
    /// Query text; must select exactly two columns, user and password
    pub query: String,

    /// Database the internal client routes to
    pub database: String,

    /// User the internal client routes as
    pub user: String,
}
