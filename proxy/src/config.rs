//! Configuration for the pooler
//!
//! Settings are read from a TOML file and overridden by `PGPOOLER_`-prefixed
//! environment variables, e.g. `PGPOOLER_CONNECT_TIMEOUT_MS=2000`.

use crate::error::{ProxyError, Result};
use pgpooler_core::{RouteConfig, StorageConfig};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Environment variable prefix
pub const ENV_PREFIX: &str = "PGPOOLER";

fn default_log_level() -> String {
    "info".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

/// Pooler configuration
#[derive(Debug, Clone, Deserialize)]
pub struct PoolerConfig {
    /// Log filter used when `RUST_LOG` is not set
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Timeout for connecting to a backend and for each startup message
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Configured routes
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

impl Default for PoolerConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            connect_timeout_ms: default_connect_timeout_ms(),
            routes: Vec::new(),
        }
    }
}

impl PoolerConfig {
    /// Create a configuration with default settings and no routes
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a file, with environment overrides
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config: Self = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.connect_timeout_ms == 0 {
            return Err(ProxyError::Config(
                "connect_timeout_ms must be greater than zero".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for route in &self.routes {
            route.validate()?;

            if !seen.insert((route.database.as_str(), route.user.as_str())) {
                return Err(ProxyError::Config(format!(
                    "duplicate route {}.{}",
                    route.database, route.user
                )));
            }
        }

        Ok(())
    }

    /// Connect timeout
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Route matching a client database and user
    pub fn find_route(&self, database: &str, user: &str) -> Option<&RouteConfig> {
        self.routes
            .iter()
            .find(|route| route.database == database && route.user == user)
    }

    /// Configuration with one local route, for tests
    pub fn for_testing() -> Self {
        let storage = StorageConfig {
            host: "127.0.0.1".to_string(),
            port: 5432,
            database: None,
            user: None,
            password: None,
        };

        Self {
            log_level: "debug".to_string(),
            connect_timeout_ms: 1000,
            routes: vec![RouteConfig::new("postgres", "postgres", storage)],
        }
    }
}
