//! Client routing
//!
//! A router resolves a client to a configured route and lends it server
//! connections from that route's pool. The lending protocol moves the
//! `ServerConnection` out of the router on `attach` and back on
//! `detach_and_unroute` or `close_and_unroute`.

pub mod pool;

pub use pool::{PoolRouter, PoolStats};

use crate::backend::ServerConnection;
use crate::client::InternalClient;
use crate::error::Result;
use async_trait::async_trait;
use pgpooler_core::RouteConfig;
use std::fmt;
use std::sync::Arc;

/// Key a route is matched by
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RouteKey {
    /// Client database
    pub database: String,
    /// Client user
    pub user: String,
}

impl RouteKey {
    /// Create a key
    pub fn new(database: &str, user: &str) -> Self {
        Self {
            database: database.to_string(),
            user: user.to_string(),
        }
    }
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.user)
    }
}

/// Resolved route
#[derive(Debug, Clone)]
pub struct Route {
    key: RouteKey,
    config: Arc<RouteConfig>,
}

impl Route {
    /// Create a route from its configuration
    pub fn new(config: Arc<RouteConfig>) -> Self {
        Self {
            key: RouteKey::new(&config.database, &config.user),
            config,
        }
    }

    /// Route key
    pub fn key(&self) -> &RouteKey {
        &self.key
    }

    /// Route configuration
    pub fn config(&self) -> &Arc<RouteConfig> {
        &self.config
    }

    /// Whether session state is discarded before a connection is used
    pub fn pool_discard(&self) -> bool {
        self.config.pool_discard
    }
}

/// Route resolution and server connection lending
#[async_trait]
pub trait Router: Send + Sync {
    /// Resolve the client to a route and record it on the client
    async fn route(&self, client: &mut InternalClient) -> Result<()>;

    /// Lend a server connection of the client's route
    async fn attach(&self, client: &mut InternalClient) -> Result<ServerConnection>;

    /// Return a healthy connection to the pool and release the route
    async fn detach_and_unroute(&self, client: &mut InternalClient, server: ServerConnection);

    /// Release the route of a client holding no connection
    async fn unroute(&self, client: &mut InternalClient);

    /// Close a connection that cannot be reused and release the route
    async fn close_and_unroute(&self, client: &mut InternalClient, server: ServerConnection);
}
