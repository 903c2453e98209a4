//! In-memory pool router

use crate::backend::ServerConnection;
use crate::client::InternalClient;
use crate::error::{ProxyError, Result};
use crate::router::{Route, RouteKey, Router};
use async_trait::async_trait;
use log::{debug, warn};
use pgpooler_core::{IdGenerator, RouteConfig};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Pool occupancy of one route
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Connections waiting in the pool
    pub idle: usize,
    /// Connections lent to clients
    pub active: usize,
    /// Clients currently routed
    pub clients: usize,
}

#[derive(Default)]
struct RoutePool {
    idle: Vec<ServerConnection>,
    active: usize,
    clients: usize,
}

impl RoutePool {
    fn stats(&self) -> PoolStats {
        PoolStats {
            idle: self.idle.len(),
            active: self.active,
            clients: self.clients,
        }
    }
}

/// Router over a fixed set of configured routes
pub struct PoolRouter {
    routes: HashMap<RouteKey, Arc<RouteConfig>>,
    ids: Arc<IdGenerator>,
    pools: Mutex<HashMap<RouteKey, RoutePool>>,
}

impl PoolRouter {
    /// Create a router; route keys must be unique
    pub fn new(configs: &[RouteConfig], ids: Arc<IdGenerator>) -> Result<Self> {
        let mut routes = HashMap::new();

        for config in configs {
            config.validate()?;

            let key = RouteKey::new(&config.database, &config.user);
            if routes.contains_key(&key) {
                return Err(ProxyError::Config(format!("duplicate route {}", key)));
            }
            routes.insert(key, Arc::new(config.clone()));
        }

        Ok(Self {
            routes,
            ids,
            pools: Mutex::new(HashMap::new()),
        })
    }

    /// Pool occupancy of a route
    pub async fn stats(&self, key: &RouteKey) -> Option<PoolStats> {
        if !self.routes.contains_key(key) {
            return None;
        }
        let pools = self.pools.lock().await;
        Some(pools.get(key).map(RoutePool::stats).unwrap_or_default())
    }

    async fn release_client(&self, client: &mut InternalClient) {
        if let Some(route) = client.take_route() {
            let mut pools = self.pools.lock().await;
            let pool = pools.entry(route.key().clone()).or_default();
            pool.clients = pool.clients.saturating_sub(1);
            debug!("router: client {} unrouted from {}", client.id(), route.key());
        }
    }
}

#[async_trait]
impl Router for PoolRouter {
    async fn route(&self, client: &mut InternalClient) -> Result<()> {
        let key = RouteKey::new(client.database(), client.user());
        let config = self
            .routes
            .get(&key)
            .ok_or_else(|| ProxyError::Routing(format!("no route for {}", key)))?;

        let route = Route::new(config.clone());
        {
            let mut pools = self.pools.lock().await;
            pools.entry(key).or_default().clients += 1;
        }

        debug!("router: client {} routed to {}", client.id(), route.key());
        client.set_route(route);
        Ok(())
    }

    async fn attach(&self, client: &mut InternalClient) -> Result<ServerConnection> {
        let route = client
            .route()
            .cloned()
            .ok_or_else(|| ProxyError::Attachment(format!("client {} is not routed", client.id())))?;

        let mut pools = self.pools.lock().await;
        let pool = pools.entry(route.key().clone()).or_default();

        if let Some(server) = pool.idle.pop() {
            pool.active += 1;
            debug!("router: client {} attached to pooled server {}", client.id(), server.id());
            return Ok(server);
        }

        let pool_size = route.config().pool_size;
        if pool.active >= pool_size {
            return Err(ProxyError::Attachment(format!(
                "pool of {} is exhausted ({} connections)",
                route.key(),
                pool_size
            )));
        }

        pool.active += 1;
        let server = ServerConnection::new(self.ids.generate("s"), route);
        debug!("router: client {} attached to new server {}", client.id(), server.id());
        Ok(server)
    }

    async fn detach_and_unroute(&self, client: &mut InternalClient, server: ServerConnection) {
        let unusable = {
            let mut pools = self.pools.lock().await;
            let pool = pools.entry(server.route().key().clone()).or_default();
            pool.active = pool.active.saturating_sub(1);

            if server.is_connected() && server.is_synchronized() {
                debug!("router: server {} returned to the pool", server.id());
                pool.idle.push(server);
                None
            } else {
                Some(server)
            }
        };

        if let Some(server) = unusable {
            warn!("router: server {} is not reusable, closing", server.id());
            server.close().await;
        }
        self.release_client(client).await;
    }

    async fn unroute(&self, client: &mut InternalClient) {
        self.release_client(client).await;
    }

    async fn close_and_unroute(&self, client: &mut InternalClient, server: ServerConnection) {
        {
            let mut pools = self.pools.lock().await;
            let pool = pools.entry(server.route().key().clone()).or_default();
            pool.active = pool.active.saturating_sub(1);
        }

        let stats = server.stats();
        debug!(
            "router: closing server {} after {} requests, {} writes, {} messages",
            server.id(),
            stats.requests,
            stats.writes,
            stats.messages_received
        );
        server.close().await;
        self.release_client(client).await;
    }
}
