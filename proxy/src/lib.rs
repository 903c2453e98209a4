//! pgpooler proxy
//!
//! Server connections, routing and the auth query of the pgpooler PostgreSQL
//! connection pooler.

// Error types and result
pub mod error;
pub use error::{ProxyError, Result};

// Configuration
pub mod config;
pub use config::PoolerConfig;

// Wire protocol framing and parsing
pub mod protocol;
pub use protocol::{BackendMessage, MessageCodec, TransactionStatus};

// Backend connections
pub mod backend;
pub use backend::{
    BackendConnector, DiscardAll, ServerConnection, SessionReset, StartupConnector,
};

// Internal clients and routing
pub mod client;
pub use client::InternalClient;

pub mod router;
pub use router::{PoolRouter, Route, RouteKey, Router};

// Auth query
pub mod auth_query;
pub use auth_query::{AuthQuery, AuthQueryError, AuthQueryStage, PasswordResult};

#[cfg(test)]
pub(crate) mod testing;
