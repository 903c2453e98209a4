//! Backend servers
//!
//! Server connections and the collaborators that act on them: establishing
//! the transport and resetting session state before reuse.

pub mod connect;
pub mod reset;
pub mod server;

pub use connect::StartupConnector;
pub use reset::DiscardAll;
pub use server::{ServerConnection, ServerStats, ServerStream, UNBOUNDED_READ_TIMEOUT};

use crate::error::Result;
use async_trait::async_trait;

/// Establishes the transport of a server connection
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BackendConnector: Send + Sync {
    /// Connect and authenticate `server` against its route's storage.
    ///
    /// `context` names the caller in log lines.
    async fn connect(&self, server: &mut ServerConnection, context: &str) -> Result<()>;
}

/// Resets the session state of a server connection
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SessionReset: Send + Sync {
    /// Discard temporary tables, settings and other session state
    async fn discard(&self, server: &mut ServerConnection) -> Result<()>;
}
