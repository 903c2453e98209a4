//! Session reset of pooled server connections

use crate::backend::{ServerConnection, SessionReset, UNBOUNDED_READ_TIMEOUT};
use crate::error::{ProxyError, Result};
use crate::protocol::message::tag;
use crate::protocol::MessageFormatter;
use async_trait::async_trait;
use log::debug;
use std::time::Duration;

const DISCARD_QUERY: &str = "DISCARD ALL";

/// Runs `DISCARD ALL` and waits for the backend to become ready again
#[derive(Debug, Clone)]
pub struct DiscardAll {
    timeout: Duration,
    formatter: MessageFormatter,
}

impl DiscardAll {
    /// Create a reset with the given per-message read timeout
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            formatter: MessageFormatter::new(),
        }
    }
}

impl Default for DiscardAll {
    fn default() -> Self {
        Self::new(UNBOUNDED_READ_TIMEOUT)
    }
}

#[async_trait]
impl SessionReset for DiscardAll {
    async fn discard(&self, server: &mut ServerConnection) -> Result<()> {
        debug!("server {}: discard", server.id());

        server.reset_stream();
        self.formatter.write_query(server.stream_mut(), DISCARD_QUERY)?;
        server.write().await?;
        server.sync_request();
        server.stat_request();

        // errors are reported once the backend is ready again
        let mut failure: Option<ProxyError> = None;
        loop {
            let message = server.read_message(self.timeout).await?;

            match message.first().copied() {
                Some(tag::ERROR_RESPONSE) => {
                    let fields = server.backend_error("discard", &message);
                    if failure.is_none() {
                        failure = Some(ProxyError::server_reported(&fields));
                    }
                }
                Some(tag::READY_FOR_QUERY) => {
                    server.backend_ready("discard", &message);
                    break;
                }
                _ => {}
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
