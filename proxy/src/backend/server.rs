//! Server connections
//!
//! A `ServerConnection` is one pooled backend connection. It owns the framed
//! transport (absent until the connection is established), the buffer of the
//! next outgoing request and the synchronization bookkeeping the pool relies
//! on to decide whether the connection can be reused.

use crate::error::{to_transport_error, ProxyError, Result};
use crate::protocol::{ErrorOrNoticeFields, MessageCodec, MessageFormatter, MessageParser, TransactionStatus};
use crate::router::Route;
use bytes::BytesMut;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, warn};
use pgpooler_core::Id;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;
use tokio_util::codec::Framed;

/// Per-message read timeout that in practice never expires
pub const UNBOUNDED_READ_TIMEOUT: Duration = Duration::from_millis(u32::MAX as u64);

/// Byte stream a server connection runs over
pub trait ServerStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> ServerStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

type ServerIo = Framed<Box<dyn ServerStream>, MessageCodec>;

/// Server connection statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    /// Number of requests issued
    pub requests: u64,

    /// Number of messages received
    pub messages_received: u64,

    /// Number of write operations
    pub writes: u64,
}

/// Pooled backend connection
pub struct ServerConnection {
    id: Id,
    route: Route,
    io: Option<ServerIo>,
    stream: BytesMut,
    stats: ServerStats,
    sync_request: u64,
    sync_reply: u64,
    transaction_status: TransactionStatus,
    parameters: HashMap<String, String>,
    backend_key: Option<(i32, i32)>,
    parser: MessageParser,
}

impl fmt::Debug for ServerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConnection")
            .field("id", &self.id.to_string())
            .field("route", self.route.key())
            .field("connected", &self.io.is_some())
            .field("stats", &self.stats)
            .field("sync_request", &self.sync_request)
            .field("sync_reply", &self.sync_reply)
            .field("transaction_status", &self.transaction_status)
            .finish()
    }
}

impl ServerConnection {
    /// Create a server connection for a route, without a transport yet
    pub fn new(id: Id, route: Route) -> Self {
        Self {
            id,
            route,
            io: None,
            stream: BytesMut::with_capacity(8192),
            stats: ServerStats::default(),
            sync_request: 0,
            sync_reply: 0,
            transaction_status: TransactionStatus::Idle,
            parameters: HashMap::new(),
            backend_key: None,
            parser: MessageParser::new(),
        }
    }

    /// Server identifier
    pub fn id(&self) -> &Id {
        &self.id
    }

    /// Route the connection belongs to
    pub fn route(&self) -> &Route {
        &self.route
    }

    /// Whether the connection has a live transport
    pub fn is_connected(&self) -> bool {
        self.io.is_some()
    }

    /// Install the transport of the connection
    pub fn attach_stream<S>(&mut self, stream: S)
    where
        S: ServerStream + 'static,
    {
        let stream: Box<dyn ServerStream> = Box::new(stream);
        self.io = Some(Framed::new(stream, MessageCodec::default()));
    }

    /// Outgoing request buffer
    pub fn stream_mut(&mut self) -> &mut BytesMut {
        &mut self.stream
    }

    /// Clear the outgoing request buffer
    pub fn reset_stream(&mut self) {
        self.stream.clear();
    }

    /// Write the outgoing request buffer to the backend
    pub async fn write(&mut self) -> Result<()> {
        let io = self
            .io
            .as_mut()
            .ok_or_else(|| ProxyError::Transport("server is not connected".to_string()))?;

        let request = self.stream.split().freeze();
        io.send(request).await.map_err(|e| match e {
            ProxyError::Io(e) => to_transport_error(e),
            other => other,
        })?;

        self.stats.writes += 1;
        Ok(())
    }

    /// Read the next complete backend message.
    ///
    /// The returned buffer starts with the message tag.
    pub async fn read_message(&mut self, wait: Duration) -> Result<BytesMut> {
        let io = self
            .io
            .as_mut()
            .ok_or_else(|| ProxyError::Transport("server is not connected".to_string()))?;

        match timeout(wait, io.next()).await {
            Err(_) => Err(ProxyError::Timeout(wait)),
            Ok(None) => Err(ProxyError::Transport(
                "server closed the connection".to_string(),
            )),
            Ok(Some(Err(ProxyError::Io(e)))) => Err(to_transport_error(e)),
            Ok(Some(Err(e))) => Err(e),
            Ok(Some(Ok(message))) => {
                self.stats.messages_received += 1;
                Ok(message)
            }
        }
    }

    /// Record that a request expecting a ReadyForQuery was sent
    pub fn sync_request(&mut self) {
        self.sync_request += 1;
    }

    /// Record a request in the statistics
    pub fn stat_request(&mut self) {
        self.stats.requests += 1;
    }

    /// Whether every request has been answered with ReadyForQuery
    pub fn is_synchronized(&self) -> bool {
        self.sync_request == self.sync_reply
    }

    /// Apply a ReadyForQuery message to the sync state
    pub fn backend_ready(&mut self, context: &str, message: &[u8]) {
        self.sync_reply += 1;

        match self.parser.parse_ready_for_query(message) {
            Ok(status) => self.transaction_status = status,
            Err(e) => warn!("{}: server {}: {}", context, self.id, e),
        }
    }

    /// Decode and log an ErrorResponse message
    pub fn backend_error(&self, context: &str, message: &[u8]) -> ErrorOrNoticeFields {
        match self.parser.parse_error_fields(message) {
            Ok(fields) => {
                error!(
                    "{}: server {}: error response from server: {} {} - {}{}",
                    context,
                    self.id,
                    fields.severity.as_deref().unwrap_or("ERROR"),
                    fields.code.as_deref().unwrap_or(""),
                    fields.message.as_deref().unwrap_or(""),
                    fields
                        .detail
                        .as_deref()
                        .map(|detail| format!(" ({})", detail))
                        .unwrap_or_default(),
                );
                fields
            }
            Err(e) => {
                error!("{}: server {}: failed to decode error response: {}", context, self.id, e);
                ErrorOrNoticeFields::default()
            }
        }
    }

    /// Transaction status reported by the last ReadyForQuery
    pub fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }

    /// Connection statistics
    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    /// Record a ParameterStatus reported by the backend
    pub fn set_parameter(&mut self, name: String, value: String) {
        self.parameters.insert(name, value);
    }

    /// Parameter reported by the backend
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }

    /// Record the BackendKeyData of the connection
    pub fn set_backend_key(&mut self, process_id: i32, secret_key: i32) {
        self.backend_key = Some((process_id, secret_key));
    }

    /// Backend process id and cancel key
    pub fn backend_key(&self) -> Option<(i32, i32)> {
        self.backend_key
    }

    /// Close the connection, telling the backend when possible
    pub async fn close(mut self) {
        if let Some(mut io) = self.io.take() {
            let mut terminate = BytesMut::new();
            MessageFormatter::new().write_terminate(&mut terminate);

            if let Err(e) = io.send(terminate.freeze()).await {
                debug!("server {}: terminate failed: {}", self.id, e);
            }
            if let Err(e) = io.close().await {
                debug!("server {}: close failed: {}", self.id, e);
            }
        }
        debug!("server {}: closed", self.id);
    }
}
