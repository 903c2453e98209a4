//! Backend connection establishment
//!
//! Opens a TCP connection to the route's storage, sends the startup packet and
//! answers the authentication request (trust, cleartext or MD5), then waits
//! for the backend to report ReadyForQuery.

use crate::backend::{BackendConnector, ServerConnection};
use crate::client::{PARAM_DATABASE, PARAM_USER};
use crate::error::{ProxyError, Result};
use crate::protocol::{AuthenticationRequest, BackendMessage, MessageFormatter, MessageParser};
use async_trait::async_trait;
use log::{debug, info, warn};
use postgres_protocol::authentication::md5_hash;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Default timeout for connecting and for each startup message
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Connects server connections over TCP
#[derive(Debug, Clone)]
pub struct StartupConnector {
    connect_timeout: Duration,
    formatter: MessageFormatter,
    parser: MessageParser,
}

impl StartupConnector {
    /// Create a connector with the given connect timeout
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            formatter: MessageFormatter::new(),
            parser: MessageParser::new(),
        }
    }

    /// Run the startup and authentication exchange on a connected transport
    pub(crate) async fn startup(
        &self,
        server: &mut ServerConnection,
        context: &str,
        user: &str,
        database: &str,
        password: Option<&str>,
    ) -> Result<()> {
        server.reset_stream();
        self.formatter
            .write_startup(server.stream_mut(), &[(PARAM_USER, user), (PARAM_DATABASE, database)])?;
        server.write().await?;
        server.sync_request();

        loop {
            let message = server.read_message(self.connect_timeout).await?;

            match self.parser.parse_backend_message(&message)? {
                BackendMessage::Authentication(AuthenticationRequest::Ok) => {
                    debug!("{}: server {}: authentication ok", context, server.id());
                }
                BackendMessage::Authentication(AuthenticationRequest::CleartextPassword) => {
                    let password = required_password(password, user)?;
                    server.reset_stream();
                    self.formatter.write_password(server.stream_mut(), password)?;
                    server.write().await?;
                }
                BackendMessage::Authentication(AuthenticationRequest::Md5Password { salt }) => {
                    let password = required_password(password, user)?;
                    let hashed = md5_hash(user.as_bytes(), password.as_bytes(), salt);
                    server.reset_stream();
                    self.formatter.write_password(server.stream_mut(), &hashed)?;
                    server.write().await?;
                }
                BackendMessage::Authentication(AuthenticationRequest::Sasl { mechanisms }) => {
                    return Err(ProxyError::Auth(format!(
                        "unsupported SASL authentication requested ({})",
                        mechanisms.join(", ")
                    )));
                }
                BackendMessage::Authentication(AuthenticationRequest::Unsupported(code)) => {
                    return Err(ProxyError::Auth(format!(
                        "unsupported authentication method {}",
                        code
                    )));
                }
                BackendMessage::ParameterStatus { name, value } => {
                    server.set_parameter(name, value);
                }
                BackendMessage::BackendKeyData {
                    process_id,
                    secret_key,
                } => {
                    server.set_backend_key(process_id, secret_key);
                }
                BackendMessage::NoticeResponse(fields) => {
                    warn!(
                        "{}: server {}: {}",
                        context,
                        server.id(),
                        fields.message.unwrap_or_default()
                    );
                }
                BackendMessage::ErrorResponse(_) => {
                    let fields = server.backend_error(context, &message);
                    return Err(ProxyError::server_reported(&fields));
                }
                BackendMessage::ReadyForQuery(_) => {
                    server.backend_ready(context, &message);
                    return Ok(());
                }
                other => {
                    debug!("{}: server {}: ignoring {:?}", context, server.id(), other);
                }
            }
        }
    }
}

impl Default for StartupConnector {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT)
    }
}

#[async_trait]
impl BackendConnector for StartupConnector {
    async fn connect(&self, server: &mut ServerConnection, context: &str) -> Result<()> {
        let config = server.route().config().clone();
        let address = config.storage.address();

        debug!("{}: server {}: connecting to {}", context, server.id(), address);

        let stream = match timeout(self.connect_timeout, TcpStream::connect(&address)).await {
            Err(_) => return Err(ProxyError::Timeout(self.connect_timeout)),
            Ok(Err(e)) => {
                return Err(ProxyError::Transport(format!(
                    "failed to connect to {}: {}",
                    address, e
                )))
            }
            Ok(Ok(stream)) => stream,
        };
        stream.set_nodelay(true)?;
        server.attach_stream(stream);

        self.startup(
            server,
            context,
            config.storage_user(),
            config.storage_database(),
            config.storage.password.as_deref(),
        )
        .await?;

        info!(
            "{}: server {}: connected to {} as {}@{} (server_version {}, pid {})",
            context,
            server.id(),
            address,
            config.storage_user(),
            config.storage_database(),
            server.parameter("server_version").unwrap_or("unknown"),
            server
                .backend_key()
                .map(|(process_id, _)| process_id.to_string())
                .unwrap_or_else(|| "unknown".to_string())
        );
        Ok(())
    }
}

fn required_password<'a>(password: Option<&'a str>, user: &str) -> Result<&'a str> {
    password.ok_or_else(|| {
        ProxyError::Auth(format!("backend requested a password for {} but none is configured", user))
    })
}
