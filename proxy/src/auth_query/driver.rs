//! Query-response driver
//!
//! Sends the auth query as a simple query over an established server
//! connection and reads the reply until ReadyForQuery. Only four message kinds
//! matter here: ErrorResponse fails the exchange, RowDescription is skipped,
//! a single DataRow carries `(user, password)`, and ReadyForQuery ends it.
//! Anything else is ignored.

use crate::backend::{ServerConnection, UNBOUNDED_READ_TIMEOUT};
use crate::error::{ProxyError, Result};
use crate::protocol::message::{tag, HEADER_LEN};
use crate::protocol::MessageFormatter;
use bytes::Buf;
use log::{debug, error};
use std::fmt;

/// Context label of auth query log lines
pub const AUTH_QUERY_CONTEXT: &str = "auth_query";

/// Number of columns the auth query must return: user and password
const AUTH_QUERY_COLUMNS: u32 = 2;

/// Column length marking a NULL value (-1 on the wire)
const NULL_COLUMN: u32 = u32::MAX;

/// Password fetched by the auth query.
///
/// Empty when the query returned no row.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct PasswordResult {
    password: Option<Vec<u8>>,
}

impl fmt::Debug for PasswordResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PasswordResult")
            .field("captured", &self.is_captured())
            .field("len", &self.len())
            .finish()
    }
}

impl PasswordResult {
    /// Password bytes, if a row was returned
    pub fn password(&self) -> Option<&[u8]> {
        self.password.as_deref()
    }

    /// Length of the password in bytes
    pub fn len(&self) -> usize {
        self.password.as_ref().map_or(0, Vec::len)
    }

    /// Whether the password is absent or empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a row was returned
    pub fn is_captured(&self) -> bool {
        self.password.is_some()
    }

    /// Take the password, treating a missing row as an authentication failure
    pub fn into_password(self) -> Result<Vec<u8>> {
        self.password
            .ok_or_else(|| ProxyError::Auth("auth query returned no password".to_string()))
    }
}

/// Backend reply as seen by the driver
#[derive(Debug, PartialEq, Eq)]
enum QueryReply<'a> {
    Error,
    RowDescription,
    DataRow(&'a [u8]),
    ReadyForQuery,
    Other(u8),
}

impl<'a> QueryReply<'a> {
    fn decode(message: &'a [u8]) -> Result<Self> {
        if message.len() < HEADER_LEN {
            return Err(ProxyError::Protocol("truncated message header".to_string()));
        }

        Ok(match message[0] {
            tag::ERROR_RESPONSE => QueryReply::Error,
            tag::ROW_DESCRIPTION => QueryReply::RowDescription,
            tag::DATA_ROW => QueryReply::DataRow(&message[HEADER_LEN..]),
            tag::READY_FOR_QUERY => QueryReply::ReadyForQuery,
            other => QueryReply::Other(other),
        })
    }
}

/// Run `query` on `server` and capture the password column of its result.
///
/// Succeeds on ReadyForQuery whether or not a row was returned. Fails on a
/// write or read failure, an ErrorResponse, a second row, or a malformed row.
pub async fn run_auth_query(server: &mut ServerConnection, query: &str) -> Result<PasswordResult> {
    server.reset_stream();
    MessageFormatter::new().write_query(server.stream_mut(), query)?;

    if let Err(e) = server.write().await {
        error!("{}: server {}: write failed: {}", AUTH_QUERY_CONTEXT, server.id(), e);
        return Err(e);
    }

    server.sync_request();
    server.stat_request();

    let mut result = PasswordResult::default();

    loop {
        let message = match server.read_message(UNBOUNDED_READ_TIMEOUT).await {
            Ok(message) => message,
            Err(e) if e.is_timeout() => {
                debug!("{}: server {}: read timed out", AUTH_QUERY_CONTEXT, server.id());
                return Err(e);
            }
            Err(e) => {
                error!("{}: server {}: read failed: {}", AUTH_QUERY_CONTEXT, server.id(), e);
                return Err(e);
            }
        };

        let reply = QueryReply::decode(&message)?;
        debug!(
            "{}: server {}: '{}'",
            AUTH_QUERY_CONTEXT,
            server.id(),
            message[0] as char
        );

        match reply {
            QueryReply::Error => {
                let fields = server.backend_error(AUTH_QUERY_CONTEXT, &message);
                return Err(ProxyError::server_reported(&fields));
            }
            QueryReply::RowDescription => {}
            QueryReply::DataRow(body) => {
                if result.is_captured() {
                    error!(
                        "{}: server {}: auth query returned more than one row",
                        AUTH_QUERY_CONTEXT,
                        server.id()
                    );
                    return Err(ProxyError::Protocol(
                        "auth query returned more than one row".to_string(),
                    ));
                }

                match parse_password_row(body) {
                    Ok(password) => result.password = Some(password),
                    Err(e) => {
                        error!("{}: server {}: {}", AUTH_QUERY_CONTEXT, server.id(), e);
                        return Err(e);
                    }
                }
            }
            QueryReply::ReadyForQuery => {
                server.backend_ready(AUTH_QUERY_CONTEXT, &message);
                return Ok(result);
            }
            QueryReply::Other(_) => {}
        }
    }
}

/// Extract the password from a `(user, password)` DataRow body
fn parse_password_row(body: &[u8]) -> Result<Vec<u8>> {
    let mut cursor = body;

    if cursor.remaining() < 4 {
        return Err(ProxyError::Protocol(
            "truncated DataRow column count".to_string(),
        ));
    }
    let columns = cursor.get_u32();
    if columns != AUTH_QUERY_COLUMNS {
        return Err(ProxyError::Protocol(format!(
            "auth query returned {} columns, expected {}",
            columns, AUTH_QUERY_COLUMNS
        )));
    }

    // the user column is not checked against the requested user
    read_column(&mut cursor, "user")?;
    let password = read_column(&mut cursor, "password")?;

    Ok(password.to_vec())
}

fn read_column<'a>(cursor: &mut &'a [u8], name: &str) -> Result<&'a [u8]> {
    if cursor.remaining() < 4 {
        return Err(ProxyError::Protocol(format!(
            "truncated DataRow {} length",
            name
        )));
    }

    let length = cursor.get_u32();
    if length == NULL_COLUMN {
        return Err(ProxyError::Protocol(format!("DataRow {} is NULL", name)));
    }

    let length = length as usize;
    if cursor.remaining() < length {
        return Err(ProxyError::Protocol(format!(
            "truncated DataRow {} value",
            name
        )));
    }

    let (value, rest) = cursor.split_at(length);
    *cursor = rest;
    Ok(value)
}
