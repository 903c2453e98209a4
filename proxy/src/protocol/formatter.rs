//! Message formatter for PostgreSQL frontend messages
//!
//! This module frames the messages the pooler sends to backends: the startup
//! packet, password responses, simple queries and terminate.

use crate::error::{ProxyError, Result};
use crate::protocol::message::PROTOCOL_VERSION;
use bytes::{BufMut, BytesMut};

/// Message formatter for PostgreSQL frontend messages
#[derive(Debug, Default, Clone, Copy)]
pub struct MessageFormatter;

impl MessageFormatter {
    /// Create a new message formatter
    pub fn new() -> Self {
        Self
    }

    /// Frame a simple query.
    ///
    /// The query is sent NUL-terminated, so the framed text length is the
    /// query length plus one.
    pub fn write_query(&self, buffer: &mut BytesMut, query: &str) -> Result<()> {
        check_cstring(query, "query")?;

        self.write_message_with_type(buffer, b'Q', |buf| {
            write_string(buf, query);
        });
        Ok(())
    }

    /// Frame a startup message with the given parameters
    pub fn write_startup(&self, buffer: &mut BytesMut, parameters: &[(&str, &str)]) -> Result<()> {
        for (name, value) in parameters {
            check_cstring(name, "startup parameter name")?;
            check_cstring(value, "startup parameter value")?;
        }

        let length_pos = buffer.len();
        buffer.put_i32(0); // Placeholder
        buffer.put_i32(PROTOCOL_VERSION);
        for (name, value) in parameters {
            write_string(buffer, name);
            write_string(buffer, value);
        }
        buffer.put_u8(0);

        let message_length = (buffer.len() - length_pos) as i32;
        buffer[length_pos..length_pos + 4].copy_from_slice(&message_length.to_be_bytes());
        Ok(())
    }

    /// Frame a password message
    pub fn write_password(&self, buffer: &mut BytesMut, password: &str) -> Result<()> {
        check_cstring(password, "password")?;

        self.write_message_with_type(buffer, b'p', |buf| {
            write_string(buf, password);
        });
        Ok(())
    }

    /// Frame a terminate message
    pub fn write_terminate(&self, buffer: &mut BytesMut) {
        self.write_message_with_type(buffer, b'X', |_| {});
    }

    /// Write a message with the specified type code
    pub(crate) fn write_message_with_type<F>(&self, buffer: &mut BytesMut, type_code: u8, writer: F)
    where
        F: FnOnce(&mut BytesMut),
    {
        buffer.put_u8(type_code);

        // Reserve space for length
        let length_pos = buffer.len();
        buffer.put_i32(0); // Placeholder

        let body_start = buffer.len();
        writer(buffer);
        let body_end = buffer.len();

        // Length includes the length field itself, but not the message type
        let message_length = (body_end - body_start + 4) as i32;
        buffer[length_pos..length_pos + 4].copy_from_slice(&message_length.to_be_bytes());
    }
}

/// Write a null-terminated string
fn write_string(buffer: &mut BytesMut, string: &str) {
    buffer.put_slice(string.as_bytes());
    buffer.put_u8(0);
}

fn check_cstring(value: &str, what: &str) -> Result<()> {
    if value.as_bytes().contains(&0) {
        return Err(ProxyError::Protocol(format!("{} contains a NUL byte", what)));
    }
    Ok(())
}
