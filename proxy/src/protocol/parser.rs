//! Message parser for PostgreSQL backend messages
use crate::error::{ProxyError, Result};
use crate::protocol::message::{
    tag, AuthenticationRequest, BackendMessage, ErrorOrNoticeFields, TransactionStatus,
    HEADER_LEN,
};
use bytes::{Buf, Bytes};
use std::collections::HashMap;

/// Message parser for PostgreSQL wire protocol
#[derive(Debug, Default, Clone, Copy)]
pub struct MessageParser;

impl MessageParser {
    /// Create a new message parser
    pub fn new() -> Self {
        Self
    }

    /// Parse a complete backend message (tag, length and body)
    pub fn parse_backend_message(&self, bytes: &[u8]) -> Result<BackendMessage> {
        if bytes.len() < HEADER_LEN {
            return Err(ProxyError::Protocol("Truncated message header".to_string()));
        }

        let message_type = bytes[0];
        let mut body = &bytes[HEADER_LEN..];

        match message_type {
            tag::AUTHENTICATION => {
                let auth_type = read_i32(&mut body, "authentication type")?;

                let request = match auth_type {
                    0 => AuthenticationRequest::Ok,
                    3 => AuthenticationRequest::CleartextPassword,
                    5 => {
                        if body.remaining() < 4 {
                            return Err(ProxyError::Protocol("Truncated MD5 salt".to_string()));
                        }
                        let mut salt = [0u8; 4];
                        body.copy_to_slice(&mut salt);
                        AuthenticationRequest::Md5Password { salt }
                    }
                    10 => {
                        let mut mechanisms = Vec::new();
                        while body.has_remaining() {
                            let mechanism = self.read_cstring(&mut body)?;
                            if mechanism.is_empty() {
                                break;
                            }
                            mechanisms.push(mechanism);
                        }
                        AuthenticationRequest::Sasl { mechanisms }
                    }
                    other => AuthenticationRequest::Unsupported(other),
                };

                Ok(BackendMessage::Authentication(request))
            }

            tag::BACKEND_KEY_DATA => {
                let process_id = read_i32(&mut body, "process id")?;
                let secret_key = read_i32(&mut body, "secret key")?;

                Ok(BackendMessage::BackendKeyData {
                    process_id,
                    secret_key,
                })
            }

            tag::PARAMETER_STATUS => {
                let name = self.read_cstring(&mut body)?;
                let value = self.read_cstring(&mut body)?;

                Ok(BackendMessage::ParameterStatus { name, value })
            }

            tag::READY_FOR_QUERY => Ok(BackendMessage::ReadyForQuery(
                self.parse_ready_for_query(bytes)?,
            )),

            tag::COMMAND_COMPLETE => Ok(BackendMessage::CommandComplete(
                self.read_cstring(&mut body)?,
            )),

            tag::ERROR_RESPONSE => Ok(BackendMessage::ErrorResponse(
                self.parse_error_fields(bytes)?,
            )),

            tag::NOTICE_RESPONSE => Ok(BackendMessage::NoticeResponse(
                self.parse_error_fields(bytes)?,
            )),

            _ => Ok(BackendMessage::Unknown {
                tag: message_type,
                body: Bytes::copy_from_slice(body),
            }),
        }
    }

    /// Parse the transaction status of a ReadyForQuery message
    pub fn parse_ready_for_query(&self, bytes: &[u8]) -> Result<TransactionStatus> {
        let status_byte = bytes
            .get(HEADER_LEN)
            .copied()
            .ok_or_else(|| ProxyError::Protocol("Truncated ReadyForQuery".to_string()))?;

        TransactionStatus::from_byte(status_byte).ok_or_else(|| {
            ProxyError::Protocol(format!("Unknown transaction status: {}", status_byte))
        })
    }

    /// Parse the fields of an ErrorResponse or NoticeResponse message
    pub fn parse_error_fields(&self, bytes: &[u8]) -> Result<ErrorOrNoticeFields> {
        let mut cursor = bytes.get(HEADER_LEN..).unwrap_or_default();
        let mut fields = ErrorOrNoticeFields::default();
        let mut all_fields = HashMap::new();

        while cursor.has_remaining() {
            let field_type = cursor.get_u8();
            if field_type == 0 {
                break;
            }

            let field_value = self.read_cstring(&mut cursor)?;
            all_fields.insert(field_type, field_value.clone());

            match field_type {
                b'S' => fields.severity = Some(field_value),
                b'C' => fields.code = Some(field_value),
                b'M' => fields.message = Some(field_value),
                b'D' => fields.detail = Some(field_value),
                b'H' => fields.hint = Some(field_value),
                _ => {} // kept in all_fields only
            }
        }

        fields.fields = all_fields;

        Ok(fields)
    }

    /// Read a null-terminated string
    fn read_cstring(&self, cursor: &mut &[u8]) -> Result<String> {
        let end = cursor
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| ProxyError::Protocol("Unterminated string".to_string()))?;

        let value = String::from_utf8(cursor[..end].to_vec())
            .map_err(|e| ProxyError::Protocol(format!("Invalid UTF-8: {}", e)))?;
        cursor.advance(end + 1);

        Ok(value)
    }
}

/// Read a big-endian Int32, failing on a short buffer
fn read_i32(cursor: &mut &[u8], what: &str) -> Result<i32> {
    if cursor.remaining() < 4 {
        return Err(ProxyError::Protocol(format!("Truncated {}", what)));
    }
    Ok(cursor.get_i32())
}
