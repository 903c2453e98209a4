//! Message types for the PostgreSQL wire protocol
use bytes::Bytes;
use std::collections::HashMap;

/// Length of a tagged message header: tag byte and Int32 length
pub const HEADER_LEN: usize = 5;

/// Protocol version 3.0 as sent in the startup message
pub const PROTOCOL_VERSION: i32 = 196608;

/// Backend message tags
pub mod tag {
    /// Authentication request
    pub const AUTHENTICATION: u8 = b'R';
    /// Backend key data
    pub const BACKEND_KEY_DATA: u8 = b'K';
    /// Command complete
    pub const COMMAND_COMPLETE: u8 = b'C';
    /// Data row
    pub const DATA_ROW: u8 = b'D';
    /// Error response
    pub const ERROR_RESPONSE: u8 = b'E';
    /// Notice response
    pub const NOTICE_RESPONSE: u8 = b'N';
    /// Parameter status
    pub const PARAMETER_STATUS: u8 = b'S';
    /// Ready for query
    pub const READY_FOR_QUERY: u8 = b'Z';
    /// Row description
    pub const ROW_DESCRIPTION: u8 = b'T';
}

/// Backend (server-to-pooler) messages seen while establishing and resetting
/// server connections
#[derive(Debug, Clone, PartialEq)]
pub enum BackendMessage {
    /// Authentication request
    Authentication(AuthenticationRequest),

    /// Backend key data
    BackendKeyData {
        /// Process ID
        process_id: i32,
        /// Secret key
        secret_key: i32,
    },

    /// Parameter status
    ParameterStatus {
        /// Parameter name
        name: String,
        /// Parameter value
        value: String,
    },

    /// Ready for query
    ReadyForQuery(TransactionStatus),

    /// Command complete
    CommandComplete(String),

    /// Error response
    ErrorResponse(ErrorOrNoticeFields),

    /// Notice response
    NoticeResponse(ErrorOrNoticeFields),

    /// Any other message
    Unknown {
        /// Message type
        tag: u8,
        /// Message body
        body: Bytes,
    },
}

/// Authentication request types
#[derive(Debug, Clone, PartialEq)]
pub enum AuthenticationRequest {
    /// Authentication successful
    Ok,

    /// Cleartext password required
    CleartextPassword,

    /// MD5 password required
    Md5Password {
        /// Salt for MD5 authentication
        salt: [u8; 4],
    },

    /// SASL authentication required
    Sasl {
        /// SASL authentication mechanisms
        mechanisms: Vec<String>,
    },

    /// Any method the pooler does not implement
    Unsupported(i32),
}

/// Transaction status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Idle (not in a transaction)
    Idle,

    /// In a transaction block
    InTransaction,

    /// In a failed transaction block
    Failed,
}

impl TransactionStatus {
    /// Convert from a byte to a transaction status
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b'I' => Some(TransactionStatus::Idle),
            b'T' => Some(TransactionStatus::InTransaction),
            b'E' => Some(TransactionStatus::Failed),
            _ => None,
        }
    }
}

/// Error and notice message fields
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ErrorOrNoticeFields {
    /// Severity (localized)
    pub severity: Option<String>,

    /// SQLSTATE code
    pub code: Option<String>,

    /// Primary message
    pub message: Option<String>,

    /// Detail message
    pub detail: Option<String>,

    /// Hint message
    pub hint: Option<String>,

    /// All fields (including unknown ones)
    pub fields: HashMap<u8, String>,
}
