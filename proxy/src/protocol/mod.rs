//! PostgreSQL wire protocol implementation
//!
//! This module provides the framing, parsing and formatting of the PostgreSQL
//! wire protocol messages exchanged with backend servers.

/// Message types for the PostgreSQL wire protocol
pub mod message;

/// Message parser for backend messages
pub mod parser;

/// Message formatter for frontend messages
pub mod formatter;

/// Frame codec for backend connections
pub mod codec;

// Re-export common types
pub use self::codec::MessageCodec;
pub use self::formatter::MessageFormatter;
pub use self::message::{
    AuthenticationRequest, BackendMessage, ErrorOrNoticeFields, TransactionStatus,
};
pub use self::parser::MessageParser;
