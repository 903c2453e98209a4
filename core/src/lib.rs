//! # pgpooler core
//!
//! Core data structures shared by the pooler crates: diagnostic identifiers,
//! route configuration and the auth query settings derived from it.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod config;
pub mod error;
pub mod utils;

/// Re-export common types for ease of use
pub use config::{AuthQuerySpec, RouteConfig, StorageConfig};
pub use error::{CoreError, Result};
pub use utils::id::{Id, IdGenerator};

/// Version of the core crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
