//! pgpooler - PostgreSQL connection pooler components
//!
//! This is the root crate that provides workspace-level documentation.
//! Actual implementation is in the subcrates:
//! - `pgpooler-core`: Identifiers, route configuration and auth query settings
//! - `pgpooler-proxy`: Backend connections, router and the auth query

/// Returns the version of the package.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
