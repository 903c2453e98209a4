//! Internal clients
//!
//! The router only knows how to serve clients. When the pooler needs a server
//! connection for its own purposes (the auth query) it manufactures an
//! internal client whose startup parameters point at the wanted database and
//! user, and routes it like any other client.

use crate::error::{ProxyError, Result};
use crate::router::Route;
use pgpooler_core::{AuthQuerySpec, Id};
use std::ops::Range;

/// Startup parameter name of the database
pub const PARAM_DATABASE: &str = "database";

/// Startup parameter name of the user
pub const PARAM_USER: &str = "user";

/// Startup parameters stored as consecutive NUL-terminated name/value pairs
#[derive(Debug, Clone, Default)]
pub struct StartupParameters {
    buf: Vec<u8>,
    entries: Vec<(Range<usize>, Range<usize>)>,
}

impl StartupParameters {
    /// Create an empty parameter set
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a parameter
    pub fn add(&mut self, name: &str, value: &str) -> Result<()> {
        if name.is_empty() || name.contains('\0') || value.contains('\0') {
            return Err(ProxyError::Allocation(format!(
                "invalid startup parameter {:?}",
                name
            )));
        }

        let name_range = self.push_cstring(name);
        let value_range = self.push_cstring(value);
        self.entries.push((name_range, value_range));
        Ok(())
    }

    /// Value of the named parameter
    pub fn get(&self, name: &str) -> Option<&str> {
        self.position(name).map(|index| self.value_at(index))
    }

    /// Index of the named parameter
    pub fn position(&self, name: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|(range, _)| &self.buf[range.clone()] == name.as_bytes())
    }

    /// Parameters in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        (0..self.entries.len()).map(move |index| (self.name_at(index), self.value_at(index)))
    }

    /// Number of parameters
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no parameters are set
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Raw parameter buffer, each name and value NUL-terminated
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    fn push_cstring(&mut self, value: &str) -> Range<usize> {
        let start = self.buf.len();
        self.buf.extend_from_slice(value.as_bytes());
        let end = self.buf.len();
        self.buf.push(0);
        start..end
    }

    fn name_at(&self, index: usize) -> &str {
        self.str_at(self.entries[index].0.clone())
    }

    fn value_at(&self, index: usize) -> &str {
        self.str_at(self.entries[index].1.clone())
    }

    fn str_at(&self, range: Range<usize>) -> &str {
        // only whole &str values are ever pushed
        std::str::from_utf8(&self.buf[range]).unwrap_or_default()
    }
}

/// Ephemeral client used by the pooler itself
#[derive(Debug)]
pub struct InternalClient {
    id: Id,
    params: StartupParameters,
    database: usize,
    user: usize,
    route: Option<Route>,
}

impl InternalClient {
    /// Create an internal client routed to the auth query database and user
    pub fn for_auth_query(id: Id, spec: &AuthQuerySpec) -> Result<Self> {
        if spec.database.is_empty() || spec.user.is_empty() {
            return Err(ProxyError::Allocation(
                "auth query database and user must be set".to_string(),
            ));
        }

        let mut params = StartupParameters::new();
        params.add(PARAM_DATABASE, &spec.database)?;
        params.add(PARAM_USER, &spec.user)?;

        // resolve the identity fields against the populated buffer
        let database = params
            .position(PARAM_DATABASE)
            .ok_or_else(|| ProxyError::Allocation("database parameter missing".to_string()))?;
        let user = params
            .position(PARAM_USER)
            .ok_or_else(|| ProxyError::Allocation("user parameter missing".to_string()))?;

        Ok(Self {
            id,
            params,
            database,
            user,
            route: None,
        })
    }

    /// Client identifier
    pub fn id(&self) -> &Id {
        &self.id
    }

    /// Database from the startup parameters
    pub fn database(&self) -> &str {
        self.params.value_at(self.database)
    }

    /// User from the startup parameters
    pub fn user(&self) -> &str {
        self.params.value_at(self.user)
    }

    /// Startup parameters
    pub fn params(&self) -> &StartupParameters {
        &self.params
    }

    /// Route the client is currently resolved to
    pub fn route(&self) -> Option<&Route> {
        self.route.as_ref()
    }

    /// Record the route resolution
    pub fn set_route(&mut self, route: Route) {
        self.route = Some(route);
    }

    /// Forget the route resolution
    pub fn take_route(&mut self) -> Option<Route> {
        self.route.take()
    }
}
