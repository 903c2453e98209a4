//! Auth query
//!
//! Fetches the stored password of a user by running the route's auth query on
//! a pooled server connection. The connection is borrowed through the router
//! on behalf of an internal client that exists only for one fetch.
//!
//! Resources are acquired in order: route, attached server, live transport,
//! clean session. Whatever prefix was acquired is released by one teardown
//! step: a routed client without a server is unrouted, a server is closed
//! after a failure and detached back to the pool after success.

pub mod driver;

pub use driver::{run_auth_query, PasswordResult, AUTH_QUERY_CONTEXT};

use crate::backend::{BackendConnector, ServerConnection, SessionReset};
use crate::client::InternalClient;
use crate::error::ProxyError;
use crate::router::Router;
use log::{debug, error};
use metrics::increment_counter;
use pgpooler_core::{AuthQuerySpec, IdGenerator};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Id prefix of internal auth query clients
pub const AUTH_QUERY_CLIENT_PREFIX: &str = "a";

/// Step of an auth query fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthQueryStage {
    /// Creating the internal client
    Allocate,
    /// Resolving the route
    Route,
    /// Attaching a server connection
    Attach,
    /// Connecting the server
    Connect,
    /// Resetting the server session
    Discard,
    /// Running the query
    Query,
}

impl AuthQueryStage {
    /// Stage name as used in log lines and metric labels
    pub fn as_str(self) -> &'static str {
        match self {
            AuthQueryStage::Allocate => "allocate",
            AuthQueryStage::Route => "route",
            AuthQueryStage::Attach => "attach",
            AuthQueryStage::Connect => "connect",
            AuthQueryStage::Discard => "discard",
            AuthQueryStage::Query => "query",
        }
    }
}

impl fmt::Display for AuthQueryStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failed auth query fetch
#[derive(Debug, Error)]
#[error("auth query failed at {stage}: {source}")]
pub struct AuthQueryError {
    /// Stage that failed
    pub stage: AuthQueryStage,
    /// Underlying error
    pub source: ProxyError,
}

/// Resources held by one fetch
#[derive(Default)]
struct Lease {
    routed: bool,
    server: Option<ServerConnection>,
}

/// Auth query runner with its collaborators
pub struct AuthQuery {
    router: Arc<dyn Router>,
    connector: Arc<dyn BackendConnector>,
    reset: Arc<dyn SessionReset>,
    ids: Arc<IdGenerator>,
}

impl AuthQuery {
    /// Create an auth query runner
    pub fn new(
        router: Arc<dyn Router>,
        connector: Arc<dyn BackendConnector>,
        reset: Arc<dyn SessionReset>,
        ids: Arc<IdGenerator>,
    ) -> Self {
        Self {
            router,
            connector,
            reset,
            ids,
        }
    }

    /// Fetch a password with the given auth query settings.
    ///
    /// A query that returns no row succeeds with an empty `PasswordResult`.
    pub async fn fetch_password(
        &self,
        spec: &AuthQuerySpec,
    ) -> Result<PasswordResult, AuthQueryError> {
        increment_counter!("auth_query_requests_total");

        let id = self.ids.generate(AUTH_QUERY_CLIENT_PREFIX);
        let mut client = InternalClient::for_auth_query(id, spec)
            .map_err(|e| self.failed(AuthQueryStage::Allocate, e))?;

        debug!(
            "{}: client {}: fetching password as {}@{}",
            AUTH_QUERY_CONTEXT,
            client.id(),
            client.user(),
            client.database()
        );

        let mut lease = Lease::default();
        let result = self
            .acquire_and_query(&mut client, &mut lease, &spec.query)
            .await;
        self.release(&mut client, lease, result.is_ok()).await;

        match result {
            Ok(password) => {
                debug!(
                    "{}: client {}: auth query returned {}",
                    AUTH_QUERY_CONTEXT,
                    client.id(),
                    if password.is_captured() { "a password" } else { "no rows" }
                );
                Ok(password)
            }
            Err((stage, e)) => Err(self.failed(stage, e)),
        }
    }

    async fn acquire_and_query(
        &self,
        client: &mut InternalClient,
        lease: &mut Lease,
        query: &str,
    ) -> Result<PasswordResult, (AuthQueryStage, ProxyError)> {
        self.router
            .route(client)
            .await
            .map_err(|e| (AuthQueryStage::Route, e))?;
        lease.routed = true;

        let server = self
            .router
            .attach(client)
            .await
            .map_err(|e| (AuthQueryStage::Attach, e))?;
        let server = lease.server.insert(server);

        if !server.is_connected() {
            self.connector
                .connect(server, AUTH_QUERY_CONTEXT)
                .await
                .map_err(|e| (AuthQueryStage::Connect, e))?;
        }

        if server.route().pool_discard() {
            self.reset
                .discard(server)
                .await
                .map_err(|e| (AuthQueryStage::Discard, e))?;
        }

        run_auth_query(server, query)
            .await
            .map_err(|e| (AuthQueryStage::Query, e))
    }

    async fn release(&self, client: &mut InternalClient, lease: Lease, healthy: bool) {
        match lease.server {
            Some(server) if healthy => self.router.detach_and_unroute(client, server).await,
            Some(server) => self.router.close_and_unroute(client, server).await,
            None if lease.routed => self.router.unroute(client).await,
            None => {}
        }
    }

    fn failed(&self, stage: AuthQueryStage, source: ProxyError) -> AuthQueryError {
        if source.is_timeout() {
            debug!("{}: {} timed out: {}", AUTH_QUERY_CONTEXT, stage, source);
        } else {
            error!("{}: {} failed: {}", AUTH_QUERY_CONTEXT, stage, source);
        }
        increment_counter!("auth_query_failures_total", "stage" => stage.as_str());

        AuthQueryError { stage, source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MockBackendConnector, MockSessionReset, StartupConnector};
    use crate::error::Result;
    use crate::router::{PoolRouter, PoolStats, RouteKey};
    use crate::testing::{
        self, auth_request, data_row, error_response, read_frontend_message,
        read_startup_packet, ready_for_query, row_description,
    };
    use async_trait::async_trait;
    use bytes::Bytes;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    const ALICE_QUERY: &str = "SELECT usename, passwd FROM pg_shadow WHERE usename='alice'";

    fn spec() -> AuthQuerySpec {
        AuthQuerySpec {
            query: ALICE_QUERY.to_string(),
            database: "auth_db".to_string(),
            user: "auth_user".to_string(),
        }
    }

    fn alice_reply() -> Vec<Bytes> {
        vec![
            row_description(&["usename", "passwd"]),
            data_row(&[Some("alice"), Some("md5abcdef")]),
            ready_for_query(b'I'),
        ]
    }

    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    struct Counts {
        route: usize,
        attach: usize,
        detach_and_unroute: usize,
        unroute: usize,
        close_and_unroute: usize,
    }

    /// Router that counts calls and fails on request
    #[derive(Default)]
    struct CountingRouter {
        fail_route: bool,
        fail_attach: bool,
        pool_discard: bool,
        route: AtomicUsize,
        attach: AtomicUsize,
        detach_and_unroute: AtomicUsize,
        unroute: AtomicUsize,
        close_and_unroute: AtomicUsize,
    }

    impl CountingRouter {
        fn counts(&self) -> Counts {
            Counts {
                route: self.route.load(Ordering::SeqCst),
                attach: self.attach.load(Ordering::SeqCst),
                detach_and_unroute: self.detach_and_unroute.load(Ordering::SeqCst),
                unroute: self.unroute.load(Ordering::SeqCst),
                close_and_unroute: self.close_and_unroute.load(Ordering::SeqCst),
            }
        }
    }

    #[async_trait]
    impl Router for CountingRouter {
        async fn route(&self, client: &mut InternalClient) -> Result<()> {
            if self.fail_route {
                return Err(ProxyError::Routing("no route".to_string()));
            }
            self.route.fetch_add(1, Ordering::SeqCst);
            client.set_route(testing::test_route(self.pool_discard));
            Ok(())
        }

        async fn attach(&self, client: &mut InternalClient) -> Result<ServerConnection> {
            if self.fail_attach {
                return Err(ProxyError::Attachment("pool exhausted".to_string()));
            }
            self.attach.fetch_add(1, Ordering::SeqCst);
            let route = client
                .route()
                .cloned()
                .ok_or_else(|| ProxyError::Attachment("client is not routed".to_string()))?;
            Ok(testing::server_for(route))
        }

        async fn detach_and_unroute(&self, client: &mut InternalClient, _server: ServerConnection) {
            self.detach_and_unroute.fetch_add(1, Ordering::SeqCst);
            client.take_route();
        }

        async fn unroute(&self, client: &mut InternalClient) {
            self.unroute.fetch_add(1, Ordering::SeqCst);
            client.take_route();
        }

        async fn close_and_unroute(&self, client: &mut InternalClient, _server: ServerConnection) {
            self.close_and_unroute.fetch_add(1, Ordering::SeqCst);
            client.take_route();
        }
    }

    /// Connector that attaches a scripted backend, or fails
    fn connector(fail: bool, script: Vec<Bytes>) -> MockBackendConnector {
        let mut connector = MockBackendConnector::new();
        connector.expect_connect().returning(move |server, _| {
            if fail {
                return Err(ProxyError::Transport("connection refused".to_string()));
            }
            let (stream, _backend) = testing::scripted_stream(script.clone());
            server.attach_stream(stream);
            Ok(())
        });
        connector
    }

    fn reset(fail: bool) -> MockSessionReset {
        let mut reset = MockSessionReset::new();
        reset.expect_discard().returning(move |_| {
            if fail {
                Err(ProxyError::ServerReported {
                    code: "25001".to_string(),
                    message: "cannot discard".to_string(),
                })
            } else {
                Ok(())
            }
        });
        reset
    }

    /// Point at which a fetch is made to fail
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum FailAt {
        Allocate,
        Route,
        Attach,
        Connect,
        Discard,
        Query,
        Nowhere,
    }

    async fn run_with_failure(
        fail_at: FailAt,
        pool_discard: bool,
    ) -> (std::result::Result<PasswordResult, AuthQueryError>, Counts) {
        let router = Arc::new(CountingRouter {
            fail_route: fail_at == FailAt::Route,
            fail_attach: fail_at == FailAt::Attach,
            pool_discard: pool_discard || fail_at == FailAt::Discard,
            ..Default::default()
        });

        let script = if fail_at == FailAt::Query {
            vec![error_response("42P01", "relation \"pg_shadow\" does not exist")]
        } else {
            alice_reply()
        };

        let auth_query = AuthQuery::new(
            router.clone(),
            Arc::new(connector(fail_at == FailAt::Connect, script)),
            Arc::new(reset(fail_at == FailAt::Discard)),
            Arc::new(IdGenerator::new()),
        );

        let mut spec = spec();
        if fail_at == FailAt::Allocate {
            spec.database.clear();
        }

        let result = auth_query.fetch_password(&spec).await;
        (result, router.counts())
    }

    fn expected_counts(fail_at: FailAt) -> Counts {
        let mut counts = Counts::default();
        match fail_at {
            FailAt::Allocate | FailAt::Route => {}
            FailAt::Attach => {
                counts.route = 1;
                counts.unroute = 1;
            }
            FailAt::Connect | FailAt::Discard | FailAt::Query => {
                counts.route = 1;
                counts.attach = 1;
                counts.close_and_unroute = 1;
            }
            FailAt::Nowhere => {
                counts.route = 1;
                counts.attach = 1;
                counts.detach_and_unroute = 1;
            }
        }
        counts
    }

    fn expected_stage(fail_at: FailAt) -> Option<AuthQueryStage> {
        match fail_at {
            FailAt::Allocate => Some(AuthQueryStage::Allocate),
            FailAt::Route => Some(AuthQueryStage::Route),
            FailAt::Attach => Some(AuthQueryStage::Attach),
            FailAt::Connect => Some(AuthQueryStage::Connect),
            FailAt::Discard => Some(AuthQueryStage::Discard),
            FailAt::Query => Some(AuthQueryStage::Query),
            FailAt::Nowhere => None,
        }
    }

    #[tokio::test]
    async fn test_fetch_password() {
        let (result, counts) = run_with_failure(FailAt::Nowhere, false).await;

        let password = result.unwrap();
        assert_eq!(password.password(), Some(&b"md5abcdef"[..]));
        assert_eq!(counts, expected_counts(FailAt::Nowhere));
    }

    #[tokio::test]
    async fn test_allocation_failure_touches_nothing() {
        let (result, counts) = run_with_failure(FailAt::Allocate, false).await;

        let err = result.unwrap_err();
        assert_eq!(err.stage, AuthQueryStage::Allocate);
        assert!(matches!(err.source, ProxyError::Allocation(_)));
        assert_eq!(counts, Counts::default());
    }

    #[tokio::test]
    async fn test_route_failure_frees_client_only() {
        let (result, counts) = run_with_failure(FailAt::Route, false).await;

        assert_eq!(result.unwrap_err().stage, AuthQueryStage::Route);
        assert_eq!(counts, Counts::default());
    }

    #[tokio::test]
    async fn test_attach_failure_unroutes() {
        let (result, counts) = run_with_failure(FailAt::Attach, false).await;

        assert_eq!(result.unwrap_err().stage, AuthQueryStage::Attach);
        assert_eq!(counts, expected_counts(FailAt::Attach));
    }

    #[tokio::test]
    async fn test_connect_failure_closes() {
        let (result, counts) = run_with_failure(FailAt::Connect, false).await;

        let err = result.unwrap_err();
        assert_eq!(err.stage, AuthQueryStage::Connect);
        assert!(err.to_string().starts_with("auth query failed at connect"));
        assert_eq!(counts, expected_counts(FailAt::Connect));
    }

    #[tokio::test]
    async fn test_discard_failure_closes() {
        let (result, counts) = run_with_failure(FailAt::Discard, true).await;

        assert_eq!(result.unwrap_err().stage, AuthQueryStage::Discard);
        assert_eq!(counts, expected_counts(FailAt::Discard));
    }

    #[tokio::test]
    async fn test_query_failure_closes() {
        let (result, counts) = run_with_failure(FailAt::Query, false).await;

        let err = result.unwrap_err();
        assert_eq!(err.stage, AuthQueryStage::Query);
        assert!(matches!(err.source, ProxyError::ServerReported { .. }));
        assert_eq!(counts, expected_counts(FailAt::Query));
    }

    #[tokio::test]
    async fn test_discard_only_when_configured() {
        let router = Arc::new(CountingRouter::default());
        let mut reset = MockSessionReset::new();
        reset.expect_discard().times(0);

        let auth_query = AuthQuery::new(
            router.clone(),
            Arc::new(connector(false, alice_reply())),
            Arc::new(reset),
            Arc::new(IdGenerator::new()),
        );
        auth_query.fetch_password(&spec()).await.unwrap();

        let router = Arc::new(CountingRouter {
            pool_discard: true,
            ..Default::default()
        });
        let mut reset = MockSessionReset::new();
        reset.expect_discard().times(1).returning(|_| Ok(()));

        let auth_query = AuthQuery::new(
            router.clone(),
            Arc::new(connector(false, alice_reply())),
            Arc::new(reset),
            Arc::new(IdGenerator::new()),
        );
        auth_query.fetch_password(&spec()).await.unwrap();
    }

    fn fail_at() -> impl Strategy<Value = FailAt> {
        prop_oneof![
            Just(FailAt::Allocate),
            Just(FailAt::Route),
            Just(FailAt::Attach),
            Just(FailAt::Connect),
            Just(FailAt::Discard),
            Just(FailAt::Query),
            Just(FailAt::Nowhere),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_release_matches_acquire(
            runs in proptest::collection::vec((fail_at(), any::<bool>()), 1..8)
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();

            let mut total = Counts::default();
            for (fail_at, pool_discard) in runs {
                let (result, counts) = runtime.block_on(run_with_failure(fail_at, pool_discard));

                prop_assert_eq!(result.err().map(|e| e.stage), expected_stage(fail_at));
                prop_assert_eq!(counts, expected_counts(fail_at));

                total.route += counts.route;
                total.attach += counts.attach;
                total.detach_and_unroute += counts.detach_and_unroute;
                total.unroute += counts.unroute;
                total.close_and_unroute += counts.close_and_unroute;
            }

            prop_assert_eq!(
                total.route,
                total.unroute + total.detach_and_unroute + total.close_and_unroute
            );
            prop_assert_eq!(total.attach, total.detach_and_unroute + total.close_and_unroute);
        }
    }

    #[tokio::test]
    async fn test_fetch_over_pool_router() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let backend_task = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            read_startup_packet(&mut socket).await;
            socket.write_all(&auth_request(0, &[])).await.unwrap();
            socket.write_all(&ready_for_query(b'I')).await.unwrap();

            let mut queries = Vec::new();
            for _ in 0..2 {
                let (tag, body) = read_frontend_message(&mut socket).await;
                assert_eq!(tag, b'Q');
                queries.push(body);
                for message in alice_reply() {
                    socket.write_all(&message).await.unwrap();
                }
            }
            queries
        });

        let config = (**testing::route_on_port(port, false).config()).clone();
        let ids = Arc::new(IdGenerator::new());
        let router = Arc::new(PoolRouter::new(&[config], ids.clone()).unwrap());

        let auth_query = AuthQuery::new(
            router.clone(),
            Arc::new(StartupConnector::new(Duration::from_secs(5))),
            Arc::new(reset(false)),
            ids,
        );

        // the second fetch reuses the pooled connection
        for _ in 0..2 {
            let password = auth_query.fetch_password(&spec()).await.unwrap();
            assert_eq!(password.into_password().unwrap(), b"md5abcdef".to_vec());
        }

        let queries = backend_task.await.unwrap();
        assert_eq!(queries.len(), 2);
        assert_eq!(queries[0], [ALICE_QUERY.as_bytes(), b"\0"].concat());

        assert_eq!(
            router.stats(&RouteKey::new("auth_db", "auth_user")).await,
            Some(PoolStats {
                idle: 1,
                active: 0,
                clients: 0
            })
        );
    }
}
