//! Reusable test helpers for HTTP integration tests.
//!
//! Provides `TestApp` for building and sending requests through the full axum
//! router over in-memory store backends, plus utilities for signing webhook
//! deliveries and minting JWTs.
//!
//! ## Test Servers
//!
//! Use [`spawn_test_server()`] when a test needs a real socket (WebSocket
//! upgrades) instead of `tower::ServiceExt::oneshot`.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{self, Method, Request, Response};
use axum::Router;
use chrono::Utc;
use http_body_util::BodyExt;
use sb_server::api::{create_router, AppState, Backends};
use sb_server::auth::issue_access_token;
use sb_server::config::Config;
use sb_server::hub::StaticAccessDirectory;
use sb_server::ratelimit::RateLimitConfig;
use sb_server::signature::{sign, SignatureVerifier};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use uuid::Uuid;

// ============================================================================
// Test App
// ============================================================================

/// A test application wrapping the full axum router.
pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    pub backends: Backends,
    pub directory: Arc<StaticAccessDirectory>,
    pub config: Arc<Config>,
    shutdown: CancellationToken,
    _relay: JoinHandle<()>,
}

impl TestApp {
    /// Create a test app with default test config and limits.
    pub fn new() -> Self {
        Self::with_config(Config::default_for_test(), RateLimitConfig::for_test())
    }

    /// Create a test app with a custom config (for limit testing).
    pub fn with_config(config: Config, rate_limits: RateLimitConfig) -> Self {
        let (backends, directory) =
            Backends::in_memory(&config, rate_limits).expect("Failed to build in-memory backends");
        let state = AppState::new(config.clone(), &backends).expect("Failed to build app state");
        let shutdown = CancellationToken::new();
        let relay = backends.spawn_relay(&config, state.hub.clone(), shutdown.clone());
        let router = create_router(state.clone());

        Self {
            router,
            state,
            backends,
            directory,
            config: Arc::new(config),
            shutdown,
            _relay: relay,
        }
    }

    /// Build an HTTP request with the given method and URI.
    pub fn request(method: Method, uri: &str) -> http::request::Builder {
        Request::builder().method(method).uri(uri)
    }

    /// Send a request through the router via `tower::ServiceExt::oneshot`.
    pub async fn oneshot(&self, request: Request<Body>) -> Response<Body> {
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("oneshot request failed")
    }

    /// Signed `POST /webhooks/{provider}/{tenant_id}` request.
    pub fn webhook(&self, provider: &str, tenant_id: Uuid, body: &str) -> Request<Body> {
        let ts = Utc::now().timestamp().to_string();
        self.webhook_at(provider, tenant_id, body, &ts)
    }

    /// Signed webhook request with an explicit epoch-seconds timestamp.
    pub fn webhook_at(&self, provider: &str, tenant_id: Uuid, body: &str, ts: &str) -> Request<Body> {
        let verifier = SignatureVerifier::builtin(
            &self.config.webhook_secrets,
            self.config.environment,
            self.config.max_skew,
        )
        .expect("Failed to build verifier");
        let signature = sign(&verifier, provider, ts, body.as_bytes()).unwrap_or_default();

        Self::request(Method::POST, &format!("/webhooks/{provider}/{tenant_id}"))
            .header(format!("x-{provider}-signature"), signature)
            .header(format!("x-{provider}-timestamp"), ts)
            .header("Content-Type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

// ============================================================================
// Test Server
// ============================================================================

/// A running test server bound to a random port.
pub struct TestServer {
    /// Server address (127.0.0.1:PORT).
    pub addr: SocketAddr,
    /// WebSocket URL of the `/ws` endpoint.
    pub ws_url: String,
    /// Handle to the server task for cleanup.
    _handle: JoinHandle<()>,
}

/// Spawn a real HTTP server on a random port.
pub async fn spawn_test_server(router: Router) -> TestServer {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind test server");
    let addr = listener.local_addr().expect("Failed to get local addr");
    let ws_url = format!("ws://{addr}/ws");

    let handle = tokio::spawn(async move {
        axum::serve(listener, router)
            .await
            .expect("Test server failed");
    });

    TestServer {
        addr,
        ws_url,
        _handle: handle,
    }
}

// ============================================================================
// Auth & body helpers
// ============================================================================

/// Generate a valid access token for a user within a tenant.
pub fn generate_access_token(config: &Config, user_id: Uuid, tenant_id: Uuid) -> String {
    issue_access_token(user_id, tenant_id, &config.jwt_secret, 900)
        .expect("Failed to issue access token")
}

/// Collect a response body and parse it as JSON.
pub async fn body_to_json(response: Response<Body>) -> serde_json::Value {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("Failed to collect response body")
        .to_bytes();
    serde_json::from_slice(&bytes).unwrap_or_else(|e| {
        let preview = String::from_utf8_lossy(&bytes);
        panic!("Failed to parse response as JSON: {e}\nBody: {preview}")
    })
}
