//! Shared fixtures for gateway integration tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum_test::TestServer;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use mcp_gateway::auth::{ApiKeyRecord, MemoryOrganizationStore, OrgResolver, OrganizationRecord};
use mcp_gateway::backend::BackendPool;
use mcp_gateway::config::{BackendEntry, GatewayConfig};
use mcp_gateway::gateway::admission::{Admission, RateLimiter};
use mcp_gateway::gateway::{AppState, create_app};
use mcp_gateway::pipeline::Pipeline;
use mcp_gateway::routing::CapabilityRouter;
use mcp_gateway::session::SessionManager;

/// The tenant API key every test gateway knows about.
pub const TENANT_KEY: &str = "sk-test-tenant";

// Not every test crate touches every field; the WebSocket tests rebuild the
// app from `config` on a real listener instead of using `server`.
#[allow(dead_code)]
pub struct TestGateway {
    pub server: TestServer,
    pub state: AppState,
    pub config: GatewayConfig,
}

pub struct GatewayBuilder {
    pub backends: HashMap<String, BackendEntry>,
    pub max_sessions: usize,
    pub rate_limit: Option<u32>,
    pub max_request_size_mb: usize,
    pub require_api_key: bool,
}

impl Default for GatewayBuilder {
    fn default() -> Self {
        Self {
            backends: HashMap::new(),
            max_sessions: 100,
            rate_limit: None,
            max_request_size_mb: 10,
            require_api_key: true,
        }
    }
}

impl GatewayBuilder {
    pub fn with_backend(mut self, id: &str, url: &str, capabilities: &[&str]) -> Self {
        self.backends.insert(
            id.to_string(),
            BackendEntry {
                url: url.to_string(),
                capabilities: capabilities.iter().map(|s| s.to_string()).collect(),
                description: None,
                health_check_interval_ms: None,
                requires_auth: None,
                max_retries: None,
                max_connections: None,
                extra: HashMap::new(),
            },
        );
        self
    }

    /// Build the full app state and run each backend's health probe once so
    /// routing sees current health.
    pub async fn build(self) -> TestGateway {
        let mut config = GatewayConfig::parse_from(["mcp-gateway"]);
        config.max_concurrent_sessions = self.max_sessions;
        config.max_request_size_mb = self.max_request_size_mb;
        config.require_api_key = self.require_api_key;

        let store = Arc::new(MemoryOrganizationStore::default());
        store
            .add_organization(OrganizationRecord {
                id: "org-1".to_string(),
                external_id: "ext-1".to_string(),
                name: "Test Org".to_string(),
            })
            .await;
        store
            .add_api_key(
                TENANT_KEY,
                ApiKeyRecord {
                    id: "key-1".to_string(),
                    key_hash: String::new(),
                    organization_id: "org-1".to_string(),
                    organization_external_id: "ext-1".to_string(),
                    role: Some("member".to_string()),
                    expires_at: None,
                    deleted: false,
                    last_used_at: None,
                },
            )
            .await;

        let http = reqwest::Client::new();
        let pool = Arc::new(
            BackendPool::from_config(&self.backends, http.clone(), Duration::from_secs(15))
                .unwrap(),
        );
        for backend in pool.backends().values() {
            pool.probe_once(backend).await;
        }

        let router = CapabilityRouter::build(pool.backends()).unwrap();
        let resolver = OrgResolver::new(store, true);
        let sessions = Arc::new(SessionManager::new(
            resolver,
            &config.jwt_secret,
            config.max_concurrent_sessions,
            config.session_timeout(),
        ));
        let pipeline = Arc::new(Pipeline::new(
            Arc::clone(&sessions),
            router,
            Arc::clone(&pool),
            http,
            Duration::from_secs(2),
        ));

        let admission = Arc::new(Admission {
            require_api_key: config.require_api_key,
            production: false,
            security_headers: config.security_headers,
            rate_limiter: self
                .rate_limit
                .map(|limit| RateLimiter::new(limit, Duration::from_secs(60))),
        });

        let state = AppState {
            pipeline,
            sessions,
            pool,
            admission,
            shutdown: CancellationToken::new(),
        };

        let server = TestServer::new(create_app(state.clone(), &config)).unwrap();
        TestGateway {
            server,
            state,
            config,
        }
    }
}

/// A fake MCP backend: `GET /health` answers with `health_status`, and any
/// `POST /mcp` is echoed back through `respond_with`.
pub async fn mock_backend(health_status: u16) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(health_status))
        .mount(&server)
        .await;
    server
}
