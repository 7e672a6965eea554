use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use mcp_gateway::auth::{MemoryOrganizationStore, OrgResolver};
use mcp_gateway::backend::BackendPool;
use mcp_gateway::config::{self, GatewayConfig};
use mcp_gateway::gateway::admission::{Admission, RateLimiter};
use mcp_gateway::gateway::{self, AppState};
use mcp_gateway::pipeline::Pipeline;
use mcp_gateway::routing::CapabilityRouter;
use mcp_gateway::session::SessionManager;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("mcp_gateway=info,tower_http=warn")),
        )
        .init();

    // Any failure from here to `serve` is a boot-time configuration error:
    // log it and exit(1), which bubbling the Err out of main does for us.
    let config = GatewayConfig::parse();
    config.validate()?;

    let backends = config::load_backends(&config)?;
    info!(
        environment = ?config.environment,
        backends = backends.len(),
        "starting mcp-gateway"
    );

    let http = reqwest::Client::new();
    let pool = Arc::new(BackendPool::from_config(
        &backends,
        http.clone(),
        config.environment.default_probe_interval(),
    )?);
    let router = CapabilityRouter::build(pool.backends())?;
    info!(capabilities = router.len(), "capability map built");

    // The organization store is the admin database's concern; the gateway
    // sees only this narrow interface. The in-memory implementation backs
    // development deployments; `x-simulate-organization` fills the gaps.
    let store = Arc::new(MemoryOrganizationStore::default());
    if !config.environment.is_production() {
        // Bootstrap tenant so the configured API key works out of the box.
        store
            .add_organization(mcp_gateway::auth::OrganizationRecord {
                id: "default".to_string(),
                external_id: "default".to_string(),
                name: "Default Organization".to_string(),
            })
            .await;
        store
            .add_api_key(
                &config.mcp_api_key,
                mcp_gateway::auth::ApiKeyRecord {
                    id: "default-key".to_string(),
                    key_hash: String::new(),
                    organization_id: "default".to_string(),
                    organization_external_id: "default".to_string(),
                    role: Some("admin".to_string()),
                    expires_at: None,
                    deleted: false,
                    last_used_at: None,
                },
            )
            .await;
    }
    let resolver = OrgResolver::new(store, !config.environment.is_production());
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
        config.forward_timeout(),
    ));

    let admission = Arc::new(Admission {
        require_api_key: config.require_api_key,
        production: config.environment.is_production(),
        security_headers: config.security_headers,
        rate_limiter: config.enable_rate_limit.then(|| {
            RateLimiter::new(
                config.rate_limit_per_minute,
                std::time::Duration::from_secs(60),
            )
        }),
    });

    let shutdown = CancellationToken::new();
    pool.spawn_probes(shutdown.clone());
    sessions.spawn_sweeper(shutdown.clone());

    let state = AppState {
        pipeline,
        sessions,
        pool,
        admission,
        shutdown,
    };

    gateway::serve(state, &config).await
}
