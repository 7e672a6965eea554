//! Gateway configuration from CLI flags and environment variables.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Well-known development API key; never valid in production.
pub const DEV_API_KEY: &str = "dev-api-key-12345";

/// The environment the gateway is running in. Production tightens the boot
/// checks and disables development-only affordances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Environment {
    #[value(alias = "prod")]
    Production,
    #[value(alias = "dev")]
    Development,
    #[value(alias = "test")]
    Testing,
}

impl Environment {
    pub fn is_production(&self) -> bool {
        matches!(self, Environment::Production)
    }

    /// Default health probe cadence: tighter in development.
    pub fn default_probe_interval(&self) -> Duration {
        match self {
            Environment::Production => Duration::from_secs(30),
            Environment::Development | Environment::Testing => Duration::from_secs(15),
        }
    }
}

#[derive(Parser, Debug, Clone)]
#[command(name = "mcp-gateway", about = "Multi-tenant gateway for MCP servers")]
pub struct GatewayConfig {
    #[clap(long, env = "GATEWAY_PORT", default_value = "8080")]
    pub port: u16,

    #[clap(long, env = "GATEWAY_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// Origins allowed by CORS, comma-separated. Must be non-empty in
    /// production.
    #[clap(long, env = "ALLOWED_ORIGINS", value_delimiter = ',')]
    pub allowed_origins: Vec<String>,

    /// Secret for session-token HMACs. At least 32 characters in production.
    #[clap(
        long,
        env = "JWT_SECRET",
        default_value = "insecure-dev-secret-rotate-before-deploy",
        hide_env_values = true
    )]
    pub jwt_secret: String,

    /// The gateway's own API key, accepted at the admission gate.
    #[clap(long, env = "MCP_API_KEY", default_value = DEV_API_KEY, hide_env_values = true)]
    pub mcp_api_key: String,

    /// Idle session lifetime, milliseconds.
    #[clap(long, env = "SESSION_TIMEOUT", default_value = "3600000")]
    pub session_timeout_ms: u64,

    #[clap(long, env = "MAX_CONCURRENT_SESSIONS", default_value = "100")]
    pub max_concurrent_sessions: usize,

    /// Token-bucket capacity per caller per minute.
    #[clap(long, env = "API_RATE_LIMIT", default_value = "100")]
    pub rate_limit_per_minute: u32,

    #[clap(
        long,
        env = "REQUIRE_API_KEY",
        default_value = "true",
        action = clap::ArgAction::Set
    )]
    pub require_api_key: bool,

    #[clap(
        long,
        env = "ENABLE_RATE_LIMIT",
        default_value = "true",
        action = clap::ArgAction::Set
    )]
    pub enable_rate_limit: bool,

    /// Request body cap, megabytes. Oversized bodies are rejected before
    /// JSON parsing.
    #[clap(long, env = "MAX_REQUEST_SIZE", default_value = "10")]
    pub max_request_size_mb: usize,

    #[clap(
        long,
        env = "CORS_CREDENTIALS",
        default_value = "false",
        action = clap::ArgAction::Set
    )]
    pub cors_credentials: bool,

    /// Emit hardening headers (nosniff, frame deny, referrer policy).
    #[clap(
        long,
        env = "SECURITY_HEADERS",
        default_value = "true",
        action = clap::ArgAction::Set
    )]
    pub security_headers: bool,

    #[clap(long, env = "NODE_ENV", default_value = "development")]
    pub environment: Environment,

    /// Backend map as inline JSON: `{"<id>": {"url": ..., "capabilities": [...]}}`.
    #[clap(long, env = "MCP_SERVERS")]
    pub mcp_servers: Option<String>,

    /// Path to a JSON file with the same backend map shape.
    #[clap(long, env = "MCP_SERVERS_FILE")]
    pub servers_file: Option<PathBuf>,

    /// Forward timeout per backend call, milliseconds.
    #[clap(long, env = "FORWARD_TIMEOUT", default_value = "15000")]
    pub forward_timeout_ms: u64,
}

impl GatewayConfig {
    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    pub fn forward_timeout(&self) -> Duration {
        Duration::from_millis(self.forward_timeout_ms)
    }

    pub fn max_request_size_bytes(&self) -> usize {
        self.max_request_size_mb * 1024 * 1024
    }

    /// Boot-time validation. Production refuses to start with the dev API
    /// key, a short token secret, or an open CORS policy.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.environment.is_production() {
            if self.mcp_api_key.trim().is_empty() || self.mcp_api_key == DEV_API_KEY {
                anyhow::bail!("MCP_API_KEY must be set to a non-default value in production");
            }
            if self.jwt_secret.len() < 32 {
                anyhow::bail!("JWT_SECRET must be at least 32 characters in production");
            }
            if self.allowed_origins.is_empty() {
                anyhow::bail!("ALLOWED_ORIGINS must not be empty in production");
            }
        }
        Ok(())
    }
}

/// One backend as configured, field names matching the JSON config surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendEntry {
    pub url: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, rename = "healthCheckInterval")]
    pub health_check_interval_ms: Option<u64>,
    #[serde(default, rename = "requiresAuth")]
    pub requires_auth: Option<bool>,
    #[serde(default, rename = "maxRetries")]
    pub max_retries: Option<usize>,
    #[serde(default, rename = "maxConnections")]
    pub max_connections: Option<usize>,

    // Tolerate extra fields so config written for newer gateways still loads.
    #[serde(flatten, default)]
    pub extra: HashMap<String, Value>,
}

/// Load the backend map: inline `MCP_SERVERS` JSON first, then the file.
pub fn load_backends(config: &GatewayConfig) -> anyhow::Result<HashMap<String, BackendEntry>> {
    let mut entries = HashMap::new();

    if let Some(raw) = &config.mcp_servers
        && !raw.trim().is_empty()
    {
        let parsed: HashMap<String, BackendEntry> = serde_json::from_str(raw)
            .map_err(|e| anyhow::anyhow!("Failed to parse MCP_SERVERS JSON: {e}"))?;
        entries.extend(parsed);
    }

    if entries.is_empty()
        && let Some(path) = &config.servers_file
    {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {e}", path.display()))?;
        let parsed: HashMap<String, BackendEntry> = serde_json::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("Failed to parse {}: {e}", path.display()))?;
        entries.extend(parsed);
    }

    if entries.is_empty() {
        anyhow::bail!("No backends configured. Set MCP_SERVERS or MCP_SERVERS_FILE.");
    }

    Ok(entries)
}
