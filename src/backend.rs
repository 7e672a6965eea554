//! Backend registry, health probing, and connection-budgeted hand-out.
//!
//! Each configured backend is one logical instance. A long-lived probe task
//! per backend drives the `Unknown → Healthy ↔ Unhealthy` state machine;
//! only edge transitions are logged. Dispatch goes through [`BackendPool::acquire`],
//! which hands out a [`BackendLease`] guard — the connection count is given
//! back on drop, on every exit path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::BackendEntry;

/// Probe timeout; a backend that cannot answer its health check in this
/// window counts as unhealthy.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Unknown,
    Healthy,
    Unhealthy,
}

struct ProbeState {
    health: Health,
    last_check: Option<DateTime<Utc>>,
}

/// One logical backend instance. Capabilities are fixed at registration.
pub struct Backend {
    pub id: String,
    pub base_url: String,
    pub capabilities: Vec<String>,
    pub max_connections: usize,
    pub max_retries: usize,
    probe_interval: Duration,
    state: Mutex<ProbeState>,
    active: AtomicUsize,
}

impl Backend {
    pub fn is_healthy(&self) -> bool {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).health == Health::Healthy
    }

    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Record a probe outcome. Logs only when the state actually changes.
    /// Health changes happen here and nowhere else.
    pub(crate) fn record_probe(&self, healthy: bool) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let next = if healthy { Health::Healthy } else { Health::Unhealthy };
        if state.health != next {
            match next {
                Health::Healthy => info!(backend = %self.id, "backend healthy"),
                Health::Unhealthy => warn!(backend = %self.id, "backend unhealthy"),
                Health::Unknown => {}
            }
            state.health = next;
        }
        state.last_check = Some(Utc::now());
    }

    /// Give a connection slot back, clamped at zero.
    fn release(&self) {
        let _ = self
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                Some(v.saturating_sub(1))
            });
    }
}

/// Holds one of a backend's connection slots; released on drop.
#[must_use]
pub struct BackendLease {
    backend: Arc<Backend>,
}

impl BackendLease {
    pub fn backend(&self) -> &Backend {
        &self.backend
    }
}

impl Drop for BackendLease {
    fn drop(&mut self) {
        self.backend.release();
    }
}

pub struct BackendPool {
    backends: HashMap<String, Arc<Backend>>,
    http: reqwest::Client,
}

impl BackendPool {
    /// Build the pool from configuration. `default_probe_interval` applies
    /// where a backend does not override it.
    pub fn from_config(
        entries: &HashMap<String, BackendEntry>,
        http: reqwest::Client,
        default_probe_interval: Duration,
    ) -> anyhow::Result<Self> {
        let mut backends = HashMap::new();
        for (id, entry) in entries {
            let base_url = entry.url.trim_end_matches('/').to_string();
            url::Url::parse(&base_url)
                .map_err(|e| anyhow::anyhow!("backend '{id}' has an invalid url: {e}"))?;
            backends.insert(
                id.clone(),
                Arc::new(Backend {
                    id: id.clone(),
                    base_url,
                    capabilities: entry.capabilities.clone(),
                    max_connections: entry.max_connections.unwrap_or(32),
                    max_retries: entry.max_retries.unwrap_or(0),
                    probe_interval: entry
                        .health_check_interval_ms
                        .map(Duration::from_millis)
                        .unwrap_or(default_probe_interval),
                    state: Mutex::new(ProbeState {
                        health: Health::Unknown,
                        last_check: None,
                    }),
                    active: AtomicUsize::new(0),
                }),
            );
        }
        Ok(Self { backends, http })
    }

    pub fn get(&self, id: &str) -> Option<&Arc<Backend>> {
        self.backends.get(id)
    }

    pub fn backends(&self) -> &HashMap<String, Arc<Backend>> {
        &self.backends
    }

    /// Hand out a connection slot for a backend, or `None` when it is
    /// unknown, unhealthy, or at its connection budget. No side effects on
    /// the `None` path.
    pub fn acquire(&self, id: &str) -> Option<BackendLease> {
        let backend = self.backends.get(id)?;
        if !backend.is_healthy() {
            return None;
        }

        let mut current = backend.active.load(Ordering::Acquire);
        loop {
            if current >= backend.max_connections {
                return None;
            }
            match backend.active.compare_exchange(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Some(BackendLease {
                        backend: Arc::clone(backend),
                    });
                }
                Err(observed) => current = observed,
            }
        }
    }

    /// Run one health probe against a backend: any 2xx from
    /// `GET {base_url}/health` within the timeout counts as healthy.
    pub async fn probe_once(&self, backend: &Backend) {
        let url = format!("{}/health", backend.base_url);
        let healthy = match self.http.get(&url).timeout(PROBE_TIMEOUT).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!(backend = %backend.id, "health probe failed: {e}");
                false
            }
        };
        backend.record_probe(healthy);
    }

    /// Spawn one independent probe loop per backend. Probes never block
    /// request handling and stop when `cancel` fires.
    pub fn spawn_probes(self: &Arc<Self>, cancel: CancellationToken) {
        for backend in self.backends.values() {
            let pool = Arc::clone(self);
            let backend = Arc::clone(backend);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(backend.probe_interval);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = interval.tick() => pool.probe_once(&backend).await,
                    }
                }
            });
        }
    }

    /// Composite health view for `GET /health`.
    pub fn snapshot(&self) -> Value {
        let mut servers = serde_json::Map::new();
        let mut healthy_count = 0usize;

        for (id, backend) in &self.backends {
            let state = backend.state.lock().unwrap_or_else(|e| e.into_inner());
            let healthy = state.health == Health::Healthy;
            if healthy {
                healthy_count += 1;
            }
            servers.insert(
                id.clone(),
                json!({
                    "instances": 1,
                    "healthy": if healthy { 1 } else { 0 },
                    "capabilities": backend.capabilities,
                    "lastCheck": state.last_check.map(|t| t.to_rfc3339()),
                }),
            );
        }

        let status = if self.backends.is_empty() || healthy_count == self.backends.len() {
            "ok"
        } else if healthy_count > 0 {
            "degraded"
        } else {
            "unhealthy"
        };

        json!({
            "status": status,
            "timestamp": Utc::now().to_rfc3339(),
            "servers": servers,
        })
    }
}
