//! End-to-end request orchestration.
//!
//! One flow serves both transports: decode, resolve the session, route the
//! capability, acquire a backend lease, forward, reply. Gateway-originated
//! failures map onto the JSON-RPC error envelope; backend responses pass
//! through verbatim. Every request gets a correlation id that rides along
//! in a tracing span.

use std::sync::Arc;
use std::time::Duration;

use axum::http::HeaderMap;
use serde_json::Value;
use tracing::{Instrument, debug, info_span, warn};
use uuid::Uuid;

use crate::backend::BackendPool;
use crate::error::GatewayError;
use crate::protocol::{self, RpcRequest};
use crate::routing::CapabilityRouter;
use crate::session::{SessionInfo, SessionManager};

/// Base delay for forward retries; the n-th retry waits n times this.
const RETRY_BACKOFF_STEP: Duration = Duration::from_millis(200);
const RETRY_BACKOFF_CAP: Duration = Duration::from_secs(2);

/// What the HTTP transport should do with a handled request.
pub enum HttpOutcome {
    /// A JSON-RPC response body, plus a freshly minted session token when
    /// this request created its session.
    Reply {
        body: Value,
        session_token: Option<String>,
    },
    /// Notification accepted; no body.
    Accepted { session_token: Option<String> },
    /// No credentials resolved; the transport answers with HTTP 401.
    Unauthorized,
}

pub struct Pipeline {
    sessions: Arc<SessionManager>,
    router: CapabilityRouter,
    pool: Arc<BackendPool>,
    http: reqwest::Client,
    forward_timeout: Duration,
}

impl Pipeline {
    pub fn new(
        sessions: Arc<SessionManager>,
        router: CapabilityRouter,
        pool: Arc<BackendPool>,
        http: reqwest::Client,
        forward_timeout: Duration,
    ) -> Self {
        Self {
            sessions,
            router,
            pool,
            http,
            forward_timeout,
        }
    }

    /// Handle one `POST /mcp` body.
    pub async fn handle_http(&self, raw: &[u8], headers: &HeaderMap) -> HttpOutcome {
        let correlation_id = Uuid::new_v4();
        let span = info_span!("request", correlation_id = %correlation_id);

        async {
            let request = match protocol::decode_request(raw) {
                Ok(request) => request,
                Err(e) => {
                    debug!("rejected request: {e}");
                    return HttpOutcome::Reply {
                        body: e.to_response(Value::Null),
                        session_token: None,
                    };
                }
            };

            let (session, session_token) = match self.sessions.get_or_create(headers).await {
                Ok(resolved) => resolved,
                Err(GatewayError::Unauthenticated) => return HttpOutcome::Unauthorized,
                Err(e) => {
                    let id = request.id.clone().unwrap_or(Value::Null);
                    return HttpOutcome::Reply {
                        body: e.to_response(id),
                        session_token: None,
                    };
                }
            };

            match self.dispatch(&request, raw, &session).await {
                Some(body) => HttpOutcome::Reply {
                    body,
                    session_token,
                },
                None => HttpOutcome::Accepted { session_token },
            }
        }
        .instrument(span)
        .await
    }

    /// Handle one WebSocket frame for an already-established session.
    /// Returns the response frame, or `None` for notifications.
    pub async fn handle_frame(&self, raw: &[u8], session: &SessionInfo) -> Option<Value> {
        let correlation_id = Uuid::new_v4();
        let span = info_span!(
            "frame",
            correlation_id = %correlation_id,
            session_id = %session.id
        );

        async {
            self.sessions.touch(&session.id).await;

            let request = match protocol::decode_request(raw) {
                Ok(request) => request,
                Err(e) => {
                    debug!("rejected frame: {e}");
                    return Some(e.to_response(Value::Null));
                }
            };

            self.dispatch(&request, raw, session).await
        }
        .instrument(span)
        .await
    }

    /// Route, acquire, forward. `None` means "no response owed" (the request
    /// was a notification).
    async fn dispatch(
        &self,
        request: &RpcRequest,
        raw: &[u8],
        session: &SessionInfo,
    ) -> Option<Value> {
        let id = request.id.clone();
        let reply = |e: GatewayError| {
            if request.is_notification() {
                debug!("dropping error reply for notification: {e}");
                None
            } else {
                Some(e.to_response(id.clone().unwrap_or(Value::Null)))
            }
        };

        let capability = request.target.capability().to_string();
        let Some(backend_id) = self.router.resolve(&request.target) else {
            return reply(GatewayError::MethodNotFound(format!(
                "No server found for capability: {capability}"
            )));
        };
        let backend_id = backend_id.to_string();

        let max_retries = self
            .pool
            .get(&backend_id)
            .map(|b| b.max_retries)
            .unwrap_or(0);
        let attempts = if request.is_idempotent() {
            max_retries + 1
        } else {
            1
        };

        let mut last_error = String::new();
        for attempt in 1..=attempts {
            if attempt > 1 {
                let backoff = (RETRY_BACKOFF_STEP * (attempt - 1) as u32).min(RETRY_BACKOFF_CAP);
                tokio::time::sleep(backoff).await;
            }

            // A fresh lease per attempt: health may have changed while we
            // backed off.
            let Some(lease) = self.pool.acquire(&backend_id) else {
                return reply(GatewayError::Internal(format!(
                    "No healthy server instances available for: {backend_id}"
                )));
            };

            match self.forward_once(lease.backend(), raw, session).await {
                Ok(response) => {
                    if request.is_notification() {
                        return None;
                    }
                    return Some(response);
                }
                Err(e) => {
                    warn!(backend = %backend_id, attempt, "forward failed: {e}");
                    last_error = e;
                }
            }
        }

        reply(GatewayError::Internal(last_error))
    }

    /// One `POST {base_url}/mcp` with the exact request body and tenant
    /// headers, bounded by the forward timeout.
    async fn forward_once(
        &self,
        backend: &crate::backend::Backend,
        raw: &[u8],
        session: &SessionInfo,
    ) -> Result<Value, String> {
        let response = self
            .http
            .post(format!("{}/mcp", backend.base_url))
            .header("content-type", "application/json")
            .header("x-organization-id", &session.organization_id)
            .header(
                "x-organization-external-id",
                &session.organization_external_id,
            )
            .body(raw.to_vec())
            .timeout(self.forward_timeout)
            .send()
            .await
            .map_err(|e| e.to_string())?;

        let status = response.status();
        if !status.is_success() {
            return Err(format!("backend returned HTTP {status}"));
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| format!("invalid backend response: {e}"))
    }
}
