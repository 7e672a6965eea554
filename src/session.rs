//! Session table, opaque session tokens, and WebSocket binding.
//!
//! A session records one authenticated caller and the organization resolved
//! at creation time; the context never changes for the session's lifetime.
//! Tokens handed to callers are gateway-local HMAC values — deliberately not
//! interoperable with identity-provider JWTs — and validate in constant
//! time. A sweeper task expires idle sessions.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::Message;
use axum::http::HeaderMap;
use chrono::Utc;
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::Sha256;
use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::{OrgResolver, OrganizationContext};
use crate::error::GatewayError;

type HmacSha256 = Hmac<Sha256>;

const TOKEN_PREFIX: &str = "mgs1";

/// How often the sweeper looks for idle sessions.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Http,
    WebSocket,
}

struct Session {
    user_id: Option<String>,
    organization_id: String,
    organization_external_id: String,
    transport: TransportKind,
    created_at: Instant,
    last_activity_at: Instant,
    // The session owns the write half of its WebSocket; the socket task only
    // ever holds the session id.
    ws: Option<mpsc::UnboundedSender<Message>>,
}

/// Immutable snapshot of a session, handed to the pipeline.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: String,
    pub user_id: Option<String>,
    pub organization_id: String,
    pub organization_external_id: String,
    pub transport: TransportKind,
}

pub struct SessionManager {
    sessions: RwLock<HashMap<String, Session>>,
    resolver: OrgResolver,
    token_key: Vec<u8>,
    max_sessions: usize,
    timeout: Duration,
}

impl SessionManager {
    pub fn new(resolver: OrgResolver, secret: &str, max_sessions: usize, timeout: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            resolver,
            token_key: secret.as_bytes().to_vec(),
            max_sessions,
            timeout,
        }
    }

    /// Resolve the session for an HTTP request.
    ///
    /// A bearer that validates as one of our session tokens refreshes and
    /// returns the existing session. Otherwise the resolver must produce an
    /// organization context and a fresh session is created; the new token is
    /// returned alongside so the transport can hand it to the caller.
    pub async fn get_or_create(
        &self,
        headers: &HeaderMap,
    ) -> Result<(SessionInfo, Option<String>), GatewayError> {
        let bearer = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));

        if let Some(token) = bearer
            && let Some(session_id) = self.session_id_from_token(token)
        {
            if let Some(info) = self.touch(&session_id).await {
                return Ok((info, None));
            }
            // Token was once valid but the session is gone; fall through to
            // credential resolution.
            debug!("session token references a removed session");
        }

        let ctx = self
            .resolver
            .resolve(headers)
            .await
            .ok_or(GatewayError::Unauthenticated)?;
        let info = self.create(ctx, TransportKind::Http).await?;
        let token = self.generate_token(&info.id);
        Ok((info, Some(token)))
    }

    /// Resolve or create the session backing a WebSocket connection. Existing
    /// sessions (via session token) are adopted; their transport flips to
    /// WebSocket when the socket attaches.
    pub async fn session_for_websocket(
        &self,
        headers: &HeaderMap,
    ) -> Result<SessionInfo, GatewayError> {
        let bearer = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));

        if let Some(token) = bearer
            && let Some(session_id) = self.session_id_from_token(token)
            && let Some(info) = self.touch(&session_id).await
        {
            return Ok(info);
        }

        let ctx = self
            .resolver
            .resolve(headers)
            .await
            .ok_or(GatewayError::Unauthenticated)?;
        self.create_websocket_session(ctx).await
    }

    pub async fn create_websocket_session(
        &self,
        ctx: OrganizationContext,
    ) -> Result<SessionInfo, GatewayError> {
        self.create(ctx, TransportKind::WebSocket).await
    }

    async fn create(
        &self,
        ctx: OrganizationContext,
        transport: TransportKind,
    ) -> Result<SessionInfo, GatewayError> {
        let mut sessions = self.sessions.write().await;
        if sessions.len() >= self.max_sessions {
            warn!(limit = self.max_sessions, "session quota exhausted");
            return Err(GatewayError::SessionQuota);
        }

        let id = generate_session_id();
        let now = Instant::now();
        sessions.insert(
            id.clone(),
            Session {
                user_id: ctx.user_id.clone(),
                organization_id: ctx.organization_id.clone(),
                organization_external_id: ctx.organization_external_id.clone(),
                transport,
                created_at: now,
                last_activity_at: now,
                ws: None,
            },
        );
        debug!(session_id = %id, organization = %ctx.organization_id, "session created");

        Ok(SessionInfo {
            id,
            user_id: ctx.user_id,
            organization_id: ctx.organization_id,
            organization_external_id: ctx.organization_external_id,
            transport,
        })
    }

    /// Bind a live WebSocket sender to a session.
    pub async fn attach_websocket(
        &self,
        session_id: &str,
        tx: mpsc::UnboundedSender<Message>,
    ) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(session_id) {
            Some(session) => {
                session.transport = TransportKind::WebSocket;
                session.ws = Some(tx);
                true
            }
            None => false,
        }
    }

    /// Refresh activity and return a snapshot, if the session exists.
    pub async fn touch(&self, session_id: &str) -> Option<SessionInfo> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(session_id)?;
        session.last_activity_at = session.last_activity_at.max(Instant::now());
        Some(snapshot(session_id, session))
    }

    pub async fn get(&self, session_id: &str) -> Option<SessionInfo> {
        let sessions = self.sessions.read().await;
        sessions.get(session_id).map(|s| snapshot(session_id, s))
    }

    /// Remove a session and close any bound WebSocket.
    pub async fn remove(&self, session_id: &str) {
        let removed = self.sessions.write().await.remove(session_id);
        if let Some(session) = removed {
            if let Some(ws) = session.ws {
                let _ = ws.send(Message::Close(None));
            }
            debug!(%session_id, "session removed");
        }
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Drop sessions idle longer than the configured timeout.
    pub async fn sweep(&self) {
        let now = Instant::now();
        let expired: Vec<(String, Duration)> = {
            let sessions = self.sessions.read().await;
            sessions
                .iter()
                .filter(|(_, s)| now.duration_since(s.last_activity_at) > self.timeout)
                .map(|(id, s)| (id.clone(), now.duration_since(s.created_at)))
                .collect()
        };
        for (id, age) in expired {
            info!(session_id = %id, age_secs = age.as_secs(), "session expired");
            self.remove(&id).await;
        }
    }

    /// Periodic sweep task; stops when `cancel` fires.
    pub fn spawn_sweeper(self: &Arc<Self>, cancel: CancellationToken) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => manager.sweep().await,
                }
            }
        });
    }

    /// Issue an opaque token for a session: `mgs1.<sid>.<issued-at>.<hmac>`,
    /// keyed by the gateway secret.
    pub fn generate_token(&self, session_id: &str) -> String {
        let issued_at = Utc::now().timestamp();
        let tag = self.token_mac(session_id, issued_at);
        format!("{TOKEN_PREFIX}.{session_id}.{issued_at}.{}", hex::encode(tag))
    }

    /// Validate a token's HMAC (constant-time) and return the session id it
    /// names. Existence is the caller's concern: a replayed token for a
    /// removed session validates here but finds no session.
    pub fn session_id_from_token(&self, token: &str) -> Option<String> {
        let mut parts = token.split('.');
        let (prefix, session_id, issued_at, tag) = (
            parts.next()?,
            parts.next()?,
            parts.next()?,
            parts.next()?,
        );
        if prefix != TOKEN_PREFIX || parts.next().is_some() {
            return None;
        }
        let issued_at: i64 = issued_at.parse().ok()?;
        let tag = hex::decode(tag).ok()?;

        let mut mac = HmacSha256::new_from_slice(&self.token_key).ok()?;
        mac.update(format!("{session_id}.{issued_at}").as_bytes());
        mac.verify_slice(&tag).ok()?;
        Some(session_id.to_string())
    }

    fn token_mac(&self, session_id: &str, issued_at: i64) -> Vec<u8> {
        let mut mac = HmacSha256::new_from_slice(&self.token_key)
            .expect("HMAC accepts keys of any length");
        mac.update(format!("{session_id}.{issued_at}").as_bytes());
        mac.finalize().into_bytes().to_vec()
    }
}

fn snapshot(id: &str, session: &Session) -> SessionInfo {
    SessionInfo {
        id: id.to_string(),
        user_id: session.user_id.clone(),
        organization_id: session.organization_id.clone(),
        organization_external_id: session.organization_external_id.clone(),
        transport: session.transport,
    }
}

/// 32 random bytes, hex-encoded: unguessable and collision-free in practice.
fn generate_session_id() -> String {
    let mut rng = rand::rng();
    let bytes: [u8; 32] = rng.random();
    hex::encode(bytes)
}
