//! Caller authentication and tenant resolution.
//!
//! Credentials come in as headers; what comes out is an
//! [`OrganizationContext`] or nothing. The resolver never fails: a request
//! with no credentials yields `None`, a credential that cannot be resolved
//! yields `None` plus a warning, and the caller decides policy.
//!
//! Bearer tokens are identity-provider JWTs. The IdP has already verified
//! the caller; the gateway only decodes the claims and maps the external
//! organization id onto an internal record via [`OrganizationStore`].
//! Session tokens issued by the gateway are a different, opaque format and
//! are never resolved here.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderName};
use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::{debug, warn};

static AUTHORIZATION: HeaderName = HeaderName::from_static("authorization");
static X_API_KEY: HeaderName = HeaderName::from_static("x-api-key");
static X_SIMULATE_ORGANIZATION: HeaderName = HeaderName::from_static("x-simulate-organization");

/// Tenant context attached to a session. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrganizationContext {
    pub organization_id: String,
    pub organization_external_id: String,
    pub user_id: Option<String>,
    pub role: Option<String>,
}

/// An organization row as the persistence layer exposes it.
#[derive(Debug, Clone)]
pub struct OrganizationRecord {
    pub id: String,
    pub external_id: String,
    pub name: String,
}

/// An API-key row. Keys are stored hashed; the gateway never sees plaintext
/// keys at rest.
#[derive(Debug, Clone)]
pub struct ApiKeyRecord {
    pub id: String,
    pub key_hash: String,
    pub organization_id: String,
    pub organization_external_id: String,
    pub role: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub deleted: bool,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl ApiKeyRecord {
    fn is_usable(&self, now: DateTime<Utc>) -> bool {
        !self.deleted && self.expires_at.is_none_or(|exp| exp > now)
    }
}

/// The narrow interface the gateway needs from the organization database.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OrganizationStore: Send + Sync {
    async fn find_org_by_external_id(
        &self,
        external_id: &str,
    ) -> anyhow::Result<Option<OrganizationRecord>>;

    async fn find_api_key_by_hash(
        &self,
        key_hash: &str,
    ) -> anyhow::Result<Option<ApiKeyRecord>>;

    async fn touch_api_key(&self, key_id: &str) -> anyhow::Result<()>;
}

/// SHA-256 hex digest of a plaintext API key, the form keys are stored in.
pub fn hash_api_key(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

/// In-memory [`OrganizationStore`] for development and tests.
#[derive(Default)]
pub struct MemoryOrganizationStore {
    inner: RwLock<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    orgs: HashMap<String, OrganizationRecord>,
    keys: HashMap<String, ApiKeyRecord>,
}

impl MemoryOrganizationStore {
    pub async fn add_organization(&self, record: OrganizationRecord) {
        let mut inner = self.inner.write().await;
        inner.orgs.insert(record.external_id.clone(), record);
    }

    /// Register a plaintext key for an organization; the stored record holds
    /// only the hash.
    pub async fn add_api_key(&self, plaintext: &str, record: ApiKeyRecord) {
        let mut inner = self.inner.write().await;
        inner.keys.insert(
            hash_api_key(plaintext),
            ApiKeyRecord {
                key_hash: hash_api_key(plaintext),
                ..record
            },
        );
    }
}

#[async_trait]
impl OrganizationStore for MemoryOrganizationStore {
    async fn find_org_by_external_id(
        &self,
        external_id: &str,
    ) -> anyhow::Result<Option<OrganizationRecord>> {
        Ok(self.inner.read().await.orgs.get(external_id).cloned())
    }

    async fn find_api_key_by_hash(
        &self,
        key_hash: &str,
    ) -> anyhow::Result<Option<ApiKeyRecord>> {
        Ok(self.inner.read().await.keys.get(key_hash).cloned())
    }

    async fn touch_api_key(&self, key_id: &str) -> anyhow::Result<()> {
        let mut inner = self.inner.write().await;
        if let Some(record) = inner.keys.values_mut().find(|k| k.id == key_id) {
            record.last_used_at = Some(Utc::now());
        }
        Ok(())
    }
}

/// Resolves request headers to an [`OrganizationContext`].
pub struct OrgResolver {
    store: Arc<dyn OrganizationStore>,
    allow_simulated: bool,
}

impl OrgResolver {
    /// `allow_simulated` honours the `x-simulate-organization` header and
    /// must be false in production.
    pub fn new(store: Arc<dyn OrganizationStore>, allow_simulated: bool) -> Self {
        Self {
            store,
            allow_simulated,
        }
    }

    /// Resolution order, first success wins: bearer JWT, API key, simulated
    /// organization (dev only).
    pub async fn resolve(&self, headers: &HeaderMap) -> Option<OrganizationContext> {
        let bearer = headers
            .get(&AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));

        if let Some(token) = bearer {
            match self.resolve_bearer(token).await {
                Some(ctx) => return Some(ctx),
                None => warn!("bearer token did not resolve to an organization"),
            }
        }

        if let Some(key) = headers.get(&X_API_KEY).and_then(|v| v.to_str().ok()) {
            match self.resolve_api_key(key).await {
                Some(ctx) => return Some(ctx),
                None => warn!("API key did not resolve to an organization"),
            }
        }

        if let Some(external_id) = headers
            .get(&X_SIMULATE_ORGANIZATION)
            .and_then(|v| v.to_str().ok())
        {
            if self.allow_simulated {
                return Some(self.resolve_simulated(external_id).await);
            }
            warn!("x-simulate-organization ignored outside development");
        }

        None
    }

    async fn resolve_bearer(&self, token: &str) -> Option<OrganizationContext> {
        let claims = decode_idp_claims(token)?;
        let external_id = claims
            .get("org_id")
            .or_else(|| claims.get("organization_id"))
            .and_then(|v| v.as_str())?;
        let user_id = claims
            .get("sub")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        let role = claims
            .get("role")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        let org = self
            .store
            .find_org_by_external_id(external_id)
            .await
            .map_err(|e| warn!("organization lookup failed: {e}"))
            .ok()??;

        Some(OrganizationContext {
            organization_id: org.id,
            organization_external_id: org.external_id,
            user_id,
            role,
        })
    }

    async fn resolve_api_key(&self, key: &str) -> Option<OrganizationContext> {
        let record = self
            .store
            .find_api_key_by_hash(&hash_api_key(key))
            .await
            .map_err(|e| warn!("API key lookup failed: {e}"))
            .ok()??;

        if !record.is_usable(Utc::now()) {
            debug!(key_id = %record.id, "API key expired or deleted");
            return None;
        }

        if let Err(e) = self.store.touch_api_key(&record.id).await {
            // Usage tracking is best-effort; the key itself already checked out.
            warn!(key_id = %record.id, "failed to update API key usage: {e}");
        }

        Some(OrganizationContext {
            organization_id: record.organization_id,
            organization_external_id: record.organization_external_id,
            user_id: None,
            role: record.role,
        })
    }

    async fn resolve_simulated(&self, external_id: &str) -> OrganizationContext {
        // Known organizations resolve to their real record; unknown ids get
        // an ad-hoc context so development works without seeding the store.
        match self.store.find_org_by_external_id(external_id).await {
            Ok(Some(org)) => OrganizationContext {
                organization_id: org.id,
                organization_external_id: org.external_id,
                user_id: None,
                role: None,
            },
            _ => {
                debug!(%external_id, "simulating unregistered organization");
                OrganizationContext {
                    organization_id: external_id.to_string(),
                    organization_external_id: external_id.to_string(),
                    user_id: None,
                    role: None,
                }
            }
        }
    }
}

/// Decode identity-provider JWT claims without verifying the signature. The
/// IdP signs and the admin layer trusts it; the gateway only needs the
/// claims to look up the organization.
fn decode_idp_claims(token: &str) -> Option<Value> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();

    match jsonwebtoken::decode::<Value>(token, &DecodingKey::from_secret(&[]), &validation) {
        Ok(data) => Some(data.claims),
        Err(e) => {
            debug!("bearer token is not a decodable JWT: {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use chrono::Duration;
    use jsonwebtoken::{EncodingKey, Header};
    use serde_json::json;

    fn idp_token(claims: Value) -> String {
        jsonwebtoken::encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(b"whatever"),
        )
        .unwrap()
    }

    fn key_record(id: &str) -> ApiKeyRecord {
        ApiKeyRecord {
            id: id.to_string(),
            key_hash: String::new(),
            organization_id: "org-1".to_string(),
            organization_external_id: "ext-1".to_string(),
            role: Some("member".to_string()),
            expires_at: None,
            deleted: false,
            last_used_at: None,
        }
    }

    async fn seeded_store() -> Arc<MemoryOrganizationStore> {
        let store = Arc::new(MemoryOrganizationStore::default());
        store
            .add_organization(OrganizationRecord {
                id: "org-1".to_string(),
                external_id: "ext-1".to_string(),
                name: "Acme".to_string(),
            })
            .await;
        store.add_api_key("sk-live-acme", key_record("key-1")).await;
        store
    }

    #[tokio::test]
    async fn bearer_jwt_resolves_org_and_user() {
        let resolver = OrgResolver::new(seeded_store().await, false);
        let mut headers = HeaderMap::new();
        let token = idp_token(json!({"sub": "user-9", "org_id": "ext-1"}));
        headers.insert(
            &AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
        );

        let ctx = resolver.resolve(&headers).await.unwrap();
        assert_eq!(ctx.organization_id, "org-1");
        assert_eq!(ctx.organization_external_id, "ext-1");
        assert_eq!(ctx.user_id.as_deref(), Some("user-9"));
    }

    #[tokio::test]
    async fn api_key_resolves_and_updates_usage() {
        let store = seeded_store().await;
        let resolver = OrgResolver::new(store.clone(), false);
        let mut headers = HeaderMap::new();
        headers.insert(&X_API_KEY, HeaderValue::from_static("sk-live-acme"));

        let ctx = resolver.resolve(&headers).await.unwrap();
        assert_eq!(ctx.organization_id, "org-1");
        assert_eq!(ctx.role.as_deref(), Some("member"));

        let record = store
            .find_api_key_by_hash(&hash_api_key("sk-live-acme"))
            .await
            .unwrap()
            .unwrap();
        assert!(record.last_used_at.is_some());
    }

    #[tokio::test]
    async fn expired_or_deleted_keys_do_not_resolve() {
        let store = Arc::new(MemoryOrganizationStore::default());
        store
            .add_api_key(
                "sk-expired",
                ApiKeyRecord {
                    expires_at: Some(Utc::now() - Duration::hours(1)),
                    ..key_record("key-old")
                },
            )
            .await;
        store
            .add_api_key(
                "sk-deleted",
                ApiKeyRecord {
                    deleted: true,
                    ..key_record("key-gone")
                },
            )
            .await;
        let resolver = OrgResolver::new(store, false);

        for key in ["sk-expired", "sk-deleted"] {
            let mut headers = HeaderMap::new();
            headers.insert(&X_API_KEY, HeaderValue::from_str(key).unwrap());
            assert!(resolver.resolve(&headers).await.is_none());
        }
    }

    #[tokio::test]
    async fn no_credentials_resolve_to_nothing() {
        let resolver = OrgResolver::new(seeded_store().await, false);
        assert!(resolver.resolve(&HeaderMap::new()).await.is_none());
    }

    #[tokio::test]
    async fn simulated_org_requires_dev_mode() {
        let store = seeded_store().await;
        let mut headers = HeaderMap::new();
        headers.insert(&X_SIMULATE_ORGANIZATION, HeaderValue::from_static("ext-1"));

        let prod = OrgResolver::new(store.clone(), false);
        assert!(prod.resolve(&headers).await.is_none());

        let dev = OrgResolver::new(store, true);
        let ctx = dev.resolve(&headers).await.unwrap();
        assert_eq!(ctx.organization_id, "org-1");
    }

    #[tokio::test]
    async fn valid_key_touches_usage_exactly_once() {
        let mut store = MockOrganizationStore::new();
        let mut record = key_record("key-7");
        record.key_hash = hash_api_key("sk-mocked");
        let expected_hash = hash_api_key("sk-mocked");
        store
            .expect_find_api_key_by_hash()
            .withf(move |hash| hash == expected_hash)
            .times(1)
            .returning(move |_| Ok(Some(record.clone())));
        store
            .expect_touch_api_key()
            .withf(|id| id == "key-7")
            .times(1)
            .returning(|_| Ok(()));

        let resolver = OrgResolver::new(Arc::new(store), false);
        let mut headers = HeaderMap::new();
        headers.insert(&X_API_KEY, HeaderValue::from_static("sk-mocked"));
        assert!(resolver.resolve(&headers).await.is_some());
    }
}
