//! Dual-mode authentication middleware: credential extraction, a
//! configurable skip list, bearer-preferred fallback to API key, and
//! protocol-shaped error bodies. Implemented as a hand-rolled
//! `tower::{Layer, Service}` pair rather than `axum::middleware::from_fn`,
//! because downstream extractors need a typed `AuthContext` inserted into
//! request extensions and the layer needs `poll_ready` passthrough.

use std::{
    collections::{HashMap, HashSet},
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context as TaskContext, Poll},
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    body::Body,
    http::{Method, Request, Response, StatusCode, header::HeaderMap},
};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use parking_lot::RwLock;
use serde::Deserialize;
use tower::{Layer, Service};

use crate::models::{AuthContext, AuthMethod};

#[derive(Clone)]
pub struct ApiKeyEntry {
    pub identity: String,
    pub permissions: HashSet<String>,
}

#[derive(Deserialize)]
struct RawApiKeyEntry {
    identity: String,
    #[serde(default)]
    permissions: HashSet<String>,
}

/// Loads the `API_KEY_TABLE_PATH` JSON file: `{ "<api-key>": {"identity":
/// "...", "permissions": ["..."]} }`. Absent entries' `permissions`
/// default to empty, which denies every scoped operation rather than
/// granting `*` — an omission in the table is a misconfiguration, not an
/// admin grant.
pub fn load_api_key_table(path: &str) -> anyhow::Result<HashMap<String, ApiKeyEntry>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading API key table at {path}"))?;
    let parsed: HashMap<String, RawApiKeyEntry> =
        serde_json::from_str(&raw).with_context(|| format!("parsing API key table at {path}"))?;
    Ok(parsed
        .into_iter()
        .map(|(key, entry)| {
            (
                key,
                ApiKeyEntry {
                    identity: entry.identity,
                    permissions: entry.permissions,
                },
            )
        })
        .collect())
}

#[derive(Clone)]
pub struct AuthConfig {
    pub api_keys: Arc<HashMap<String, ApiKeyEntry>>,
    pub oidc_issuer: Option<String>,
    pub oidc_audience: Option<String>,
    pub jwks_url: Option<String>,
    pub jwks_cache_ttl: Duration,
    /// `(method, exact path)` pairs that bypass authentication entirely.
    pub skip_list: Vec<(Method, &'static str)>,
}

impl AuthConfig {
    pub fn default_skip_list() -> Vec<(Method, &'static str)> {
        vec![
            (Method::GET, "/health"),
            (Method::GET, "/healthz"),
            (Method::GET, "/metrics"),
            (Method::GET, "/.well-known/kubently-auth"),
            (Method::GET, "/.well-known/openid-configuration"),
            (Method::GET, "/jwks"),
            (Method::GET, "/device"),
            (Method::GET, "/device/code"),
            (Method::POST, "/device/code"),
            (Method::GET, "/device/approve"),
            (Method::POST, "/token"),
            (Method::GET, "/a2a/"),
        ]
    }

    fn should_skip(&self, method: &Method, path: &str) -> bool {
        self.skip_list.iter().any(|(m, p)| m == method && *p == path)
    }
}

#[derive(Deserialize)]
struct Jwks {
    keys: Vec<Jwk>,
}

#[derive(Deserialize, Clone)]
struct Jwk {
    kid: String,
    n: String,
    e: String,
}

struct JwksCacheEntry {
    fetched_at: Instant,
    keys: HashMap<String, Jwk>,
}

/// Derived, rebuildable cache with a TTL, behind a `parking_lot::RwLock`
/// rather than an async lock since reads never hold it across an await
/// point.
#[derive(Clone)]
pub struct JwksCache {
    inner: Arc<RwLock<Option<JwksCacheEntry>>>,
    http: reqwest::Client,
}

impl JwksCache {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(None)),
            http: reqwest::Client::new(),
        }
    }

    async fn key_for(&self, kid: &str, jwks_url: &str, ttl: Duration) -> Option<Jwk> {
        if let Some(key) = self.cached_key(kid, ttl) {
            return Some(key);
        }
        match self.refresh(jwks_url).await {
            Ok(()) => self.cached_key(kid, ttl),
            Err(e) => {
                tracing::warn!(error = %e, "JWKS fetch failed; falling back to cached keys");
                // Fall back to a possibly expired cached key rather than
                // fail the request outright.
                self.inner
                    .read()
                    .as_ref()
                    .and_then(|c| c.keys.get(kid).cloned())
            }
        }
    }

    fn cached_key(&self, kid: &str, ttl: Duration) -> Option<Jwk> {
        let guard = self.inner.read();
        let entry = guard.as_ref()?;
        if entry.fetched_at.elapsed() > ttl {
            return None;
        }
        entry.keys.get(kid).cloned()
    }

    async fn refresh(&self, jwks_url: &str) -> anyhow::Result<()> {
        let jwks: Jwks = self.http.get(jwks_url).send().await?.json().await?;
        let keys = jwks.keys.into_iter().map(|k| (k.kid.clone(), k)).collect();
        *self.inner.write() = Some(JwksCacheEntry {
            fetched_at: Instant::now(),
            keys,
        });
        Ok(())
    }
}

impl Default for JwksCache {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Deserialize)]
struct Claims {
    sub: String,
    email: Option<String>,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    permissions: Option<Vec<String>>,
}

fn extract_credentials(headers: &HeaderMap) -> (Option<String>, Option<String>) {
    let bearer = headers
        .iter()
        .find(|(name, _)| name.as_str().eq_ignore_ascii_case("authorization"))
        .and_then(|(_, v)| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer ").or_else(|| v.strip_prefix("bearer ")))
        .map(|s| s.trim().to_string());
    let api_key = headers
        .iter()
        .find(|(name, _)| name.as_str().eq_ignore_ascii_case("x-api-key"))
        .and_then(|(_, v)| v.to_str().ok())
        .map(|s| s.trim().to_string());
    (bearer, api_key)
}

fn is_json_rpc_path(path: &str) -> bool {
    path.starts_with("/a2a")
}

fn auth_error_response(path: &str, message: &str) -> Response<Body> {
    let status = StatusCode::UNAUTHORIZED;
    let body = if is_json_rpc_path(path) {
        serde_json::json!({
            "jsonrpc": "2.0",
            "id": null,
            "error": { "code": -32000, "message": format!("Authentication failed: {message}") }
        })
    } else {
        serde_json::json!({ "error": format!("Authentication failed: {message}"), "status": status.as_u16() })
    };
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap()
}

#[derive(Clone)]
pub struct AuthLayer {
    config: Arc<AuthConfig>,
    jwks: JwksCache,
}

impl AuthLayer {
    pub fn new(config: AuthConfig) -> Self {
        Self {
            config: Arc::new(config),
            jwks: JwksCache::new(),
        }
    }
}

impl<S> Layer<S> for AuthLayer {
    type Service = AuthMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AuthMiddleware {
            inner,
            config: self.config.clone(),
            jwks: self.jwks.clone(),
        }
    }
}

#[derive(Clone)]
pub struct AuthMiddleware<S> {
    inner: S,
    config: Arc<AuthConfig>,
    jwks: JwksCache,
}

impl<S> Service<Request<Body>> for AuthMiddleware<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut TaskContext<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let config = self.config.clone();
        let jwks = self.jwks.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let path = req.uri().path().to_string();
            let method = req.method().clone();

            if config.should_skip(&method, &path) {
                return inner.call(req).await;
            }

            let (bearer, api_key) = extract_credentials(req.headers());

            let auth = if let Some(token) = bearer.as_deref() {
                match validate_bearer(token, &config, &jwks).await {
                    Ok(ctx) => Ok(ctx),
                    Err(e) => {
                        // Bearer preferred; fall through to API key on failure (P4).
                        if let Some(key) = api_key.as_deref() {
                            validate_api_key(key, &config)
                        } else {
                            Err(e)
                        }
                    }
                }
            } else if let Some(key) = api_key.as_deref() {
                validate_api_key(key, &config)
            } else {
                Err("missing credentials".to_string())
            };

            match auth {
                Ok(ctx) => {
                    req.extensions_mut().insert(ctx);
                    inner.call(req).await
                }
                Err(message) => Ok(auth_error_response(&path, &message)),
            }
        })
    }
}

fn validate_api_key(key: &str, config: &AuthConfig) -> Result<AuthContext, String> {
    config
        .api_keys
        .get(key)
        .map(|entry| AuthContext {
            identity: entry.identity.clone(),
            method: AuthMethod::ApiKey,
            permissions: entry.permissions.clone(),
        })
        .ok_or_else(|| "Invalid credentials".to_string())
}

async fn validate_bearer(
    token: &str,
    config: &AuthConfig,
    jwks: &JwksCache,
) -> Result<AuthContext, String> {
    let jwks_url = config
        .jwks_url
        .as_deref()
        .ok_or_else(|| "bearer auth not configured".to_string())?;
    let header = decode_header(token).map_err(|e| format!("malformed token: {e}"))?;
    let kid = header.kid.ok_or_else(|| "token missing kid".to_string())?;
    let jwk = jwks
        .key_for(&kid, jwks_url, config.jwks_cache_ttl)
        .await
        .ok_or_else(|| "unknown signing key".to_string())?;
    let key = DecodingKey::from_rsa_components(&jwk.n, &jwk.e)
        .map_err(|e| format!("invalid signing key: {e}"))?;

    let mut validation = Validation::new(Algorithm::RS256);
    if let Some(aud) = &config.oidc_audience {
        validation.set_audience(&[aud]);
    } else {
        validation.validate_aud = false;
    }
    if let Some(iss) = &config.oidc_issuer {
        validation.set_issuer(&[iss]);
    }

    let data = decode::<Claims>(token, &key, &validation).map_err(|e| format!("invalid token: {e}"))?;
    let identity = data.claims.email.unwrap_or(data.claims.sub);
    let permissions: HashSet<String> = data
        .claims
        .permissions
        .unwrap_or_default()
        .into_iter()
        .chain(
            data.claims
                .scope
                .unwrap_or_default()
                .split_whitespace()
                .map(|s| s.to_string()),
        )
        .collect();

    Ok(AuthContext {
        identity,
        method: AuthMethod::BearerToken,
        permissions,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn extracts_bearer_case_insensitively() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer abc123"));
        let (bearer, key) = extract_credentials(&headers);
        assert_eq!(bearer.as_deref(), Some("abc123"));
        assert!(key.is_none());
    }

    #[test]
    fn extracts_api_key_header_case_insensitively() {
        let mut headers = HeaderMap::new();
        headers.insert("X-Api-Key", HeaderValue::from_static("opkey"));
        let (bearer, key) = extract_credentials(&headers);
        assert!(bearer.is_none());
        assert_eq!(key.as_deref(), Some("opkey"));
    }

    #[test]
    fn skip_list_matches_method_and_path() {
        let config = AuthConfig {
            api_keys: Arc::new(HashMap::new()),
            oidc_issuer: None,
            oidc_audience: None,
            jwks_url: None,
            jwks_cache_ttl: Duration::from_secs(60),
            skip_list: AuthConfig::default_skip_list(),
        };
        assert!(config.should_skip(&Method::GET, "/healthz"));
        assert!(!config.should_skip(&Method::POST, "/debug/execute"));
    }

    #[test]
    fn invalid_api_key_is_rejected() {
        let config = AuthConfig {
            api_keys: Arc::new(HashMap::new()),
            oidc_issuer: None,
            oidc_audience: None,
            jwks_url: None,
            jwks_cache_ttl: Duration::from_secs(60),
            skip_list: vec![],
        };
        assert!(validate_api_key("invalid-key-12345", &config).is_err());
    }
}
