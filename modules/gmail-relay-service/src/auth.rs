//! Push authentication: Google OIDC bearer tokens and a shared secret.

use async_trait::async_trait;
use axum::extract::Query;
use axum::http::{HeaderMap, Uri};
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

pub const SHARED_TOKEN_HEADER: &str = "x-gog-token";
const GOOGLE_ISSUERS: [&str; 2] = ["accounts.google.com", "https://accounts.google.com"];
const JWKS_CACHE_TTL: Duration = Duration::from_secs(3600);
const JWKS_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq)]
pub enum AuthError {
    MissingCredentials,
    InvalidToken(String),
    EmailMismatch,
    SharedTokenMismatch,
    KeyFetch(String),
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthError::MissingCredentials => write!(f, "no credentials presented"),
            AuthError::InvalidToken(e) => write!(f, "invalid OIDC token: {}", e),
            AuthError::EmailMismatch => write!(f, "OIDC token email does not match"),
            AuthError::SharedTokenMismatch => write!(f, "shared token mismatch"),
            AuthError::KeyFetch(e) => write!(f, "failed to load OIDC signing keys: {}", e),
        }
    }
}

impl std::error::Error for AuthError {}

/// Claims read from a Pub/Sub push token.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OidcClaims {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub email_verified: Option<bool>,
    #[serde(default)]
    pub sub: Option<String>,
}

#[async_trait]
pub trait OidcVerifier: Send + Sync {
    /// Verify signature, expiry, issuer and `audience`, returning the claims.
    async fn verify(&self, token: &str, audience: &str) -> Result<OidcClaims, AuthError>;
}

/// Where signing keys come from.
#[derive(Debug, Clone)]
pub enum KeySource {
    /// RS256 keys from a JWKS endpoint (Google's certs in production).
    Jwks(String),
    /// HS256 shared secret, for self-hosted issuers and tests.
    Secret(String),
}

#[derive(Clone)]
struct JwksCacheEntry {
    fetched_at: Instant,
    jwks: Arc<JwkSet>,
}

pub struct JwtOidcVerifier {
    keys: KeySource,
    http: reqwest::Client,
    cache: Mutex<Option<JwksCacheEntry>>,
}

impl JwtOidcVerifier {
    pub fn new(keys: KeySource) -> Self {
        Self {
            keys,
            http: reqwest::Client::new(),
            cache: Mutex::new(None),
        }
    }

    async fn fetch_jwks(&self, url: &str, force: bool) -> Result<Arc<JwkSet>, AuthError> {
        let mut cache = self.cache.lock().await;
        if !force {
            if let Some(entry) = cache.as_ref() {
                if entry.fetched_at.elapsed() < JWKS_CACHE_TTL {
                    return Ok(entry.jwks.clone());
                }
            }
        }

        let response = self
            .http
            .get(url)
            .timeout(JWKS_FETCH_TIMEOUT)
            .send()
            .await
            .map_err(|e| AuthError::KeyFetch(e.to_string()))?;
        if !response.status().is_success() {
            return Err(AuthError::KeyFetch(format!("HTTP {}", response.status())));
        }
        let jwks: JwkSet = response
            .json()
            .await
            .map_err(|e| AuthError::KeyFetch(e.to_string()))?;
        let jwks = Arc::new(jwks);

        *cache = Some(JwksCacheEntry {
            fetched_at: Instant::now(),
            jwks: jwks.clone(),
        });
        Ok(jwks)
    }

    async fn decoding_key(&self, kid: Option<&str>) -> Result<(DecodingKey, Algorithm), AuthError> {
        match &self.keys {
            KeySource::Secret(secret) => Ok((DecodingKey::from_secret(secret.as_bytes()), Algorithm::HS256)),
            KeySource::Jwks(url) => {
                let kid = kid.ok_or_else(|| AuthError::InvalidToken("token has no kid".into()))?;
                let jwks = self.fetch_jwks(url, false).await?;
                let jwk = match jwks.find(kid).cloned() {
                    Some(jwk) => jwk,
                    // Google rotates keys; refresh once on an unknown kid.
                    None => self
                        .fetch_jwks(url, true)
                        .await?
                        .find(kid)
                        .cloned()
                        .ok_or_else(|| AuthError::InvalidToken(format!("unknown kid {}", kid)))?,
                };
                let key = DecodingKey::from_jwk(&jwk).map_err(|e| AuthError::InvalidToken(e.to_string()))?;
                Ok((key, Algorithm::RS256))
            }
        }
    }
}

#[async_trait]
impl OidcVerifier for JwtOidcVerifier {
    async fn verify(&self, token: &str, audience: &str) -> Result<OidcClaims, AuthError> {
        let header =
            jsonwebtoken::decode_header(token).map_err(|e| AuthError::InvalidToken(e.to_string()))?;
        let (key, algorithm) = self.decoding_key(header.kid.as_deref()).await?;

        let mut validation = Validation::new(algorithm);
        validation.set_audience(&[audience]);
        validation.set_issuer(&GOOGLE_ISSUERS);

        jsonwebtoken::decode::<OidcClaims>(token, &key, &validation)
            .map(|data| data.claims)
            .map_err(|e| AuthError::InvalidToken(e.to_string()))
    }
}

/// How a request was let in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    Oidc,
    SharedToken,
    /// No authentication configured; only possible on a loopback bind.
    Open,
}

pub struct OidcGate {
    pub verifier: Arc<dyn OidcVerifier>,
    pub expected_email: Option<String>,
    pub audience: Option<String>,
}

pub struct PushAuthenticator {
    oidc: Option<OidcGate>,
    shared_token: Option<String>,
}

impl PushAuthenticator {
    pub fn new(oidc: Option<OidcGate>, shared_token: Option<String>) -> Self {
        Self {
            oidc,
            shared_token: shared_token.filter(|t| !t.is_empty()),
        }
    }

    pub async fn authorize(&self, headers: &HeaderMap, uri: &Uri) -> Result<AuthMethod, AuthError> {
        if let Some(gate) = &self.oidc {
            let oidc_err = match self.check_oidc(gate, headers, uri).await {
                Ok(()) => return Ok(AuthMethod::Oidc),
                Err(e) => e,
            };
            if self.shared_token.is_some() {
                return self.check_shared(headers, uri).map(|_| AuthMethod::SharedToken);
            }
            return Err(oidc_err);
        }

        if self.shared_token.is_some() {
            return self.check_shared(headers, uri).map(|_| AuthMethod::SharedToken);
        }

        Ok(AuthMethod::Open)
    }

    async fn check_oidc(&self, gate: &OidcGate, headers: &HeaderMap, uri: &Uri) -> Result<(), AuthError> {
        let token = bearer_token(headers).ok_or(AuthError::MissingCredentials)?;
        let audience = gate
            .audience
            .clone()
            .unwrap_or_else(|| effective_audience(headers, uri));

        let claims = gate.verifier.verify(&token, &audience).await?;

        if let Some(expected) = &gate.expected_email {
            let email_matches = claims
                .email
                .as_deref()
                .map(|e| e.eq_ignore_ascii_case(expected))
                .unwrap_or(false);
            if !email_matches || claims.email_verified == Some(false) {
                return Err(AuthError::EmailMismatch);
            }
        }
        Ok(())
    }

    fn check_shared(&self, headers: &HeaderMap, uri: &Uri) -> Result<(), AuthError> {
        let expected = match &self.shared_token {
            Some(t) => t,
            None => return Err(AuthError::MissingCredentials),
        };
        let provided = headers
            .get(SHARED_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .or_else(|| query_token(uri))
            .ok_or(AuthError::MissingCredentials)?;

        if constant_time_eq(&provided, expected) {
            Ok(())
        } else {
            Err(AuthError::SharedTokenMismatch)
        }
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?.trim();
    let token = value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))?
        .trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

fn query_token(uri: &Uri) -> Option<String> {
    let Query(params) = Query::<HashMap<String, String>>::try_from_uri(uri).ok()?;
    params.get("token").cloned().filter(|t| !t.is_empty())
}

/// `scheme://host/path` as the push subscription would have addressed it.
pub fn effective_audience(headers: &HeaderMap, uri: &Uri) -> String {
    let first = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };
    let scheme = first("x-forwarded-proto")
        .or_else(|| uri.scheme_str().map(|s| s.to_string()))
        .unwrap_or_else(|| "http".to_string());
    let host = first("x-forwarded-host")
        .or_else(|| first("host"))
        .or_else(|| uri.authority().map(|a| a.to_string()))
        .unwrap_or_default();
    format!("{}://{}{}", scheme, host, uri.path())
}

fn constant_time_eq(left: &str, right: &str) -> bool {
    let left_bytes = left.as_bytes();
    let right_bytes = right.as_bytes();
    if left_bytes.len() != right_bytes.len() {
        return false;
    }

    let mut diff = 0_u8;
    for (a, b) in left_bytes.iter().zip(right_bytes.iter()) {
        diff |= *a ^ *b;
    }
    diff == 0
}
