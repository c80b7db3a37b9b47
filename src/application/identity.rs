//! Caller identification for export requests.
//!
//! Providers map inbound request headers to an opaque [`UserId`]. They never
//! see the request body, so authentication can run before any render work.

use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderName, header};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::domain::export::UserId;

pub const DEFAULT_USER_HEADER: &str = "x-user-id";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing credentials")]
    Missing,
    #[error("invalid credentials")]
    Invalid,
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn identify(&self, headers: &HeaderMap) -> Result<UserId, AuthError>;
}

/// Trusts a header set by an upstream proxy that already authenticated the
/// session. Only safe when the service is not reachable directly.
#[derive(Debug, Clone)]
pub struct TrustedHeaderIdentity {
    header: HeaderName,
}

impl TrustedHeaderIdentity {
    pub fn new(header: HeaderName) -> Self {
        Self { header }
    }
}

impl Default for TrustedHeaderIdentity {
    fn default() -> Self {
        Self::new(HeaderName::from_static(DEFAULT_USER_HEADER))
    }
}

#[async_trait]
impl IdentityProvider for TrustedHeaderIdentity {
    async fn identify(&self, headers: &HeaderMap) -> Result<UserId, AuthError> {
        let value = headers.get(&self.header).ok_or(AuthError::Missing)?;
        let raw = value.to_str().map_err(|_| AuthError::Invalid)?;
        if raw.trim().is_empty() {
            return Err(AuthError::Missing);
        }
        UserId::parse(raw).map_err(|_| AuthError::Invalid)
    }
}

/// Bearer tokens mapped to users. Only SHA-256 digests of the tokens are held.
#[derive(Clone, Default)]
pub struct ApiKeyIdentity {
    keys: Vec<(Vec<u8>, UserId)>,
}

impl std::fmt::Debug for ApiKeyIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiKeyIdentity")
            .field("keys", &self.keys.len())
            .finish()
    }
}

impl ApiKeyIdentity {
    /// Build from `(user id, hex-encoded SHA-256 of the token)` pairs.
    pub fn from_digests<'a, I>(entries: I) -> Result<Self, String>
    where
        I: IntoIterator<Item = (&'a UserId, &'a str)>,
    {
        let mut keys = Vec::new();
        for (user, digest_hex) in entries {
            let digest = hex::decode(digest_hex.trim())
                .map_err(|err| format!("token digest for `{user}` is not hex: {err}"))?;
            if digest.len() != 32 {
                return Err(format!(
                    "token digest for `{user}` must be 32 bytes, got {}",
                    digest.len()
                ));
            }
            keys.push((digest, user.clone()));
        }
        Ok(Self { keys })
    }

    pub fn hash_token(token: &str) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(token.as_bytes());
        hasher.finalize().to_vec()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    fn lookup(&self, token: &str) -> Option<&UserId> {
        let hashed = Self::hash_token(token);
        let mut found = None;
        // Every entry is compared so timing does not reveal the match position.
        for (digest, user) in &self.keys {
            if digest.ct_eq(&hashed).unwrap_u8() == 1 {
                found = Some(user);
            }
        }
        found
    }
}

#[async_trait]
impl IdentityProvider for ApiKeyIdentity {
    async fn identify(&self, headers: &HeaderMap) -> Result<UserId, AuthError> {
        let token = extract_bearer(headers)
            .or_else(|| {
                headers
                    .get("x-api-key")
                    .and_then(|value| value.to_str().ok())
                    .map(str::to_string)
            })
            .ok_or(AuthError::Missing)?;

        self.lookup(&token).cloned().ok_or(AuthError::Invalid)
    }
}

fn extract_bearer(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let bearer = raw.strip_prefix("Bearer ")?;
    Some(bearer.trim().to_string())
}
