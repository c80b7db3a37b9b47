//! Publishing of captured artifacts to object storage.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::info;

use crate::domain::export::{CapturedArtifact, PublishedLocation, UserId};
use crate::domain::filename::sanitize_filename;

pub const DEFAULT_SIGNED_URL_TTL: Duration = Duration::from_secs(3600);

/// Failures reported by an object store. Never carries credentials.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("{status} {body}")]
    Status { status: u16, body: String },
    #[error("transport error: {message}")]
    Transport { message: String },
    #[error("unusable storage response: {message}")]
    InvalidResponse { message: String },
}

impl StorageError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self::InvalidResponse {
            message: message.into(),
        }
    }
}

/// Minimal object storage surface used by exports.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `body` under `key`, replacing any existing object.
    async fn put_object(&self, key: &str, body: Bytes, content_type: &str)
    -> Result<(), StorageError>;

    /// Mint a time-limited URL granting read access to `key`.
    async fn create_signed_url(&self, key: &str, expires_in: Duration)
    -> Result<String, StorageError>;

    async fn delete_object(&self, key: &str) -> Result<(), StorageError>;
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PublishError {
    #[error("Upload failed: {source}")]
    Upload { key: String, source: StorageError },
    #[error("Sign failed: {source}")]
    Sign { key: String, source: StorageError },
}

impl PublishError {
    pub fn stage(&self) -> &'static str {
        match self {
            PublishError::Upload { .. } => "upload",
            PublishError::Sign { .. } => "sign",
        }
    }
}

/// Storage key for an export: `users/<user>/exports/<filename>`.
///
/// The filename is sanitized here even when the caller already did so.
pub fn export_storage_key(user: &UserId, filename: &str) -> String {
    format!(
        "users/{}/exports/{}",
        user.as_str(),
        sanitize_filename(filename)
    )
}

#[derive(Clone)]
pub struct ArtifactPublisher {
    store: Arc<dyn ObjectStore>,
    signed_url_ttl: Duration,
}

impl ArtifactPublisher {
    pub fn new(store: Arc<dyn ObjectStore>, signed_url_ttl: Duration) -> Self {
        Self {
            store,
            signed_url_ttl,
        }
    }

    pub fn signed_url_ttl(&self) -> Duration {
        self.signed_url_ttl
    }

    /// Upload in a single PUT, then sign. Neither step is retried, and the
    /// sign call is never attempted after a failed upload.
    pub async fn publish(
        &self,
        artifact: &CapturedArtifact,
        user: &UserId,
    ) -> Result<PublishedLocation, PublishError> {
        let key = export_storage_key(user, &artifact.suggested_filename);

        self.store
            .put_object(&key, artifact.bytes.clone(), artifact.content_type)
            .await
            .map_err(|source| PublishError::Upload {
                key: key.clone(),
                source,
            })?;

        let signed_url = self
            .store
            .create_signed_url(&key, self.signed_url_ttl)
            .await
            .map_err(|source| PublishError::Sign {
                key: key.clone(),
                source,
            })?;

        info!(
            target = "application::publish",
            op = "publish",
            key = %key,
            bytes = artifact.len(),
            ttl_secs = self.signed_url_ttl.as_secs(),
            "Artifact published"
        );

        Ok(PublishedLocation {
            storage_key: key,
            signed_url,
            expires_at: OffsetDateTime::now_utc() + self.signed_url_ttl,
        })
    }
}
