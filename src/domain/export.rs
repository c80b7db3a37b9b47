//! Request-scoped entities of the export pipeline.
//!
//! Nothing here is persisted: every value lives for the duration of one
//! export and is dropped once the caller has its signed URL.

use std::fmt;

use bytes::Bytes;
use serde::Deserialize;
use time::OffsetDateTime;

use super::error::DomainError;
use super::filename::export_filename;

pub const PDF_CONTENT_TYPE: &str = "application/pdf";

const MAX_PRESENTATION_ID_LEN: usize = 256;
const MAX_USER_ID_LEN: usize = 128;

/// CSS pixels per inch used by the engine when laying out print output.
pub const CSS_PIXELS_PER_INCH: f64 = 96.0;

/// Inbound export call, exactly as received.
///
/// The front-end historically sends the presentation as `id`; `presentationId`
/// is accepted as an alias.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExportRequest {
    #[serde(default, alias = "presentationId")]
    pub id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
}

impl ExportRequest {
    pub fn new(id: impl Into<String>, title: Option<String>) -> Self {
        Self {
            id: Some(id.into()),
            title,
        }
    }

    /// Validate the request once; the result is immutable thereafter.
    pub fn validate(&self) -> Result<ValidatedExport, DomainError> {
        let raw_id = self.id.as_deref().map(str::trim).unwrap_or_default();
        let presentation_id = PresentationId::parse(raw_id)?;
        let title = self
            .title
            .as_deref()
            .map(str::trim)
            .filter(|title| !title.is_empty())
            .map(str::to_string);

        Ok(ValidatedExport {
            presentation_id,
            title,
        })
    }
}

/// An export request that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedExport {
    presentation_id: PresentationId,
    title: Option<String>,
}

impl ValidatedExport {
    pub fn presentation_id(&self) -> &PresentationId {
        &self.presentation_id
    }

    pub fn title(&self) -> Option<&str> {
        self.title.as_deref()
    }

    /// Filename suggested for the artifact, derived from the title only.
    pub fn suggested_filename(&self) -> String {
        export_filename(self.title())
    }
}

/// Identifier of a presentation, embedded into the render URL query.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PresentationId(String);

impl PresentationId {
    pub fn parse(value: &str) -> Result<Self, DomainError> {
        if value.is_empty() {
            return Err(DomainError::validation("Missing Presentation ID"));
        }
        if value.len() > MAX_PRESENTATION_ID_LEN {
            return Err(DomainError::validation(format!(
                "Presentation ID exceeds {MAX_PRESENTATION_ID_LEN} bytes"
            )));
        }
        if !value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        {
            return Err(DomainError::validation(
                "Presentation ID may only contain letters, digits, '-' and '_'",
            ));
        }
        Ok(Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PresentationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque caller identity, used to namespace storage keys.
///
/// Because the value becomes a storage key segment it must be a single safe
/// path component.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UserId(String);

impl UserId {
    pub fn parse(value: &str) -> Result<Self, DomainError> {
        let value = value.trim();
        if value.is_empty() {
            return Err(DomainError::validation("user id is empty"));
        }
        if value.len() > MAX_USER_ID_LEN {
            return Err(DomainError::validation(format!(
                "user id exceeds {MAX_USER_ID_LEN} bytes"
            )));
        }
        if value.starts_with('.')
            || !value
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
        {
            return Err(DomainError::validation(
                "user id is not a safe storage path segment",
            ));
        }
        Ok(Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Target output dimensions in CSS pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Viewport {
    /// 16:9 slide size the presentation renderer lays out against.
    pub const SLIDE_16_9: Viewport = Viewport {
        width: 1280,
        height: 720,
    };

    pub fn new(width: u32, height: u32) -> Result<Self, DomainError> {
        if width == 0 || height == 0 {
            return Err(DomainError::validation(
                "viewport dimensions must be greater than zero",
            ));
        }
        Ok(Self { width, height })
    }

    pub fn width_inches(&self) -> f64 {
        f64::from(self.width) / CSS_PIXELS_PER_INCH
    }

    pub fn height_inches(&self) -> f64 {
        f64::from(self.height) / CSS_PIXELS_PER_INCH
    }
}

impl Default for Viewport {
    fn default() -> Self {
        Self::SLIDE_16_9
    }
}

impl fmt::Display for Viewport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// A finished render, owned by whoever publishes it next.
#[derive(Debug, Clone)]
pub struct CapturedArtifact {
    pub bytes: Bytes,
    pub content_type: &'static str,
    pub suggested_filename: String,
}

impl CapturedArtifact {
    pub fn pdf(bytes: impl Into<Bytes>, suggested_filename: impl Into<String>) -> Self {
        Self {
            bytes: bytes.into(),
            content_type: PDF_CONTENT_TYPE,
            suggested_filename: suggested_filename.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Capability reference to a published artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedLocation {
    pub storage_key: String,
    pub signed_url: String,
    pub expires_at: OffsetDateTime,
}
