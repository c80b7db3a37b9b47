//! Export orchestration: validate, authenticate, render, publish.
//!
//! Stages run strictly in sequence within one export and nothing is retried.
//! The render session is closed on every path before an outcome is returned;
//! if the export future itself is dropped, the session, the registry entry
//! and the admission permit all release through their `Drop` impls.

mod registry;

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use axum::http::HeaderMap;
use metrics::{counter, histogram};
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{info, instrument, warn};
use url::Url;
use uuid::Uuid;

use crate::application::identity::{AuthError, IdentityProvider};
use crate::application::publish::{ArtifactPublisher, PublishError};
use crate::application::render::{
    BrowserEngine, Readiness, RenderError, RenderSession, RenderSessionConfig,
};
use crate::domain::error::DomainError;
use crate::domain::export::{
    CapturedArtifact, ExportRequest, PresentationId, PublishedLocation, UserId, ValidatedExport,
};

pub use registry::{ExportGuard, InFlightExport, InFlightExports};

pub const DEFAULT_RENDER_BASE_URL: &str = "http://localhost/pdf-maker";

const METRIC_EXPORT_TOTAL: &str = "deckpress_export_total";
const METRIC_STAGE_MS: &str = "deckpress_export_stage_ms";
const METRIC_READINESS_DEGRADED: &str = "deckpress_readiness_degraded_total";

#[derive(Debug, Clone, PartialEq)]
pub struct ExportConfig {
    /// Page that renders a presentation when given `?id=<presentation>`.
    pub render_base: Url,
    pub session: RenderSessionConfig,
    /// Maximum simultaneous exports; zero disables the limit.
    pub max_concurrent: usize,
}

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("validation failed: {message}")]
    Validation { message: String },
    #[error("configuration error: {message}")]
    Configuration { message: String },
    #[error("unauthorized: {source}")]
    Unauthorized { source: AuthError },
    #[error("navigation failed: {source}")]
    Navigation { source: RenderError },
    #[error("capture failed: {source}")]
    Capture { source: RenderError },
    #[error("render failed: {source}")]
    Render { source: RenderError },
    #[error(transparent)]
    Upload(PublishError),
    #[error(transparent)]
    Sign(PublishError),
    #[error("export capacity exhausted")]
    Overloaded,
}

impl ExportError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Stable machine-readable kind.
    pub fn kind(&self) -> &'static str {
        match self {
            ExportError::Validation { .. } => "validation_error",
            ExportError::Configuration { .. } => "configuration_error",
            ExportError::Unauthorized { .. } => "unauthorized",
            ExportError::Navigation { .. } => "navigation_error",
            ExportError::Capture { .. } => "capture_error",
            ExportError::Render { .. } => "render_error",
            ExportError::Upload(_) => "upload_error",
            ExportError::Sign(_) => "sign_error",
            ExportError::Overloaded => "overloaded",
        }
    }

    /// Message safe to hand back to the caller.
    ///
    /// Storage failures keep the status and truncated body; engine details
    /// stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            ExportError::Validation { message } => message.clone(),
            ExportError::Configuration { .. } => "Supabase storage not configured".to_string(),
            ExportError::Unauthorized { .. } => "Unauthorized".to_string(),
            ExportError::Navigation { .. } => "Failed to load presentation for export".to_string(),
            ExportError::Capture { .. } => "Failed to capture PDF".to_string(),
            ExportError::Render { .. } => "PDF renderer unavailable".to_string(),
            ExportError::Upload(err) | ExportError::Sign(err) => err.to_string(),
            ExportError::Overloaded => "Too many exports in progress; retry shortly".to_string(),
        }
    }
}

impl From<DomainError> for ExportError {
    fn from(error: DomainError) -> Self {
        Self::Validation {
            message: error.message().to_string(),
        }
    }
}

impl From<AuthError> for ExportError {
    fn from(source: AuthError) -> Self {
        Self::Unauthorized { source }
    }
}

impl From<RenderError> for ExportError {
    fn from(source: RenderError) -> Self {
        if source.is_navigation() {
            Self::Navigation { source }
        } else if source.is_capture() {
            Self::Capture { source }
        } else {
            Self::Render { source }
        }
    }
}

impl From<PublishError> for ExportError {
    fn from(error: PublishError) -> Self {
        match error {
            PublishError::Upload { .. } => Self::Upload(error),
            PublishError::Sign { .. } => Self::Sign(error),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExportOutcome {
    pub export_id: Uuid,
    pub location: PublishedLocation,
    pub readiness: Readiness,
    pub bytes: usize,
}

#[derive(Clone)]
pub struct ExportService {
    engine: Arc<dyn BrowserEngine>,
    identity: Arc<dyn IdentityProvider>,
    publisher: Option<ArtifactPublisher>,
    config: ExportConfig,
    admission: Option<Arc<Semaphore>>,
    in_flight: InFlightExports,
}

impl ExportService {
    /// `publisher` is `None` when storage is not configured; every export
    /// then fails with a configuration error before any engine work.
    pub fn new(
        engine: Arc<dyn BrowserEngine>,
        identity: Arc<dyn IdentityProvider>,
        publisher: Option<ArtifactPublisher>,
        config: ExportConfig,
    ) -> Self {
        let admission =
            (config.max_concurrent > 0).then(|| Arc::new(Semaphore::new(config.max_concurrent)));
        Self {
            engine,
            identity,
            publisher,
            config,
            admission,
            in_flight: InFlightExports::new(),
        }
    }

    pub fn config(&self) -> &ExportConfig {
        &self.config
    }

    pub fn in_flight(&self) -> &InFlightExports {
        &self.in_flight
    }

    /// Resolve the caller behind `headers`.
    pub async fn authenticate(&self, headers: &HeaderMap) -> Result<UserId, ExportError> {
        self.identity
            .identify(headers)
            .await
            .map_err(ExportError::from)
    }

    /// Export on behalf of an HTTP caller.
    pub async fn export(
        &self,
        request: &ExportRequest,
        headers: &HeaderMap,
    ) -> Result<ExportOutcome, ExportError> {
        self.export_identified(request, headers).await.1
    }

    /// Like [`ExportService::export`], also returning the caller once
    /// authentication has succeeded so the response can be attributed.
    pub async fn export_identified(
        &self,
        request: &ExportRequest,
        headers: &HeaderMap,
    ) -> (Option<UserId>, Result<ExportOutcome, ExportError>) {
        let (user, result) = match request.validate() {
            Err(err) => (None, Err(ExportError::from(err))),
            Ok(validated) => match self.authenticate(headers).await {
                Err(err) => (None, Err(err)),
                Ok(user) => {
                    let result = self.run(validated, user.clone()).await;
                    (Some(user), result)
                }
            },
        };
        record_result(&result);
        (user, result)
    }

    /// Export on behalf of an already identified user, e.g. from the CLI.
    pub async fn export_as(
        &self,
        request: &ExportRequest,
        user: UserId,
    ) -> Result<ExportOutcome, ExportError> {
        let result = match request.validate() {
            Ok(validated) => self.run(validated, user).await,
            Err(err) => Err(ExportError::from(err)),
        };
        record_result(&result);
        result
    }

    async fn run(
        &self,
        validated: ValidatedExport,
        user: UserId,
    ) -> Result<ExportOutcome, ExportError> {
        let publisher = self.publisher.as_ref().ok_or_else(|| {
            ExportError::configuration("storage url, service key and bucket must all be set")
        })?;
        let _permit = self.admit()?;
        let guard = self.in_flight.register(validated.presentation_id(), &user);

        self.run_admitted(guard.export_id(), publisher, &validated, &user)
            .await
    }

    #[instrument(
        name = "export",
        skip_all,
        fields(
            export_id = %export_id,
            presentation_id = %validated.presentation_id(),
            user_id = %user,
        )
    )]
    async fn run_admitted(
        &self,
        export_id: Uuid,
        publisher: &ArtifactPublisher,
        validated: &ValidatedExport,
        user: &UserId,
    ) -> Result<ExportOutcome, ExportError> {
        let started = Instant::now();
        let url = render_url(&self.config.render_base, validated.presentation_id());
        let filename = validated.suggested_filename();

        let mut session = RenderSession::new(Arc::clone(&self.engine), self.config.session);
        let rendered = drive(&mut session, &url, &filename).await;
        let closed = timed("close", session.close()).await;
        if let Err(err) = &closed {
            warn!(
                target = "application::export",
                op = "export::close",
                error = %err,
                "Engine teardown reported an error"
            );
        }

        let (artifact, readiness) = match rendered {
            Ok(rendered) => rendered,
            Err(err) => {
                warn!(
                    target = "application::export",
                    op = "export::render",
                    result = "error",
                    error = %err,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Render failed"
                );
                return Err(ExportError::from(err));
            }
        };

        let location = timed("publish", publisher.publish(&artifact, user)).await?;

        info!(
            target = "application::export",
            op = "export",
            result = "success",
            readiness = readiness.as_str(),
            bytes = artifact.len(),
            key = %location.storage_key,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Export published"
        );

        Ok(ExportOutcome {
            export_id,
            bytes: artifact.len(),
            location,
            readiness,
        })
    }

    fn admit(&self) -> Result<Option<OwnedSemaphorePermit>, ExportError> {
        match &self.admission {
            None => Ok(None),
            Some(semaphore) => Arc::clone(semaphore)
                .try_acquire_owned()
                .map(Some)
                .map_err(|_| ExportError::Overloaded),
        }
    }
}

async fn drive(
    session: &mut RenderSession,
    url: &Url,
    filename: &str,
) -> Result<(CapturedArtifact, Readiness), RenderError> {
    timed("launch", session.open()).await?;
    timed("navigate", session.navigate(url)).await?;
    let readiness = timed("readiness", session.await_ready()).await?;
    if readiness.is_degraded() {
        counter!(METRIC_READINESS_DEGRADED).increment(1);
    }
    let artifact = timed("capture", session.capture(filename)).await?;
    Ok((artifact, readiness))
}

async fn timed<F: Future>(stage: &'static str, future: F) -> F::Output {
    let started = Instant::now();
    let output = future.await;
    histogram!(METRIC_STAGE_MS, "stage" => stage).record(started.elapsed().as_secs_f64() * 1000.0);
    output
}

fn record_result(result: &Result<ExportOutcome, ExportError>) {
    let label = match result {
        Ok(_) => "success",
        Err(err) => err.kind(),
    };
    counter!(METRIC_EXPORT_TOTAL, "result" => label).increment(1);
}

/// `<base>?id=<presentation>`, replacing any `id` already on the base.
pub fn render_url(base: &Url, presentation_id: &PresentationId) -> Url {
    let retained: Vec<(String, String)> = base
        .query_pairs()
        .filter(|(key, _)| key != "id")
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();

    let mut url = base.clone();
    url.query_pairs_mut()
        .clear()
        .extend_pairs(retained)
        .append_pair("id", presentation_id.as_str());
    url
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(value: &str) -> PresentationId {
        PresentationId::parse(value).expect("presentation id")
    }

    #[test]
    fn render_url_appends_id() {
        let base = Url::parse(DEFAULT_RENDER_BASE_URL).expect("base");
        assert_eq!(
            render_url(&base, &id("abc123")).as_str(),
            "http://localhost/pdf-maker?id=abc123"
        );
    }

    #[test]
    fn render_url_replaces_existing_id_and_keeps_other_params() {
        let base = Url::parse("https://app.test/pdf-maker?theme=dark&id=stale").expect("base");
        assert_eq!(
            render_url(&base, &id("fresh")).as_str(),
            "https://app.test/pdf-maker?theme=dark&id=fresh"
        );
    }

    #[test]
    fn render_errors_map_to_distinct_kinds() {
        let url = Url::parse("http://localhost/pdf-maker?id=a").expect("url");
        assert_eq!(
            ExportError::from(RenderError::navigation(&url, "404")).kind(),
            "navigation_error"
        );
        assert_eq!(
            ExportError::from(RenderError::capture("empty")).kind(),
            "capture_error"
        );
        assert_eq!(
            ExportError::from(RenderError::launch("no chrome")).kind(),
            "render_error"
        );
    }

    #[test]
    fn public_messages_do_not_leak_engine_detail() {
        let err = ExportError::from(RenderError::protocol("ws://127.0.0.1:9222/devtools closed"));
        assert!(!err.public_message().contains("127.0.0.1"));
        assert_eq!(ExportError::from(AuthError::Missing).public_message(), "Unauthorized");
    }
}
