//! Scoped ownership of one headless engine instance.
//!
//! A session is created per export and is never pooled. Stages must run in
//! order; calling one out of order is an invariant error rather than a
//! silent no-op. Whatever happens, the engine page is closed exactly once:
//! either through [`RenderSession::close`] or, when the owning future is
//! dropped mid-flight, by a teardown task spawned from `Drop`.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::time;
use tracing::{debug, warn};
use url::Url;

use crate::domain::export::{CapturedArtifact, Viewport};

use super::readiness::{Readiness, ReadinessDetector, ReadinessPolicy};
use super::types::{BrowserEngine, EnginePage, PdfLayout, RenderError};

pub const DEFAULT_NAVIGATION_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_CAPTURE_TIMEOUT: Duration = Duration::from_secs(120);

const PDF_MAGIC: &[u8] = b"%PDF-";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Opened,
    Navigated,
    Ready,
    Degraded,
    Captured,
    Failed,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Created => "created",
            SessionState::Opened => "opened",
            SessionState::Navigated => "navigated",
            SessionState::Ready => "ready",
            SessionState::Degraded => "degraded",
            SessionState::Captured => "captured",
            SessionState::Failed => "failed",
            SessionState::Closed => "closed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderSessionConfig {
    pub viewport: Viewport,
    pub navigation_timeout: Duration,
    pub capture_timeout: Duration,
    pub readiness: ReadinessPolicy,
}

impl Default for RenderSessionConfig {
    fn default() -> Self {
        Self {
            viewport: Viewport::SLIDE_16_9,
            navigation_timeout: DEFAULT_NAVIGATION_TIMEOUT,
            capture_timeout: DEFAULT_CAPTURE_TIMEOUT,
            readiness: ReadinessPolicy::default(),
        }
    }
}

pub struct RenderSession {
    engine: Arc<dyn BrowserEngine>,
    config: RenderSessionConfig,
    page: Option<Box<dyn EnginePage>>,
    state: SessionState,
}

impl fmt::Debug for RenderSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderSession")
            .field("config", &self.config)
            .field("state", &self.state)
            .field("page_open", &self.page.is_some())
            .finish()
    }
}

impl RenderSession {
    pub fn new(engine: Arc<dyn BrowserEngine>, config: RenderSessionConfig) -> Self {
        Self {
            engine,
            config,
            page: None,
            state: SessionState::Created,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &RenderSessionConfig {
        &self.config
    }

    /// Launch the engine and open a page fixed to the configured viewport.
    pub async fn open(&mut self) -> Result<(), RenderError> {
        self.expect_state("open", &[SessionState::Created])?;

        match self.engine.launch(self.config.viewport).await {
            Ok(page) => {
                self.page = Some(page);
                self.state = SessionState::Opened;
                debug!(
                    target = "application::render::session",
                    op = "session::open",
                    viewport = %self.config.viewport,
                    "Engine page opened"
                );
                Ok(())
            }
            Err(err) => {
                self.state = SessionState::Failed;
                Err(err)
            }
        }
    }

    /// Load `url` and wait for the network to go idle within the navigation
    /// budget. Any failure here is fatal for the export.
    pub async fn navigate(&mut self, url: &Url) -> Result<(), RenderError> {
        self.expect_state("navigate", &[SessionState::Opened])?;
        let timeout = self.config.navigation_timeout;
        let page = self.page_ref("navigate")?;

        let outcome = match time::timeout(timeout, page.navigate(url)).await {
            Ok(result) => result,
            Err(_) => Err(RenderError::NavigationTimeout {
                url: url.to_string(),
                timeout,
            }),
        };

        self.state = match outcome {
            Ok(()) => SessionState::Navigated,
            Err(_) => SessionState::Failed,
        };
        outcome
    }

    /// Wait for visual readiness. Running out of budget degrades, it never fails.
    pub async fn await_ready(&mut self) -> Result<Readiness, RenderError> {
        self.expect_state("await readiness", &[SessionState::Navigated])?;
        let detector = ReadinessDetector::new(self.config.readiness);
        let page = self.page_ref("await readiness")?;

        let readiness = detector.wait(page).await;
        self.state = match readiness {
            Readiness::Ready { .. } => SessionState::Ready,
            Readiness::Degraded { .. } => SessionState::Degraded,
        };
        Ok(readiness)
    }

    /// Print the page to a PDF sized exactly to the viewport.
    pub async fn capture(
        &mut self,
        suggested_filename: &str,
    ) -> Result<CapturedArtifact, RenderError> {
        self.expect_state("capture", &[SessionState::Ready, SessionState::Degraded])?;
        let timeout = self.config.capture_timeout;
        let layout = PdfLayout::for_viewport(self.config.viewport);
        let page = self.page_ref("capture")?;

        let outcome = match time::timeout(timeout, page.print_pdf(&layout)).await {
            Ok(Ok(bytes)) if bytes.is_empty() => {
                Err(RenderError::capture("engine returned an empty document"))
            }
            Ok(Ok(bytes)) if !bytes.starts_with(PDF_MAGIC) => Err(RenderError::capture(
                "engine output is not a PDF document",
            )),
            Ok(Ok(bytes)) => Ok(CapturedArtifact::pdf(bytes, suggested_filename)),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(RenderError::CaptureTimeout { timeout }),
        };

        self.state = match outcome {
            Ok(_) => SessionState::Captured,
            Err(_) => SessionState::Failed,
        };
        outcome
    }

    /// Close the page and the engine instance behind it.
    ///
    /// Valid from any state; closing a session that never opened is a no-op.
    pub async fn close(mut self) -> Result<(), RenderError> {
        let from = self.state;
        self.state = SessionState::Closed;
        let Some(page) = self.page.take() else {
            return Ok(());
        };

        let result = page.close().await;
        debug!(
            target = "application::render::session",
            op = "session::close",
            from = from.as_str(),
            result = if result.is_ok() { "ok" } else { "error" },
            "Engine page closed"
        );
        result
    }

    fn expect_state(
        &self,
        operation: &'static str,
        allowed: &[SessionState],
    ) -> Result<(), RenderError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(RenderError::InvalidState {
                operation,
                state: self.state.as_str(),
            })
        }
    }

    fn page_ref(&self, operation: &'static str) -> Result<&dyn EnginePage, RenderError> {
        self.page.as_deref().ok_or(RenderError::InvalidState {
            operation,
            state: self.state.as_str(),
        })
    }
}

impl Drop for RenderSession {
    fn drop(&mut self) {
        let Some(page) = self.page.take() else {
            return;
        };

        match Handle::try_current() {
            Ok(handle) => {
                let state = self.state.as_str();
                handle.spawn(async move {
                    if let Err(err) = page.close().await {
                        warn!(
                            target = "application::render::session",
                            op = "session::teardown",
                            state,
                            error = %err,
                            "Background engine teardown failed"
                        );
                    }
                });
            }
            Err(_) => warn!(
                target = "application::render::session",
                op = "session::teardown",
                state = self.state.as_str(),
                "No runtime available; engine page dropped without close"
            ),
        }
    }
}
