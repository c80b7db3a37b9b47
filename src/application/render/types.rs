use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use url::Url;

use crate::domain::export::Viewport;

/// One measurement of the rendered DOM, taken inside the page.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomSample {
    /// `document.readyState` at sampling time.
    pub ready_state: String,
    /// Number of elements attached to the document.
    pub total: u64,
    /// Elements that are visible and occupy a non-zero box.
    pub visible: u64,
}

impl DomSample {
    pub fn new(ready_state: impl Into<String>, total: u64, visible: u64) -> Self {
        Self {
            ready_state: ready_state.into(),
            total,
            visible,
        }
    }

    pub fn is_document_complete(&self) -> bool {
        self.ready_state == "complete"
    }

    /// Share of elements that are visible and sized; zero for an empty document.
    pub fn completion_ratio(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.visible.min(self.total) as f64 / self.total as f64
    }
}

/// Print layout handed to the engine when capturing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PdfLayout {
    pub paper_width_in: f64,
    pub paper_height_in: f64,
    pub margin_top_in: f64,
    pub margin_right_in: f64,
    pub margin_bottom_in: f64,
    pub margin_left_in: f64,
    pub print_background: bool,
}

impl PdfLayout {
    /// Single-page-per-slide layout sized exactly to the viewport, no margins.
    pub fn for_viewport(viewport: Viewport) -> Self {
        Self {
            paper_width_in: viewport.width_inches(),
            paper_height_in: viewport.height_inches(),
            margin_top_in: 0.0,
            margin_right_in: 0.0,
            margin_bottom_in: 0.0,
            margin_left_in: 0.0,
            print_background: true,
        }
    }

    pub fn has_zero_margins(&self) -> bool {
        self.margin_top_in == 0.0
            && self.margin_right_in == 0.0
            && self.margin_bottom_in == 0.0
            && self.margin_left_in == 0.0
    }
}

/// Errors raised by the headless engine or the session wrapping it.
#[derive(Debug, Clone, Error)]
pub enum RenderError {
    #[error("failed to launch browser engine: {message}")]
    Launch { message: String },
    #[error("navigation to {url} timed out after {}s", .timeout.as_secs())]
    NavigationTimeout { url: String, timeout: Duration },
    #[error("navigation to {url} failed: {message}")]
    Navigation { url: String, message: String },
    #[error("page evaluation failed: {message}")]
    Evaluation { message: String },
    #[error("capture timed out after {}s", .timeout.as_secs())]
    CaptureTimeout { timeout: Duration },
    #[error("capture failed: {message}")]
    Capture { message: String },
    #[error("engine protocol error: {message}")]
    Protocol { message: String },
    #[error("render session cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },
}

impl RenderError {
    pub fn launch(message: impl Into<String>) -> Self {
        Self::Launch {
            message: message.into(),
        }
    }

    pub fn navigation(url: &Url, message: impl Into<String>) -> Self {
        Self::Navigation {
            url: url.to_string(),
            message: message.into(),
        }
    }

    pub fn evaluation(message: impl Into<String>) -> Self {
        Self::Evaluation {
            message: message.into(),
        }
    }

    pub fn capture(message: impl Into<String>) -> Self {
        Self::Capture {
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub fn is_navigation(&self) -> bool {
        matches!(
            self,
            Self::Navigation { .. } | Self::NavigationTimeout { .. }
        )
    }

    pub fn is_capture(&self) -> bool {
        matches!(self, Self::Capture { .. } | Self::CaptureTimeout { .. })
    }
}

/// Anything that can measure its rendered DOM.
#[async_trait]
pub trait DomProbe: Send + Sync {
    async fn sample_dom(&self) -> Result<DomSample, RenderError>;
}

/// Launches isolated engine instances, one per export.
#[async_trait]
pub trait BrowserEngine: Send + Sync {
    /// Start an engine instance and open a single page fixed to `viewport`.
    async fn launch(&self, viewport: Viewport) -> Result<Box<dyn EnginePage>, RenderError>;
}

/// A single page inside an engine instance that exclusively owns it.
///
/// Timeouts are enforced by the caller; implementations may wait as long as
/// the engine needs.
#[async_trait]
pub trait EnginePage: DomProbe {
    /// Load `url` and wait until the network has gone quiet.
    async fn navigate(&self, url: &Url) -> Result<(), RenderError>;

    /// Print the current document with the given layout.
    async fn print_pdf(&self, layout: &PdfLayout) -> Result<Vec<u8>, RenderError>;

    /// Close the page and shut down the engine instance that owns it.
    async fn close(self: Box<Self>) -> Result<(), RenderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ratio_counts_visible_elements() {
        let sample = DomSample::new("complete", 200, 198);
        assert!((sample.completion_ratio() - 0.99).abs() < 1e-9);
        assert!(sample.is_document_complete());
    }

    #[test]
    fn empty_document_has_zero_ratio() {
        let sample = DomSample::new("loading", 0, 0);
        assert_eq!(sample.completion_ratio(), 0.0);
        assert!(!sample.is_document_complete());
    }

    #[test]
    fn ratio_is_stable_across_remeasurement() {
        let sample = DomSample::new("complete", 311, 287);
        let first = sample.completion_ratio();
        for _ in 0..10 {
            assert_eq!(sample.completion_ratio(), first);
        }
    }

    #[test]
    fn sample_deserializes_from_page_payload() {
        let sample: DomSample =
            serde_json::from_str(r#"{"readyState":"interactive","total":10,"visible":4}"#)
                .expect("sample");
        assert_eq!(sample, DomSample::new("interactive", 10, 4));
    }

    #[test]
    fn layout_matches_viewport_without_margins() {
        let layout = PdfLayout::for_viewport(Viewport::SLIDE_16_9);
        assert!((layout.paper_width_in * 96.0 - 1280.0).abs() < 1e-9);
        assert!((layout.paper_height_in * 96.0 - 720.0).abs() < 1e-9);
        assert!(layout.has_zero_margins());
        assert!(layout.print_background);
    }
}
