//! Headless rendering of a presentation into a paginated PDF.
//!
//! The engine itself sits behind [`BrowserEngine`] / [`EnginePage`]; this
//! module owns the lifecycle around it and decides when a page is visually
//! complete enough to print.

mod readiness;
mod session;
mod types;

pub use readiness::{
    DEFAULT_COMPLETION_THRESHOLD, DEFAULT_POLL_INTERVAL, DEFAULT_READINESS_TIMEOUT,
    DEFAULT_SETTLE_DELAY, Readiness, ReadinessDetector, ReadinessPolicy,
};
pub use session::{
    DEFAULT_CAPTURE_TIMEOUT, DEFAULT_NAVIGATION_TIMEOUT, RenderSession, RenderSessionConfig,
    SessionState,
};
pub use types::{BrowserEngine, DomProbe, DomSample, EnginePage, PdfLayout, RenderError};
