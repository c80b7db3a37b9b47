//! Chromium-backed implementation of the render engine seam.
//!
//! Each launch starts a dedicated headless Chromium process over the DevTools
//! protocol. Nothing is shared between exports: the page, the browser and the
//! task driving the protocol connection are torn down together on close.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::network::{EventResponseReceived, ResourceType};
use chromiumoxide::cdp::browser_protocol::page::{
    EventLifecycleEvent, FrameId, NavigateParams, PrintToPdfParams,
};
use chromiumoxide::handler::viewport::Viewport as CdpViewport;
use chromiumoxide::{Browser, BrowserConfig, Page};
use futures::{FutureExt, StreamExt};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use url::Url;

use crate::application::render::{
    BrowserEngine, DomProbe, DomSample, EnginePage, PdfLayout, RenderError,
};
use crate::domain::export::Viewport;

/// Counts attached elements and those that are visible with a non-zero box.
const DOM_SAMPLE_SCRIPT: &str = r#"(() => {
  const all = document.querySelectorAll('*');
  let visible = 0;
  for (const el of all) {
    const style = window.getComputedStyle(el);
    if (style.display !== 'none'
        && style.visibility !== 'hidden'
        && style.opacity !== '0'
        && el.offsetWidth > 0
        && el.offsetHeight > 0) {
      visible += 1;
    }
  }
  return { readyState: document.readyState, total: all.length, visible };
})()"#;

const LIFECYCLE_INIT: &str = "init";
const LIFECYCLE_NETWORK_IDLE: &str = "networkIdle";

/// How long a closed browser gets to exit before its process is killed.
const BROWSER_EXIT_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChromiumOptions {
    /// Explicit browser binary; autodetected when `None`.
    pub executable: Option<PathBuf>,
    /// Pass `--no-sandbox`, needed in most containers.
    pub no_sandbox: bool,
    /// Upper bound for a single DevTools command such as `printToPDF`.
    pub protocol_timeout: Duration,
}

impl ChromiumOptions {
    /// Options whose per-command bound never cuts a navigation or capture
    /// short of the limits enforced by the render session.
    pub fn for_stage_timeouts(navigation: Duration, capture: Duration) -> Self {
        Self {
            protocol_timeout: navigation.max(capture),
            ..Self::default()
        }
    }
}

impl Default for ChromiumOptions {
    fn default() -> Self {
        Self {
            executable: None,
            no_sandbox: false,
            protocol_timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ChromiumEngine {
    options: ChromiumOptions,
}

impl ChromiumEngine {
    pub fn new(options: ChromiumOptions) -> Self {
        Self { options }
    }

    fn browser_config(&self, viewport: Viewport) -> Result<BrowserConfig, RenderError> {
        let mut builder = BrowserConfig::builder()
            .viewport(cdp_viewport(viewport))
            .window_size(viewport.width, viewport.height)
            .request_timeout(self.options.protocol_timeout)
            .arg("--hide-scrollbars")
            .arg("--mute-audio");
        if self.options.no_sandbox {
            builder = builder.no_sandbox();
        }
        if let Some(executable) = &self.options.executable {
            builder = builder.chrome_executable(executable);
        }
        builder.build().map_err(RenderError::launch)
    }
}

#[async_trait]
impl BrowserEngine for ChromiumEngine {
    async fn launch(&self, viewport: Viewport) -> Result<Box<dyn EnginePage>, RenderError> {
        let config = self.browser_config(viewport)?;
        let (mut browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|err| RenderError::launch(err.to_string()))?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(err) = event {
                    debug!(
                        target = "infra::chromium",
                        op = "chromium::handler",
                        error = %err,
                        "DevTools handler reported an error"
                    );
                }
            }
        });

        let page = match browser.new_page("about:blank").await {
            Ok(page) => page,
            Err(err) => {
                let _ = browser.close().await;
                reap(&mut browser).await;
                handler_task.abort();
                return Err(RenderError::launch(format!("failed to open page: {err}")));
            }
        };

        debug!(
            target = "infra::chromium",
            op = "chromium::launch",
            viewport = %viewport,
            "Chromium instance started"
        );

        Ok(Box::new(ChromiumPage {
            browser: Mutex::new(browser),
            page,
            handler_task,
        }))
    }
}

fn cdp_viewport(viewport: Viewport) -> CdpViewport {
    CdpViewport {
        width: viewport.width,
        height: viewport.height,
        device_scale_factor: Some(1.0),
        emulating_mobile: false,
        is_landscape: viewport.width >= viewport.height,
        has_touch: false,
    }
}

/// Maps a print layout onto DevTools parameters.
///
/// Paper size is always explicit and CSS `@page` rules are ignored, so the
/// output page matches the viewport regardless of the document's stylesheet.
fn print_params(layout: &PdfLayout) -> PrintToPdfParams {
    PrintToPdfParams {
        landscape: Some(false),
        display_header_footer: Some(false),
        print_background: Some(layout.print_background),
        scale: Some(1.0),
        paper_width: Some(layout.paper_width_in),
        paper_height: Some(layout.paper_height_in),
        margin_top: Some(layout.margin_top_in),
        margin_bottom: Some(layout.margin_bottom_in),
        margin_left: Some(layout.margin_left_in),
        margin_right: Some(layout.margin_right_in),
        prefer_css_page_size: Some(false),
        ..Default::default()
    }
}

fn protocol_error(err: impl std::fmt::Display) -> RenderError {
    RenderError::protocol(err.to_string())
}

/// Wait for the browser process to exit, killing it after a short grace.
async fn reap(browser: &mut Browser) {
    match tokio::time::timeout(BROWSER_EXIT_GRACE, browser.wait()).await {
        Ok(_) => {}
        Err(_) => {
            warn!(
                target = "infra::chromium",
                op = "chromium::close",
                grace_ms = BROWSER_EXIT_GRACE.as_millis() as u64,
                "Chromium did not exit after close, killing it"
            );
            if let Some(Err(err)) = browser.kill().await {
                debug!(
                    target = "infra::chromium",
                    op = "chromium::close",
                    error = %err,
                    "Killing Chromium failed"
                );
            }
        }
    }
}

/// A response observed while a navigation was in progress.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ObservedResponse {
    kind: ResourceType,
    frame_id: Option<FrameId>,
    status: i64,
}

impl From<&EventResponseReceived> for ObservedResponse {
    fn from(event: &EventResponseReceived) -> Self {
        Self {
            kind: event.r#type.clone(),
            frame_id: event.frame_id.clone(),
            status: event.response.status,
        }
    }
}

/// Status of the last document response served to `main_frame`.
///
/// Sub-resources and documents loaded into other frames (iframes) are
/// ignored. Redirects produce several document responses; the last wins.
fn main_document_status<'a>(
    main_frame: &FrameId,
    responses: impl IntoIterator<Item = &'a ObservedResponse>,
) -> Option<i64> {
    responses
        .into_iter()
        .filter(|response| {
            response.kind == ResourceType::Document
                && response.frame_id.as_ref() == Some(main_frame)
        })
        .map(|response| response.status)
        .last()
}

/// Judge a finished navigation by Chromium's own error text and the main
/// document's HTTP status. A missing status (for example `data:` URLs)
/// counts as success.
fn check_navigation(
    url: &Url,
    error_text: Option<&str>,
    status: Option<i64>,
) -> Result<(), RenderError> {
    if let Some(text) = error_text.filter(|text| !text.is_empty()) {
        return Err(RenderError::navigation(url, text));
    }
    match status {
        Some(status) if !(200..300).contains(&status) => Err(RenderError::navigation(
            url,
            format!("main document responded with status {status}"),
        )),
        _ => Ok(()),
    }
}

struct ChromiumPage {
    browser: Mutex<Browser>,
    page: Page,
    handler_task: JoinHandle<()>,
}

#[async_trait]
impl DomProbe for ChromiumPage {
    async fn sample_dom(&self) -> Result<DomSample, RenderError> {
        let result = self
            .page
            .evaluate(DOM_SAMPLE_SCRIPT)
            .await
            .map_err(|err| RenderError::evaluation(err.to_string()))?;
        result
            .into_value::<DomSample>()
            .map_err(|err| RenderError::evaluation(format!("unexpected sample shape: {err}")))
    }
}

#[async_trait]
impl EnginePage for ChromiumPage {
    async fn navigate(&self, url: &Url) -> Result<(), RenderError> {
        // Subscribe before navigating so no lifecycle event can be missed.
        let mut lifecycle = self
            .page
            .event_listener::<EventLifecycleEvent>()
            .await
            .map_err(protocol_error)?;
        let mut responses = self
            .page
            .event_listener::<EventResponseReceived>()
            .await
            .map_err(protocol_error)?;

        // Issued as a raw command: the page-level `goto` helper applies its
        // own fixed deadline, while this call is bounded by the caller.
        let navigated = self
            .page
            .execute(NavigateParams::new(url.as_str()))
            .await
            .map_err(|err| RenderError::navigation(url, err.to_string()))?;
        let main_frame = navigated.result.frame_id.clone();
        if let Some(text) = navigated.result.error_text.as_deref() {
            check_navigation(url, Some(text), None)?;
        }

        // Network idle belongs to this navigation's loader, not to the
        // about:blank document that preceded it. Without a reported loader,
        // the next `init` on the main frame names it.
        let mut loader = navigated.result.loader_id.clone();
        loop {
            let Some(event) = lifecycle.next().await else {
                return Err(RenderError::navigation(
                    url,
                    "page closed before the network went idle",
                ));
            };
            if event.frame_id != main_frame {
                continue;
            }
            match event.name.as_str() {
                LIFECYCLE_INIT if loader.is_none() => loader = Some(event.loader_id.clone()),
                LIFECYCLE_NETWORK_IDLE if loader.as_ref() == Some(&event.loader_id) => break,
                _ => {}
            }
        }

        let mut observed = Vec::new();
        while let Some(Some(event)) = responses.next().now_or_never() {
            observed.push(ObservedResponse::from(event.as_ref()));
        }
        check_navigation(url, None, main_document_status(&main_frame, &observed))
    }

    async fn print_pdf(&self, layout: &PdfLayout) -> Result<Vec<u8>, RenderError> {
        self.page
            .pdf(print_params(layout))
            .await
            .map_err(|err| RenderError::capture(err.to_string()))
    }

    async fn close(self: Box<Self>) -> Result<(), RenderError> {
        let ChromiumPage {
            browser,
            page,
            handler_task,
        } = *self;

        let page_result = page.close().await;
        let mut browser = browser.into_inner();
        let browser_result = browser.close().await;
        reap(&mut browser).await;
        handler_task.abort();

        page_result.map_err(protocol_error)?;
        browser_result.map(|_| ()).map_err(protocol_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn print_params_follow_layout_exactly() {
        let layout = PdfLayout::for_viewport(Viewport::SLIDE_16_9);
        let params = print_params(&layout);
        assert_eq!(params.paper_width, Some(1280.0 / 96.0));
        assert_eq!(params.paper_height, Some(7.5));
        for margin in [
            params.margin_top,
            params.margin_bottom,
            params.margin_left,
            params.margin_right,
        ] {
            assert_eq!(margin, Some(0.0));
        }
        assert_eq!(params.print_background, Some(true));
        assert_eq!(params.display_header_footer, Some(false));
        assert_eq!(params.prefer_css_page_size, Some(false));
    }

    #[test]
    fn viewport_is_fixed_and_unscaled() {
        let viewport = cdp_viewport(Viewport::SLIDE_16_9);
        assert_eq!((viewport.width, viewport.height), (1280, 720));
        assert_eq!(viewport.device_scale_factor, Some(1.0));
        assert!(!viewport.emulating_mobile);
        assert!(viewport.is_landscape);
    }

    fn response(kind: ResourceType, frame: Option<&str>, status: i64) -> ObservedResponse {
        ObservedResponse {
            kind,
            frame_id: frame.map(FrameId::new),
            status,
        }
    }

    fn url() -> Url {
        Url::parse("http://render.test/pdf-maker?id=abc123").expect("url")
    }

    #[test]
    fn main_document_status_ignores_other_frames_and_subresources() {
        let main = FrameId::new("main");
        let observed = [
            response(ResourceType::Document, Some("main"), 200),
            response(ResourceType::Document, Some("ad-iframe"), 404),
            response(ResourceType::Script, Some("main"), 500),
            response(ResourceType::Image, None, 403),
        ];

        assert_eq!(main_document_status(&main, &observed), Some(200));
    }

    #[test]
    fn main_document_status_takes_the_last_redirect_hop() {
        let main = FrameId::new("main");
        let observed = [
            response(ResourceType::Document, Some("main"), 302),
            response(ResourceType::Document, Some("main"), 404),
        ];

        assert_eq!(main_document_status(&main, &observed), Some(404));
    }

    #[test]
    fn main_document_status_is_absent_without_a_document_response() {
        let main = FrameId::new("main");
        let observed = [response(ResourceType::Stylesheet, Some("main"), 200)];

        assert_eq!(main_document_status(&main, &observed), None);
        assert_eq!(main_document_status(&main, &[]), None);
    }

    #[test]
    fn error_statuses_fail_navigation() {
        for status in [301, 404, 500, 503] {
            let err = check_navigation(&url(), None, Some(status)).expect_err("status fails");
            assert!(err.is_navigation());
            assert!(err.to_string().contains(&status.to_string()), "{err}");
        }
    }

    #[test]
    fn success_or_unknown_status_passes() {
        for status in [Some(200), Some(204), None] {
            assert!(check_navigation(&url(), None, status).is_ok());
        }
    }

    #[test]
    fn chromium_error_text_fails_navigation() {
        let err = check_navigation(&url(), Some("net::ERR_CONNECTION_REFUSED"), Some(200))
            .expect_err("error text fails");
        assert!(err.is_navigation());
        assert!(err.to_string().contains("ERR_CONNECTION_REFUSED"), "{err}");
        assert!(check_navigation(&url(), Some(""), None).is_ok());
    }

    #[test]
    fn protocol_timeout_covers_the_longest_stage() {
        let options =
            ChromiumOptions::for_stage_timeouts(Duration::from_secs(300), Duration::from_secs(120));
        assert_eq!(options.protocol_timeout, Duration::from_secs(300));

        let options =
            ChromiumOptions::for_stage_timeouts(Duration::from_secs(30), Duration::from_secs(90));
        assert_eq!(options.protocol_timeout, Duration::from_secs(90));
        assert!(!options.no_sandbox);
        assert_eq!(options.executable, None);
    }

    #[test]
    fn browser_exit_grace_is_short() {
        assert!(BROWSER_EXIT_GRACE <= Duration::from_secs(10));
    }

    #[test]
    fn sample_script_reports_expected_fields() {
        for field in ["readyState", "total", "visible"] {
            assert!(DOM_SAMPLE_SCRIPT.contains(field));
        }
    }
}
