//! Requires a local Chrome/Chromium. Run with `cargo test -- --ignored`.

use std::sync::Arc;
use std::time::Duration;

use axum::{Router, http::StatusCode, response::Html, routing::get};
use deckpress::application::render::{
    ReadinessPolicy, RenderError, RenderSession, RenderSessionConfig, SessionState,
};
use deckpress::infra::chromium::{ChromiumEngine, ChromiumOptions};
use url::Url;

const SLIDE: &str = r#"<!doctype html>
<html>
  <body style="margin:0;background:#123456">
    <section style="width:1280px;height:720px;color:white;font:48px sans-serif">
      <h1>Quarterly Review</h1>
    </section>
  </body>
</html>"#;

async fn serve(app: Router) -> (String, tokio::task::JoinHandle<()>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let server = tokio::spawn(async move {
        let _ = axum::serve(listener, app.into_make_service()).await;
    });
    (format!("http://{addr}"), server)
}

fn engine(navigation_timeout: Duration) -> Arc<ChromiumEngine> {
    Arc::new(ChromiumEngine::new(ChromiumOptions {
        no_sandbox: std::env::var_os("DECKPRESS_LIVE_NO_SANDBOX").is_some(),
        ..ChromiumOptions::for_stage_timeouts(navigation_timeout, Duration::from_secs(120))
    }))
}

fn session_config(navigation_timeout: Duration) -> RenderSessionConfig {
    RenderSessionConfig {
        navigation_timeout,
        readiness: ReadinessPolicy {
            timeout: Duration::from_secs(20),
            ..ReadinessPolicy::default()
        },
        ..RenderSessionConfig::default()
    }
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "needs a Chromium binary"]
async fn chromium_renders_a_served_slide_to_pdf() {
    let app = Router::new().route("/pdf-maker", get(|| async { Html(SLIDE) }));
    let (base, server) = serve(app).await;

    let timeout = Duration::from_secs(60);
    let mut session = RenderSession::new(engine(timeout), session_config(timeout));
    let url = Url::parse(&format!("{base}/pdf-maker?id=live")).expect("url");

    session.open().await.expect("open");
    session.navigate(&url).await.expect("navigate");
    let readiness = session.await_ready().await.expect("readiness");
    assert!(!readiness.is_degraded(), "{readiness:?}");
    let artifact = session.capture("Quarterly_Review.pdf").await.expect("capture");
    assert_eq!(session.state(), SessionState::Captured);
    session.close().await.expect("close");

    assert!(artifact.bytes.starts_with(b"%PDF-"));
    assert_eq!(artifact.suggested_filename, "Quarterly_Review.pdf");

    server.abort();
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "needs a Chromium binary; takes about 35s"]
async fn slow_pages_load_within_the_configured_navigation_timeout() {
    let app = Router::new().route(
        "/pdf-maker",
        get(|| async {
            tokio::time::sleep(Duration::from_secs(35)).await;
            Html(SLIDE)
        }),
    );
    let (base, server) = serve(app).await;

    let timeout = Duration::from_secs(90);
    let mut session = RenderSession::new(engine(timeout), session_config(timeout));
    let url = Url::parse(&format!("{base}/pdf-maker?id=slow")).expect("url");

    session.open().await.expect("open");
    session.navigate(&url).await.expect("slow page still loads");
    session.close().await.expect("close");

    server.abort();
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "needs a Chromium binary"]
async fn missing_presentation_page_is_a_navigation_error() {
    let app = Router::new().route(
        "/pdf-maker",
        get(|| async { (StatusCode::NOT_FOUND, Html("<h1>Not found</h1>")) }),
    );
    let (base, server) = serve(app).await;

    let timeout = Duration::from_secs(60);
    let mut session = RenderSession::new(engine(timeout), session_config(timeout));
    let url = Url::parse(&format!("{base}/pdf-maker?id=missing")).expect("url");

    session.open().await.expect("open");
    let err = session.navigate(&url).await.expect_err("404 fails");
    assert!(
        matches!(&err, RenderError::Navigation { message, .. } if message.contains("404")),
        "{err:?}"
    );
    session.close().await.expect("close");

    server.abort();
}
