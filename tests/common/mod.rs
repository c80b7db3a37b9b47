#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderValue};
use bytes::Bytes;
use tokio::sync::Notify;
use url::Url;

use deckpress::application::export::{ExportConfig, ExportService};
use deckpress::application::identity::TrustedHeaderIdentity;
use deckpress::application::publish::{ArtifactPublisher, ObjectStore, StorageError};
use deckpress::application::render::{
    BrowserEngine, DomProbe, DomSample, EnginePage, PdfLayout, ReadinessPolicy, RenderError,
    RenderSessionConfig,
};
use deckpress::domain::export::Viewport;

pub const RENDER_BASE: &str = "http://render.test/pdf-maker";
pub const STORAGE_BASE: &str = "https://project.supabase.co";
pub const USER: &str = "user-1";

#[derive(Debug, Clone, Copy)]
pub enum Navigation {
    Succeeds,
    Fails,
    Hangs,
}

#[derive(Debug, Clone, Copy)]
pub enum Paint {
    Complete,
    Never,
}

/// Everything the fake engine observed, shared with the pages it hands out.
#[derive(Default)]
pub struct EngineLog {
    pub launches: AtomicUsize,
    pub closes: AtomicUsize,
    pub prints: AtomicUsize,
    pub viewports: Mutex<Vec<Viewport>>,
    pub urls: Mutex<Vec<String>>,
    pub layouts: Mutex<Vec<PdfLayout>>,
    pub closed: Notify,
}

impl EngineLog {
    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn prints(&self) -> usize {
        self.prints.load(Ordering::SeqCst)
    }
}

pub struct FakeEngine {
    navigation: Navigation,
    paint: Paint,
    pub log: Arc<EngineLog>,
}

impl FakeEngine {
    pub fn new(navigation: Navigation, paint: Paint) -> Arc<Self> {
        Arc::new(Self {
            navigation,
            paint,
            log: Arc::new(EngineLog::default()),
        })
    }

    pub fn healthy() -> Arc<Self> {
        Self::new(Navigation::Succeeds, Paint::Complete)
    }
}

#[async_trait]
impl BrowserEngine for FakeEngine {
    async fn launch(&self, viewport: Viewport) -> Result<Box<dyn EnginePage>, RenderError> {
        self.log.launches.fetch_add(1, Ordering::SeqCst);
        self.log
            .viewports
            .lock()
            .expect("viewports lock")
            .push(viewport);
        Ok(Box::new(FakePage {
            navigation: self.navigation,
            paint: self.paint,
            log: Arc::clone(&self.log),
        }))
    }
}

struct FakePage {
    navigation: Navigation,
    paint: Paint,
    log: Arc<EngineLog>,
}

#[async_trait]
impl DomProbe for FakePage {
    async fn sample_dom(&self) -> Result<DomSample, RenderError> {
        Ok(match self.paint {
            Paint::Complete => DomSample::new("complete", 40, 40),
            Paint::Never => DomSample::new("interactive", 40, 12),
        })
    }
}

#[async_trait]
impl EnginePage for FakePage {
    async fn navigate(&self, url: &Url) -> Result<(), RenderError> {
        self.log
            .urls
            .lock()
            .expect("urls lock")
            .push(url.to_string());
        match self.navigation {
            Navigation::Succeeds => Ok(()),
            Navigation::Fails => Err(RenderError::navigation(url, "net::ERR_CONNECTION_REFUSED")),
            Navigation::Hangs => std::future::pending().await,
        }
    }

    async fn print_pdf(&self, layout: &PdfLayout) -> Result<Vec<u8>, RenderError> {
        self.log.prints.fetch_add(1, Ordering::SeqCst);
        self.log
            .layouts
            .lock()
            .expect("layouts lock")
            .push(*layout);
        Ok(b"%PDF-1.7\n%fake deck\n".to_vec())
    }

    async fn close(self: Box<Self>) -> Result<(), RenderError> {
        self.log.closes.fetch_add(1, Ordering::SeqCst);
        self.log.closed.notify_one();
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PutCall {
    pub key: String,
    pub bytes: usize,
    pub content_type: String,
}

#[derive(Default)]
pub struct RecordingStore {
    fail_upload_with: Option<u16>,
    pub puts: Mutex<Vec<PutCall>>,
    pub signs: Mutex<Vec<(String, Duration)>>,
}

impl RecordingStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn rejecting_uploads(status: u16) -> Arc<Self> {
        Arc::new(Self {
            fail_upload_with: Some(status),
            ..Self::default()
        })
    }

    pub fn puts(&self) -> Vec<PutCall> {
        self.puts.lock().expect("puts lock").clone()
    }

    pub fn signs(&self) -> Vec<(String, Duration)> {
        self.signs.lock().expect("signs lock").clone()
    }
}

#[async_trait]
impl ObjectStore for RecordingStore {
    async fn put_object(
        &self,
        key: &str,
        body: Bytes,
        content_type: &str,
    ) -> Result<(), StorageError> {
        if let Some(status) = self.fail_upload_with {
            return Err(StorageError::Status {
                status,
                body: "new row violates row-level security policy".to_string(),
            });
        }
        self.puts.lock().expect("puts lock").push(PutCall {
            key: key.to_string(),
            bytes: body.len(),
            content_type: content_type.to_string(),
        });
        Ok(())
    }

    async fn create_signed_url(
        &self,
        key: &str,
        expires_in: Duration,
    ) -> Result<String, StorageError> {
        self.signs
            .lock()
            .expect("signs lock")
            .push((key.to_string(), expires_in));
        Ok(format!(
            "{STORAGE_BASE}/storage/v1/object/sign/exports/{key}?token=signed"
        ))
    }

    async fn delete_object(&self, _key: &str) -> Result<(), StorageError> {
        Ok(())
    }
}

pub fn export_config(max_concurrent: usize) -> ExportConfig {
    ExportConfig {
        render_base: Url::parse(RENDER_BASE).expect("render base"),
        session: RenderSessionConfig {
            readiness: ReadinessPolicy {
                timeout: Duration::from_secs(2),
                poll_interval: Duration::from_millis(50),
                threshold: 0.99,
                settle_delay: Duration::from_millis(10),
            },
            ..RenderSessionConfig::default()
        },
        max_concurrent,
    }
}

pub fn service_with(
    engine: Arc<FakeEngine>,
    store: Option<Arc<RecordingStore>>,
    max_concurrent: usize,
) -> ExportService {
    let publisher = store.map(|store| {
        ArtifactPublisher::new(store as Arc<dyn ObjectStore>, Duration::from_secs(3600))
    });
    ExportService::new(
        engine,
        Arc::new(TrustedHeaderIdentity::default()),
        publisher,
        export_config(max_concurrent),
    )
}

pub fn service(engine: Arc<FakeEngine>, store: Arc<RecordingStore>) -> ExportService {
    service_with(engine, Some(store), 0)
}

pub fn caller(user: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert("x-user-id", HeaderValue::from_str(user).expect("header value"));
    headers
}

/// Wait until `condition` holds, yielding to spawned tasks in between.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
