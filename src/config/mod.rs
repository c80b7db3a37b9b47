//! Configuration layer: typed settings with layered precedence (file → env → CLI).

mod cli;

use std::{fmt, net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};

use axum::http::HeaderName;
use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

use crate::application::export::{DEFAULT_RENDER_BASE_URL, ExportConfig};
use crate::application::identity::DEFAULT_USER_HEADER;
use crate::application::publish::DEFAULT_SIGNED_URL_TTL;
use crate::application::render::{
    DEFAULT_CAPTURE_TIMEOUT, DEFAULT_COMPLETION_THRESHOLD, DEFAULT_NAVIGATION_TIMEOUT,
    DEFAULT_POLL_INTERVAL, DEFAULT_READINESS_TIMEOUT, DEFAULT_SETTLE_DELAY, ReadinessPolicy,
    RenderSessionConfig,
};
use crate::domain::export::{UserId, Viewport};

pub use cli::{
    CliArgs, Command, ExportArgs, LoggingOverrides, RenderOverrides, ServeArgs, ServeOverrides,
    StorageOverrides,
};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "deckpress";
const ENV_PREFIX: &str = "DECKPRESS";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_STORAGE_REQUEST_TIMEOUT_SECS: u64 = 60;
const DEFAULT_MAX_CONCURRENT_EXPORTS: u32 = 0;

/// Variables honoured for deployments that predate the `DECKPRESS__` prefix.
const LEGACY_STORAGE_URL_ENV: &str = "SUPABASE_URL";
const LEGACY_STORAGE_KEY_ENV: &str = "SUPABASE_SERVICE_ROLE_KEY";
const LEGACY_STORAGE_BUCKET_ENV: &str = "SUPABASE_STORAGE_BUCKET";

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub render: RenderSettings,
    pub readiness: ReadinessPolicy,
    pub storage: StorageSettings,
    pub auth: AuthSettings,
    pub export: ExportSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct RenderSettings {
    pub base_url: Url,
    pub chrome_executable: Option<PathBuf>,
    pub no_sandbox: bool,
    pub viewport: Viewport,
    pub navigation_timeout: Duration,
    pub capture_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct StorageSettings {
    /// `None` when no storage is configured; exports then fail fast.
    pub connection: Option<StorageConnection>,
    pub signed_url_ttl: Duration,
    pub request_timeout: Duration,
}

#[derive(Clone, PartialEq, Eq)]
pub struct StorageConnection {
    pub url: Url,
    pub service_key: String,
    pub bucket: String,
}

impl fmt::Debug for StorageConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageConnection")
            .field("url", &self.url.as_str())
            .field("service_key", &"[redacted]")
            .field("bucket", &self.bucket)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub enum AuthSettings {
    TrustedHeader { header: HeaderName },
    ApiKeys { keys: Vec<ApiKeyEntry> },
}

#[derive(Debug, Clone)]
pub struct ApiKeyEntry {
    pub user_id: UserId,
    pub token_sha256: String,
}

#[derive(Debug, Clone)]
pub struct ExportSettings {
    /// Zero disables the limit.
    pub max_concurrent: u32,
}

impl Settings {
    /// Pipeline configuration derived from the render, readiness and export sections.
    pub fn export_config(&self) -> ExportConfig {
        ExportConfig {
            render_base: self.render.base_url.clone(),
            session: RenderSessionConfig {
                viewport: self.render.viewport,
                navigation_timeout: self.render.navigation_timeout,
                capture_timeout: self.render.capture_timeout,
                readiness: self.readiness,
            },
            max_concurrent: self.export.max_concurrent as usize,
        }
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;
    raw.storage
        .apply_legacy_env(|name| std::env::var(name).ok());

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Export(args)) => raw.apply_export_overrides(args),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    render: RawRenderSettings,
    readiness: RawReadinessSettings,
    storage: RawStorageSettings,
    auth: RawAuthSettings,
    export: RawExportSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(max) = overrides.export_max_concurrent {
            self.export.max_concurrent = Some(max);
        }

        self.apply_logging_overrides(&overrides.logging);
        self.apply_render_overrides(&overrides.render);
        self.apply_storage_overrides(&overrides.storage);
    }

    fn apply_export_overrides(&mut self, args: &ExportArgs) {
        self.apply_logging_overrides(&args.logging);
        self.apply_render_overrides(&args.render);
        self.apply_storage_overrides(&args.storage);
    }

    fn apply_logging_overrides(&mut self, overrides: &LoggingOverrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
    }

    fn apply_render_overrides(&mut self, overrides: &RenderOverrides) {
        if let Some(url) = overrides.base_url.as_ref() {
            self.render.base_url = Some(url.clone());
        }
        if let Some(path) = overrides.chrome_executable.as_ref() {
            self.render.chrome_executable = Some(path.clone());
        }
        if let Some(no_sandbox) = overrides.no_sandbox {
            self.render.no_sandbox = Some(no_sandbox);
        }
        if let Some(seconds) = overrides.navigation_timeout_seconds {
            self.render.navigation_timeout_seconds = Some(seconds);
        }
        if let Some(seconds) = overrides.capture_timeout_seconds {
            self.render.capture_timeout_seconds = Some(seconds);
        }
        if let Some(seconds) = overrides.readiness_timeout_seconds {
            self.readiness.timeout_seconds = Some(seconds);
        }
        if let Some(threshold) = overrides.readiness_threshold {
            self.readiness.threshold = Some(threshold);
        }
    }

    fn apply_storage_overrides(&mut self, overrides: &StorageOverrides) {
        if let Some(url) = overrides.url.as_ref() {
            self.storage.url = Some(url.clone());
        }
        if let Some(bucket) = overrides.bucket.as_ref() {
            self.storage.bucket = Some(bucket.clone());
        }
        if let Some(ttl) = overrides.signed_url_ttl_seconds {
            self.storage.signed_url_ttl_seconds = Some(ttl);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            render,
            readiness,
            storage,
            auth,
            export,
        } = raw;

        Ok(Self {
            server: build_server_settings(server)?,
            logging: build_logging_settings(logging)?,
            render: build_render_settings(render)?,
            readiness: build_readiness_policy(readiness)?,
            storage: build_storage_settings(storage)?,
            auth: build_auth_settings(auth)?,
            export: ExportSettings {
                max_concurrent: export
                    .max_concurrent
                    .unwrap_or(DEFAULT_MAX_CONCURRENT_EXPORTS),
            },
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());
    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }

    let addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("server.addr", reason))?;

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    let graceful_shutdown = non_zero_secs(graceful_secs, "server.graceful_shutdown_seconds")?;

    Ok(ServerSettings {
        addr,
        graceful_shutdown,
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_render_settings(render: RawRenderSettings) -> Result<RenderSettings, LoadError> {
    let base_url = parse_http_url(
        render.base_url.as_deref().unwrap_or(DEFAULT_RENDER_BASE_URL),
        "render.base_url",
    )?;

    let chrome_executable = render
        .chrome_executable
        .filter(|path| !path.as_os_str().is_empty());

    let viewport = Viewport::new(
        render
            .viewport_width
            .unwrap_or(Viewport::SLIDE_16_9.width),
        render
            .viewport_height
            .unwrap_or(Viewport::SLIDE_16_9.height),
    )
    .map_err(|err| LoadError::invalid("render.viewport", err.message()))?;

    let navigation_timeout = match render.navigation_timeout_seconds {
        Some(secs) => non_zero_secs(secs, "render.navigation_timeout_seconds")?,
        None => DEFAULT_NAVIGATION_TIMEOUT,
    };
    let capture_timeout = match render.capture_timeout_seconds {
        Some(secs) => non_zero_secs(secs, "render.capture_timeout_seconds")?,
        None => DEFAULT_CAPTURE_TIMEOUT,
    };

    Ok(RenderSettings {
        base_url,
        chrome_executable,
        no_sandbox: render.no_sandbox.unwrap_or(false),
        viewport,
        navigation_timeout,
        capture_timeout,
    })
}

fn build_readiness_policy(readiness: RawReadinessSettings) -> Result<ReadinessPolicy, LoadError> {
    let timeout = match readiness.timeout_seconds {
        Some(secs) => non_zero_secs(secs, "readiness.timeout_seconds")?,
        None => DEFAULT_READINESS_TIMEOUT,
    };

    let poll_interval = match readiness.poll_interval_ms {
        Some(0) => {
            return Err(LoadError::invalid(
                "readiness.poll_interval_ms",
                "must be greater than zero",
            ));
        }
        Some(ms) => Duration::from_millis(ms),
        None => DEFAULT_POLL_INTERVAL,
    };

    let threshold = readiness.threshold.unwrap_or(DEFAULT_COMPLETION_THRESHOLD);
    if !(threshold > 0.0 && threshold <= 1.0) {
        return Err(LoadError::invalid(
            "readiness.threshold",
            "must be within (0, 1]",
        ));
    }

    let settle_delay = readiness
        .settle_delay_ms
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_SETTLE_DELAY);

    Ok(ReadinessPolicy {
        timeout,
        poll_interval,
        threshold,
        settle_delay,
    })
}

fn build_storage_settings(storage: RawStorageSettings) -> Result<StorageSettings, LoadError> {
    let url = non_blank(storage.url);
    let service_key = non_blank(storage.service_key);
    let bucket = non_blank(storage.bucket);

    let connection = match (url, service_key, bucket) {
        (None, None, None) => None,
        (Some(url), Some(service_key), Some(bucket)) => Some(StorageConnection {
            url: parse_http_url(&url, "storage.url")?,
            service_key,
            bucket,
        }),
        _ => {
            return Err(LoadError::invalid(
                "storage",
                "url, service_key and bucket must be set together",
            ));
        }
    };

    let signed_url_ttl = match storage.signed_url_ttl_seconds {
        Some(secs) => non_zero_secs(secs, "storage.signed_url_ttl_seconds")?,
        None => DEFAULT_SIGNED_URL_TTL,
    };
    let request_timeout = non_zero_secs(
        storage
            .request_timeout_seconds
            .unwrap_or(DEFAULT_STORAGE_REQUEST_TIMEOUT_SECS),
        "storage.request_timeout_seconds",
    )?;

    Ok(StorageSettings {
        connection,
        signed_url_ttl,
        request_timeout,
    })
}

fn build_auth_settings(auth: RawAuthSettings) -> Result<AuthSettings, LoadError> {
    let mode = auth.mode.as_deref().map(str::trim).unwrap_or("trusted_header");
    match mode {
        "trusted_header" => {
            let header = auth.header.as_deref().unwrap_or(DEFAULT_USER_HEADER);
            let header = HeaderName::from_str(&header.to_ascii_lowercase())
                .map_err(|err| LoadError::invalid("auth.header", err.to_string()))?;
            Ok(AuthSettings::TrustedHeader { header })
        }
        "api_keys" => {
            if auth.api_keys.is_empty() {
                return Err(LoadError::invalid(
                    "auth.api_keys",
                    "at least one key is required when auth.mode = api_keys",
                ));
            }
            let keys = auth
                .api_keys
                .into_iter()
                .map(|entry| {
                    let user_id = UserId::parse(&entry.user_id)
                        .map_err(|err| LoadError::invalid("auth.api_keys.user_id", err.message()))?;
                    let digest = entry.token_sha256.trim().to_ascii_lowercase();
                    if digest.len() != 64 || !digest.bytes().all(|b| b.is_ascii_hexdigit()) {
                        return Err(LoadError::invalid(
                            "auth.api_keys.token_sha256",
                            "must be a hex-encoded SHA-256 digest",
                        ));
                    }
                    Ok(ApiKeyEntry {
                        user_id,
                        token_sha256: digest,
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok(AuthSettings::ApiKeys { keys })
        }
        other => Err(LoadError::invalid(
            "auth.mode",
            format!("unknown mode `{other}` (expected trusted_header or api_keys)"),
        )),
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRenderSettings {
    base_url: Option<String>,
    chrome_executable: Option<PathBuf>,
    no_sandbox: Option<bool>,
    viewport_width: Option<u32>,
    viewport_height: Option<u32>,
    navigation_timeout_seconds: Option<u64>,
    capture_timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawReadinessSettings {
    timeout_seconds: Option<u64>,
    poll_interval_ms: Option<u64>,
    threshold: Option<f64>,
    settle_delay_ms: Option<u64>,
}

#[derive(Clone, Deserialize, Default)]
#[serde(default)]
struct RawStorageSettings {
    url: Option<String>,
    service_key: Option<String>,
    bucket: Option<String>,
    signed_url_ttl_seconds: Option<u64>,
    request_timeout_seconds: Option<u64>,
}

impl fmt::Debug for RawStorageSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawStorageSettings")
            .field("url", &self.url)
            .field("service_key", &self.service_key.as_ref().map(|_| "[redacted]"))
            .field("bucket", &self.bucket)
            .field("signed_url_ttl_seconds", &self.signed_url_ttl_seconds)
            .field("request_timeout_seconds", &self.request_timeout_seconds)
            .finish()
    }
}

impl RawStorageSettings {
    /// Fill unset connection fields from the legacy `SUPABASE_*` variables.
    fn apply_legacy_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if self.url.is_none() {
            self.url = lookup(LEGACY_STORAGE_URL_ENV);
        }
        if self.service_key.is_none() {
            self.service_key = lookup(LEGACY_STORAGE_KEY_ENV);
        }
        if self.bucket.is_none() {
            self.bucket = lookup(LEGACY_STORAGE_BUCKET_ENV);
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawAuthSettings {
    mode: Option<String>,
    header: Option<String>,
    api_keys: Vec<RawApiKey>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawApiKey {
    user_id: String,
    token_sha256: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawExportSettings {
    max_concurrent: Option<u32>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn parse_http_url(value: &str, key: &'static str) -> Result<Url, LoadError> {
    let url = Url::parse(value.trim())
        .map_err(|err| LoadError::invalid(key, format!("invalid URL: {err}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(LoadError::invalid(key, "URL scheme must be http or https"));
    }
    Ok(url)
}

fn non_zero_secs(value: u64, key: &'static str) -> Result<Duration, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    Ok(Duration::from_secs(value))
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    })
}
