use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};

/// Command-line arguments for the deckpress binary.
#[derive(Debug, Parser)]
#[command(
    name = "deckpress",
    version,
    about = "Headless PDF export service for rendered presentations"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(
        long = "config-file",
        env = "DECKPRESS_CONFIG_FILE",
        value_name = "PATH",
        value_hint = ValueHint::FilePath
    )]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the HTTP export service.
    Serve(Box<ServeArgs>),
    /// Export a single presentation and print its signed URL.
    Export(Box<ExportArgs>),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Clone)]
pub struct ExportArgs {
    /// Presentation to export.
    #[arg(value_name = "PRESENTATION_ID")]
    pub presentation_id: String,

    /// Title used to name the exported file.
    #[arg(long, value_name = "TITLE")]
    pub title: Option<String>,

    /// User whose storage namespace receives the file.
    #[arg(long = "user-id", env = "DECKPRESS_USER_ID", value_name = "USER")]
    pub user_id: String,

    #[command(flatten)]
    pub logging: LoggingOverrides,

    #[command(flatten)]
    pub render: RenderOverrides,

    #[command(flatten)]
    pub storage: StorageOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub server_graceful_shutdown_seconds: Option<u64>,

    /// Override the maximum number of simultaneous exports (0 = unlimited).
    #[arg(long = "export-max-concurrent", value_name = "COUNT")]
    pub export_max_concurrent: Option<u32>,

    #[command(flatten)]
    pub logging: LoggingOverrides,

    #[command(flatten)]
    pub render: RenderOverrides,

    #[command(flatten)]
    pub storage: StorageOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct LoggingOverrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct RenderOverrides {
    /// Override the page that renders a presentation for printing.
    #[arg(long = "render-base-url", value_name = "URL")]
    pub base_url: Option<String>,

    /// Override the Chromium executable used for rendering.
    #[arg(long = "render-chrome-executable", value_name = "PATH", value_hint = ValueHint::ExecutablePath)]
    pub chrome_executable: Option<PathBuf>,

    /// Launch Chromium without its sandbox (containers).
    #[arg(
        long = "render-no-sandbox",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub no_sandbox: Option<bool>,

    /// Override the navigation timeout.
    #[arg(long = "render-navigation-timeout-seconds", value_name = "SECONDS")]
    pub navigation_timeout_seconds: Option<u64>,

    /// Override the capture timeout.
    #[arg(long = "render-capture-timeout-seconds", value_name = "SECONDS")]
    pub capture_timeout_seconds: Option<u64>,

    /// Override how long to wait for visual readiness before capturing anyway.
    #[arg(long = "readiness-timeout-seconds", value_name = "SECONDS")]
    pub readiness_timeout_seconds: Option<u64>,

    /// Override the visible-element ratio that counts as ready.
    #[arg(long = "readiness-threshold", value_name = "RATIO")]
    pub readiness_threshold: Option<f64>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct StorageOverrides {
    /// Override the storage endpoint.
    #[arg(long = "storage-url", value_name = "URL")]
    pub url: Option<String>,

    /// Override the storage bucket.
    #[arg(long = "storage-bucket", value_name = "BUCKET")]
    pub bucket: Option<String>,

    /// Override the signed URL lifetime.
    #[arg(long = "storage-signed-url-ttl-seconds", value_name = "SECONDS")]
    pub signed_url_ttl_seconds: Option<u64>,
}
