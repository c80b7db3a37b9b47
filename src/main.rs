use std::{future::IntoFuture, process, sync::Arc, time::Duration};

use deckpress::{
    application::{
        error::AppError,
        export::ExportService,
        identity::{ApiKeyIdentity, IdentityProvider, TrustedHeaderIdentity},
        publish::ArtifactPublisher,
    },
    config::{self, AuthSettings, ExportArgs},
    domain::export::{ExportRequest, UserId},
    infra::{
        chromium::{ChromiumEngine, ChromiumOptions},
        error::InfraError,
        http::{self, HttpState},
        storage::SupabaseStorage,
        telemetry,
    },
};
use tokio::sync::oneshot;
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| AppError::unexpected(format!("failed to load configuration: {err}")))?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Export(args) => run_export(settings, *args).await,
    }
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let exports = build_export_service(&settings)?;
    let router = http::build_router(HttpState::new(exports));

    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;
    info!(
        target = "deckpress::serve",
        addr = %settings.server.addr,
        "Export service listening"
    );

    let (stopping_tx, stopping_rx) = oneshot::channel::<()>();
    let server = axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            let _ = stopping_tx.send(());
        })
        .into_future();
    tokio::pin!(server);

    let grace = settings.server.graceful_shutdown;
    tokio::select! {
        result = &mut server => {
            result.map_err(|err| AppError::unexpected(format!("server error: {err}")))?;
        }
        _ = drain_deadline(stopping_rx, grace) => {
            warn!(
                target = "deckpress::serve",
                grace_secs = grace.as_secs(),
                "Graceful shutdown timed out; abandoning in-flight exports"
            );
        }
    }

    Ok(())
}

/// Resolves `grace` after shutdown began; pending forever while serving.
async fn drain_deadline(stopping: oneshot::Receiver<()>, grace: Duration) {
    if stopping.await.is_err() {
        std::future::pending::<()>().await;
    }
    tokio::time::sleep(grace).await;
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(target = "deckpress::serve", error = %err, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(target = "deckpress::serve", error = %err, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!(target = "deckpress::serve", "Shutdown signal received");
}

async fn run_export(settings: config::Settings, args: ExportArgs) -> Result<(), AppError> {
    let user = UserId::parse(&args.user_id)?;
    let exports = build_export_service(&settings)?;
    let request = ExportRequest::new(args.presentation_id, args.title);

    let outcome = exports.export_as(&request, user).await?;
    info!(
        target = "deckpress::export",
        export_id = %outcome.export_id,
        key = %outcome.location.storage_key,
        readiness = outcome.readiness.as_str(),
        bytes = outcome.bytes,
        "Export complete"
    );
    println!("{}", outcome.location.signed_url);
    Ok(())
}

fn build_export_service(settings: &config::Settings) -> Result<ExportService, AppError> {
    let engine = Arc::new(ChromiumEngine::new(ChromiumOptions {
        executable: settings.render.chrome_executable.clone(),
        no_sandbox: settings.render.no_sandbox,
        ..ChromiumOptions::for_stage_timeouts(
            settings.render.navigation_timeout,
            settings.render.capture_timeout,
        )
    }));

    let identity: Arc<dyn IdentityProvider> = match &settings.auth {
        AuthSettings::TrustedHeader { header } => {
            Arc::new(TrustedHeaderIdentity::new(header.clone()))
        }
        AuthSettings::ApiKeys { keys } => {
            let provider = ApiKeyIdentity::from_digests(
                keys.iter()
                    .map(|key| (&key.user_id, key.token_sha256.as_str())),
            )
            .map_err(|reason| AppError::from(InfraError::configuration(reason)))?;
            Arc::new(provider)
        }
    };

    let publisher = match &settings.storage.connection {
        Some(connection) => {
            let store = SupabaseStorage::new(connection, settings.storage.request_timeout)?;
            Some(ArtifactPublisher::new(
                Arc::new(store),
                settings.storage.signed_url_ttl,
            ))
        }
        None => {
            warn!(
                target = "deckpress::bootstrap",
                "Storage is not configured; exports will be rejected"
            );
            None
        }
    };

    Ok(ExportService::new(
        engine,
        identity,
        publisher,
        settings.export_config(),
    ))
}
