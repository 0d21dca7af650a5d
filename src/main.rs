use std::{process, sync::Arc};

use render_cache::{
    cache::{CacheConfig, ReconcileOutcome, build_store},
    config::{self, LoadError},
    infra::{
        error::InfraError,
        http::{self, HttpState},
        pages::PageDirRenderer,
        telemetry,
    },
    render::RenderCoordinator,
};
use thiserror::Error;
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[derive(Debug, Error)]
enum AppError {
    #[error("failed to load configuration: {0}")]
    Config(#[from] LoadError),
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error("server error: {0}")]
    Server(String),
}

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
    let (cli_args, settings) = config::load_with_cli()?;
    telemetry::init(&settings.logging)?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::default()));

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
    }
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let store = build_store(&settings.cache);
    let renderer = Arc::new(PageDirRenderer::open(&settings.render)?);
    let cache_config = CacheConfig::from(&settings.cache);

    if settings.cache.patterns.is_empty() {
        info!("no cacheable pages configured; every request is rendered");
    }

    let coordinator = Arc::new(RenderCoordinator::new(
        cache_config,
        Arc::clone(&store),
        renderer.clone(),
    ));

    match coordinator.version_gate().reconcile().await {
        ReconcileOutcome::StoreUnavailable => {
            warn!("cache version could not be verified; stale pages may be served")
        }
        outcome => info!(?outcome, "cache version reconciled"),
    }

    let state = HttpState::new(Arc::clone(&coordinator))
        .with_render_timeout(settings.render.timeout);
    let router = http::build_router(state);

    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(InfraError::from)?;

    info!(
        addr = %settings.server.addr,
        root = %renderer.root().display(),
        backend = store.name(),
        "render cache listening"
    );

    axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| AppError::Server(err.to_string()))?;

    let grace = settings.server.graceful_shutdown;
    if tokio::time::timeout(grace, coordinator.settle_writes())
        .await
        .is_err()
    {
        warn!(
            timeout_secs = grace.as_secs(),
            "pending cache writes did not finish before shutdown"
        );
    }

    info!("render cache stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
