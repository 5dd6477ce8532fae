use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use mail_director::config::OrchestratorConfig;
use mail_director::fetcher::{FetchCoordinator, spawn_error_drain};
use mail_director::llm::UnconfiguredBackend;
use mail_director::mail::ProviderRegistry;
use mail_director::server::{AppState, router};
use mail_director::store::LibSqlStore;

const EVICTION_SWEEP: Duration = Duration::from_secs(60);

/// Console output always; a daily-rolling file too when a log dir is set.
fn init_tracing(log_dir: Option<PathBuf>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "mail-director.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(file_layer)
        .init();
    guard
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guard = init_tracing(std::env::var_os("MAIL_DIRECTOR_LOG_DIR").map(PathBuf::from));
    let config = OrchestratorConfig::from_env();
    config.validate().context("invalid configuration")?;

    info!(version = env!("CARGO_PKG_VERSION"), "Mail Director starting");

    // ── Store ────────────────────────────────────────────────────────────
    let store = Arc::new(
        LibSqlStore::new_local(&config.server.database_path)
            .await
            .with_context(|| {
                format!(
                    "failed to open database at {}",
                    config.server.database_path.display()
                )
            })?,
    );
    info!(path = %config.server.database_path.display(), "Database ready");

    // ── Coordinator ──────────────────────────────────────────────────────
    // Adapters and the LLM backend are supplied by embedders.
    let providers = ProviderRegistry::new();
    if providers.is_empty() {
        warn!("No mail provider adapters registered; every account will report a missing adapter");
    }
    warn!("No LLM backend configured; director runs will fail until one is injected");

    let (coordinator, errors) = FetchCoordinator::new(
        store.clone(),
        store,
        Arc::new(UnconfiguredBackend),
        providers,
        &config,
    );
    let _drain = spawn_error_drain(Arc::clone(coordinator.registry()), errors);

    let registry = Arc::clone(coordinator.registry());
    let idle_eviction = config.fetcher.idle_eviction;
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(EVICTION_SWEEP);
        loop {
            tick.tick().await;
            let evicted = registry.evict_idle(idle_eviction).await;
            if !evicted.is_empty() {
                info!(count = evicted.len(), "Idle tenant sessions evicted");
            }
        }
    });

    for tenant in &config.server.tenants {
        coordinator.start(tenant).await;
        info!(tenant = %tenant, "Fetcher started on boot");
    }

    // ── HTTP ─────────────────────────────────────────────────────────────
    let app = router(AppState {
        coordinator: Arc::clone(&coordinator),
    });
    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.server.bind))?;
    info!(bind = %config.server.bind, "Status server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for shutdown signal");
            }
        })
        .await
        .context("status server failed")?;

    info!("Mail Director stopped");
    Ok(())
}
