pub mod api;
pub mod appointment;
pub mod authorization;
pub mod booking;
pub mod config;
pub mod core_state;
pub mod db;
pub mod gateway;
pub mod models;
pub mod notification;
pub mod scheduling;
pub mod settlement;
pub mod wallet;

use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::EnvFilter;

use crate::config::AppConfig;
use crate::core_state::CoreState;

/// How often the in-memory audit buffer is flushed to the database.
const AUDIT_FLUSH_INTERVAL: Duration = Duration::from_secs(60);

pub fn run() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config::default_log_filter())),
        )
        .init();

    tracing::info!("{} starting v{}", config::APP_NAME, config::APP_VERSION);

    let app_config = match AppConfig::from_env() {
        Ok(app_config) => app_config,
        Err(e) => {
            tracing::error!("Configuration error: {e}");
            std::process::exit(2);
        }
    };

    // Built before the runtime: the HTTP gateway client is blocking.
    let core = match CoreState::new(app_config) {
        Ok(core) => Arc::new(core),
        Err(e) => {
            tracing::error!("Startup failed: {e}");
            std::process::exit(1);
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!("Failed to start async runtime: {e}");
            std::process::exit(1);
        }
    };

    let result = runtime.block_on(serve(core.clone()));

    if let Err(e) = core.flush_and_prune_audit() {
        tracing::warn!("Final audit flush failed: {e}");
    }
    // Drop the runtime before `core`: the blocking gateway client must not
    // be dropped on a runtime thread.
    drop(runtime);

    if let Err(e) = result {
        tracing::error!("{e}");
        std::process::exit(1);
    }
    tracing::info!("{} stopped", config::APP_NAME);
}

async fn serve(core: Arc<CoreState>) -> Result<(), String> {
    let bind = core.config().bind;
    let server = api::start_api_server(core.clone(), bind).await?;
    tracing::info!(addr = %server.session.server_addr, "Listening");

    let flusher = tokio::spawn(flush_audit_periodically(core));

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {e}");
    }
    tracing::info!("Shutdown requested");

    flusher.abort();
    server.stop().await;
    Ok(())
}

async fn flush_audit_periodically(core: Arc<CoreState>) {
    let mut ticker = tokio::time::interval(AUDIT_FLUSH_INTERVAL);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let core = core.clone();
        match tokio::task::spawn_blocking(move || core.flush_and_prune_audit()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!("Audit flush failed: {e}"),
            Err(e) => tracing::warn!("Audit flush task failed: {e}"),
        }
    }
}
