use anyhow::{Context, Result};
use labelling_service::config::{Config, ServiceConfig};
use labelling_service::{
    start_api_server, AppState, FsMediaCatalog, LabellingService, MemorySelectionStore,
    PgSelectionStore, SelectionStore,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    init_tracing(&config.service);

    info!(
        service = %config.service.name,
        media_root = %config.media.root.display(),
        actor_header = %config.api.actor_header,
        "Starting labelling service"
    );

    if config.service.metrics_enabled {
        init_metrics(config.service.metrics_port)?;
    }

    let store = build_store(&config).await?;
    let catalog = Arc::new(FsMediaCatalog::new(
        config.media.root.clone(),
        &config.media.frame_extensions,
    ));

    let labelling = Arc::new(LabellingService::new(store, catalog, &config.selection));
    let api_state = AppState::new(labelling, &config.api).context("Failed to build API state")?;

    start_api_server(api_state, &config.api, shutdown_signal()).await?;

    info!("Labelling service stopped");
    Ok(())
}

/// Pick the selection store named by `database.url`
async fn build_store(config: &Config) -> Result<Arc<dyn SelectionStore>> {
    if config.database.is_memory() {
        warn!("Using in-memory selection store; selections are lost on restart");
        return Ok(Arc::new(MemorySelectionStore::new()));
    }

    let store = PgSelectionStore::new(&config.database, config.media.root.clone())
        .await
        .context("Failed to initialize selection store")?;

    if config.database.run_migrations {
        store
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }

    Ok(Arc::new(store))
}

/// JSON logs by default, human-readable with `log_format = "pretty"`.
/// `RUST_LOG` overrides the configured level.
fn init_tracing(service: &ServiceConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&service.log_level));
    let registry = tracing_subscriber::registry().with(filter);

    match service.log_format.as_str() {
        "pretty" => registry.with(fmt::layer().pretty()).init(),
        _ => registry.with(fmt::layer().json().with_current_span(true)).init(),
    }
}

fn init_metrics(port: u16) -> Result<()> {
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;

    info!(%addr, "Serving Prometheus metrics");
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let interrupt = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Ctrl+C handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let received = tokio::select! {
        _ = interrupt => "SIGINT",
        _ = terminate => "SIGTERM",
    };

    info!(signal = received, "Shutting down labelling service");
}
