use anyhow::Context;
use clap::Parser;
use keeper_client::create_store;
use keeper_cluster::Registry;
use keeper_server::{start_rest_server, AppState, DaemonConfig};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Leader failover daemon for agent groups
#[derive(Parser, Debug)]
#[command(name = "keeperd", version, about)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Status API listen address
    #[arg(long, value_name = "ADDR")]
    http_address: Option<String>,

    /// Comma separated store endpoints, e.g. `10.0.0.1:2379,10.0.0.2:2379`
    #[arg(long, value_name = "HOSTS")]
    etcd_endpoint: Option<String>,

    /// Directory whose children are the monitored groups
    #[arg(long, value_name = "DIR")]
    discovery_root: Option<String>,

    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,
}

impl Cli {
    fn apply(self, mut config: DaemonConfig) -> DaemonConfig {
        if let Some(addr) = self.http_address {
            config.http_address = addr;
        }
        if let Some(hosts) = self.etcd_endpoint {
            config.store = config.store.with_endpoints(&hosts);
        }
        if let Some(root) = self.discovery_root {
            config.registry.discovery_root = root;
        }
        if let Some(level) = self.log_level {
            config.log_level = level;
        }
        config
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = DaemonConfig::load(cli.config.as_deref())?;
    let config = cli.apply(config);

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting keeperd v{}", env!("CARGO_PKG_VERSION"));
    config.validate()?;
    let addr = config.socket_addr()?;

    let metrics = match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!("Failed to install Prometheus recorder: {}", e);
            None
        }
    };

    let store = create_store(config.store.clone()).context("failed to create store client")?;
    info!("Store endpoints: {:?}", config.store.endpoints);

    let registry = Arc::new(Registry::new(store, config.registry.clone())?);
    registry.start()?;

    let state = Arc::new(AppState::new(registry.clone(), metrics));
    if let Err(e) = start_rest_server(addr, state, shutdown_signal()).await {
        error!("REST server error: {}", e);
    }

    info!("Shutting down registry...");
    registry.shutdown().await;
    info!("keeperd stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Ctrl+C received, shutting down"),
        _ = terminate => info!("SIGTERM received, shutting down"),
    }
}
