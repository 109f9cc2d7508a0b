use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use lora_appserver::api::{self, as_server, join_server, operator as operator_api};
use lora_appserver::auth::PolicyAuthorizer;
use lora_appserver::config::Config;
use lora_appserver::context::{AppContext, Ports};
use lora_appserver::integration::{Integration, LogIntegration};
use lora_appserver::join::backend::JoinServer;
use lora_appserver::join::JoinEngine;
use lora_appserver::ns::pool::Connector;
use lora_appserver::operator::Operator;
use lora_appserver::storage::memory::MemoryStore;

#[derive(Parser)]
#[command(name = "lora-appserver")]
#[command(about = "LoRaWAN application-server: join-server, uplink decryption and downlink queueing")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load(&cli.config).unwrap_or_else(|e| {
        eprintln!("Warning: Failed to load config from {:?}: {:#}", cli.config, e);
        eprintln!("Using default configuration");
        Config::default()
    });

    // Initialize tracing/logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .init();

    info!("lora-appserver v{}", env!("CARGO_PKG_VERSION"));
    info!("===========================================");
    info!("LoRaWAN Application Server");
    info!("===========================================");

    let store = Arc::new(MemoryStore::new());
    config.inventory.seed(&store);
    info!(
        "Inventory: {} network-server(s), {} application(s)",
        config.inventory.network_servers.len(),
        config.inventory.applications.len()
    );

    let authorizer = Arc::new(PolicyAuthorizer::new(
        store.clone(),
        store.clone(),
        store.clone(),
    ));
    let sinks: Vec<Arc<dyn Integration>> = vec![Arc::new(LogIntegration)];
    let ctx = AppContext::new(
        Ports::from_store(store),
        authorizer,
        connector(&config),
        sinks,
        config.core_settings(),
    );

    // Network-server ingress
    let listener = bind(&config.application_server.bind).await?;
    let router = as_server::routes(Arc::new(as_server::AsState::new(ctx.clone())));
    spawn_server("Application-server API", listener, router);

    // Join-server
    let listener = bind(&config.join_server.bind).await?;
    let js = JoinServer::new(
        JoinEngine::new(ctx.clone()),
        config.join_server.net_id,
        config.join_server.join_eui_filter.clone(),
    );
    if config.join_server.join_eui_filter.is_empty() {
        info!("Join-server answers every JoinEUI");
    }
    spawn_server("Join-server", listener, join_server::routes(Arc::new(js)));

    // Operator API
    let tokens = config.external_api.token_table();
    if tokens.is_empty() {
        warn!("No API tokens configured; every operator request will be rejected");
    }
    let listener = bind(&config.external_api.bind).await?;
    let state = operator_api::OperatorState {
        operator: Operator::new(ctx.clone()),
        tokens,
    };
    spawn_server("Operator API", listener, operator_api::routes(Arc::new(state)));

    spawn_housekeeping(&ctx, &config);

    info!("Application server running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    Ok(())
}

#[cfg(feature = "ns-http")]
fn connector(config: &Config) -> Arc<dyn Connector> {
    use lora_appserver::ns::http::HttpConnector;

    Arc::new(HttpConnector::new(config.network_server.timeouts()))
}

/// Without an HTTP client every network-server is simulated in memory.
#[cfg(not(feature = "ns-http"))]
fn connector(config: &Config) -> Arc<dyn Connector> {
    use lora_appserver::ns::memory::InMemoryNetworkServer;
    use lora_appserver::ns::pool::StaticConnector;

    warn!("Built without ns-http; using an in-memory network-server");
    Arc::new(StaticConnector(Arc::new(InMemoryNetworkServer::new(
        config.join_server.net_id,
    ))))
}

async fn bind(addr: &str) -> anyhow::Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))
}

fn spawn_server(name: &'static str, listener: TcpListener, router: axum::Router) {
    tokio::spawn(async move {
        if let Err(e) = api::serve(name, listener, router).await {
            error!("{} failed: {}", name, e);
        }
    });
}

/// Periodic cleanup: idle locks, idle network-server clients and
/// integration deliveries that failed earlier.
fn spawn_housekeeping(ctx: &AppContext, config: &Config) {
    let sweep_every = Duration::from_secs(config.core.lock_sweep_secs.max(1));
    let device_locks = ctx.device_locks.clone();
    let group_locks = ctx.group_locks.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_every);
        loop {
            interval.tick().await;
            let swept = device_locks.sweep() + group_locks.sweep();
            if swept > 0 {
                debug!("Swept {} idle lock(s)", swept);
            }
        }
    });

    let reap_every = Duration::from_secs((config.network_server.idle_timeout_secs / 2).max(1));
    let pool = ctx.ns_pool.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(reap_every);
        loop {
            interval.tick().await;
            let closed = pool.close_idle();
            if closed > 0 {
                info!("Closed {} idle network-server client(s)", closed);
            }
        }
    });

    let retry_every = Duration::from_secs(config.core.integration_retry_secs.max(1));
    let integration = ctx.integration.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(retry_every);
        loop {
            interval.tick().await;
            if integration.pending_len() == 0 {
                continue;
            }
            let delivered = integration.retry_pending().await;
            info!(
                "Redelivered {} integration event(s), {} still pending",
                delivered,
                integration.pending_len()
            );
        }
    });
}
