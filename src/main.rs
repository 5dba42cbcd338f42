use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use wakegate::cache::RoutingCache;
use wakegate::config::Config;
use wakegate::consumer::run_status_consumer;
use wakegate::directory::ProjectDirectoryClient;
use wakegate::notify::IngressNotifier;
use wakegate::orchestrator::{Orchestrator, OrchestratorServer};
use wakegate::pool::{PoolConfig, UpstreamPool};
use wakegate::proxy::{EdgeContext, EdgeServer};
use wakegate::records::RecordStore;
use wakegate::stream::EventStream;
use wakegate::token::TokenIssuer;
use wakegate::wakeup::WakeupPublisher;
use wakegate::{PKG_NAME, VERSION};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("wakegate=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration; a missing file means defaults
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = if config_path.exists() {
        let config = Config::load(&config_path).map_err(|e| {
            error!(path = %config_path.display(), error = %e, "Failed to load configuration");
            e
        })?;
        info!(path = %config_path.display(), "Configuration loaded");
        config
    } else {
        warn!(path = %config_path.display(), "No config file found; using defaults");
        Config::default()
    };

    info!(name = PKG_NAME, version = VERSION, "Starting edge");
    info!(
        bind = %config.server.bind,
        edge_port = config.server.edge_port,
        orchestrator_bind = %config.server.orchestrator_bind,
        orchestrator_port = config.server.orchestrator_port,
        cache_ttl_secs = config.cache.ttl_secs,
        store_path = %config.store.path,
        "Server configuration"
    );

    // Shared infrastructure
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let store = Arc::new(RecordStore::open(&config.store.path)?);
    let stream = Arc::new(EventStream::new(config.stream.max_len));
    let cache = Arc::new(RoutingCache::new(config.cache.ttl()));

    // Tokens signed with an ephemeral secret die with the process
    let token_secret = config.tokens.secret.clone().unwrap_or_else(|| {
        warn!("No token secret configured; generating one (tokens will not survive restarts)");
        uuid::Uuid::new_v4().to_string()
    });
    let issuer = TokenIssuer::new(&token_secret, config.tokens.ttls.clone());

    let pool = Arc::new(UpstreamPool::new(PoolConfig {
        max_idle_per_host: config.pool.max_idle_per_host,
        idle_timeout: Duration::from_secs(config.pool.idle_timeout_secs),
    }));

    let orchestrator_base = format!("http://127.0.0.1:{}", config.server.orchestrator_port);
    let directory = Arc::new(ProjectDirectoryClient::new(
        &config.directory.base_url,
        config.directory.timeout(),
    )?);
    let notifier = Arc::new(IngressNotifier::new(
        &orchestrator_base,
        Duration::from_secs(2),
    )?);
    let wakeup = Arc::new(WakeupPublisher::new(
        Arc::clone(&stream),
        Arc::clone(&cache),
    ));

    // Orchestrator API; containers call back into this listener
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&store),
        Arc::clone(&stream),
        issuer,
    ));
    let orchestrator_addr: SocketAddr = format!(
        "{}:{}",
        config.server.orchestrator_bind, config.server.orchestrator_port
    )
    .parse()
    .map_err(|e| anyhow::anyhow!("Invalid orchestrator bind address: {}", e))?;
    let orchestrator_server = OrchestratorServer::new(
        orchestrator_addr,
        Arc::clone(&orchestrator),
        shutdown_rx.clone(),
    );
    let orchestrator_handle = tokio::spawn(async move {
        if let Err(e) = orchestrator_server.run().await {
            error!(error = %e, "Orchestrator server error");
        }
    });

    // Public edge
    let edge_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.edge_port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.edge_port, error = %e, "Invalid edge bind address");
            anyhow::anyhow!("Invalid edge bind address: {}", e)
        })?;
    let edge_ctx = Arc::new(EdgeContext {
        cache: Arc::clone(&cache),
        directory,
        pool,
        wakeup,
        notifier,
        config: config.edge.clone(),
    });
    let edge_server = EdgeServer::new(edge_addr, edge_ctx, shutdown_rx.clone());
    let edge_handle = tokio::spawn(async move {
        if let Err(e) = edge_server.run().await {
            error!(error = %e, "Edge server error");
        }
    });

    // Cache sweep loop
    let sweep_cache = Arc::clone(&cache);
    let sweep_interval = config.cache.sweep_interval();
    let mut sweep_shutdown_rx = shutdown_rx.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(sweep_interval) => {
                    sweep_cache.sweep();
                }
                _ = sweep_shutdown_rx.changed() => {
                    if *sweep_shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    });

    // Lifecycle fact mirror
    let consumer_handle = tokio::spawn(run_status_consumer(
        Arc::clone(&stream),
        Arc::clone(&store),
        shutdown_rx.clone(),
    ));

    // Wait for shutdown signal
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }

    let _ = shutdown_tx.send(true);

    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = edge_handle.await;
        let _ = orchestrator_handle.await;
        let _ = consumer_handle.await;
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}
