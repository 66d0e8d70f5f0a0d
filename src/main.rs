use reloadgate::config::Config;
use reloadgate::gate::Gate;
use reloadgate::proxy::{GatedProxy, ProxyContext, PKG_NAME, RELOAD_PATH, VERSION};
use reloadgate::reload::ReloadPipeline;
use reloadgate::upstream::{PoolConfig, UpstreamClient};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut args = std::env::args().skip(1);
    let first = args.next();

    if first.as_deref() == Some("--version") {
        println!("{} {}", PKG_NAME, VERSION);
        return Ok(());
    }

    // Load configuration
    let config_path = first
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        eprintln!("Failed to load configuration from {}: {}", config_path.display(), e);
        e
    })?;

    // Initialize logging at the configured verbosity; RUST_LOG still wins
    // for anything it names explicitly
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(
                format!("{}={}", PKG_NAME, config.log_level)
                    .parse()
                    .expect("validated log directive"),
            ),
        )
        .init();

    info!(path = %config_path.display(), "Configuration loaded");

    // Print startup banner
    print_startup_banner(&config);

    // The gate starts Cooling: the upstream is assumed not ready until the
    // first cooldown window after startup has passed
    let gate = Arc::new(Gate::new(config.gate.cooldown()));

    // Reload steps are bundled into the binary; a malformed list degrades
    // to an empty pipeline and is reported in the banner below
    let pipeline = Arc::new(ReloadPipeline::embedded());
    info!(steps = pipeline.len(), reload_path = RELOAD_PATH, "Reload pipeline loaded");

    let pool_config = PoolConfig {
        max_idle_per_host: config.upstream.pool_max_idle_per_host,
        idle_timeout: config.upstream.pool_idle_timeout(),
    };
    let upstream = Arc::new(UpstreamClient::new(config.upstream.addr.clone(), pool_config));

    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let proxy = GatedProxy::new(
        bind_addr,
        ProxyContext {
            gate,
            pipeline,
            upstream,
            request_timeout: config.upstream.request_timeout(),
        },
        shutdown_rx,
    );

    let proxy_handle = tokio::spawn(async move {
        if let Err(e) = proxy.run().await {
            error!(error = %e, "Proxy server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

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
        tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown and wait for the server to stop (with timeout)
    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(5), proxy_handle).await;

    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting gated proxy");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        upstream = %config.upstream.addr,
        "Server configuration"
    );
    info!(
        cooldown_secs = config.gate.cooldown_secs,
        "Gate configuration (forwarding suppressed this long after startup and after every reload)"
    );
    info!(
        pool_max_idle = config.upstream.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.upstream.pool_idle_timeout_secs,
        request_timeout_secs = config.upstream.request_timeout_secs,
        "Upstream settings"
    );
}
