use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use snapwire_server::config::ServerConfig;
use snapwire_server::game::sandbox::SandboxSimulation;
use snapwire_server::metrics::{self, Metrics};
use snapwire_server::net::map_transfer::DirectoryMapSource;
use snapwire_server::net::udp::UdpTransport;
use snapwire_server::server::demo::DirectoryDemoStore;
use snapwire_server::server::Server;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    info!("Snapwire Server v{}", env!("CARGO_PKG_VERSION"));

    let config = ServerConfig::load_or_default();
    config.validate().map_err(anyhow::Error::msg)?;
    info!(
        "Configuration loaded: {}:{}, max_clients={}, map={}",
        config.bind_address, config.port, config.max_clients, config.map
    );

    let metrics = Arc::new(Metrics::new());
    let metrics_clone = metrics.clone();
    let metrics_port = config.metrics_port;
    tokio::spawn(async move {
        if let Err(e) = metrics::start_metrics_server(metrics_clone, metrics_port).await {
            error!("Metrics server error: {}", e);
        }
    });

    let addr = SocketAddr::new(config.bind_address, config.port);
    let transport = UdpTransport::bind(addr, config.max_clients)?;
    let maps = Box::new(DirectoryMapSource::new(&config.maps_dir));
    let demos = Box::new(DirectoryDemoStore::new(&config.demos_dir));

    #[allow(unused_mut)]
    let mut server = Server::new(config.clone(), SandboxSimulation::new(), transport, maps)
        .with_metrics(metrics)
        .with_demo_store(demos);

    #[cfg(feature = "dnsbl")]
    if config.dnsbl {
        use snapwire_server::server::dnsbl::HostLookupResolver;
        info!("DNSBL lookups enabled against {}", config.dnsbl_host);
        let resolver = HostLookupResolver::new(config.dnsbl_host.clone(), config.dnsbl_key.clone());
        server = server.with_dnsbl(Box::new(resolver));
    }

    let running = server.shutdown_handle();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown signal received");
                running.store(false, Ordering::Relaxed);
            }
            Err(e) => error!("Failed to install Ctrl+C handler: {}", e),
        }
    });

    // The tick loop is synchronous and owns its thread
    tokio::task::spawn_blocking(move || server.run()).await??;

    info!("Server stopped");
    Ok(())
}
