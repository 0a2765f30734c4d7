//! mesh-dns binary entry point.

use clap::Parser;
use mesh_dns::{telemetry, Config, MeshDnsServer};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Mesh DNS forwarder with mDNS peer discovery.
#[derive(Parser, Debug)]
#[command(name = "mesh-dns")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file (TOML).
    #[arg(short, long, default_value = "mesh-dns.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load configuration
    let config: Config = config::Config::builder()
        .add_source(config::File::from(args.config.clone()))
        .add_source(
            config::Environment::with_prefix("MESH_DNS")
                .separator("__")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize()?;

    // Initialize telemetry
    telemetry::init(&config.telemetry).map_err(|e| e as Box<dyn std::error::Error>)?;

    info!(
        config_file = %args.config.display(),
        listen_addr = %config.dns.listen_addr,
        zone = %config.forward.zone,
        "Starting mesh-dns"
    );

    // Setup graceful shutdown
    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            signal_token.cancel();
        }
    });

    // Run the server
    let server = MeshDnsServer::new(config);
    let result = server.run(shutdown).await;

    if let Err(e) = result {
        error!("mesh-dns server error: {}", e);
        return Err(e.into());
    }

    info!("mesh-dns shutdown complete");
    Ok(())
}
