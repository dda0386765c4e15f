use std::path::PathBuf;

use tracing::info;
use tracing_subscriber::EnvFilter;

use voltlink_ocpp::config::{default_config_path, AppConfig};
use voltlink_ocpp::server::CsmsServer;
use voltlink_ocpp::support::{listen_for_shutdown_signals, ShutdownSignal};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone())),
        )
        .init();

    info!(address = config.server.address().as_str(), "Starting CSMS");

    let shutdown = ShutdownSignal::new();
    tokio::spawn(listen_for_shutdown_signals(shutdown.clone()));

    let server = CsmsServer::new(config.server, config.policy, shutdown.clone());
    server.run().await?;

    info!("CSMS stopped");
    Ok(())
}

/// Config resolution: `VOLTLINK_CONFIG` env var, then the default location,
/// then built-in defaults.
fn load_config() -> AppConfig {
    let path = std::env::var("VOLTLINK_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| default_config_path());

    if path.exists() {
        match AppConfig::load(&path) {
            Ok(config) => return config,
            Err(e) => {
                // tracing is not initialized yet
                eprintln!("warning: ignoring config {}: {}", path.display(), e);
            }
        }
    }
    AppConfig::default()
}
