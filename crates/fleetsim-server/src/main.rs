//! Fleet telemetry simulator server.
//!
//! Wires the simulation engine to real transports and exposes it through
//! the HTTP control surface.
//!
//! # Startup Sequence
//!
//! 1. Initialize structured logging (tracing)
//! 2. Load process settings from the environment
//! 3. Load the simulator configuration from YAML
//! 4. Build the WebSocket connector and HTTP poster
//! 5. Serve the control surface until `Ctrl-C`, draining open requests
//! 6. Stop every environment before exiting

mod error;
mod settings;

use std::sync::Arc;

use fleetsim_api::{AppState, ServerConfig};
use fleetsim_core::transport::{HttpPoster, WsConnector};
use fleetsim_core::{Simulator, SimulatorConfig};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::error::ServerError;
use crate::settings::ServerSettings;

/// Application entry point.
///
/// # Errors
///
/// Returns an error if any startup step fails or the server stops with an
/// error.
#[tokio::main]
async fn main() -> Result<(), ServerError> {
    // 1. Initialize structured logging.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    info!("fleetsim-server starting");

    // 2. Process settings.
    let settings = ServerSettings::from_env()?;

    // 3. Simulator configuration.
    let config = SimulatorConfig::load(&settings.config_path)?;
    info!(
        path = %settings.config_path.display(),
        data_dir = %config.data_dir.display(),
        environments = config.environments.len(),
        cycle_gap_ms = config.cycle_gap_ms,
        "Configuration loaded"
    );

    // 4. Transports.
    let poster = HttpPoster::new(settings.http_timeout)?;
    let simulator = Simulator::new(config, Arc::new(WsConnector), Arc::new(poster));
    let state = Arc::new(AppState::new(simulator));

    // 5. Serve.
    let server_config = ServerConfig {
        host: settings.host,
        port: settings.port,
    };
    let result =
        fleetsim_api::start_server(&server_config, Arc::clone(&state), shutdown_signal()).await;

    // 6. Stop everything that is still running.
    state.simulator.stop(None).await;
    info!("fleetsim-server stopped");

    result.map_err(ServerError::from)
}

/// Resolve on `Ctrl-C`. If the signal handler cannot be installed, never
/// resolve, so the server keeps running.
async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received"),
        Err(e) => {
            warn!(error = %e, "failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
    }
}
