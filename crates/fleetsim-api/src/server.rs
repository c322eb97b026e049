//! Control surface server lifecycle.
//!
//! [`start_server`] binds the listener, serves the router, and returns
//! once the caller's shutdown future resolves and in-flight requests have
//! drained. Stopping running simulations is left to the caller.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;

use crate::router::build_router;
use crate::state::AppState;

/// Listen address of the control surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Host or IP to bind.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: String::from("0.0.0.0"),
            port: 3000,
        }
    }
}

impl ServerConfig {
    /// Parse `host:port` into a socket address.
    pub fn socket_addr(&self) -> Result<SocketAddr, ServerError> {
        format!("{}:{}", self.host, self.port)
            .parse::<SocketAddr>()
            .map_err(|e| {
                ServerError::Bind(format!("invalid address {}:{}: {e}", self.host, self.port))
            })
    }
}

/// Serve the control surface until `shutdown` resolves.
///
/// # Errors
///
/// Returns [`ServerError::Bind`] if the address is invalid or cannot be
/// bound, and [`ServerError::Serve`] if serving fails.
pub async fn start_server<F>(
    config: &ServerConfig,
    state: Arc<AppState>,
    shutdown: F,
) -> Result<(), ServerError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = config.socket_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| ServerError::Bind(format!("bind failed on {addr}: {e}")))?;

    info!(%addr, "control surface listening");

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| ServerError::Serve(e.to_string()))?;

    info!(%addr, "control surface shut down");
    Ok(())
}

/// Errors from binding or running the control surface.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// The listen address is invalid or could not be bound.
    #[error("bind error: {0}")]
    Bind(String),

    /// Serving stopped with an I/O error.
    #[error("serve error: {0}")]
    Serve(String),
}
