//! HTTP control surface for the fleet telemetry simulator.
//!
//! A thin Axum layer over [`fleetsim_core::Simulator`]: requests are
//! parsed and validated here, then handed to the simulator, which owns all
//! runtime state. Every handler shares one [`AppState`].

pub mod error;
pub mod handlers;
pub mod router;
pub mod server;
pub mod state;

// Re-export primary types for convenience.
pub use error::ApiError;
pub use router::build_router;
pub use server::{ServerConfig, ServerError, start_server};
pub use state::AppState;
