//! Shared application state for the control surface.

use std::sync::Arc;

use fleetsim_core::Simulator;

/// State handed to every handler.
#[derive(Debug, Clone)]
pub struct AppState {
    /// The simulator every request operates on.
    pub simulator: Arc<Simulator>,
}

impl AppState {
    /// Wrap a simulator.
    pub fn new(simulator: Simulator) -> Self {
        Self {
            simulator: Arc::new(simulator),
        }
    }
}
