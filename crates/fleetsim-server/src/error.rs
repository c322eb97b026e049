//! Error types for the server binary.
//!
//! [`ServerError`] is the top-level error type that wraps every failure
//! mode during startup and serving.

/// Top-level error for the server binary.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// A process setting could not be parsed.
    #[error("settings error: {0}")]
    Settings(String),

    /// The simulator configuration could not be loaded.
    #[error("config error: {source}")]
    Config {
        /// The underlying simulator error.
        #[from]
        source: fleetsim_core::SimError,
    },

    /// The HTTP client for vehicle posts could not be built.
    #[error("transport error: {source}")]
    Transport {
        /// The underlying transport error.
        #[from]
        source: fleetsim_core::transport::TransportError,
    },

    /// The control surface failed to start or stopped with an error.
    #[error("api error: {source}")]
    Api {
        /// The underlying server error.
        #[from]
        source: fleetsim_api::ServerError,
    },
}
