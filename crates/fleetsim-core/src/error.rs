//! Error taxonomy for the simulation engine.
//!
//! Errors are scoped to the unit that produced them: configuration and
//! connectivity failures become per-unit `error` statuses during the
//! connect phase, transport failures end up in a unit's session log, and
//! only environment-level operations surface errors to the caller.

use fleetsim_types::{CoordinateError, UnitKind};

use crate::transport::TransportError;

/// Errors that can occur while resolving, connecting, or running units.
#[derive(Debug, thiserror::Error)]
pub enum SimError {
    /// A unit's configuration is missing or malformed.
    #[error("config error: {0}")]
    Config(String),

    /// A unit file does not exist for the given environment.
    #[error("{kind} file not found: {path}")]
    UnitFileMissing {
        /// Which kind of unit was being resolved.
        kind: UnitKind,
        /// The path that was looked up.
        path: String,
    },

    /// The environment has no entry in the simulator configuration.
    #[error("unknown environment: {0}")]
    UnknownEnvironment(String),

    /// A coordinate in a route could not be normalized.
    #[error("invalid coordinate: {source}")]
    Coordinate {
        /// The underlying coordinate error.
        #[from]
        source: CoordinateError,
    },

    /// Authentication or connection to the backend failed.
    #[error("connect error: {0}")]
    Connect(String),

    /// Sending or posting telemetry failed.
    #[error("transport error: {source}")]
    Transport {
        /// The underlying transport error.
        #[from]
        source: TransportError,
    },

    /// Reading a configuration or unit file failed.
    #[error("I/O error: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// A unit file was not valid JSON of the expected shape.
    #[error("JSON error: {source}")]
    Json {
        /// The underlying serde error.
        #[from]
        source: serde_json::Error,
    },

    /// The simulator configuration file was not valid YAML.
    #[error("YAML error: {source}")]
    Yaml {
        /// The underlying YAML error.
        #[from]
        source: serde_yml::Error,
    },
}

impl SimError {
    /// Whether this error was caused by the caller's input or configuration
    /// rather than by the backend or the local system.
    pub const fn is_config(&self) -> bool {
        matches!(
            self,
            Self::Config(_)
                | Self::UnitFileMissing { .. }
                | Self::UnknownEnvironment(_)
                | Self::Coordinate { .. }
                | Self::Json { .. }
        )
    }
}
