//! Shared type definitions for the fleet telemetry simulator.
//!
//! This crate is the single source of truth for the data model used by
//! the simulation engine and the HTTP control surface.
//!
//! # Modules
//!
//! - [`ids`] -- Type-safe UUID wrappers for runs and sessions
//! - [`coords`] -- Normalized [`Waypoint`] and the raw coordinate shapes
//!   accepted from files and requests
//! - [`messages`] -- Wire payloads for operator streams and vehicle posts
//! - [`units`] -- Unit kinds, connect-phase statuses, and unit route shapes

pub mod coords;
pub mod ids;
pub mod messages;
pub mod units;

// Re-export all public types at crate root for convenience.
pub use coords::{CoordinateError, RawCoordinate, Waypoint, normalize_all};
pub use ids::{RunId, SessionId};
pub use messages::{OperatorPayload, TimedMessage, VehicleFix, VehicleTelemetry};
pub use units::{
    ConnectState, EnvironmentStatus, OperatorFile, OperatorOverride, OperatorRoute, RunState,
    UnitKind, UnitStatus, VehicleOverride, VehicleRoute,
};
