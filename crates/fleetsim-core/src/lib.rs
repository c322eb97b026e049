//! Simulation engine for the fleet telemetry simulator.
//!
//! Replays waypoint routes as telemetry from many simulated units at once,
//! grouped into isolated environments. Operators push over a persistent
//! stream on a repeating message cycle; vehicles post single fixes in a
//! strictly sequential loop.
//!
//! # Modules
//!
//! - [`geo`] -- Haversine distance and linear route interpolation.
//! - [`config`] -- `fleetsim.yaml` loading into typed structs.
//! - [`source`] -- [`UnitSource`] trait, file-backed source, and plan
//!   resolution for both unit kinds.
//! - [`transport`] -- Stream and post seams, the WebSocket and HTTP
//!   implementations, and in-memory fakes.
//! - [`control`] -- Per-session stop flag and cancellable timer set.
//! - [`stream`] -- [`StreamUnit`], the operator session.
//! - [`polled`] -- [`PolledUnit`], the vehicle session.
//! - [`runner`] -- [`EnvironmentRunner`], connect fan-out and background
//!   supervision.
//! - [`registry`] -- [`SimulationRegistry`] of runners and live links.
//! - [`simulator`] -- [`Simulator`], the run/stop/status facade.
//! - [`error`] -- [`SimError`].
//!
//! [`UnitSource`]: source::UnitSource
//! [`StreamUnit`]: stream::StreamUnit
//! [`PolledUnit`]: polled::PolledUnit
//! [`EnvironmentRunner`]: runner::EnvironmentRunner
//! [`SimulationRegistry`]: registry::SimulationRegistry
//! [`Simulator`]: simulator::Simulator
//! [`SimError`]: error::SimError

pub mod config;
pub mod control;
pub mod error;
pub mod geo;
pub mod polled;
pub mod registry;
pub mod runner;
pub mod simulator;
pub mod source;
pub mod stream;
pub mod transport;

pub use config::SimulatorConfig;
pub use error::SimError;
pub use runner::{EnvironmentRunner, RunOptions, RunnerDeps};
pub use simulator::{RunReport, RunParams, Simulator};
