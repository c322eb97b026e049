//! Configuration loading and typed config structures for the simulator.
//!
//! The configuration lives in a YAML file (`fleetsim.yaml` by default).
//! It names every environment the simulator may drive, where that
//! environment's backend lives, and the operator tokens it accepts, plus
//! the defaults applied when a unit file or request leaves a parameter out.
//!
//! The loaded [`SimulatorConfig`] is passed explicitly into the simulator
//! and from there into every runner and session. Nothing is cached in
//! process-wide state.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::SimError;

/// Top-level simulator configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    /// Root directory holding `operators_<env>/` and `vehicles_<env>/`.
    pub data_dir: PathBuf,
    /// Pause between the last message of a stream cycle and the first
    /// message of the next one, in milliseconds.
    pub cycle_gap_ms: u64,
    /// Defaults for operator (stream) units.
    pub operator: OperatorDefaults,
    /// Defaults for vehicle (polled) units.
    pub vehicle: VehicleDefaults,
    /// Backend endpoints and credentials keyed by environment name.
    pub environments: BTreeMap<String, EnvironmentProfile>,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("."),
            cycle_gap_ms: 1000,
            operator: OperatorDefaults::default(),
            vehicle: VehicleDefaults::default(),
            environments: BTreeMap::new(),
        }
    }
}

impl SimulatorConfig {
    /// Load and parse a configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`SimError::Io`] if the file cannot be read and
    /// [`SimError::Yaml`] if it is not valid YAML of the expected shape.
    pub fn load(path: &Path) -> Result<Self, SimError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&contents)
    }

    /// Parse a configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns [`SimError::Yaml`] on malformed input.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, SimError> {
        let config: Self = serde_yml::from_str(yaml)?;
        Ok(config)
    }

    /// Look up an environment profile.
    ///
    /// # Errors
    ///
    /// Returns [`SimError::UnknownEnvironment`] if the environment is not
    /// configured.
    pub fn environment(&self, env: &str) -> Result<&EnvironmentProfile, SimError> {
        self.environments
            .get(env)
            .ok_or_else(|| SimError::UnknownEnvironment(env.to_owned()))
    }

    /// The inter-cycle pause as a [`Duration`].
    pub const fn cycle_gap(&self) -> Duration {
        Duration::from_millis(self.cycle_gap_ms)
    }
}

/// Defaults for operator units. Speed is in km/h.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct OperatorDefaults {
    /// Delay between consecutive messages in milliseconds.
    pub delay_ms: u64,
    /// Walking/driving speed in km/h.
    pub speed_kmh: f64,
    /// Course in degrees.
    pub course: f64,
    /// Altitude in metres.
    pub altitude: f64,
    /// Whether routes are interpolated.
    pub interpolate: bool,
}

impl Default for OperatorDefaults {
    fn default() -> Self {
        Self {
            delay_ms: 2000,
            speed_kmh: 5.0,
            course: 90.0,
            altitude: 0.0,
            interpolate: true,
        }
    }
}

/// Defaults for vehicle units. Speed is in m/s.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct VehicleDefaults {
    /// How long a vehicle keeps posting when the run gives no duration.
    pub duration_secs: u64,
    /// Pause between consecutive posts in milliseconds.
    pub request_delay_ms: u64,
    /// Speed in m/s.
    pub speed_mps: f64,
    /// Client identifier for request routes given as a bare coordinate list.
    pub fallback_client_id: u64,
    /// Whether routes are interpolated.
    pub interpolate: bool,
}

impl Default for VehicleDefaults {
    fn default() -> Self {
        Self {
            duration_secs: 300,
            request_delay_ms: 1000,
            speed_mps: 10.0,
            fallback_client_id: 999_999,
            interpolate: true,
        }
    }
}

/// Backend endpoints and credentials for one environment.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct EnvironmentProfile {
    /// WebSocket collector URL operators connect to.
    pub stream_url: String,
    /// Base URL of the vehicle connector. Posts go to
    /// `{connector_url}/debug/locations/vehicle`.
    pub connector_url: String,
    /// Bearer tokens keyed by two-digit operator key (`"01"`, `"02"`, ...).
    pub operator_tokens: BTreeMap<String, String>,
}

impl EnvironmentProfile {
    /// Full URL of the vehicle telemetry endpoint.
    pub fn vehicle_endpoint(&self) -> String {
        format!(
            "{}/debug/locations/vehicle",
            self.connector_url.trim_end_matches('/')
        )
    }

    /// Token for an operator key, padded to two digits before lookup.
    pub fn operator_token(&self, key: &str) -> Option<&str> {
        self.operator_tokens
            .get(&unit_file_key(key))
            .map(String::as_str)
    }
}

/// Left-pad a unit identifier with `0` to two characters.
///
/// Unit files and token keys are named with this form: unit `"1"` lives in
/// `operator_01.json` and authenticates with token `"01"`.
pub fn unit_file_key(unit: &str) -> String {
    format!("{unit:0>2}")
}
