//! Unit kinds, connect-phase statuses, and route descriptions.
//!
//! A route can come from a unit file or from the `operatorCoords` /
//! `vehicleCoords` fields of a run request. Both use the same shapes: a
//! bare coordinate list, or an object carrying the coordinates together
//! with an identifier and simulation parameters.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::coords::RawCoordinate;
use crate::ids::RunId;
use crate::messages::TimedMessage;

/// The two kinds of simulated unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitKind {
    /// Mobile client pushing telemetry over a persistent stream.
    Operator,
    /// Client pushing telemetry through repeated single-shot posts.
    Vehicle,
}

impl UnitKind {
    /// Lowercase name used in paths and log fields.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Operator => "operator",
            Self::Vehicle => "vehicle",
        }
    }
}

impl fmt::Display for UnitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of the connect phase for one unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectState {
    /// Polled unit whose configuration resolved successfully.
    Ready,
    /// Stream unit whose connection is open.
    Connected,
    /// The unit failed to resolve or connect and will not run.
    Error,
}

/// Per-unit status record returned from the connect phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitStatus {
    /// Unit identifier as given by the caller.
    pub unit: String,
    /// Connect-phase outcome.
    pub status: ConnectState,
    /// Error message when `status` is [`ConnectState::Error`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl UnitStatus {
    /// A successful status record.
    pub fn ok(unit: impl Into<String>, status: ConnectState) -> Self {
        Self {
            unit: unit.into(),
            status,
            error: None,
        }
    }

    /// A failed status record.
    pub fn failed(unit: impl Into<String>, error: impl fmt::Display) -> Self {
        Self {
            unit: unit.into(),
            status: ConnectState::Error,
            error: Some(error.to_string()),
        }
    }

    /// Whether the unit will take part in the background run.
    pub const fn is_ok(&self) -> bool {
        !matches!(self.status, ConnectState::Error)
    }
}

/// Whether an environment currently has anything running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// At least one runner, connection, or unit is live.
    Running,
    /// Nothing is live for the environment.
    Stopped,
}

/// Status line for one environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentStatus {
    /// Environment name.
    pub env: String,
    /// Aggregate state of the environment.
    pub status: RunState,
    /// Identifiers of the runners registered for the environment.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub runs: Vec<RunId>,
    /// Number of unit sessions still cycling.
    #[serde(default)]
    pub active_units: usize,
}

// ---------------------------------------------------------------------------
// Operator routes
// ---------------------------------------------------------------------------

/// Waypoint route for an operator, with optional parameter overrides.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OperatorRoute {
    /// Route coordinates in any accepted shape.
    pub coords: Vec<RawCoordinate>,
    /// Operator identifier used to pick the auth token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator_id: Option<u64>,
    /// Speed in km/h.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    /// Course in degrees.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub course: Option<f64>,
    /// Altitude in metres.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub altitude: Option<f64>,
    /// Delay between messages in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<u64>,
    /// Whether to interpolate between waypoints.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interpolate: Option<bool>,
}

/// Contents of an `operator_NN.json` file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OperatorFile {
    /// Legacy flat list of pre-built timed messages.
    Messages(Vec<TimedMessage>),
    /// Waypoint route expanded into messages at load time.
    Route(OperatorRoute),
}

/// Operator route supplied inline in a run request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OperatorOverride {
    /// Bare coordinate list.
    Coords(Vec<RawCoordinate>),
    /// Coordinates with identifier and parameters.
    Detailed(OperatorRoute),
}

impl OperatorOverride {
    /// Flatten either shape into an [`OperatorRoute`].
    pub fn into_route(self) -> OperatorRoute {
        match self {
            Self::Coords(coords) => OperatorRoute {
                coords,
                ..OperatorRoute::default()
            },
            Self::Detailed(route) => route,
        }
    }
}

// ---------------------------------------------------------------------------
// Vehicle routes
// ---------------------------------------------------------------------------

/// Waypoint route for a vehicle, with optional parameter overrides.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct VehicleRoute {
    /// Route coordinates in any accepted shape.
    pub coords: Vec<RawCoordinate>,
    /// Backend-facing client identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<u64>,
    /// Speed in m/s.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    /// Whether to interpolate between waypoints.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interpolate: Option<bool>,
}

/// Vehicle route supplied inline in a run request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VehicleOverride {
    /// Bare coordinate list.
    Coords(Vec<RawCoordinate>),
    /// Coordinates with client identifier and parameters.
    Detailed(VehicleRoute),
}

impl VehicleOverride {
    /// Flatten either shape into a [`VehicleRoute`].
    pub fn into_route(self) -> VehicleRoute {
        match self {
            Self::Coords(coords) => VehicleRoute {
                coords,
                ..VehicleRoute::default()
            },
            Self::Detailed(route) => route,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn unit_status_serializes_without_empty_error() {
        let json = serde_json::to_value(UnitStatus::ok("01", ConnectState::Connected)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"unit": "01", "status": "connected"})
        );
    }

    #[test]
    fn failed_status_carries_message() {
        let status = UnitStatus::failed("07", "token missing");
        assert!(!status.is_ok());
        assert_eq!(status.error.as_deref(), Some("token missing"));
    }

    #[test]
    fn operator_file_accepts_legacy_list() {
        let json = r#"[{"payload": {"lat": 58.0, "lon": 106.5, "timestamp": 0}, "delay": 2000}]"#;
        let file: OperatorFile = serde_json::from_str(json).unwrap();
        assert!(matches!(file, OperatorFile::Messages(ref m) if m.len() == 1));
    }

    #[test]
    fn operator_file_accepts_route_object() {
        let json = r#"{"coords": [[106.54, 58.03], [106.53, 58.04]], "speed": 60, "delay": 3000}"#;
        let file: OperatorFile = serde_json::from_str(json).unwrap();
        let OperatorFile::Route(route) = file else {
            panic!("expected route");
        };
        assert_eq!(route.coords.len(), 2);
        assert_eq!(route.delay, Some(3000));
        assert!(route.operator_id.is_none());
    }

    #[test]
    fn vehicle_override_shapes() {
        let bare: VehicleOverride =
            serde_json::from_str(r#"[{"lat": 58.03, "lon": 106.54}]"#).unwrap();
        assert!(bare.into_route().client.is_none());

        let detailed: VehicleOverride = serde_json::from_str(
            r#"{"coords": [[106.54, 58.03]], "client": 123456, "speed": 15, "interpolate": false}"#,
        )
        .unwrap();
        let route = detailed.into_route();
        assert_eq!(route.client, Some(123_456));
        assert_eq!(route.interpolate, Some(false));
    }
}
