//! Unit configuration lookup and resolution into runnable plans.
//!
//! A [`UnitSource`] answers "what does unit `NN` of environment `env`
//! look like" from wherever unit definitions live; [`FileUnitSource`]
//! reads the per-environment JSON directories. The `resolve_*` functions
//! combine a source, the simulator defaults, and any request override into
//! an [`OperatorPlan`] or [`VehiclePlan`] that a session can run without
//! further lookups.
//!
//! A request override always wins: when one is given for a unit, the
//! source is not consulted for that unit at all.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::Map;
use tracing::debug;

use fleetsim_types::{
    OperatorFile, OperatorOverride, OperatorPayload, OperatorRoute, TimedMessage, UnitKind,
    VehicleOverride, VehicleRoute, Waypoint, normalize_all,
};

use crate::config::{OperatorDefaults, SimulatorConfig, unit_file_key};
use crate::error::SimError;
use crate::geo;

/// Highest unit number probed by [`UnitSource::discover`].
pub const MAX_DISCOVERED_UNIT: u32 = 99;

/// Speed accuracy reported with generated operator samples, m/s.
const SPEED_ACCURACY: f64 = 1.0;
/// Course accuracy reported with generated operator samples, degrees.
const COURSE_ACCURACY: f64 = 5.0;
/// Altitude accuracy reported with generated operator samples, metres.
const ALTITUDE_ACCURACY: f64 = 2.0;
/// km/h per m/s.
const KMH_PER_MPS: f64 = 3.6;

/// Where unit definitions come from.
pub trait UnitSource: Send + Sync {
    /// Load the definition of an operator unit.
    fn operator(&self, env: &str, unit: &str) -> Result<OperatorFile, SimError>;

    /// Load the definition of a vehicle unit.
    fn vehicle(&self, env: &str, unit: &str) -> Result<VehicleRoute, SimError>;

    /// List the units of `kind` defined for `env`, in ascending order.
    fn discover(&self, kind: UnitKind, env: &str) -> Vec<String>;
}

// ---------------------------------------------------------------------------
// File-backed source
// ---------------------------------------------------------------------------

/// Reads `operators_<env>/operator_<NN>.json` and
/// `vehicles_<env>/vehicle_<NN>.json` below a data directory.
#[derive(Debug, Clone)]
pub struct FileUnitSource {
    data_dir: PathBuf,
}

impl FileUnitSource {
    /// A source rooted at `data_dir`.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    /// Path of the file that defines `unit` of `kind` in `env`.
    pub fn unit_path(&self, kind: UnitKind, env: &str, unit: &str) -> PathBuf {
        let key = unit_file_key(unit);
        self.data_dir
            .join(format!("{kind}s_{env}"))
            .join(format!("{kind}_{key}.json"))
    }

    fn read(&self, kind: UnitKind, env: &str, unit: &str) -> Result<String, SimError> {
        let path = self.unit_path(kind, env, unit);
        debug!(path = %path.display(), %kind, %unit, "reading unit file");
        std::fs::read_to_string(&path).map_err(|e| missing_or_io(kind, &path, e))
    }
}

fn missing_or_io(kind: UnitKind, path: &Path, err: std::io::Error) -> SimError {
    if err.kind() == std::io::ErrorKind::NotFound {
        SimError::UnitFileMissing {
            kind,
            path: path.display().to_string(),
        }
    } else {
        SimError::Io { source: err }
    }
}

impl UnitSource for FileUnitSource {
    fn operator(&self, env: &str, unit: &str) -> Result<OperatorFile, SimError> {
        let contents = self.read(UnitKind::Operator, env, unit)?;
        Ok(serde_json::from_str(&contents)?)
    }

    fn vehicle(&self, env: &str, unit: &str) -> Result<VehicleRoute, SimError> {
        let contents = self.read(UnitKind::Vehicle, env, unit)?;
        Ok(serde_json::from_str(&contents)?)
    }

    fn discover(&self, kind: UnitKind, env: &str) -> Vec<String> {
        (1..=MAX_DISCOVERED_UNIT)
            .map(|n| n.to_string())
            .filter(|unit| self.unit_path(kind, env, unit).is_file())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Operator plans
// ---------------------------------------------------------------------------

/// Everything a stream session needs for one operator.
#[derive(Debug, Clone, PartialEq)]
pub struct OperatorPlan {
    /// Unit identifier as requested.
    pub unit: String,
    /// Key used to look up the operator's bearer token.
    pub token_key: String,
    /// One cycle of timed messages.
    pub messages: Vec<TimedMessage>,
}

/// Resolve an operator into a plan.
///
/// # Errors
///
/// Returns a configuration error if the unit file is missing or malformed,
/// a coordinate is invalid, or the route produces no messages.
pub fn resolve_operator(
    source: &dyn UnitSource,
    config: &SimulatorConfig,
    env: &str,
    unit: &str,
    request: Option<&OperatorOverride>,
) -> Result<OperatorPlan, SimError> {
    let (token_key, messages) = match request {
        Some(request) => {
            let route = request.clone().into_route();
            (route_token_key(&route, unit), expand_route(&route, &config.operator)?)
        }
        None => match source.operator(env, unit)? {
            OperatorFile::Messages(messages) => (unit.to_owned(), messages),
            OperatorFile::Route(route) => {
                (route_token_key(&route, unit), expand_route(&route, &config.operator)?)
            }
        },
    };

    if messages.is_empty() {
        return Err(SimError::Config(format!("operator {unit} has no messages")));
    }

    Ok(OperatorPlan {
        unit: unit.to_owned(),
        token_key,
        messages,
    })
}

fn route_token_key(route: &OperatorRoute, unit: &str) -> String {
    route
        .operator_id
        .map_or_else(|| unit.to_owned(), |id| id.to_string())
}

/// Turn an operator route into one cycle of timed messages.
///
/// Speed in the route is km/h; the payload carries m/s. Each generated
/// message waits the route's delay after the previous one.
///
/// # Errors
///
/// Returns [`SimError::Coordinate`] if a coordinate cannot be normalized.
pub fn expand_route(
    route: &OperatorRoute,
    defaults: &OperatorDefaults,
) -> Result<Vec<TimedMessage>, SimError> {
    let waypoints = normalize_all(&route.coords)?;
    let speed_mps = route.speed.unwrap_or(defaults.speed_kmh) / KMH_PER_MPS;
    let delay = route.delay.unwrap_or(defaults.delay_ms);
    let course = route.course.unwrap_or(defaults.course);
    let altitude = route.altitude.unwrap_or(defaults.altitude);

    let points = if route.interpolate.unwrap_or(defaults.interpolate) {
        geo::interpolate(&waypoints, speed_mps, delay)
    } else {
        waypoints
    };

    Ok(points
        .into_iter()
        .map(|point| TimedMessage {
            payload: OperatorPayload {
                lat: point.lat,
                lon: point.lon,
                timestamp: 0,
                speed: Some(speed_mps),
                speed_accuracy: Some(SPEED_ACCURACY),
                course: Some(course),
                course_accuracy: Some(COURSE_ACCURACY),
                altitude: Some(altitude),
                altitude_accuracy: Some(ALTITUDE_ACCURACY),
                extra: Map::new(),
            },
            delay,
            extra: Map::new(),
        })
        .collect())
}

// ---------------------------------------------------------------------------
// Vehicle plans
// ---------------------------------------------------------------------------

/// Everything a polled session needs for one vehicle.
#[derive(Debug, Clone, PartialEq)]
pub struct VehiclePlan {
    /// Unit identifier as requested.
    pub unit: String,
    /// Backend-facing client identifier.
    pub client_id: u64,
    /// Points visited in order, wrapping at the end.
    pub points: Vec<Waypoint>,
    /// Speed in m/s, reported with every fix.
    pub speed_mps: f64,
    /// Pause between consecutive posts.
    pub delay: Duration,
}

/// Resolve a vehicle into a plan.
///
/// Speed precedence is the per-unit request speed, then `request_speed`
/// (the run-wide speed), then the unit file's speed, then the configured
/// default.
///
/// # Errors
///
/// Returns a configuration error if the unit file is missing or malformed,
/// no client identifier can be determined, a coordinate is invalid, or the
/// route is empty.
pub fn resolve_vehicle(
    source: &dyn UnitSource,
    config: &SimulatorConfig,
    env: &str,
    unit: &str,
    request: Option<&VehicleOverride>,
    request_speed: Option<f64>,
) -> Result<VehiclePlan, SimError> {
    let defaults = &config.vehicle;

    let (route, client, unit_speed, file_speed) = match request {
        Some(VehicleOverride::Coords(coords)) => {
            let route = VehicleRoute {
                coords: coords.clone(),
                ..VehicleRoute::default()
            };
            (route, Some(defaults.fallback_client_id), None, None)
        }
        Some(VehicleOverride::Detailed(route)) => (route.clone(), route.client, route.speed, None),
        None => {
            let route = source.vehicle(env, unit)?;
            let (client, speed) = (route.client, route.speed);
            (route, client, None, speed)
        }
    };

    let client_id = client
        .ok_or_else(|| SimError::Config(format!("vehicle {unit} has no client id")))?;
    let speed_mps = unit_speed
        .or(request_speed)
        .or(file_speed)
        .unwrap_or(defaults.speed_mps);

    let waypoints = normalize_all(&route.coords)?;
    if waypoints.is_empty() {
        return Err(SimError::Config(format!("vehicle {unit} has no coordinates")));
    }
    let points = if route.interpolate.unwrap_or(defaults.interpolate) {
        geo::interpolate(&waypoints, speed_mps, defaults.request_delay_ms)
    } else {
        waypoints
    };

    Ok(VehiclePlan {
        unit: unit.to_owned(),
        client_id,
        points,
        speed_mps,
        delay: Duration::from_millis(defaults.request_delay_ms),
    })
}
