//! Control surface handlers.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/run` | Start operators and vehicles in an environment |
//! | `POST` | `/stop` | Stop one environment, or all without a body |
//! | `GET` | `/status` | Running/stopped, for one environment or all |
//! | `GET` | `/health` | Liveness probe |

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use serde::{Deserialize, Serialize};
use tracing::info;
use validator::Validate;

use fleetsim_core::{RunOptions, RunParams};
use fleetsim_types::{EnvironmentStatus, OperatorOverride, VehicleOverride};

use crate::error::ApiError;
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

/// A unit identifier as sent by clients: either a number or a string.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum UnitRef {
    /// Numeric identifier, e.g. `7`.
    Number(u64),
    /// String identifier, e.g. `"07"`.
    Text(String),
}

impl fmt::Display for UnitRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

/// Request body for `POST /run`.
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    /// Target environment (default `demo`).
    #[serde(default = "default_env")]
    #[validate(length(min = 1))]
    pub env: String,
    /// Operator units to run.
    #[serde(default)]
    pub operators: Vec<UnitRef>,
    /// Vehicle units to run.
    #[serde(default)]
    pub vehicles: Vec<UnitRef>,
    /// Run-wide vehicle speed in m/s.
    #[validate(range(min = 0.0))]
    pub speed: Option<f64>,
    /// Overall duration in seconds, fractions allowed.
    #[validate(range(min = 1.0))]
    pub duration: Option<f64>,
    /// Also run every operator that has a unit file.
    #[serde(default)]
    pub all_operators: bool,
    /// Also run every vehicle that has a unit file.
    #[serde(default)]
    pub all_vehicles: bool,
    /// Inline operator routes keyed by unit.
    #[serde(default)]
    pub operator_coords: BTreeMap<String, OperatorOverride>,
    /// Inline vehicle routes keyed by unit.
    #[serde(default)]
    pub vehicle_coords: BTreeMap<String, VehicleOverride>,
}

fn default_env() -> String {
    String::from("demo")
}

impl RunRequest {
    /// Convert into the simulator's run description.
    pub fn into_params(self) -> RunParams {
        RunParams {
            env: self.env,
            operators: self.operators.iter().map(ToString::to_string).collect(),
            vehicles: self.vehicles.iter().map(ToString::to_string).collect(),
            all_operators: self.all_operators,
            all_vehicles: self.all_vehicles,
            options: RunOptions {
                // Too large to represent means effectively unbounded.
                duration: self
                    .duration
                    .map(|secs| Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)),
                speed_mps: self.speed,
                operator_overrides: self.operator_coords,
                vehicle_overrides: self.vehicle_coords,
            },
        }
    }
}

/// Request body for `POST /stop`.
#[derive(Debug, Default, Deserialize)]
pub struct StopRequest {
    /// Environment to stop; all environments when absent.
    pub env: Option<String>,
}

/// Query parameters for `GET /status`.
#[derive(Debug, Default, Deserialize)]
pub struct StatusQuery {
    /// Environment to report; all environments when absent.
    pub env: Option<String>,
}

/// Response of `POST /stop`.
#[derive(Debug, Serialize)]
struct StopResponse {
    status: &'static str,
    message: String,
}

/// Response of `GET /status`: one object for a named environment, a list
/// otherwise.
#[derive(Debug, Serialize)]
#[serde(untagged)]
enum StatusResponse {
    One(EnvironmentStatus),
    All(Vec<EnvironmentStatus>),
}

// ---------------------------------------------------------------------------
// POST /run
// ---------------------------------------------------------------------------

/// Start the requested units and return their connect-phase statuses.
///
/// Sessions keep running in the background after the response is sent.
pub async fn run(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RunRequest>,
) -> Result<impl IntoResponse, ApiError> {
    request.validate()?;
    let params = request.into_params();
    info!(
        env = %params.env,
        operators = params.operators.len(),
        vehicles = params.vehicles.len(),
        all_operators = params.all_operators,
        all_vehicles = params.all_vehicles,
        "run request"
    );

    let report = state.simulator.run(params).await?;
    Ok(Json(report))
}

// ---------------------------------------------------------------------------
// POST /stop
// ---------------------------------------------------------------------------

/// Stop one environment, or every environment when no `env` is given.
pub async fn stop(
    State(state): State<Arc<AppState>>,
    request: Option<Json<StopRequest>>,
) -> impl IntoResponse {
    let Json(request) = request.unwrap_or_default();
    let env = request.env.filter(|env| !env.is_empty());

    state.simulator.stop(env.as_deref()).await;

    let message = env.map_or_else(
        || "Stopped all environments".to_owned(),
        |env| format!("Stopped environment {env}"),
    );
    Json(StopResponse {
        status: "stopped",
        message,
    })
}

// ---------------------------------------------------------------------------
// GET /status
// ---------------------------------------------------------------------------

/// Report whether an environment is running.
pub async fn status(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StatusQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let response = match query.env.filter(|env| !env.is_empty()) {
        Some(env) => {
            let one = state
                .simulator
                .status(Some(&env))
                .into_iter()
                .next()
                .ok_or_else(|| ApiError::Internal(format!("no status for {env}")))?;
            StatusResponse::One(one)
        }
        None => StatusResponse::All(state.simulator.status(None)),
    };
    Ok(Json(response))
}

// ---------------------------------------------------------------------------
// GET /health
// ---------------------------------------------------------------------------

/// Liveness probe.
pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "ok": true }))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn run_request_defaults() {
        let request: RunRequest = serde_json::from_str("{}").unwrap();
        assert_eq!(request.env, "demo");
        assert!(request.operators.is_empty());
        assert!(!request.all_vehicles);
        assert!(request.validate().is_ok());
    }

    #[test]
    fn unit_refs_accept_numbers_and_strings() {
        let request: RunRequest =
            serde_json::from_str(r#"{"env":"dev","operators":[1,"02"],"duration":60}"#).unwrap();
        let params = request.into_params();
        assert_eq!(params.operators, vec!["1", "02"]);
        assert_eq!(params.options.duration, Some(Duration::from_secs(60)));
    }

    #[test]
    fn fractional_durations_are_accepted() {
        let request: RunRequest = serde_json::from_str(r#"{"duration":1.5}"#).unwrap();
        assert!(request.validate().is_ok());
        let params = request.into_params();
        assert_eq!(params.options.duration, Some(Duration::from_millis(1_500)));

        let request: RunRequest = serde_json::from_str(r#"{"duration":0.5}"#).unwrap();
        assert!(request.validate().is_err());

        let request: RunRequest = serde_json::from_str(r#"{"duration":1e300}"#).unwrap();
        assert_eq!(request.into_params().options.duration, Some(Duration::MAX));
    }

    #[test]
    fn negative_speed_and_zero_duration_are_rejected() {
        let request: RunRequest = serde_json::from_str(r#"{"speed":-1.0}"#).unwrap();
        assert!(request.validate().is_err());

        let request: RunRequest = serde_json::from_str(r#"{"duration":0}"#).unwrap();
        assert!(request.validate().is_err());
    }

    #[test]
    fn coordinate_overrides_use_camel_case_keys() {
        let request: RunRequest = serde_json::from_str(
            r#"{
                "operatorCoords": {"3": [[106.5, 58.0], [106.6, 58.1]]},
                "vehicleCoords": {"9": {"client": 42, "coords": [{"lat": 58.0, "lon": 106.5}]}}
            }"#,
        )
        .unwrap();
        assert!(matches!(
            request.operator_coords.get("3"),
            Some(OperatorOverride::Coords(c)) if c.len() == 2
        ));
        assert!(matches!(
            request.vehicle_coords.get("9"),
            Some(VehicleOverride::Detailed(route)) if route.client == Some(42)
        ));
    }
}
