//! Wire payloads sent to the tracking backend.
//!
//! Operators push [`TimedMessage`] values over their stream; vehicles post
//! one [`VehicleTelemetry`] document per call. Unknown fields in operator
//! messages loaded from legacy files are preserved through `extra` so a
//! replayed file reaches the backend unchanged apart from its timestamp.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One scheduled operator message: a payload plus the delay, in
/// milliseconds, that precedes it within a cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimedMessage {
    /// The telemetry sample.
    pub payload: OperatorPayload,
    /// Delay in milliseconds since the previous message of the cycle.
    pub delay: u64,
    /// Any other top-level keys found in the source file.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TimedMessage {
    /// Return a copy of this message with the payload timestamp replaced.
    #[must_use]
    pub fn restamped(&self, timestamp: i64) -> Self {
        let mut message = self.clone();
        message.payload.timestamp = timestamp;
        message
    }
}

/// Operator telemetry sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatorPayload {
    /// Latitude in degrees.
    pub lat: f64,
    /// Longitude in degrees.
    pub lon: f64,
    /// Unix timestamp in seconds. Overwritten at send time.
    #[serde(default)]
    pub timestamp: i64,
    /// Ground speed in metres per second.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    /// Speed accuracy in metres per second.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed_accuracy: Option<f64>,
    /// Course over ground in degrees.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub course: Option<f64>,
    /// Course accuracy in degrees.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub course_accuracy: Option<f64>,
    /// Altitude in metres.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub altitude: Option<f64>,
    /// Altitude accuracy in metres.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub altitude_accuracy: Option<f64>,
    /// Any other payload keys found in the source file.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Body of a single vehicle telemetry post.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleTelemetry {
    /// Fixes carried by this post. The simulator always sends exactly one.
    pub telemetry: Vec<VehicleFix>,
}

/// One vehicle position fix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleFix {
    /// Backend-facing client identifier of the vehicle.
    pub client: u64,
    /// Local time of the fix, `YYYY-MM-DDTHH:MM:SS+HH:MM`.
    pub navigation_time: String,
    /// Latitude in degrees.
    pub latitude: f64,
    /// Longitude in degrees.
    pub longitude: f64,
    /// Whether the vehicle is moving.
    pub moving: bool,
    /// Odometer reading reported with the fix.
    pub distance: u32,
    /// Number of satellites in view.
    pub nsat: u32,
    /// Position dilution of precision.
    pub pdop: u32,
    /// Speed in km/h.
    pub speed: u32,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    #[test]
    fn legacy_message_keeps_unknown_fields() {
        let json = r#"{
            "type": "location",
            "payload": {"lat": 58.0, "lon": 106.5, "timestamp": 1744365976,
                        "speed": 10, "course": 90, "provider": "gps"},
            "delay": 2000
        }"#;
        let message: TimedMessage = serde_json::from_str(json).unwrap();
        assert_eq!(message.delay, 2000);
        assert_eq!(message.extra.get("type"), Some(&Value::from("location")));
        assert_eq!(
            message.payload.extra.get("provider"),
            Some(&Value::from("gps"))
        );

        let out = serde_json::to_value(message.restamped(42)).unwrap();
        assert_eq!(out["payload"]["timestamp"], 42);
        assert_eq!(out["payload"]["provider"], "gps");
        assert_eq!(out["type"], "location");
    }

    #[test]
    fn absent_optional_fields_are_not_serialized() {
        let payload = OperatorPayload {
            lat: 1.0,
            lon: 2.0,
            timestamp: 0,
            speed: None,
            speed_accuracy: None,
            course: None,
            course_accuracy: None,
            altitude: None,
            altitude_accuracy: None,
            extra: Map::new(),
        };
        let out = serde_json::to_value(payload).unwrap();
        let keys: Vec<&String> = out.as_object().unwrap().keys().collect();
        assert_eq!(keys.len(), 3);
    }
}
