//! Geographic coordinates and the raw shapes they arrive in.
//!
//! Unit files and run requests describe routes as lists of coordinates in
//! one of three shapes: `[lon, lat]`, `[lat, lon]`, or `{"lat": .., "lon": ..}`.
//! [`RawCoordinate`] accepts all three and [`RawCoordinate::normalize`]
//! turns each into a [`Waypoint`]. Everything downstream of the parser
//! works on [`Waypoint`] only.
//!
//! # Axis order
//!
//! For the two-element array shapes the axis order is decided by the
//! first value alone: if `|first| > 90` it can only be a longitude, so the
//! pair is read as `[lon, lat]`; otherwise it is read as `[lat, lon]`.
//! There is no fallback for pairs where both values are within +/-90.

use serde::{Deserialize, Serialize};

/// Largest absolute latitude, in degrees.
const MAX_LATITUDE: f64 = 90.0;

/// Largest absolute longitude, in degrees.
const MAX_LONGITUDE: f64 = 180.0;

/// A normalized geographic coordinate in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Waypoint {
    /// Latitude in degrees, positive north.
    pub lat: f64,
    /// Longitude in degrees, positive east.
    pub lon: f64,
}

impl Waypoint {
    /// Create a waypoint from latitude and longitude.
    pub const fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }
}

/// Errors produced while normalizing raw coordinates.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CoordinateError {
    /// A coordinate value was NaN or infinite.
    #[error("coordinate at index {index} is not a finite number")]
    NotFinite {
        /// Position of the offending coordinate in its list.
        index: usize,
    },

    /// A coordinate was outside the valid latitude/longitude range after
    /// axis disambiguation.
    #[error("coordinate at index {index} is out of range (lat {lat}, lon {lon})")]
    OutOfRange {
        /// Position of the offending coordinate in its list.
        index: usize,
        /// Latitude after axis disambiguation.
        lat: f64,
        /// Longitude after axis disambiguation.
        lon: f64,
    },
}

/// A coordinate as it appears in a unit file or request body.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawCoordinate {
    /// A two-element array in either `[lon, lat]` or `[lat, lon]` order.
    Pair([f64; 2]),
    /// An object with explicit `lat` and `lon` keys.
    Object {
        /// Latitude in degrees.
        lat: f64,
        /// Longitude in degrees.
        lon: f64,
    },
}

impl RawCoordinate {
    /// Resolve the axis order and return a [`Waypoint`].
    ///
    /// Does not range-check; see [`normalize_all`] for the validating form.
    pub fn to_waypoint(self) -> Waypoint {
        match self {
            Self::Pair([first, second]) => {
                if first.abs() > MAX_LATITUDE {
                    Waypoint::new(second, first)
                } else {
                    Waypoint::new(first, second)
                }
            }
            Self::Object { lat, lon } => Waypoint::new(lat, lon),
        }
    }

    /// Resolve the axis order and validate the result.
    ///
    /// `index` is only used for error reporting.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinateError`] if either value is not finite or the
    /// resolved latitude/longitude is out of range.
    pub fn normalize(self, index: usize) -> Result<Waypoint, CoordinateError> {
        let waypoint = self.to_waypoint();
        if !waypoint.lat.is_finite() || !waypoint.lon.is_finite() {
            return Err(CoordinateError::NotFinite { index });
        }
        if waypoint.lat.abs() > MAX_LATITUDE || waypoint.lon.abs() > MAX_LONGITUDE {
            return Err(CoordinateError::OutOfRange {
                index,
                lat: waypoint.lat,
                lon: waypoint.lon,
            });
        }
        Ok(waypoint)
    }
}

/// Normalize a whole coordinate list, failing on the first bad entry.
///
/// # Errors
///
/// Returns the [`CoordinateError`] of the first coordinate that fails
/// [`RawCoordinate::normalize`].
pub fn normalize_all(raw: &[RawCoordinate]) -> Result<Vec<Waypoint>, CoordinateError> {
    raw.iter()
        .enumerate()
        .map(|(index, coord)| coord.normalize(index))
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use super::*;

    #[test]
    fn lon_first_pair_is_swapped() {
        let wp = RawCoordinate::Pair([106.5, 58.0]).normalize(0).unwrap();
        assert_eq!(wp, Waypoint::new(58.0, 106.5));
    }

    #[test]
    fn lat_first_pair_is_kept() {
        let wp = RawCoordinate::Pair([58.0, 106.5]).normalize(0).unwrap();
        assert_eq!(wp, Waypoint::new(58.0, 106.5));
    }

    #[test]
    fn negative_longitude_first_is_detected() {
        let wp = RawCoordinate::Pair([-122.4, 37.7]).normalize(0).unwrap();
        assert_eq!(wp.lat, 37.7);
        assert_eq!(wp.lon, -122.4);
    }

    #[test]
    fn both_axes_within_ninety_read_as_lat_lon() {
        let wp = RawCoordinate::Pair([10.0, 20.0]).normalize(0).unwrap();
        assert_eq!(wp, Waypoint::new(10.0, 20.0));
    }

    #[test]
    fn object_shape_passes_through() {
        let wp = RawCoordinate::Object { lat: 58.03, lon: 106.54 }
            .normalize(0)
            .unwrap();
        assert_eq!(wp, Waypoint::new(58.03, 106.54));
    }

    #[test]
    fn out_of_range_latitude_is_rejected() {
        let err = RawCoordinate::Pair([106.5, 95.0]).normalize(3).unwrap_err();
        assert!(matches!(err, CoordinateError::OutOfRange { index: 3, .. }));
    }

    #[test]
    fn non_finite_is_rejected() {
        let err = RawCoordinate::Object { lat: f64::NAN, lon: 1.0 }
            .normalize(0)
            .unwrap_err();
        assert_eq!(err, CoordinateError::NotFinite { index: 0 });
    }

    #[test]
    fn deserializes_all_three_shapes() {
        let json = r#"[[106.54683029, 58.03256597], [58.03409, 106.5384], {"lat": 58.0389, "lon": 106.5378}]"#;
        let raw: Vec<RawCoordinate> = serde_json::from_str(json).unwrap();
        let waypoints = normalize_all(&raw).unwrap();
        assert_eq!(waypoints.len(), 3);
        assert!(waypoints.iter().all(|w| w.lat > 58.0 && w.lon > 106.0));
    }

    #[test]
    fn normalize_all_reports_first_failure() {
        let raw = vec![
            RawCoordinate::Pair([58.0, 106.0]),
            RawCoordinate::Pair([200.0, 200.0]),
        ];
        let err = normalize_all(&raw).unwrap_err();
        assert!(matches!(err, CoordinateError::OutOfRange { index: 1, .. }));
    }
}
