//! Waypoint distance and time-paced route interpolation.
//!
//! [`interpolate`] turns a sparse list of waypoints into the sequence of
//! positions a unit moving at a constant speed would report at a fixed
//! interval. Step counts come from the haversine distance of each segment,
//! but the intermediate points themselves are placed by linear
//! interpolation in latitude/longitude space. That is a planar
//! approximation, not a great-circle path: it is accurate to well under a
//! metre over the metre-to-kilometre segments simulated routes use, and
//! drifts for long or high-latitude segments. Keep it planar; the
//! emitted cadence is what the backend is being tested against.

use fleetsim_types::Waypoint;

/// Mean Earth radius in metres used by the haversine formula.
pub const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

/// Great-circle distance between two waypoints in metres (haversine).
pub fn distance_meters(a: Waypoint, b: Waypoint) -> f64 {
    let phi1 = a.lat.to_radians();
    let phi2 = b.lat.to_radians();
    let delta_phi = (b.lat - a.lat).to_radians();
    let delta_lambda = (b.lon - a.lon).to_radians();

    let half_chord = (delta_phi / 2.0).sin().powi(2)
        + phi1.cos() * phi2.cos() * (delta_lambda / 2.0).sin().powi(2);
    let central_angle = 2.0 * half_chord.sqrt().atan2((1.0 - half_chord).sqrt());

    EARTH_RADIUS_METERS * central_angle
}

/// Number of interpolation steps needed to cover `distance` metres at
/// `speed_mps` when reporting every `interval_ms` milliseconds.
///
/// Always at least 1, so coincident waypoints still produce one point.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
fn segment_steps(distance: f64, speed_mps: f64, interval_ms: u64) -> usize {
    let interval_secs = interval_ms as f64 / 1000.0;
    let time_needed = distance / speed_mps;
    let steps = (time_needed / interval_secs).ceil();
    if steps.is_finite() && steps >= 1.0 {
        steps as usize
    } else {
        1
    }
}

/// Expand `waypoints` into a time-paced point sequence.
///
/// For each consecutive pair the segment is split into
/// `ceil(distance / speed / interval)` steps and one point is emitted per
/// step, ending exactly on the segment's end waypoint. The very first
/// waypoint is emitted once up front. Fewer than two waypoints, or a
/// non-positive speed or zero interval, return the input unchanged.
///
/// The output is deterministic: identical inputs give identical output.
#[allow(clippy::cast_precision_loss)]
pub fn interpolate(waypoints: &[Waypoint], speed_mps: f64, interval_ms: u64) -> Vec<Waypoint> {
    let Some(first) = waypoints.first() else {
        return Vec::new();
    };
    if waypoints.len() < 2 || speed_mps <= 0.0 || !speed_mps.is_finite() || interval_ms == 0 {
        return waypoints.to_vec();
    }

    let mut points = Vec::with_capacity(waypoints.len());
    points.push(*first);

    for pair in waypoints.windows(2) {
        let [start, end] = pair else { continue };
        let steps = segment_steps(distance_meters(*start, *end), speed_mps, interval_ms);
        let steps_f = steps as f64;

        for j in 1..steps {
            let ratio = j as f64 / steps_f;
            points.push(Waypoint::new(
                (end.lat - start.lat).mul_add(ratio, start.lat),
                (end.lon - start.lon).mul_add(ratio, start.lon),
            ));
        }
        // Land exactly on the input waypoint rather than on a rounded
        // ratio of 1.0.
        points.push(*end);
    }

    points
}
