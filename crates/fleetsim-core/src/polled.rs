//! Vehicle sessions: one telemetry post per point, strictly sequential.
//!
//! The loop walks a cursor over the plan's points, wrapping at the end, and
//! waits for each post to finish before sleeping the inter-call delay and
//! issuing the next. It ends when stopped or once the configured duration
//! has elapsed, whichever is seen first at the top of an iteration.

use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use fleetsim_types::{SessionId, VehicleFix, VehicleTelemetry, Waypoint};

use crate::control::{EndReason, SessionControl};
use crate::source::VehiclePlan;
use crate::transport::TelemetryPoster;

/// Odometer value reported with every fix.
const REPORTED_DISTANCE: u32 = 1930;
/// Satellites-in-view value reported with every fix.
const REPORTED_NSAT: u32 = 3;
/// PDOP value reported with every fix.
const REPORTED_PDOP: u32 = 4;

/// Outcome of one telemetry post.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostOutcome {
    /// Index of the point that was posted.
    pub index: usize,
    /// HTTP status, if a response was received.
    pub status: Option<u16>,
    /// Transport error, if no response was received.
    pub error: Option<String>,
}

impl PostOutcome {
    /// Whether the backend answered with a 2xx status.
    pub fn is_success(&self) -> bool {
        self.status.is_some_and(|s| (200..300).contains(&s))
    }
}

/// Result of a finished vehicle session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollReport {
    /// Unit identifier.
    pub unit: String,
    /// Identifier of this session.
    pub session_id: SessionId,
    /// Why the session ended: [`EndReason::Stopped`] or
    /// [`EndReason::TimedOut`].
    pub end: EndReason,
    /// One entry per completed post, in order.
    pub outcomes: Vec<PostOutcome>,
}

/// A vehicle session bound to one plan.
pub struct PolledUnit {
    plan: VehiclePlan,
    env: String,
    endpoint: String,
    duration: Duration,
    poster: Arc<dyn TelemetryPoster>,
    control: Arc<SessionControl>,
    session_id: SessionId,
    cursor: usize,
}

impl std::fmt::Debug for PolledUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolledUnit")
            .field("unit", &self.plan.unit)
            .field("env", &self.env)
            .field("endpoint", &self.endpoint)
            .field("duration", &self.duration)
            .field("cursor", &self.cursor)
            .finish_non_exhaustive()
    }
}

impl PolledUnit {
    /// Create a session that posts to `endpoint` for at most `duration`.
    pub fn new(
        plan: VehiclePlan,
        env: &str,
        endpoint: String,
        duration: Duration,
        poster: Arc<dyn TelemetryPoster>,
    ) -> Self {
        Self {
            plan,
            env: env.to_owned(),
            endpoint,
            duration,
            poster,
            control: Arc::new(SessionControl::new()),
            session_id: SessionId::new(),
            cursor: 0,
        }
    }

    /// The control of this session. Stopping it stops the session.
    pub fn control(&self) -> Arc<SessionControl> {
        Arc::clone(&self.control)
    }

    /// Post points until stopped or out of time.
    pub async fn run(mut self) -> PollReport {
        let started = Instant::now();
        let mut outcomes = Vec::new();

        info!(
            unit = %self.plan.unit,
            env = %self.env,
            session = %self.session_id,
            client = self.plan.client_id,
            points = self.plan.points.len(),
            "polled session started"
        );

        let end = loop {
            if !self.control.is_running() {
                break EndReason::Stopped;
            }
            if started.elapsed() >= self.duration {
                info!(unit = %self.plan.unit, env = %self.env, "duration elapsed, stopping");
                self.control.stop();
                break EndReason::TimedOut;
            }
            let Some(point) = self.plan.points.get(self.cursor).copied() else {
                warn!(unit = %self.plan.unit, "no points to post");
                self.control.stop();
                break EndReason::Stopped;
            };

            let outcome = self.post(point).await;
            if !self.control.is_running() {
                // Stopped while the post was in flight: drop its result.
                break EndReason::Stopped;
            }
            outcomes.push(outcome);

            self.cursor = self
                .cursor
                .saturating_add(1)
                .checked_rem(self.plan.points.len())
                .unwrap_or(0);

            tokio::select! {
                () = self.control.stopped() => {}
                () = tokio::time::sleep(self.plan.delay) => {}
            }
        };

        info!(
            unit = %self.plan.unit,
            env = %self.env,
            session = %self.session_id,
            posts = outcomes.len(),
            end = ?end,
            "polled session ended"
        );

        PollReport {
            unit: self.plan.unit,
            session_id: self.session_id,
            end,
            outcomes,
        }
    }

    async fn post(&self, point: Waypoint) -> PostOutcome {
        let payload = telemetry_for(self.plan.client_id, point, self.plan.speed_mps);
        match self.poster.post(&self.endpoint, &payload).await {
            Ok(status) => {
                debug!(
                    unit = %self.plan.unit,
                    index = self.cursor,
                    lat = point.lat,
                    lon = point.lon,
                    status,
                    "telemetry posted"
                );
                PostOutcome {
                    index: self.cursor,
                    status: Some(status),
                    error: None,
                }
            }
            Err(e) => {
                warn!(unit = %self.plan.unit, index = self.cursor, error = %e, "telemetry post failed");
                PostOutcome {
                    index: self.cursor,
                    status: None,
                    error: Some(e.to_string()),
                }
            }
        }
    }
}

/// Build the single-fix telemetry document for `point`.
///
/// `navigation_time` is the local time of the call; speed is reported in
/// whole km/h.
pub fn telemetry_for(client: u64, point: Waypoint, speed_mps: f64) -> VehicleTelemetry {
    VehicleTelemetry {
        telemetry: vec![VehicleFix {
            client,
            navigation_time: Local::now().format("%Y-%m-%dT%H:%M:%S%:z").to_string(),
            latitude: point.lat,
            longitude: point.lon,
            moving: true,
            distance: REPORTED_DISTANCE,
            nsat: REPORTED_NSAT,
            pdop: REPORTED_PDOP,
            speed: speed_kmh(speed_mps),
        }],
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn speed_kmh(speed_mps: f64) -> u32 {
    let kmh = (speed_mps * 3.6).round();
    if kmh.is_finite() && kmh > 0.0 {
        kmh.min(f64::from(u32::MAX)) as u32
    } else {
        0
    }
}
