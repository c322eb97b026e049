//! Operator sessions: cyclic replay of timed messages over a stream.
//!
//! Every message of a cycle is scheduled up front as its own timer task,
//! at the sum of the delays up to and including it, measured from the
//! cycle start. When the last message of a cycle fires, the next cycle is
//! scheduled to start one cycle gap later, so a cycle lasts
//! `sum(delays) + gap`. Timer tasks are owned by the session's
//! [`SessionControl`] and all of them are aborted when the session ends.
//!
//! A session ends on the first of: an explicit stop, its duration
//! elapsing, the connection closing, a transport error, or a failed send.
//! Only a transport error is reported as `Err`.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use fleetsim_types::{SessionId, TimedMessage};

use crate::config::SimulatorConfig;
use crate::control::{EndReason, SessionControl};
use crate::error::SimError;
use crate::source::OperatorPlan;
use crate::transport::{
    CLOSE_ABNORMAL, ConnectTarget, StreamConnection, StreamConnector, StreamEvent, StreamLink,
    TransportError, close_reason_text,
};

/// Result of a finished unit session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    /// Unit identifier.
    pub unit: String,
    /// Identifier of this session.
    pub session_id: SessionId,
    /// Why the session ended.
    pub end: EndReason,
    /// Number of messages handed to the transport.
    pub messages_sent: usize,
    /// Session log: one line per sent, received, closed, or failed event.
    pub log: Vec<String>,
}

/// Build the connect target for an operator plan.
///
/// # Errors
///
/// Returns a configuration error if the environment is unknown or no token
/// is configured for the plan's token key. No network activity happens
/// before these checks pass.
pub fn connect_target(
    config: &SimulatorConfig,
    env: &str,
    plan: &OperatorPlan,
) -> Result<ConnectTarget, SimError> {
    let profile = config.environment(env)?;
    let token = profile.operator_token(&plan.token_key).ok_or_else(|| {
        SimError::Config(format!(
            "no token configured for operator {} in {env}",
            plan.token_key
        ))
    })?;
    Ok(ConnectTarget {
        unit: plan.unit.clone(),
        env: env.to_owned(),
        url: profile.stream_url.clone(),
        token: token.to_owned(),
    })
}

/// An operator session bound to one plan.
#[derive(Debug)]
pub struct StreamUnit {
    unit: String,
    env: String,
    messages: Arc<[TimedMessage]>,
    timeout: Option<Duration>,
    cycle_gap: Duration,
    control: Arc<SessionControl>,
    session_id: SessionId,
}

impl StreamUnit {
    /// Create a session for `plan` in `env`.
    ///
    /// With no `timeout` the session cycles until stopped or closed.
    pub fn new(
        plan: OperatorPlan,
        env: &str,
        timeout: Option<Duration>,
        cycle_gap: Duration,
    ) -> Self {
        Self {
            unit: plan.unit,
            env: env.to_owned(),
            messages: plan.messages.into(),
            timeout,
            cycle_gap,
            control: Arc::new(SessionControl::new()),
            session_id: SessionId::new(),
        }
    }

    /// The control shared with this session's timers. Stopping it stops
    /// the session.
    pub fn control(&self) -> Arc<SessionControl> {
        Arc::clone(&self.control)
    }

    /// Acquire a connection through `connector`, then [`run`](Self::run).
    ///
    /// # Errors
    ///
    /// Returns [`SimError::Connect`] if the connection cannot be opened,
    /// otherwise whatever [`run`](Self::run) returns.
    pub async fn connect_and_run(
        self,
        connector: &dyn StreamConnector,
        target: &ConnectTarget,
    ) -> Result<SessionReport, SimError> {
        let connection = connector
            .connect(target)
            .await
            .map_err(|e| SimError::Connect(e.to_string()))?;
        self.run(connection).await
    }

    /// Cycle over `connection` until the session ends.
    ///
    /// # Errors
    ///
    /// Returns [`SimError::Transport`] if reading from the connection fails.
    pub async fn run(self, connection: StreamConnection) -> Result<SessionReport, SimError> {
        let StreamConnection { link, mut events } = connection;
        let cycle = Arc::new(Cycle {
            unit: self.unit.clone(),
            messages: Arc::clone(&self.messages),
            link: link.clone(),
            control: Arc::clone(&self.control),
            gap: self.cycle_gap,
            log: Mutex::new(Vec::new()),
            sent: AtomicUsize::new(0),
            send_failed: AtomicBool::new(false),
        });

        info!(
            unit = %self.unit,
            env = %self.env,
            session = %self.session_id,
            messages = self.messages.len(),
            "stream session started"
        );

        let started = Instant::now();
        schedule_cycle(&cycle, started);

        let deadline = self.timeout.and_then(|t| started.checked_add(t));
        let expired = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(expired);

        let outcome = loop {
            tokio::select! {
                biased;
                () = self.control.stopped() => {
                    break Ok(if cycle.send_failed.load(Ordering::Acquire) {
                        EndReason::SendFailed
                    } else {
                        EndReason::Stopped
                    });
                }
                () = &mut expired => {
                    info!(unit = %self.unit, env = %self.env, "duration elapsed, stopping");
                    break Ok(EndReason::TimedOut);
                }
                event = events.recv() => match event {
                    Some(StreamEvent::Message(text)) => {
                        debug!(unit = %self.unit, "message received");
                        cycle.record(format!("<- [{}] {text}", self.unit));
                    }
                    Some(StreamEvent::Closed { code, reason }) => {
                        let text = close_reason_text(code, &reason);
                        info!(unit = %self.unit, env = %self.env, reason = %text, "stream closed");
                        cycle.record(format!("x [{}] closed: {text}", self.unit));
                        break Ok(EndReason::Closed { code, reason });
                    }
                    Some(StreamEvent::SendFailed(message)) => {
                        warn!(
                            unit = %self.unit,
                            env = %self.env,
                            error = %message,
                            "send failed, stopping"
                        );
                        cycle.record(format!("! [{}] error: {message}", self.unit));
                        break Ok(EndReason::SendFailed);
                    }
                    Some(StreamEvent::Error(message)) => {
                        warn!(unit = %self.unit, env = %self.env, error = %message, "stream error");
                        cycle.record(format!("! [{}] error: {message}", self.unit));
                        break Err(SimError::Transport {
                            source: TransportError::WebSocket(message),
                        });
                    }
                    None => {
                        let text = close_reason_text(CLOSE_ABNORMAL, "");
                        cycle.record(format!("x [{}] closed: {text}", self.unit));
                        break Ok(EndReason::Closed {
                            code: CLOSE_ABNORMAL,
                            reason: String::new(),
                        });
                    }
                },
            }
        };

        self.control.stop();
        link.close();

        let end = outcome?;
        let messages_sent = cycle.sent.load(Ordering::Acquire);
        info!(
            unit = %self.unit,
            env = %self.env,
            session = %self.session_id,
            messages_sent,
            end = ?end,
            "stream session ended"
        );

        Ok(SessionReport {
            unit: self.unit,
            session_id: self.session_id,
            end,
            messages_sent,
            log: cycle.take_log(),
        })
    }
}

// ---------------------------------------------------------------------------
// Cycle scheduling
// ---------------------------------------------------------------------------

/// State shared by one session's timer tasks.
#[derive(Debug)]
struct Cycle {
    unit: String,
    messages: Arc<[TimedMessage]>,
    link: StreamLink,
    control: Arc<SessionControl>,
    gap: Duration,
    log: Mutex<Vec<String>>,
    sent: AtomicUsize,
    send_failed: AtomicBool,
}

impl Cycle {
    fn record(&self, line: String) {
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(line);
    }

    fn take_log(&self) -> Vec<String> {
        std::mem::take(&mut *self.log.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Send message `index`, which was due at `due`.
    fn fire(self: &Arc<Self>, index: usize, due: Instant) {
        let Some(message) = self.messages.get(index) else {
            return;
        };

        let outcome = self.control.fire(|| -> Result<(), SimError> {
            let json = serde_json::to_string(&message.restamped(Utc::now().timestamp()))?;
            self.record(format!("-> [{}] {json}", self.unit));
            self.link.send_text(json)?;
            Ok(())
        });

        match outcome {
            None => {}
            Some(Ok(())) => {
                self.sent.fetch_add(1, Ordering::AcqRel);
                debug!(unit = %self.unit, index, "message sent");
                if index.saturating_add(1) == self.messages.len() {
                    schedule_cycle(self, due.checked_add(self.gap).unwrap_or(due));
                }
            }
            Some(Err(e)) => {
                warn!(unit = %self.unit, index, error = %e, "send failed, stopping session");
                self.record(format!("! [{}] error: {e}", self.unit));
                self.send_failed.store(true, Ordering::Release);
                self.control.stop();
            }
        }
    }
}

/// Schedule every message of one cycle starting at `start`.
fn schedule_cycle(cycle: &Arc<Cycle>, start: Instant) {
    let mut offset = Duration::ZERO;
    for (index, message) in cycle.messages.iter().enumerate() {
        offset = offset.saturating_add(Duration::from_millis(message.delay));
        let due = start.checked_add(offset).unwrap_or(start);
        let task_cycle = Arc::clone(cycle);
        let timer = tokio::spawn(async move {
            tokio::time::sleep_until(due).await;
            task_cycle.fire(index, due);
        });
        if !cycle.control.track(timer.abort_handle()) {
            return;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use serde_json::{Map, Value};

    use fleetsim_types::OperatorPayload;

    use super::*;
    use crate::transport::{LoopbackConnector, StreamPeer};

    fn message(delay: u64) -> TimedMessage {
        TimedMessage {
            payload: OperatorPayload {
                lat: 58.03,
                lon: 106.54,
                timestamp: 0,
                speed: Some(1.0),
                speed_accuracy: None,
                course: None,
                course_accuracy: None,
                altitude: None,
                altitude_accuracy: None,
                extra: Map::new(),
            },
            delay,
            extra: Map::new(),
        }
    }

    fn plan(delays: &[u64]) -> OperatorPlan {
        OperatorPlan {
            unit: "1".to_owned(),
            token_key: "1".to_owned(),
            messages: delays.iter().map(|d| message(*d)).collect(),
        }
    }

    fn start(
        delays: &[u64],
        timeout: Option<Duration>,
    ) -> (
        Arc<SessionControl>,
        StreamPeer,
        tokio::task::JoinHandle<Result<SessionReport, SimError>>,
    ) {
        let unit = StreamUnit::new(plan(delays), "dev", timeout, Duration::from_secs(1));
        let control = unit.control();
        let (connection, peer) = StreamConnection::pair();
        let handle = tokio::spawn(unit.run(connection));
        (control, peer, handle)
    }

    async fn sleep_ms(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn messages_follow_offsets_and_cycle_gap() {
        let (control, mut peer, handle) = start(&[100, 200], None);

        // Cycle 1: t=100, t=300. Cycle 2 starts at 1300: t=1400, t=1600.
        sleep_ms(150).await;
        assert_eq!(peer.drain_texts().len(), 1);
        sleep_ms(200).await; // t=350
        assert_eq!(peer.drain_texts().len(), 1);
        sleep_ms(1000).await; // t=1350, inside the gap
        assert!(peer.drain_texts().is_empty());
        sleep_ms(100).await; // t=1450
        assert_eq!(peer.drain_texts().len(), 1);
        sleep_ms(200).await; // t=1650
        assert_eq!(peer.drain_texts().len(), 1);

        control.stop();
        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.end, EndReason::Stopped);
        assert_eq!(report.messages_sent, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn sent_messages_are_restamped_and_logged() {
        let (control, mut peer, handle) = start(&[100], None);
        sleep_ms(150).await;

        let texts = peer.drain_texts();
        let sent: Value = serde_json::from_str(&texts[0]).unwrap();
        assert!(sent["payload"]["timestamp"].as_i64().unwrap() > 0);
        assert_eq!(sent["delay"], 100);

        control.stop();
        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.log.len(), 1);
        assert!(report.log[0].starts_with("-> [1] {"));
    }

    #[tokio::test(start_paused = true)]
    async fn no_sends_after_stop_returns() {
        let (control, mut peer, handle) = start(&[100, 100, 100, 100], None);

        sleep_ms(150).await;
        control.stop();
        let before_stop = peer.drain_texts();
        assert_eq!(before_stop.len(), 1);
        assert_eq!(control.pending_timers(), 0);

        sleep_ms(10_000).await;
        assert!(peer.drain_texts().is_empty());

        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.end, EndReason::Stopped);
        assert_eq!(report.messages_sent, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_ends_session_without_error() {
        let (_control, mut peer, handle) = start(&[400], Some(Duration::from_secs(1)));

        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.end, EndReason::TimedOut);
        assert_eq!(report.messages_sent, 1);
        assert_eq!(peer.drain_texts().len(), 1);

        // The session closes its connection on the way out.
        sleep_ms(5_000).await;
        assert!(peer.drain_texts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn remote_close_is_recorded() {
        let (_control, peer, handle) = start(&[100], None);
        sleep_ms(50).await;
        assert!(peer.push(StreamEvent::Message("ack".to_owned())));
        assert!(peer.close(1008, "token expired"));

        let report = handle.await.unwrap().unwrap();
        assert_eq!(
            report.end,
            EndReason::Closed {
                code: 1008,
                reason: "token expired".to_owned()
            }
        );
        assert_eq!(report.messages_sent, 0);
        assert_eq!(
            report.log,
            vec![
                "<- [1] ack".to_owned(),
                "x [1] closed: Policy Violation (1008) - token expired".to_owned(),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn transport_error_fails_the_session() {
        let (control, peer, handle) = start(&[100], None);
        assert!(peer.push(StreamEvent::Error("connection reset".to_owned())));

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, SimError::Transport { .. }));
        assert!(!control.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn send_failure_stops_without_error() {
        let (control, mut peer, handle) = start(&[100, 100], None);
        peer.refuse_sends();

        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.end, EndReason::SendFailed);
        assert_eq!(report.messages_sent, 0);
        assert!(report.log.iter().any(|l| l.starts_with("! [1] error:")));
        assert!(!control.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_write_after_queueing_stops_without_error() {
        let (control, mut peer, handle) = start(&[100, 100], None);
        sleep_ms(150).await;
        assert_eq!(peer.drain_texts().len(), 1);
        assert!(peer.push(StreamEvent::SendFailed("broken pipe".to_owned())));

        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.end, EndReason::SendFailed);
        assert!(report.log.contains(&"! [1] error: broken pipe".to_owned()));
        assert!(!control.is_running());

        sleep_ms(5_000).await;
        assert!(peer.drain_texts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn connect_and_run_over_loopback() {
        let target = ConnectTarget {
            unit: "1".to_owned(),
            env: "dev".to_owned(),
            url: "ws://collector.test/ws".to_owned(),
            token: "secret".to_owned(),
        };

        let refusing = LoopbackConnector::refusing(["1"]);
        let unit = StreamUnit::new(plan(&[100]), "dev", None, Duration::from_secs(1));
        let err = unit.connect_and_run(&refusing, &target).await.unwrap_err();
        assert!(matches!(err, SimError::Connect(ref msg) if msg.contains("refused")));

        let connector = Arc::new(LoopbackConnector::new());
        let unit = StreamUnit::new(plan(&[100]), "dev", None, Duration::from_secs(1));
        let control = unit.control();
        let task_connector = Arc::clone(&connector);
        let handle = tokio::spawn(async move {
            unit.connect_and_run(task_connector.as_ref(), &target).await
        });

        sleep_ms(150).await;
        let mut peers = connector.take_peers();
        assert_eq!(peers[0].0.token, "secret");
        assert_eq!(peers[0].1.drain_texts().len(), 1);

        control.stop();
        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.end, EndReason::Stopped);
    }

    #[test]
    fn connect_target_requires_token() {
        let config = SimulatorConfig::from_yaml_str(
            r#"
environments:
  dev:
    stream_url: wss://dev.example.com/ws
    operator_tokens:
      "01": secret
"#,
        )
        .unwrap();

        let target = connect_target(&config, "dev", &plan(&[100])).unwrap();
        assert_eq!(target.token, "secret");
        assert_eq!(target.url, "wss://dev.example.com/ws");

        let mut other = plan(&[100]);
        other.token_key = "2".to_owned();
        let err = connect_target(&config, "dev", &other).unwrap_err();
        assert!(err.is_config());

        let err = connect_target(&config, "stage", &plan(&[100])).unwrap_err();
        assert!(matches!(err, SimError::UnknownEnvironment(_)));
    }
}
