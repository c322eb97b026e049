//! Transport seams between unit sessions and the tracking backend.
//!
//! Sessions never talk to a socket or an HTTP client directly. Stream
//! units receive a [`StreamConnection`] from a [`StreamConnector`] and
//! push text frames through its [`StreamLink`]; polled units hand each
//! payload to a [`TelemetryPoster`]. The production implementations are
//! [`WsConnector`] (tokio-tungstenite) and [`HttpPoster`] (reqwest).
//! Tests swap in [`StreamConnection::pair`] and a recording poster.
//!
//! A [`StreamConnection`] is a pair of channels: an outbound command
//! queue ([`Outbound`]) and an inbound [`StreamEvent`] stream. For real
//! sockets a pump task bridges the two onto the WebSocket.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::{debug, warn};

use fleetsim_types::VehicleTelemetry;

/// Close code reported when the peer closed without a status code.
pub const CLOSE_NO_STATUS: u16 = 1005;

/// Close code reported when the socket dropped without a close frame.
pub const CLOSE_ABNORMAL: u16 = 1006;

/// Errors raised by the concrete transports.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The connection is already closed; nothing can be sent.
    #[error("connection closed")]
    Closed,

    /// The connect request could not be built (bad URL or header value).
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The WebSocket handshake or a frame exchange failed.
    #[error("websocket error: {0}")]
    WebSocket(String),

    /// The HTTP request failed before a status was received.
    #[error("http error: {source}")]
    Http {
        /// The underlying reqwest error.
        #[from]
        source: reqwest::Error,
    },
}

// ---------------------------------------------------------------------------
// Stream connections
// ---------------------------------------------------------------------------

/// Commands queued on a stream connection's outbound side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Send one text frame.
    Text(String),
    /// Close the connection with a normal closure.
    Close,
}

/// Things that happen on a stream connection's inbound side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// The backend sent a text frame.
    Message(String),
    /// The connection closed, locally or remotely.
    Closed {
        /// WebSocket close code.
        code: u16,
        /// Close reason, possibly empty.
        reason: String,
    },
    /// Writing a queued message to the backend failed.
    SendFailed(String),
    /// Reading from the transport failed.
    Error(String),
}

/// Cloneable sending half of a stream connection.
///
/// The runner keeps one clone so it can close the connection on stop; the
/// session keeps another for its scheduled sends.
#[derive(Debug, Clone)]
pub struct StreamLink {
    outbound: mpsc::UnboundedSender<Outbound>,
}

impl StreamLink {
    /// Queue a text frame.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Closed`] if the connection has gone away.
    pub fn send_text(&self, text: String) -> Result<(), TransportError> {
        self.outbound
            .send(Outbound::Text(text))
            .map_err(|_closed| TransportError::Closed)
    }

    /// Ask the connection to close. A no-op if it is already closed.
    pub fn close(&self) {
        if self.outbound.send(Outbound::Close).is_err() {
            debug!("close requested on an already closed stream link");
        }
    }

    /// Whether the other end of the outbound queue is gone.
    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }

    /// Whether both links feed the same connection.
    pub fn same_link(&self, other: &Self) -> bool {
        self.outbound.same_channel(&other.outbound)
    }
}

/// An open stream connection: a [`StreamLink`] for sending plus the
/// receiver of inbound [`StreamEvent`]s.
#[derive(Debug)]
pub struct StreamConnection {
    /// Sending half.
    pub link: StreamLink,
    /// Inbound events, ending when the connection is gone.
    pub events: mpsc::UnboundedReceiver<StreamEvent>,
}

impl StreamConnection {
    /// Build an in-memory connection and the [`StreamPeer`] that plays the
    /// backend's side of it.
    pub fn pair() -> (Self, StreamPeer) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let connection = Self {
            link: StreamLink {
                outbound: outbound_tx,
            },
            events: events_rx,
        };
        let peer = StreamPeer {
            outbound: outbound_rx,
            events: events_tx,
        };
        (connection, peer)
    }
}

/// Backend side of an in-memory [`StreamConnection`].
#[derive(Debug)]
pub struct StreamPeer {
    outbound: mpsc::UnboundedReceiver<Outbound>,
    events: mpsc::UnboundedSender<StreamEvent>,
}

impl StreamPeer {
    /// Wait for the next outbound command.
    pub async fn recv(&mut self) -> Option<Outbound> {
        self.outbound.recv().await
    }

    /// Drain every outbound command queued so far.
    pub fn drain(&mut self) -> Vec<Outbound> {
        let mut drained = Vec::new();
        while let Ok(item) = self.outbound.try_recv() {
            drained.push(item);
        }
        drained
    }

    /// Drain queued commands and keep only the text frames.
    pub fn drain_texts(&mut self) -> Vec<String> {
        self.drain()
            .into_iter()
            .filter_map(|item| match item {
                Outbound::Text(text) => Some(text),
                Outbound::Close => None,
            })
            .collect()
    }

    /// Stop accepting outbound commands, so further sends fail as they
    /// would on a dead socket.
    pub fn refuse_sends(&mut self) {
        self.outbound.close();
    }

    /// Deliver an inbound event to the session. Returns `false` if the
    /// session side has been dropped.
    pub fn push(&self, event: StreamEvent) -> bool {
        self.events.send(event).is_ok()
    }

    /// Close from the backend side with the given code and reason.
    pub fn close(&self, code: u16, reason: &str) -> bool {
        self.push(StreamEvent::Closed {
            code,
            reason: reason.to_owned(),
        })
    }
}

/// Where and as whom a stream unit connects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    /// Unit identifier, for logging.
    pub unit: String,
    /// Environment name, for logging.
    pub env: String,
    /// WebSocket URL of the collector.
    pub url: String,
    /// Bearer token presented in the `Authorization` header.
    pub token: String,
}

/// Opens stream connections for operator units.
pub trait StreamConnector: Send + Sync {
    /// Connect and authenticate, returning an open connection.
    fn connect<'a>(
        &'a self,
        target: &'a ConnectTarget,
    ) -> BoxFuture<'a, Result<StreamConnection, TransportError>>;
}

/// [`StreamConnector`] over real WebSockets.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

impl StreamConnector for WsConnector {
    fn connect<'a>(
        &'a self,
        target: &'a ConnectTarget,
    ) -> BoxFuture<'a, Result<StreamConnection, TransportError>> {
        Box::pin(async move {
            let mut request = target
                .url
                .as_str()
                .into_client_request()
                .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;
            let bearer = HeaderValue::from_str(&format!("Bearer {}", target.token))
                .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;
            request.headers_mut().insert(AUTHORIZATION, bearer);

            let (socket, response) = tokio_tungstenite::connect_async(request)
                .await
                .map_err(|e| TransportError::WebSocket(e.to_string()))?;
            debug!(
                unit = %target.unit,
                env = %target.env,
                status = response.status().as_u16(),
                "websocket handshake complete"
            );

            Ok(spawn_pump(socket))
        })
    }
}

/// Bridge a WebSocket onto the channel pair of a [`StreamConnection`].
///
/// The pump ends after the first close or error, reporting it as a
/// [`StreamEvent`]. Dropping every [`StreamLink`] clone also closes the
/// socket.
fn spawn_pump<S>(socket: WebSocketStream<S>) -> StreamConnection
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (connection, mut peer) = StreamConnection::pair();
    let (mut sink, mut stream) = socket.split();

    tokio::spawn(async move {
        let closed = loop {
            tokio::select! {
                command = peer.recv() => {
                    if let Some(Outbound::Text(text)) = command {
                        if let Err(e) = sink.send(Message::Text(text.into())).await {
                            break StreamEvent::SendFailed(e.to_string());
                        }
                        continue;
                    }
                    let frame = CloseFrame {
                        code: CloseCode::Normal,
                        reason: "".into(),
                    };
                    if let Err(e) = sink.send(Message::Close(Some(frame))).await {
                        debug!(error = %e, "close frame not delivered");
                    }
                    break StreamEvent::Closed {
                        code: 1000,
                        reason: String::new(),
                    };
                }
                inbound = stream.next() => match inbound {
                    Some(Ok(Message::Text(text))) => {
                        if !peer.push(StreamEvent::Message(text.as_str().to_owned())) {
                            break StreamEvent::Closed {
                                code: 1000,
                                reason: String::new(),
                            };
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break frame.map_or_else(
                            || StreamEvent::Closed {
                                code: CLOSE_NO_STATUS,
                                reason: String::new(),
                            },
                            |f| StreamEvent::Closed {
                                code: u16::from(f.code),
                                reason: f.reason.as_str().to_owned(),
                            },
                        );
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break StreamEvent::Error(e.to_string()),
                    None => {
                        break StreamEvent::Closed {
                            code: CLOSE_ABNORMAL,
                            reason: String::new(),
                        };
                    }
                },
            }
        };
        if !peer.push(closed) {
            debug!("stream session gone before final event");
        }
    });

    connection
}

/// Human-readable description of a WebSocket close.
///
/// `close_reason_text(1000, "")` is `"Normal Closure (1000)"`; a non-empty
/// reason is appended after `" - "`.
pub fn close_reason_text(code: u16, reason: &str) -> String {
    let name = match code {
        1000 => "Normal Closure",
        1001 => "Going Away",
        1002 => "Protocol Error",
        1003 => "Unsupported Data",
        1005 => "No Status Received",
        1006 => "Abnormal Closure",
        1007 => "Invalid frame payload data",
        1008 => "Policy Violation",
        1009 => "Message too big",
        1010 => "Mandatory Extension",
        1011 => "Internal Server Error",
        1015 => "TLS Handshake",
        _ => "Unknown",
    };
    if reason.is_empty() {
        format!("{name} ({code})")
    } else {
        format!("{name} ({code}) - {reason}")
    }
}

// ---------------------------------------------------------------------------
// Vehicle posts
// ---------------------------------------------------------------------------

/// Sends single-shot vehicle telemetry posts.
pub trait TelemetryPoster: Send + Sync {
    /// Post one telemetry document and return the HTTP status code.
    ///
    /// Any status counts as delivered; only failures to get a response
    /// at all are errors.
    fn post<'a>(
        &'a self,
        endpoint: &'a str,
        payload: &'a VehicleTelemetry,
    ) -> BoxFuture<'a, Result<u16, TransportError>>;
}

/// [`TelemetryPoster`] backed by a shared [`reqwest::Client`].
#[derive(Debug, Clone)]
pub struct HttpPoster {
    client: reqwest::Client,
}

impl HttpPoster {
    /// Build a poster whose requests time out after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Http`] if the TLS backend cannot be
    /// initialized.
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

impl TelemetryPoster for HttpPoster {
    fn post<'a>(
        &'a self,
        endpoint: &'a str,
        payload: &'a VehicleTelemetry,
    ) -> BoxFuture<'a, Result<u16, TransportError>> {
        Box::pin(async move {
            let response = self.client.post(endpoint).json(payload).send().await?;
            let status = response.status();
            if !status.is_success() {
                warn!(%endpoint, status = status.as_u16(), "vehicle post rejected");
            }
            Ok(status.as_u16())
        })
    }
}

// ---------------------------------------------------------------------------
// In-memory transports
// ---------------------------------------------------------------------------

/// [`StreamConnector`] that hands out in-memory connections and keeps the
/// backend side of each one.
#[derive(Debug, Default)]
pub struct LoopbackConnector {
    refused: Vec<String>,
    peers: Mutex<Vec<(ConnectTarget, StreamPeer)>>,
}

impl LoopbackConnector {
    /// A connector that accepts every unit.
    pub fn new() -> Self {
        Self::default()
    }

    /// A connector that refuses the listed units.
    pub fn refusing<I, S>(units: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            refused: units.into_iter().map(Into::into).collect(),
            peers: Mutex::new(Vec::new()),
        }
    }

    /// Take the backend sides of every connection made so far.
    pub fn take_peers(&self) -> Vec<(ConnectTarget, StreamPeer)> {
        std::mem::take(&mut *self.peers.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Units connected so far, in connection order.
    pub fn connected_units(&self) -> Vec<String> {
        self.peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(target, _)| target.unit.clone())
            .collect()
    }
}

impl StreamConnector for LoopbackConnector {
    fn connect<'a>(
        &'a self,
        target: &'a ConnectTarget,
    ) -> BoxFuture<'a, Result<StreamConnection, TransportError>> {
        Box::pin(async move {
            if self.refused.contains(&target.unit) {
                return Err(TransportError::WebSocket(format!(
                    "connection refused for unit {}",
                    target.unit
                )));
            }
            let (connection, peer) = StreamConnection::pair();
            self.peers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push((target.clone(), peer));
            Ok(connection)
        })
    }
}

/// [`TelemetryPoster`] that records every post and answers with a fixed
/// status.
#[derive(Debug)]
pub struct RecordingPoster {
    status: u16,
    posts: Mutex<Vec<(String, VehicleTelemetry)>>,
}

impl Default for RecordingPoster {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingPoster {
    /// A poster that answers `200`.
    pub const fn new() -> Self {
        Self::with_status(200)
    }

    /// A poster that answers `status`.
    pub const fn with_status(status: u16) -> Self {
        Self {
            status,
            posts: Mutex::new(Vec::new()),
        }
    }

    /// Every `(endpoint, payload)` posted so far.
    pub fn posts(&self) -> Vec<(String, VehicleTelemetry)> {
        self.posts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl TelemetryPoster for RecordingPoster {
    fn post<'a>(
        &'a self,
        endpoint: &'a str,
        payload: &'a VehicleTelemetry,
    ) -> BoxFuture<'a, Result<u16, TransportError>> {
        Box::pin(async move {
            self.posts
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push((endpoint.to_owned(), payload.clone()));
            Ok(self.status)
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn close_reasons_use_standard_names() {
        assert_eq!(close_reason_text(1000, ""), "Normal Closure (1000)");
        assert_eq!(close_reason_text(1001, ""), "Going Away (1001)");
        assert_eq!(close_reason_text(1015, ""), "TLS Handshake (1015)");
        assert_eq!(
            close_reason_text(1008, "token expired"),
            "Policy Violation (1008) - token expired"
        );
        assert_eq!(close_reason_text(4000, ""), "Unknown (4000)");
    }

    #[tokio::test]
    async fn in_memory_pair_carries_both_directions() {
        let (mut connection, mut peer) = StreamConnection::pair();

        connection.link.send_text("hello".to_owned()).unwrap();
        connection.link.close();
        assert_eq!(
            peer.drain(),
            vec![Outbound::Text("hello".to_owned()), Outbound::Close]
        );

        assert!(peer.push(StreamEvent::Message("ack".to_owned())));
        assert!(peer.close(1001, "bye"));
        assert_eq!(
            connection.events.recv().await,
            Some(StreamEvent::Message("ack".to_owned()))
        );
        assert_eq!(
            connection.events.recv().await,
            Some(StreamEvent::Closed {
                code: 1001,
                reason: "bye".to_owned()
            })
        );
    }

    #[test]
    fn send_after_peer_dropped_fails() {
        let (connection, peer) = StreamConnection::pair();
        drop(peer);
        assert!(connection.link.is_closed());
        assert!(matches!(
            connection.link.send_text("late".to_owned()),
            Err(TransportError::Closed)
        ));
    }
}
