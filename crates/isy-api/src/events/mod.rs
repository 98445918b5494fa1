//! Event stream shared machinery.
//!
//! Two wire variants deliver the controller's live update stream: a
//! duplex WebSocket on current firmware and a legacy half-duplex TCP
//! socket on ISY-994 class hardware. Both share the lifecycle state
//! machine, the heartbeat liveness window, and the reconnect backoff
//! schedule defined here.

pub mod tcp;
pub mod websocket;

use std::sync::Mutex;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::broadcast;

use crate::error::Error;

pub use tcp::TcpEventStream;
pub use websocket::WebSocketEventStream;

/// Expected heartbeat interval advertised by the controller.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Grace period beyond the heartbeat interval before the connection is
/// declared lost.
pub const HEARTBEAT_GRACE: Duration = Duration::from_secs(5);

/// Reconnect backoff schedule, in seconds. Clamped at the final value
/// for further attempts; reset after any successful return to
/// [`StreamState::Connected`].
pub const RECONNECT_BACKOFF: [f64; 5] = [0.01, 1.0, 10.0, 30.0, 60.0];

/// Control code carried by heartbeat messages.
pub const CONTROL_HEARTBEAT: &str = "_0";

/// Buffered capacity of the status broadcast channel.
const STATUS_CHANNEL_CAPACITY: usize = 64;

/// Lifecycle state of the event stream session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// No session has been started yet.
    NotStarted,
    /// Handshake / subscription request in flight.
    Initializing,
    /// Handshake succeeded; no liveness signal observed yet.
    Loaded,
    /// A heartbeat arrived within the liveness window; events flow.
    Connected,
    /// Liveness window exceeded or the transport reported closure.
    LostConnection,
    /// Waiting out the backoff before the next connection attempt.
    Reconnecting,
    /// User-initiated stop. Terminal until an explicit restart.
    Disconnected,
    /// Delivery suspended without tearing down the socket (duplex only).
    StopUpdates,
}

/// A state transition notification: prior state and new state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamTransition {
    pub prior: StreamState,
    pub new: StreamState,
}

/// Publishes state transitions to subscribers.
///
/// Every distinct transition is broadcast exactly once; setting the
/// current state again is a no-op.
#[derive(Debug)]
pub(crate) struct StatusPublisher {
    state: Mutex<StreamState>,
    tx: broadcast::Sender<StreamTransition>,
}

impl StatusPublisher {
    pub(crate) fn new() -> Self {
        let (tx, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(StreamState::NotStarted),
            tx,
        }
    }

    /// Current state.
    pub(crate) fn get(&self) -> StreamState {
        *self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Move to `new`, notifying subscribers of `(prior, new)` if the
    /// state actually changed.
    pub(crate) fn set(&self, new: StreamState) {
        let prior = {
            let mut guard = self
                .state
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let prior = *guard;
            if prior == new {
                return;
            }
            *guard = new;
            prior
        };
        tracing::debug!(?prior, ?new, "stream state transition");
        let _ = self.tx.send(StreamTransition { prior, new });
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<StreamTransition> {
        self.tx.subscribe()
    }
}

/// Reconnect backoff iterator over [`RECONNECT_BACKOFF`].
///
/// `next_delay` walks the schedule and clamps at the final entry;
/// `reset` rewinds to the start after a successful connection.
#[derive(Debug)]
pub struct ReconnectBackoff {
    attempt: usize,
}

impl ReconnectBackoff {
    pub fn new() -> Self {
        Self { attempt: 0 }
    }

    pub fn next_delay(&mut self) -> Duration {
        let index = self.attempt.min(RECONNECT_BACKOFF.len() - 1);
        self.attempt = self.attempt.saturating_add(1);
        let secs = RECONNECT_BACKOFF
            .get(index)
            .copied()
            .unwrap_or(RECONNECT_BACKOFF[RECONNECT_BACKOFF.len() - 1]);
        Duration::from_secs_f64(secs)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self::new()
    }
}

// ── Wire messages ────────────────────────────────────────────────────

/// One parsed event-stream message.
///
/// Self-describing on the duplex socket; the legacy socket delivers the
/// same documents after client-side framing.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct EventMessage {
    /// Wire sequence number, when the controller provides one.
    #[serde(default)]
    pub seqnum: Option<u64>,
    /// Stream (subscription) id.
    #[serde(default)]
    pub sid: Option<String>,
    /// Control code: `"_0"` heartbeat, `"ST"` and friends for node
    /// properties, `"_1"`/`"_3"`/`"_5"` for trigger, node-change, and
    /// system events.
    #[serde(default)]
    pub control: String,
    /// Action payload; shape varies by control code.
    #[serde(default)]
    pub action: Option<serde_json::Value>,
    /// Node address the message refers to, if any.
    #[serde(default)]
    pub node: Option<String>,
    /// Additional event detail.
    #[serde(default, alias = "eventInfo")]
    pub event_info: Option<serde_json::Value>,
    /// Pre-formatted display value, if the controller sent one.
    #[serde(default, alias = "fmtAct")]
    pub fmt_act: Option<String>,
}

impl EventMessage {
    /// Whether this message is a liveness heartbeat.
    pub fn is_heartbeat(&self) -> bool {
        self.control == CONTROL_HEARTBEAT
    }

    /// Heartbeat interval advertised in a heartbeat's action field.
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        let action = self.action.as_ref()?;
        let secs = action
            .as_u64()
            .or_else(|| action.as_str().and_then(|s| s.parse().ok()))?;
        Some(Duration::from_secs(secs))
    }
}

/// Parse one framed stream document.
///
/// Malformed frames yield [`Error::Protocol`]; the readers log and drop
/// these without tearing the stream down.
pub fn parse_event(text: &str) -> Result<EventMessage, Error> {
    serde_json::from_str(text).map_err(|e| Error::Protocol {
        message: format!("malformed stream message: {e}"),
    })
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn backoff_follows_schedule_and_clamps() {
        let mut backoff = ReconnectBackoff::new();
        let observed: Vec<f64> = (0..7).map(|_| backoff.next_delay().as_secs_f64()).collect();
        assert_eq!(observed, vec![0.01, 1.0, 10.0, 30.0, 60.0, 60.0, 60.0]);
    }

    #[test]
    fn backoff_resets_to_first_value() {
        let mut backoff = ReconnectBackoff::new();
        for _ in 0..4 {
            backoff.next_delay();
        }
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs_f64(0.01));
    }

    #[test]
    fn status_publisher_emits_prior_and_new() {
        let publisher = StatusPublisher::new();
        let mut rx = publisher.subscribe();

        publisher.set(StreamState::Initializing);
        publisher.set(StreamState::Loaded);
        // Setting the same state again must not notify.
        publisher.set(StreamState::Loaded);
        publisher.set(StreamState::Connected);

        assert_eq!(
            rx.try_recv().expect("first"),
            StreamTransition {
                prior: StreamState::NotStarted,
                new: StreamState::Initializing,
            }
        );
        assert_eq!(
            rx.try_recv().expect("second"),
            StreamTransition {
                prior: StreamState::Initializing,
                new: StreamState::Loaded,
            }
        );
        assert_eq!(
            rx.try_recv().expect("third"),
            StreamTransition {
                prior: StreamState::Loaded,
                new: StreamState::Connected,
            }
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn parse_node_property_event() {
        let json = r#"{
            "seqnum": 42,
            "sid": "uuid:74",
            "control": "ST",
            "action": { "value": 255, "uom": "100", "prec": "0" },
            "node": "2E 5C A1 1",
            "fmtAct": "On"
        }"#;
        let msg = parse_event(json).expect("parse");
        assert_eq!(msg.seqnum, Some(42));
        assert_eq!(msg.control, "ST");
        assert_eq!(msg.node.as_deref(), Some("2E 5C A1 1"));
        assert!(!msg.is_heartbeat());
    }

    #[test]
    fn parse_heartbeat_event() {
        let json = r#"{ "seqnum": 1, "control": "_0", "action": "30" }"#;
        let msg = parse_event(json).expect("parse");
        assert!(msg.is_heartbeat());
        assert_eq!(msg.heartbeat_interval(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn malformed_frame_is_protocol_error() {
        let err = parse_event("<Event><control>_0</control></Event>").expect_err("err");
        assert!(matches!(err, Error::Protocol { .. }));
    }
}
