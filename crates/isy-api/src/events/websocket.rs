//! Duplex WebSocket event stream.
//!
//! Connects to `/rest/subscribe` with the controller's subprotocol and
//! streams self-describing JSON event messages. Owns the reconnection
//! loop: backoff per [`RECONNECT_BACKOFF`](super::RECONNECT_BACKOFF),
//! liveness tracking from heartbeat messages, and cooperative shutdown
//! through a `CancellationToken`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures_util::StreamExt;
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::{self, ClientRequestBuilder};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use super::{
    EventMessage, HEARTBEAT_GRACE, HEARTBEAT_INTERVAL, ReconnectBackoff, StatusPublisher,
    StreamState, StreamTransition, parse_event,
};
use crate::error::Error;

/// Required origin header for the controller's WebSocket listener.
const WS_ORIGIN: &str = "com.universal-devices.websockets.isy";

/// Subprotocol the controller expects on the upgrade request.
const WS_SUBPROTOCOL: &str = "ISYSUB";

/// Handle to the duplex event stream session.
///
/// Cheaply cloneable. At most one reconnection loop runs per session;
/// duplicate [`start`](Self::start) calls are no-ops.
#[derive(Clone)]
pub struct WebSocketEventStream {
    inner: Arc<Inner>,
}

struct Inner {
    url: Url,
    authorization: String,
    events_tx: mpsc::Sender<EventMessage>,
    status: StatusPublisher,
    paused: AtomicBool,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    session_cancel: Mutex<CancellationToken>,
    heartbeat_interval: Mutex<Duration>,
    sid: Mutex<Option<String>>,
}

impl WebSocketEventStream {
    /// Create a stream session. Nothing connects until `start`.
    pub fn new(
        url: Url,
        username: &str,
        password: &SecretString,
        events_tx: mpsc::Sender<EventMessage>,
    ) -> Self {
        let authorization = basic_authorization(username, password);
        Self {
            inner: Arc::new(Inner {
                url,
                authorization,
                events_tx,
                status: StatusPublisher::new(),
                paused: AtomicBool::new(false),
                task: Mutex::new(None),
                session_cancel: Mutex::new(CancellationToken::new()),
                heartbeat_interval: Mutex::new(HEARTBEAT_INTERVAL),
                sid: Mutex::new(None),
            }),
        }
    }

    /// Start the connection loop. A no-op while one is already running;
    /// after [`stop`](Self::stop) (or a consumer-driven wind-down) a new
    /// session is spawned even if the old loop has not yet exited.
    pub fn start(&self) {
        let mut task = lock(&self.inner.task);
        let live = task.as_ref().is_some_and(|handle| !handle.is_finished());
        if live && !lock(&self.inner.session_cancel).is_cancelled() {
            debug!("event stream already running, ignoring duplicate start");
            return;
        }
        let cancel = CancellationToken::new();
        *lock(&self.inner.session_cancel) = cancel.clone();
        self.inner.paused.store(false, Ordering::SeqCst);

        let prior = task.take();
        let inner = Arc::clone(&self.inner);
        *task = Some(tokio::spawn(async move {
            // Let a still-unwinding predecessor finish first so its
            // terminal transition cannot clobber this session's state.
            if let Some(prior) = prior {
                let _ = prior.await;
            }
            run(&inner, cancel).await;
        }));
    }

    /// Stop the session: cancels the loop, unwinding any pending
    /// backoff wait. Terminal until an explicit `start`.
    pub fn stop(&self) {
        lock(&self.inner.session_cancel).cancel();
    }

    /// Suspend event delivery without tearing down the socket.
    /// Heartbeats are still consumed so liveness tracking survives.
    pub fn pause(&self) {
        if self.inner.status.get() == StreamState::Connected {
            self.inner.paused.store(true, Ordering::SeqCst);
            self.inner.status.set(StreamState::StopUpdates);
        }
    }

    /// Resume delivery after [`pause`](Self::pause).
    ///
    /// The gate is cleared unconditionally: a reconnect may already
    /// have moved the state past `StopUpdates` while the flag was set.
    pub fn resume(&self) {
        self.inner.paused.store(false, Ordering::SeqCst);
        if self.inner.status.get() == StreamState::StopUpdates {
            self.inner.status.set(StreamState::Connected);
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> StreamState {
        self.inner.status.get()
    }

    /// Subscribe to state transitions.
    pub fn subscribe_status(&self) -> broadcast::Receiver<StreamTransition> {
        self.inner.status.subscribe()
    }

    /// The stream id assigned by the controller, once observed.
    pub fn stream_id(&self) -> Option<String> {
        lock(&self.inner.sid).clone()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Build the `Authorization: Basic ...` header value.
pub(crate) fn basic_authorization(username: &str, password: &SecretString) -> String {
    let raw = format!("{username}:{}", password.expose_secret());
    format!("Basic {}", BASE64.encode(raw))
}

// ── Connection loop ──────────────────────────────────────────────────

/// Main loop: connect → read until failure → backoff → reconnect.
async fn run(inner: &Arc<Inner>, cancel: CancellationToken) {
    let mut backoff = ReconnectBackoff::new();

    loop {
        // A new socket means a fresh subscription; any pause ended with
        // the old one.
        inner.paused.store(false, Ordering::SeqCst);
        inner.status.set(StreamState::Initializing);
        match connect_and_read(inner, &cancel, &mut backoff).await {
            Ok(()) => {
                // Cancelled by the user, or the consumer went away.
                inner.status.set(StreamState::Disconnected);
                return;
            }
            Err(e) => {
                warn!(error = %e, "event stream connection lost");
                inner.status.set(StreamState::LostConnection);
            }
        }

        inner.status.set(StreamState::Reconnecting);
        let delay = backoff.next_delay();
        info!(delay_ms = delay.as_millis() as u64, "waiting before stream reconnect");
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                inner.status.set(StreamState::Disconnected);
                return;
            }
            () = tokio::time::sleep(delay) => {}
        }
    }
}

/// One connection lifecycle: upgrade, then read frames until the
/// liveness window lapses, the transport fails, or we are cancelled.
async fn connect_and_read(
    inner: &Arc<Inner>,
    cancel: &CancellationToken,
    backoff: &mut ReconnectBackoff,
) -> Result<(), Error> {
    debug!(url = %inner.url, "connecting event stream websocket");

    let uri: tungstenite::http::Uri = inner
        .url
        .as_str()
        .parse()
        .map_err(|e: tungstenite::http::uri::InvalidUri| Error::StreamConnect(e.to_string()))?;

    let request = ClientRequestBuilder::new(uri)
        .with_header("Authorization", &inner.authorization)
        .with_header("Origin", WS_ORIGIN)
        .with_sub_protocol(WS_SUBPROTOCOL);

    let (ws_stream, _response) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|e| Error::StreamConnect(e.to_string()))?;

    info!("event stream websocket connected");
    inner.status.set(StreamState::Loaded);

    let (_write, mut read) = ws_stream.split();
    let mut deadline = Instant::now() + liveness_window(inner);

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(()),
            () = tokio::time::sleep_until(deadline) => {
                return Err(Error::StreamClosed {
                    reason: "heartbeat liveness window exceeded".into(),
                });
            }
            frame = read.next() => {
                match frame {
                    Some(Ok(tungstenite::Message::Text(text))) => {
                        if handle_frame(inner, backoff, text.as_str()).await.is_break() {
                            return Ok(());
                        }
                        deadline = Instant::now() + liveness_window(inner);
                    }
                    Some(Ok(tungstenite::Message::Ping(_))) => {
                        // tungstenite answers pongs automatically
                    }
                    Some(Ok(tungstenite::Message::Close(frame))) => {
                        let reason = frame
                            .map(|f| format!("code {}: {}", f.code, f.reason))
                            .unwrap_or_else(|| "no close payload".into());
                        return Err(Error::StreamClosed { reason });
                    }
                    Some(Err(e)) => {
                        return Err(Error::StreamClosed { reason: e.to_string() });
                    }
                    None => {
                        return Err(Error::StreamClosed {
                            reason: "stream ended without close frame".into(),
                        });
                    }
                    _ => {
                        // Binary, Pong, Frame -- ignore
                    }
                }
            }
        }
    }
}

/// Process one text frame. Returns `Break` when the consumer is gone
/// and the loop should wind down cleanly.
async fn handle_frame(
    inner: &Arc<Inner>,
    backoff: &mut ReconnectBackoff,
    text: &str,
) -> std::ops::ControlFlow<()> {
    let message = match parse_event(text) {
        Ok(message) => message,
        Err(e) => {
            warn!(error = %e, "dropping malformed stream frame");
            return std::ops::ControlFlow::Continue(());
        }
    };

    if let Some(sid) = &message.sid {
        let mut guard = lock(&inner.sid);
        if guard.as_deref() != Some(sid.as_str()) {
            debug!(sid, "event stream id updated");
            *guard = Some(sid.clone());
        }
    }

    if message.is_heartbeat() {
        if let Some(interval) = message.heartbeat_interval() {
            *lock(&inner.heartbeat_interval) = interval;
        }
        // First heartbeat confirms liveness; later ones refresh it.
        if inner.status.get() == StreamState::Loaded {
            inner.status.set(StreamState::Connected);
            // A fresh subscription ends any pause from the previous
            // socket; otherwise the gate would drop events while the
            // state claims Connected.
            inner.paused.store(false, Ordering::SeqCst);
            backoff.reset();
        }
        return std::ops::ControlFlow::Continue(());
    }

    if inner.paused.load(Ordering::SeqCst) {
        return std::ops::ControlFlow::Continue(());
    }

    if inner.events_tx.send(message).await.is_err() {
        debug!("event consumer dropped, closing stream");
        return std::ops::ControlFlow::Break(());
    }
    std::ops::ControlFlow::Continue(())
}

fn liveness_window(inner: &Arc<Inner>) -> Duration {
    *lock(&inner.heartbeat_interval) + HEARTBEAT_GRACE
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn stream() -> (WebSocketEventStream, mpsc::Receiver<EventMessage>) {
        let (tx, rx) = mpsc::channel(16);
        let url: Url = "ws://192.168.1.50/rest/subscribe".parse().expect("url");
        let ws = WebSocketEventStream::new(url, "admin", &SecretString::from("admin"), tx);
        (ws, rx)
    }

    #[test]
    fn basic_authorization_header() {
        let header = basic_authorization("admin", &SecretString::from("admin"));
        assert_eq!(header, "Basic YWRtaW46YWRtaW4=");
    }

    #[tokio::test]
    async fn heartbeat_promotes_loaded_to_connected() {
        let (ws, _rx) = stream();
        let mut status = ws.subscribe_status();
        ws.inner.status.set(StreamState::Initializing);
        ws.inner.status.set(StreamState::Loaded);
        let mut backoff = ReconnectBackoff::new();
        backoff.next_delay();
        backoff.next_delay();

        let hb = parse_event(r#"{ "control": "_0", "action": "30" }"#).expect("parse");
        assert!(hb.is_heartbeat());
        let flow = handle_frame(&ws.inner, &mut backoff, r#"{ "control": "_0", "action": "30" }"#)
            .await;
        assert!(flow.is_continue());
        assert_eq!(ws.state(), StreamState::Connected);
        // Backoff was reset by the successful connection.
        assert_eq!(backoff.next_delay(), Duration::from_secs_f64(0.01));

        // Drain: NotStarted→Initializing→Loaded→Connected
        let mut last = None;
        while let Ok(t) = status.try_recv() {
            last = Some(t);
        }
        assert_eq!(
            last,
            Some(StreamTransition {
                prior: StreamState::Loaded,
                new: StreamState::Connected,
            })
        );
    }

    #[tokio::test]
    async fn paused_stream_drops_events_but_tracks_sid() {
        let (ws, mut rx) = stream();
        ws.inner.status.set(StreamState::Connected);
        ws.pause();
        assert_eq!(ws.state(), StreamState::StopUpdates);

        let mut backoff = ReconnectBackoff::new();
        let frame = r#"{ "sid": "uuid:22", "control": "ST", "node": "1 2 3 4" }"#;
        let flow = handle_frame(&ws.inner, &mut backoff, frame).await;
        assert!(flow.is_continue());
        assert!(rx.try_recv().is_err());
        assert_eq!(ws.stream_id().as_deref(), Some("uuid:22"));

        ws.resume();
        assert_eq!(ws.state(), StreamState::Connected);
        let flow = handle_frame(&ws.inner, &mut backoff, frame).await;
        assert!(flow.is_continue());
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn pause_does_not_survive_a_reconnect() {
        let (ws, mut rx) = stream();
        ws.inner.status.set(StreamState::Connected);
        ws.pause();
        assert_eq!(ws.state(), StreamState::StopUpdates);

        // Connection drops while paused; the loop reconnects.
        ws.inner.status.set(StreamState::LostConnection);
        ws.inner.status.set(StreamState::Reconnecting);
        ws.inner.status.set(StreamState::Initializing);
        ws.inner.status.set(StreamState::Loaded);

        let mut backoff = ReconnectBackoff::new();
        let hb = r#"{ "control": "_0", "action": "30" }"#;
        let flow = handle_frame(&ws.inner, &mut backoff, hb).await;
        assert!(flow.is_continue());
        assert_eq!(ws.state(), StreamState::Connected);

        // The fresh subscription ends the pause: events flow again
        // without an explicit resume.
        let frame = r#"{ "control": "ST", "node": "1 2 3 4", "action": { "value": 1 } }"#;
        let flow = handle_frame(&ws.inner, &mut backoff, frame).await;
        assert!(flow.is_continue());
        assert!(rx.try_recv().is_ok());

        // A late resume stays harmless.
        ws.resume();
        assert_eq!(ws.state(), StreamState::Connected);
        let flow = handle_frame(&ws.inner, &mut backoff, frame).await;
        assert!(flow.is_continue());
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn malformed_frame_does_not_kill_stream() {
        let (ws, mut rx) = stream();
        let mut backoff = ReconnectBackoff::new();
        let flow = handle_frame(&ws.inner, &mut backoff, "not json").await;
        assert!(flow.is_continue());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn pause_is_duplex_connected_only() {
        let (ws, _rx) = stream();
        // Not connected yet: pause is a no-op.
        ws.pause();
        assert_eq!(ws.state(), StreamState::NotStarted);
    }
}
