//! Legacy half-duplex TCP event stream.
//!
//! ISY-994 class firmware exposes no WebSocket endpoint. Instead the
//! client opens a raw TCP connection, posts a subscription request over
//! it, and the controller keeps writing event documents down the same
//! socket. Framing is client-side: HTTP-style chunk headers are skipped
//! and each document is recovered from the byte stream by
//! [`frame_line`].
//!
//! The lifecycle state machine, heartbeat liveness window, and backoff
//! schedule are shared with the duplex variant. There is no delivery
//! pause on this transport; the controller controls the flow.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use secrecy::SecretString;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use super::websocket::basic_authorization;
use super::{
    EventMessage, HEARTBEAT_GRACE, HEARTBEAT_INTERVAL, ReconnectBackoff, StatusPublisher,
    StreamState, StreamTransition, parse_event,
};
use crate::error::Error;

/// Subscription lifetime requested from the controller, in seconds.
/// The socket is reused, so the duration only bounds an orphaned
/// subscription on the controller side.
const SUBSCRIPTION_DURATION_SECS: u32 = 20;

/// Handle to the legacy event stream session.
#[derive(Clone)]
pub struct TcpEventStream {
    inner: Arc<Inner>,
}

struct Inner {
    url: Url,
    authorization: String,
    events_tx: mpsc::Sender<EventMessage>,
    status: StatusPublisher,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    session_cancel: Mutex<CancellationToken>,
    heartbeat_interval: Mutex<Duration>,
    sid: Mutex<Option<String>>,
}

impl TcpEventStream {
    /// Create a stream session against the controller's base URL.
    /// Nothing connects until `start`.
    pub fn new(
        base_url: Url,
        username: &str,
        password: &SecretString,
        events_tx: mpsc::Sender<EventMessage>,
    ) -> Self {
        let authorization = basic_authorization(username, password);
        Self {
            inner: Arc::new(Inner {
                url: base_url,
                authorization,
                events_tx,
                status: StatusPublisher::new(),
                task: Mutex::new(None),
                session_cancel: Mutex::new(CancellationToken::new()),
                heartbeat_interval: Mutex::new(HEARTBEAT_INTERVAL),
                sid: Mutex::new(None),
            }),
        }
    }

    /// Start the connection loop. A no-op while one is already running;
    /// after [`stop`](Self::stop) a new session is spawned even if the
    /// old loop has not yet observed the cancellation.
    pub fn start(&self) {
        let mut task = lock(&self.inner.task);
        let live = task.as_ref().is_some_and(|handle| !handle.is_finished());
        if live && !lock(&self.inner.session_cancel).is_cancelled() {
            debug!("legacy event stream already running, ignoring duplicate start");
            return;
        }
        let cancel = CancellationToken::new();
        *lock(&self.inner.session_cancel) = cancel.clone();

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

    /// Stop the session. Terminal until an explicit `start`.
    pub fn stop(&self) {
        lock(&self.inner.session_cancel).cancel();
    }

    /// Current lifecycle state.
    pub fn state(&self) -> StreamState {
        self.inner.status.get()
    }

    /// Subscribe to state transitions.
    pub fn subscribe_status(&self) -> broadcast::Receiver<StreamTransition> {
        self.inner.status.subscribe()
    }

    /// The subscription id assigned by the controller, once observed.
    pub fn stream_id(&self) -> Option<String> {
        lock(&self.inner.sid).clone()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

// ── Subscription request ─────────────────────────────────────────────

/// Render the subscribe (or resubscribe) request written down the raw
/// socket. With a stored `sid` the controller resumes the existing
/// subscription instead of opening a new one.
fn subscribe_request(host: &str, authorization: &str, sid: Option<&str>) -> String {
    let body = match sid {
        Some(sid) => format!(
            "{{\"subscribe\":{{\"sid\":\"{sid}\",\"reportURL\":\"REUSE_SOCKET\",\
             \"duration\":{SUBSCRIPTION_DURATION_SECS}}}}}"
        ),
        None => format!(
            "{{\"subscribe\":{{\"reportURL\":\"REUSE_SOCKET\",\
             \"duration\":{SUBSCRIPTION_DURATION_SECS}}}}}"
        ),
    };
    format!(
        "POST /services HTTP/1.1\r\n\
         Host: {host}\r\n\
         Authorization: {authorization}\r\n\
         Content-Type: application/json\r\n\
         Accept: application/json\r\n\
         Content-Length: {}\r\n\
         Connection: keep-alive\r\n\
         \r\n\
         {body}",
        body.len()
    )
}

/// Recover an event document from one raw socket line, or `None` when
/// the line is interstitial transport chatter (HTTP status lines, chunk
/// headers, blank keep-alive lines).
///
/// The controller occasionally glues a chunk length onto the front of a
/// document, so anything before the first `{` is stripped.
pub(crate) fn frame_line(line: &str) -> Option<&str> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    let start = trimmed.find('{')?;
    Some(&trimmed[start..])
}

// ── Connection loop ──────────────────────────────────────────────────

async fn run(inner: &Arc<Inner>, cancel: CancellationToken) {
    let mut backoff = ReconnectBackoff::new();

    loop {
        inner.status.set(StreamState::Initializing);
        match connect_and_read(inner, &cancel, &mut backoff).await {
            Ok(()) => {
                inner.status.set(StreamState::Disconnected);
                return;
            }
            Err(e) => {
                warn!(error = %e, "legacy event stream connection lost");
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

async fn connect_and_read(
    inner: &Arc<Inner>,
    cancel: &CancellationToken,
    backoff: &mut ReconnectBackoff,
) -> Result<(), Error> {
    let host = inner
        .url
        .host_str()
        .ok_or_else(|| Error::StreamConnect("base url has no host".into()))?
        .to_owned();
    let port = inner.url.port_or_known_default().unwrap_or(80);

    debug!(%host, port, "connecting legacy event socket");
    let stream = TcpStream::connect((host.as_str(), port))
        .await
        .map_err(|e| Error::StreamConnect(e.to_string()))?;
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    // Resubscribe with the stored sid when we have one so in-flight
    // events queued under the old subscription are not lost.
    let sid = lock(&inner.sid).clone();
    let request = subscribe_request(&host, &inner.authorization, sid.as_deref());
    write_half
        .write_all(request.as_bytes())
        .await
        .map_err(|e| Error::StreamConnect(e.to_string()))?;

    info!(resumed = sid.is_some(), "legacy event subscription requested");
    inner.status.set(StreamState::Loaded);

    let mut line = String::new();
    let mut deadline = Instant::now() + liveness_window(inner);

    loop {
        line.clear();
        tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(()),
            () = tokio::time::sleep_until(deadline) => {
                return Err(Error::StreamClosed {
                    reason: "heartbeat liveness window exceeded".into(),
                });
            }
            read = reader.read_line(&mut line) => {
                match read {
                    Ok(0) => {
                        return Err(Error::StreamClosed {
                            reason: "controller closed the socket".into(),
                        });
                    }
                    Ok(_) => {
                        let Some(document) = frame_line(&line) else {
                            continue;
                        };
                        if handle_document(inner, backoff, document).await.is_break() {
                            return Ok(());
                        }
                        deadline = Instant::now() + liveness_window(inner);
                    }
                    Err(e) => {
                        return Err(Error::StreamClosed { reason: e.to_string() });
                    }
                }
            }
        }
    }
}

async fn handle_document(
    inner: &Arc<Inner>,
    backoff: &mut ReconnectBackoff,
    document: &str,
) -> std::ops::ControlFlow<()> {
    let message = match parse_event(document) {
        Ok(message) => message,
        Err(e) => {
            warn!(error = %e, "dropping malformed stream document");
            return std::ops::ControlFlow::Continue(());
        }
    };

    if let Some(sid) = &message.sid {
        let mut guard = lock(&inner.sid);
        if guard.as_deref() != Some(sid.as_str()) {
            debug!(sid, "legacy subscription id updated");
            *guard = Some(sid.clone());
        }
    }

    if message.is_heartbeat() {
        if let Some(interval) = message.heartbeat_interval() {
            *lock(&inner.heartbeat_interval) = interval;
        }
        if inner.status.get() == StreamState::Loaded {
            inner.status.set(StreamState::Connected);
            backoff.reset();
        }
        return std::ops::ControlFlow::Continue(());
    }

    if inner.events_tx.send(message).await.is_err() {
        debug!("event consumer dropped, closing legacy stream");
        return std::ops::ControlFlow::Break(());
    }
    std::ops::ControlFlow::Continue(())
}

fn liveness_window(inner: &Arc<Inner>) -> Duration {
    *lock(&inner.heartbeat_interval) + HEARTBEAT_GRACE
}

// ── Tests ────────────────────────────────────────────────────────────
