// ── Controller orchestration ──
//
// `Isy` owns the full connection lifecycle: probe, concurrent bulk
// loads, event stream startup, routing, commands, and shutdown. It is a
// context object -- no process-wide singletons -- so multiple
// controllers can coexist in one process.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use isy_api::events::{StreamState, StreamTransition, TcpEventStream, WebSocketEventStream};
use isy_api::transport::{TlsMode, TransportConfig};
use isy_api::{ConfigurationSnapshot, IsyClient, PermitPool, PlatformClass};

use crate::command::{self, Command};
use crate::config::{InitializeOptions, IsyConfig, TlsVerification};
use crate::error::CoreError;
use crate::model::{
    NetworkResource, Node, Platform, Program, Variable, VariableKind, build_nodes, build_programs,
    build_variables,
};
use crate::store::{EntityCollection, Registry};

const EVENT_CHANNEL_SIZE: usize = 256;

/// Outcome of [`Isy::initialize`].
#[derive(Debug)]
pub struct InitReport {
    pub configuration: ConfigurationSnapshot,
    /// Platforms whose bulk load succeeded.
    pub loaded: Vec<Platform>,
    /// Platforms whose bulk load failed, with the reason. A failure
    /// here never invalidates sibling platforms.
    pub failed: Vec<(Platform, String)>,
    /// Whether the event stream is running.
    pub live_updates: bool,
}

enum StreamHandle {
    Duplex(WebSocketEventStream),
    Legacy(TcpEventStream),
}

impl StreamHandle {
    fn start(&self) {
        match self {
            Self::Duplex(ws) => ws.start(),
            Self::Legacy(tcp) => tcp.start(),
        }
    }

    fn stop(&self) {
        match self {
            Self::Duplex(ws) => ws.stop(),
            Self::Legacy(tcp) => tcp.stop(),
        }
    }

    fn state(&self) -> StreamState {
        match self {
            Self::Duplex(ws) => ws.state(),
            Self::Legacy(tcp) => tcp.state(),
        }
    }

    fn subscribe_status(&self) -> broadcast::Receiver<StreamTransition> {
        match self {
            Self::Duplex(ws) => ws.subscribe_status(),
            Self::Legacy(tcp) => tcp.subscribe_status(),
        }
    }
}

/// The main entry point for consumers.
///
/// Cheaply cloneable. Create with [`new`](Self::new), then
/// [`initialize`](Self::initialize) to load state and start live
/// updates.
#[derive(Clone)]
pub struct Isy {
    inner: Arc<IsyInner>,
}

struct IsyInner {
    config: IsyConfig,
    client: IsyClient,
    permits: Arc<PermitPool>,
    registry: Arc<Registry>,
    cancel: CancellationToken,
    stream: Mutex<Option<StreamHandle>>,
    router_task: Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl Isy {
    /// Create a controller context. Does not touch the network.
    pub fn new(config: IsyConfig) -> Result<Self, CoreError> {
        let transport = TransportConfig {
            tls: match &config.tls {
                TlsVerification::SystemDefaults => TlsMode::System,
                TlsVerification::CustomCa(path) => TlsMode::CustomCa(path.clone()),
                TlsVerification::DangerAcceptInvalid => TlsMode::DangerAcceptInvalid,
            },
            timeout: config.timeout,
        };
        let permits = Arc::new(PermitPool::new());
        let cancel = CancellationToken::new();
        let client = IsyClient::new(
            config.url.clone(),
            config.username.clone(),
            config.password.clone(),
            &transport,
            Arc::clone(&permits),
            cancel.clone(),
        )?;

        Ok(Self {
            inner: Arc::new(IsyInner {
                config,
                client,
                permits,
                registry: Arc::new(Registry::new()),
                cancel,
                stream: Mutex::new(None),
                router_task: Mutex::new(None),
                shut_down: AtomicBool::new(false),
            }),
        })
    }

    pub fn config(&self) -> &IsyConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.inner.registry
    }

    pub fn nodes(&self) -> &EntityCollection<Node> {
        self.inner.registry.nodes()
    }

    pub fn programs(&self) -> &EntityCollection<Program> {
        self.inner.registry.programs()
    }

    pub fn variables(&self) -> &EntityCollection<Variable> {
        self.inner.registry.variables()
    }

    pub fn network_resources(&self) -> &EntityCollection<NetworkResource> {
        self.inner.registry.network_resources()
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Probe the controller, bulk-load the requested platforms
    /// concurrently, then start the event stream.
    ///
    /// A single platform failure degrades that platform only; all
    /// requested platforms failing is an error. A stream start failure
    /// degrades to `live_updates: false` without invalidating loaded
    /// data. A 401 from the probe surfaces immediately with no retry.
    pub async fn initialize(&self, options: InitializeOptions) -> Result<InitReport, CoreError> {
        if self.inner.shut_down.load(Ordering::SeqCst) {
            return Err(CoreError::InvalidState {
                message: "initialize called after shutdown".into(),
            });
        }

        let configuration = isy_api::configuration::probe(&self.inner.client).await?;
        info!(
            firmware = %configuration.firmware,
            name = %configuration.name,
            "controller probe complete"
        );

        let mut requested = 0usize;
        let mut loaded = Vec::new();
        let mut failed = Vec::new();

        let load_variables = options.variables && configuration.variables;
        if options.variables && !configuration.variables {
            debug!("variables platform not present on controller, skipping");
        }
        let load_network = options.network_resources && configuration.networking_installed();
        if options.network_resources && !configuration.networking_installed() {
            debug!("networking module not installed, skipping network resources");
        }

        // The loads share the permit pool, so overall concurrency stays
        // within the negotiated ceilings.
        let (nodes_res, programs_res, variables_res, network_res) = tokio::join!(
            maybe(options.nodes, self.load_nodes()),
            maybe(options.programs, self.load_programs()),
            maybe(load_variables, self.load_variables()),
            maybe(load_network, self.load_network_resources()),
        );

        for (platform, result) in [
            (Platform::Nodes, nodes_res),
            (Platform::Programs, programs_res),
            (Platform::Variables, variables_res),
            (Platform::NetworkResources, network_res),
        ] {
            match result {
                None => {}
                Some(Ok(count)) => {
                    requested += 1;
                    info!(%platform, count, "platform loaded");
                    loaded.push(platform);
                }
                Some(Err(e)) => {
                    requested += 1;
                    warn!(%platform, error = %e, "platform load failed");
                    failed.push((platform, e.to_string()));
                }
            }
        }

        if requested > 0 && loaded.is_empty() {
            return Err(CoreError::PartialInitialization { failures: failed });
        }

        let live_updates = if options.live_updates {
            match self.start_stream(configuration.platform_class()) {
                Ok(()) => true,
                Err(e) => {
                    warn!(error = %e, "event stream startup failed, continuing without live updates");
                    false
                }
            }
        } else {
            false
        };

        Ok(InitReport {
            configuration,
            loaded,
            failed,
            live_updates,
        })
    }

    /// Stop the stream and cancel background work. Idempotent.
    pub async fn shutdown(&self) {
        self.inner.shut_down.store(true, Ordering::SeqCst);
        self.inner.cancel.cancel();

        if let Some(stream) = lock(&self.inner.stream).take() {
            stream.stop();
        }
        let task = lock(&self.inner.router_task).take();
        if let Some(task) = task {
            let _ = task.await;
        }
        debug!("controller shut down");
    }

    // ── Commands ─────────────────────────────────────────────────────

    /// Execute one command, bounded by the shared transport permits.
    pub async fn send_command(&self, command: Command) -> Result<(), CoreError> {
        command::run(&self.inner.client, &command).await
    }

    // ── Stream access ────────────────────────────────────────────────

    /// Current event stream state, if a stream was started.
    pub fn stream_state(&self) -> Option<StreamState> {
        lock(&self.inner.stream).as_ref().map(StreamHandle::state)
    }

    /// Subscribe to stream state transitions. Disconnects surface here,
    /// never as errors from data accessors.
    pub fn stream_status(&self) -> Option<broadcast::Receiver<StreamTransition>> {
        lock(&self.inner.stream)
            .as_ref()
            .map(StreamHandle::subscribe_status)
    }

    /// Suspend event delivery without dropping the socket (duplex
    /// streams only).
    pub fn pause_updates(&self) -> Result<(), CoreError> {
        match &*lock(&self.inner.stream) {
            Some(StreamHandle::Duplex(ws)) => {
                ws.pause();
                Ok(())
            }
            Some(StreamHandle::Legacy(_)) => Err(CoreError::InvalidState {
                message: "legacy event socket cannot pause delivery".into(),
            }),
            None => Err(CoreError::InvalidState {
                message: "no event stream running".into(),
            }),
        }
    }

    /// Resume event delivery after [`pause_updates`](Self::pause_updates).
    pub fn resume_updates(&self) -> Result<(), CoreError> {
        match &*lock(&self.inner.stream) {
            Some(StreamHandle::Duplex(ws)) => {
                ws.resume();
                Ok(())
            }
            Some(StreamHandle::Legacy(_)) | None => Err(CoreError::InvalidState {
                message: "no duplex event stream running".into(),
            }),
        }
    }

    // ── Bulk loads ───────────────────────────────────────────────────

    async fn load_nodes(&self) -> Result<usize, CoreError> {
        // Stamped at request begin: deltas arriving while this load is
        // in flight must outrank it.
        let stamp = self.inner.registry.next_stamp();
        let (nodes, status) = tokio::join!(
            self.inner.client.list_nodes::<crate::model::NodesDocument>(),
            self.inner.client.get_status::<crate::model::StatusDocument>(),
        );
        let nodes = nodes?;
        // A missing status document degrades to structure-only records.
        let status = match status {
            Ok(status) => Some(status),
            Err(e) => {
                warn!(error = %e, "status fetch failed, loading nodes without properties");
                None
            }
        };
        let records = build_nodes(nodes, status, stamp);
        let outcome = self.inner.registry.nodes().bulk_merge(records, stamp);
        Ok(outcome.created + outcome.updated)
    }

    async fn load_programs(&self) -> Result<usize, CoreError> {
        let stamp = self.inner.registry.next_stamp();
        let document = self
            .inner
            .client
            .list_programs::<crate::model::ProgramsDocument>()
            .await?;
        let records = build_programs(document, stamp);
        let outcome = self.inner.registry.programs().bulk_merge(records, stamp);
        Ok(outcome.created + outcome.updated)
    }

    async fn load_variables(&self) -> Result<usize, CoreError> {
        let stamp = self.inner.registry.next_stamp();
        let mut records = Vec::new();
        for kind in [VariableKind::Integer, VariableKind::State] {
            let code = kind.wire_code();
            let (definitions, values) = tokio::join!(
                self.inner
                    .client
                    .list_variable_definitions::<crate::model::VariableDefinitionsDocument>(code),
                self.inner
                    .client
                    .get_variable_values::<crate::model::VariableValuesDocument>(code),
            );
            records.extend(build_variables(kind, definitions?, values?, stamp));
        }
        let outcome = self.inner.registry.variables().bulk_merge(records, stamp);
        Ok(outcome.created + outcome.updated)
    }

    async fn load_network_resources(&self) -> Result<usize, CoreError> {
        let stamp = self.inner.registry.next_stamp();
        let document = self
            .inner
            .client
            .list_network_resources::<crate::model::NetworkResourcesDocument>()
            .await?;
        let Some(document) = document else {
            debug!("network resources endpoint absent");
            return Ok(0);
        };
        let records = document.into_records(stamp);
        let outcome = self
            .inner
            .registry
            .network_resources()
            .bulk_merge(records, stamp);
        Ok(outcome.created + outcome.updated)
    }

    // ── Stream startup ───────────────────────────────────────────────

    /// Build the stream variant for the platform class, spawn the
    /// router, and start the connection loop. A second call while a
    /// stream exists is a no-op.
    fn start_stream(&self, class: PlatformClass) -> Result<(), CoreError> {
        let mut guard = lock(&self.inner.stream);
        if let Some(existing) = guard.as_ref() {
            debug!(state = ?existing.state(), "event stream already present, not restarting");
            existing.start();
            return Ok(());
        }

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
        let (username, password) = self.inner.client.credentials();

        let handle = match class {
            PlatformClass::Current => {
                let url = self.inner.client.websocket_url()?;
                StreamHandle::Duplex(WebSocketEventStream::new(url, username, password, events_tx))
            }
            PlatformClass::Legacy => StreamHandle::Legacy(TcpEventStream::new(
                self.inner.client.base_url().clone(),
                username,
                password,
                events_tx,
            )),
        };

        let registry = Arc::clone(&self.inner.registry);
        let cancel = self.inner.cancel.clone();
        *lock(&self.inner.router_task) = Some(tokio::spawn(crate::router::route_events(
            registry, events_rx, cancel,
        )));

        handle.start();
        *guard = Some(handle);
        info!(?class, "event stream started");
        Ok(())
    }
}

/// Run `future` only when `enabled`, keeping the result slot so the
/// caller can tell "not requested" from "failed".
async fn maybe<F>(enabled: bool, future: F) -> Option<Result<usize, CoreError>>
where
    F: Future<Output = Result<usize, CoreError>>,
{
    if enabled { Some(future.await) } else { None }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;

    fn config() -> IsyConfig {
        IsyConfig::new(
            "http://192.168.1.50".parse().expect("url"),
            "admin",
            SecretString::from("admin"),
        )
    }

    #[tokio::test]
    async fn initialize_after_shutdown_is_rejected() {
        let isy = Isy::new(config()).expect("isy");
        isy.shutdown().await;
        let err = isy
            .initialize(InitializeOptions::default())
            .await
            .expect_err("must reject");
        assert!(matches!(err, CoreError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let isy = Isy::new(config()).expect("isy");
        isy.shutdown().await;
        isy.shutdown().await;
    }

    #[test]
    fn stream_accessors_before_start() {
        let isy = Isy::new(config()).expect("isy");
        assert!(isy.stream_state().is_none());
        assert!(isy.stream_status().is_none());
        assert!(isy.pause_updates().is_err());
    }
}
