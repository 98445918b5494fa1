// REST client for the controller's /rest endpoint family.
//
// Wraps `reqwest::Client` with ISY-specific URL construction, basic-auth
// injection, permit-bounded concurrency, and a retry policy for the
// controller's habit of replying 503 while it is busy. Endpoint wrappers
// stay thin; document parsing belongs to the caller.

use std::sync::Arc;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::configuration::ConfigurationSnapshot;
use crate::error::Error;
use crate::permits::{ConnectionClass, PermitPool};
use crate::transport::TransportConfig;

/// Retries after the initial attempt. A persistently failing request
/// costs six sends total, sleeping once per [`RETRY_BACKOFF`] entry.
pub const MAX_RETRIES: u32 = 5;

/// Backoff between attempts, in seconds. The controller recovers from
/// most 503s within a fraction of a second, so the schedule starts hot.
pub const RETRY_BACKOFF: [f64; 5] = [0.01, 0.10, 0.25, 1.0, 2.0];

/// Variable kind path segment: integer variables.
pub const VAR_INTEGER: u8 = 1;
/// Variable kind path segment: state variables.
pub const VAR_STATE: u8 = 2;

/// Async client for the controller REST API.
///
/// One logical request holds one permit from the shared [`PermitPool`]
/// for its whole lifetime, retries included; the permit is released on
/// every exit path. All endpoints are HTTP GET — the controller models
/// commands as path segments, not request bodies.
pub struct IsyClient {
    http: reqwest::Client,
    base_url: Url,
    username: String,
    password: SecretString,
    permits: Arc<PermitPool>,
    cancel: CancellationToken,
    timeout: Duration,
}

impl IsyClient {
    /// Create a client from a `TransportConfig`.
    ///
    /// `base_url` is the controller root, e.g. `http://192.168.1.50` or
    /// `https://my-eisy.local:8443`.
    pub fn new(
        base_url: Url,
        username: String,
        password: SecretString,
        transport: &TransportConfig,
        permits: Arc<PermitPool>,
        cancel: CancellationToken,
    ) -> Result<Self, Error> {
        let http = transport.build_client()?;
        Ok(Self {
            http,
            base_url,
            username,
            password,
            permits,
            cancel,
            timeout: transport.timeout,
        })
    }

    /// The controller base URL.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// The shared permit pool bounding this client's concurrency.
    pub fn permits(&self) -> &Arc<PermitPool> {
        &self.permits
    }

    /// Basic-auth credentials, for the event-stream sockets which
    /// authenticate the same way the REST calls do.
    pub fn credentials(&self) -> (&str, &SecretString) {
        (&self.username, &self.password)
    }

    // ── URL builders ─────────────────────────────────────────────────

    /// Build a `/rest/...` URL from path segments plus optional query
    /// pairs. Segments are percent-encoded, so node addresses containing
    /// spaces are safe to pass through.
    pub fn rest_url(&self, segments: &[&str], query: &[(&str, &str)]) -> Result<Url, Error> {
        let mut url = self.base_url.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|()| Error::Tls("base URL cannot be a base".into()))?;
            path.push("rest");
            for segment in segments {
                path.push(segment);
            }
        }
        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in query {
                pairs.append_pair(key, value);
            }
        }
        Ok(url)
    }

    /// The event-stream WebSocket URL (`ws(s)://host/rest/subscribe`).
    pub fn websocket_url(&self) -> Result<Url, Error> {
        let mut url = self.rest_url(&["subscribe"], &[])?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|()| Error::Tls("cannot derive websocket scheme".into()))?;
        Ok(url)
    }

    // ── Request execution ────────────────────────────────────────────

    /// Execute a GET against `url` with retry, returning the body.
    ///
    /// Retries up to [`MAX_RETRIES`] times after the initial attempt
    /// with [`RETRY_BACKOFF`], but only for 503, timeouts, and transient
    /// network errors. A 401 fails immediately with no retry. A 404
    /// resolves to `Ok(None)` when `ok404` is set, otherwise it is an
    /// error. Backoff waits unwind promptly on cancellation.
    pub async fn execute(&self, url: Url, ok404: bool) -> Result<Option<String>, Error> {
        let class = ConnectionClass::from_url(&url);
        let _permit = self.permits.acquire(class).await;

        let mut retries: u32 = 0;
        loop {
            match self.send_once(&url, ok404).await {
                Ok(body) => return Ok(body),
                Err(err) => {
                    if !err.is_transient() || retries >= MAX_RETRIES {
                        return Err(err);
                    }
                    let index = usize::try_from(retries).unwrap_or(RETRY_BACKOFF.len() - 1);
                    let delay = RETRY_BACKOFF
                        .get(index)
                        .copied()
                        .unwrap_or(RETRY_BACKOFF[RETRY_BACKOFF.len() - 1]);
                    retries += 1;
                    debug!(url = %url, retry = retries, delay_s = delay, error = %err, "retrying request");
                    tokio::select! {
                        biased;
                        () = self.cancel.cancelled() => return Err(Error::Cancelled),
                        () = tokio::time::sleep(Duration::from_secs_f64(delay)) => {}
                    }
                }
            }
        }
    }

    /// One attempt: send the request and classify the outcome.
    async fn send_once(&self, url: &Url, ok404: bool) -> Result<Option<String>, Error> {
        let result = self
            .http
            .get(url.clone())
            .basic_auth(&self.username, Some(self.password.expose_secret()))
            .send()
            .await;

        let response = match result {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                return Err(Error::Timeout {
                    timeout_secs: self.timeout.as_secs(),
                });
            }
            Err(e) => return Err(Error::Transport(e)),
        };

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(Error::Authentication {
                message: "controller rejected credentials".into(),
            });
        }
        if status == reqwest::StatusCode::NOT_FOUND {
            if ok404 {
                debug!(url = %url, "resource absent (404 tolerated)");
                return Ok(None);
            }
            return Err(Error::HttpStatus {
                status: 404,
                path: url.path().to_owned(),
            });
        }
        if !status.is_success() {
            return Err(Error::HttpStatus {
                status: status.as_u16(),
                path: url.path().to_owned(),
            });
        }

        let body = response.text().await.map_err(Error::Transport)?;
        Ok(Some(body))
    }

    /// GET and deserialize a JSON document.
    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, Error> {
        let body = self
            .execute(url, false)
            .await?
            .unwrap_or_default();
        serde_json::from_str(&body).map_err(|e| Error::Deserialization {
            message: e.to_string(),
            body,
        })
    }

    /// GET and deserialize a JSON document, tolerating absence.
    async fn get_json_opt<T: DeserializeOwned>(&self, url: Url) -> Result<Option<T>, Error> {
        let Some(body) = self.execute(url, true).await? else {
            return Ok(None);
        };
        serde_json::from_str(&body)
            .map(Some)
            .map_err(|e| Error::Deserialization {
                message: e.to_string(),
                body,
            })
    }

    // ── Endpoints ────────────────────────────────────────────────────

    /// Fetch the controller configuration document.
    ///
    /// `GET /rest/config`
    pub async fn get_config(&self) -> Result<ConfigurationSnapshot, Error> {
        let url = self.rest_url(&["config"], &[])?;
        debug!("fetching controller configuration");
        self.get_json(url).await
    }

    /// List all node and group definitions.
    ///
    /// `GET /rest/nodes`
    pub async fn list_nodes<T: DeserializeOwned>(&self) -> Result<T, Error> {
        let url = self.rest_url(&["nodes"], &[])?;
        debug!("listing nodes");
        self.get_json(url).await
    }

    /// Fetch current property status for all nodes.
    ///
    /// `GET /rest/status`
    pub async fn get_status<T: DeserializeOwned>(&self) -> Result<T, Error> {
        let url = self.rest_url(&["status"], &[])?;
        debug!("fetching node status");
        self.get_json(url).await
    }

    /// List all programs, folders included.
    ///
    /// `GET /rest/programs?subfolders=true`
    pub async fn list_programs<T: DeserializeOwned>(&self) -> Result<T, Error> {
        let url = self.rest_url(&["programs"], &[("subfolders", "true")])?;
        debug!("listing programs");
        self.get_json(url).await
    }

    /// List variable definitions for one kind (1 = integer, 2 = state).
    ///
    /// `GET /rest/vars/definitions/{kind}`
    pub async fn list_variable_definitions<T: DeserializeOwned>(
        &self,
        kind: u8,
    ) -> Result<T, Error> {
        let kind_segment = kind.to_string();
        let url = self.rest_url(&["vars", "definitions", &kind_segment], &[])?;
        debug!(kind, "listing variable definitions");
        self.get_json(url).await
    }

    /// Fetch current values for one variable kind.
    ///
    /// `GET /rest/vars/get/{kind}`
    pub async fn get_variable_values<T: DeserializeOwned>(&self, kind: u8) -> Result<T, Error> {
        let kind_segment = kind.to_string();
        let url = self.rest_url(&["vars", "get", &kind_segment], &[])?;
        debug!(kind, "fetching variable values");
        self.get_json(url).await
    }

    /// List network resources. Absent (404) when the networking module
    /// is not installed.
    ///
    /// `GET /rest/networking/resources`
    pub async fn list_network_resources<T: DeserializeOwned>(&self) -> Result<Option<T>, Error> {
        let url = self.rest_url(&["networking", "resources"], &[])?;
        debug!("listing network resources");
        self.get_json_opt(url).await
    }

    /// Fetch the controller clock document.
    ///
    /// `GET /rest/time`
    pub async fn get_clock<T: DeserializeOwned>(&self) -> Result<T, Error> {
        let url = self.rest_url(&["time"], &[])?;
        debug!("fetching controller clock");
        self.get_json(url).await
    }

    /// List node-server connection profiles.
    ///
    /// `GET /rest/profiles/ns/0/connection`
    pub async fn list_node_server_profiles<T: DeserializeOwned>(
        &self,
    ) -> Result<Option<T>, Error> {
        let url = self.rest_url(&["profiles", "ns", "0", "connection"], &[])?;
        debug!("listing node server profiles");
        self.get_json_opt(url).await
    }

    // ── Commands ─────────────────────────────────────────────────────

    /// Send a command to a node.
    ///
    /// `GET /rest/nodes/{address}/cmd/{cmd}[/{value}[/{uom}]]`
    pub async fn send_node_command(
        &self,
        address: &str,
        cmd: &str,
        value: Option<&str>,
        uom: Option<&str>,
    ) -> Result<(), Error> {
        let mut segments = vec!["nodes", address, "cmd", cmd];
        if let Some(value) = value {
            segments.push(value);
            if let Some(uom) = uom {
                segments.push(uom);
            }
        }
        let url = self.rest_url(&segments, &[])?;
        debug!(address, cmd, value, "sending node command");
        self.execute(url, false).await?;
        Ok(())
    }

    /// Enable or disable a node.
    ///
    /// `GET /rest/nodes/{address}/{enable|disable}`
    pub async fn set_node_enabled(&self, address: &str, enabled: bool) -> Result<(), Error> {
        let verb = if enabled { "enable" } else { "disable" };
        let url = self.rest_url(&["nodes", address, verb], &[])?;
        debug!(address, enabled, "setting node enabled state");
        self.execute(url, false).await?;
        Ok(())
    }

    /// Ask the controller to re-query a node's device state.
    ///
    /// `GET /rest/query/{address}`
    pub async fn query_node(&self, address: &str) -> Result<(), Error> {
        let url = self.rest_url(&["query", address], &[])?;
        debug!(address, "querying node");
        self.execute(url, false).await?;
        Ok(())
    }

    /// Send a command to a program (`run`, `runThen`, `runElse`, `stop`,
    /// `enable`, `disable`, ...).
    ///
    /// `GET /rest/programs/{id}/{cmd}`
    pub async fn send_program_command(&self, id: &str, cmd: &str) -> Result<(), Error> {
        let url = self.rest_url(&["programs", id, cmd], &[])?;
        debug!(id, cmd, "sending program command");
        self.execute(url, false).await?;
        Ok(())
    }

    /// Set a variable's current or init value.
    ///
    /// `GET /rest/vars/set/{kind}/{id}/{value}` (init inserts `init`).
    pub async fn set_variable(
        &self,
        kind: u8,
        id: u32,
        init: bool,
        value: i64,
    ) -> Result<(), Error> {
        let kind_segment = kind.to_string();
        let id_segment = id.to_string();
        let value_segment = value.to_string();
        let mut segments = vec!["vars", "set"];
        if init {
            segments.push("init");
        }
        segments.push(&kind_segment);
        segments.push(&id_segment);
        segments.push(&value_segment);
        let url = self.rest_url(&segments, &[])?;
        debug!(kind, id, init, value, "setting variable");
        self.execute(url, false).await?;
        Ok(())
    }

    /// Run a network resource command.
    ///
    /// The controller is finicky about response codes here: it may
    /// report 404 for a command that actually ran, so absence is only
    /// logged, matching long-standing client behavior.
    ///
    /// `GET /rest/networking/resources/{id}`
    pub async fn run_network_resource(&self, id: &str) -> Result<(), Error> {
        let url = self.rest_url(&["networking", "resources", id], &[])?;
        if self.execute(url, true).await?.is_none() {
            warn!(id, "network resource command returned 404");
        }
        Ok(())
    }
}
