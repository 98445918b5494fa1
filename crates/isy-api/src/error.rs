use thiserror::Error;

/// Top-level error type for the `isy-api` crate.
///
/// Covers every failure mode of the transport and stream layers:
/// authentication, HTTP status, timeouts, wire-format problems, and the
/// event-stream sockets. `isy-core` maps these into user-facing
/// diagnostics.
#[derive(Debug, Error)]
pub enum Error {
    // ── Authentication ──────────────────────────────────────────────
    /// Controller rejected the credentials (HTTP 401). Never retried.
    #[error("Authentication failed: {message}")]
    Authentication { message: String },

    // ── Transport ───────────────────────────────────────────────────
    /// HTTP transport error (connection refused, DNS failure, etc.)
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Non-success HTTP status that is not handled specially.
    #[error("HTTP {status} from {path}")]
    HttpStatus { status: u16, path: String },

    /// Request timed out.
    #[error("Request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    /// URL parsing error.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// TLS setup or certificate error.
    #[error("TLS error: {0}")]
    Tls(String),

    /// The owning context was cancelled while a backoff wait was pending.
    #[error("Operation cancelled")]
    Cancelled,

    // ── Event stream ────────────────────────────────────────────────
    /// Stream connection (WebSocket upgrade or TCP subscribe) failed.
    #[error("Event stream connection failed: {0}")]
    StreamConnect(String),

    /// Stream socket closed by the controller.
    #[error("Event stream closed: {reason}")]
    StreamClosed { reason: String },

    /// Malformed stream message. Logged and dropped by the reader,
    /// never fatal to the stream itself.
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    // ── Data ────────────────────────────────────────────────────────
    /// JSON deserialization failed, with the raw body for debugging.
    #[error("Deserialization error: {message}")]
    Deserialization { message: String, body: String },
}

impl Error {
    /// Returns `true` if this is a transient failure worth retrying:
    /// a 503 from the controller, a timeout, or a connect-level
    /// transport error. Everything else fails the call immediately.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_timeout() || e.is_connect(),
            Self::HttpStatus { status: 503, .. } => true,
            Self::Timeout { .. } => true,
            Self::StreamConnect(_) => true,
            _ => false,
        }
    }

    /// Returns `true` for credential failures, which abort immediately.
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Authentication { .. })
    }

    /// Returns `true` if this is a "not found" error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::HttpStatus { status: 404, .. })
    }
}

#[cfg(test)]
mod tests {
    use super::Error;

    #[test]
    fn service_unavailable_is_transient() {
        let err = Error::HttpStatus {
            status: 503,
            path: "/rest/nodes".into(),
        };
        assert!(err.is_transient());
    }

    #[test]
    fn auth_error_is_not_transient() {
        let err = Error::Authentication {
            message: "bad credentials".into(),
        };
        assert!(!err.is_transient());
        assert!(err.is_auth());
    }

    #[test]
    fn not_found_detection() {
        let err = Error::HttpStatus {
            status: 404,
            path: "/rest/nodes/1 2 3 4/notes".into(),
        };
        assert!(err.is_not_found());
        assert!(!err.is_transient());
    }
}
