// ── Core error types ──
//
// User-facing errors from isy-core. These are NOT wire-specific --
// consumers never see raw HTTP statuses or JSON parse failures. The
// `From<isy_api::Error>` impl translates transport-layer errors into
// domain-appropriate variants.

use thiserror::Error;

use crate::model::Platform;

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Connection errors ────────────────────────────────────────────
    #[error("Cannot connect to controller at {url}: {reason}")]
    ConnectionFailed { url: String, reason: String },

    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    #[error("Controller request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    // ── Data errors ──────────────────────────────────────────────────
    #[error("{platform} entity not found: {address}")]
    NotFound { platform: Platform, address: String },

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    // ── Lifecycle errors ─────────────────────────────────────────────
    #[error("Invalid state: {message}")]
    InvalidState { message: String },

    /// Every requested platform failed to load. Individual failures are
    /// carried so the caller can report each one.
    #[error("Initialization failed for all requested platforms ({})", summarize(failures))]
    PartialInitialization { failures: Vec<(Platform, String)> },

    #[error("Operation cancelled")]
    Cancelled,

    // ── Internal errors ──────────────────────────────────────────────
    #[error("Internal error: {0}")]
    Internal(String),
}

fn summarize(failures: &[(Platform, String)]) -> String {
    failures
        .iter()
        .map(|(platform, reason)| format!("{platform}: {reason}"))
        .collect::<Vec<_>>()
        .join("; ")
}

// ── Conversion from transport-layer errors ───────────────────────────

impl From<isy_api::Error> for CoreError {
    fn from(err: isy_api::Error) -> Self {
        match err {
            isy_api::Error::Authentication { message } => {
                CoreError::AuthenticationFailed { message }
            }
            isy_api::Error::Transport(ref e) => {
                if e.is_timeout() {
                    CoreError::Timeout { timeout_secs: 0 }
                } else {
                    CoreError::ConnectionFailed {
                        url: e
                            .url()
                            .map(|u| u.to_string())
                            .unwrap_or_else(|| "<unknown>".into()),
                        reason: e.to_string(),
                    }
                }
            }
            isy_api::Error::HttpStatus { status, path } => CoreError::ConnectionFailed {
                url: path,
                reason: format!("controller returned HTTP {status}"),
            },
            isy_api::Error::Timeout { timeout_secs } => CoreError::Timeout { timeout_secs },
            isy_api::Error::InvalidUrl(e) => CoreError::Internal(format!("invalid URL: {e}")),
            isy_api::Error::Tls(msg) => CoreError::ConnectionFailed {
                url: String::new(),
                reason: format!("TLS error: {msg}"),
            },
            isy_api::Error::Cancelled => CoreError::Cancelled,
            isy_api::Error::StreamConnect(reason) => CoreError::ConnectionFailed {
                url: String::new(),
                reason: format!("event stream connection failed: {reason}"),
            },
            isy_api::Error::StreamClosed { reason } => CoreError::ConnectionFailed {
                url: String::new(),
                reason: format!("event stream closed: {reason}"),
            },
            isy_api::Error::Protocol { message } => CoreError::Protocol { message },
            isy_api::Error::Deserialization { message, body: _ } => CoreError::Protocol {
                message: format!("malformed controller document: {message}"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_errors_translate() {
        let err: CoreError = isy_api::Error::Authentication {
            message: "controller rejected credentials".into(),
        }
        .into();
        assert!(matches!(err, CoreError::AuthenticationFailed { .. }));
    }

    #[test]
    fn partial_initialization_lists_failures() {
        let err = CoreError::PartialInitialization {
            failures: vec![
                (Platform::Nodes, "HTTP 503".into()),
                (Platform::Programs, "timeout".into()),
            ],
        };
        let text = err.to_string();
        assert!(text.contains("nodes: HTTP 503"));
        assert!(text.contains("programs: timeout"));
    }
}
