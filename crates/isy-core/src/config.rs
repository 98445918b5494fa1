// ── Runtime connection configuration ──
//
// These types describe *how* to reach a controller. They carry
// credential data and connection tuning, but never touch disk -- the
// embedding application constructs an `IsyConfig` and hands it in.

use std::time::Duration;

use secrecy::SecretString;
use url::Url;

/// TLS verification strategy.
#[derive(Debug, Clone, Default)]
pub enum TlsVerification {
    /// System CA store (strict).
    SystemDefaults,
    /// Custom CA certificate file.
    CustomCa(std::path::PathBuf),
    /// Skip verification (self-signed certs). Default for local
    /// controllers, which almost never carry a trusted certificate.
    #[default]
    DangerAcceptInvalid,
}

/// Configuration for connecting to a single controller.
#[derive(Debug, Clone)]
pub struct IsyConfig {
    /// Controller URL (e.g., `http://192.168.1.50` or
    /// `https://my-eisy.local:8443`).
    pub url: Url,
    /// Basic-auth username.
    pub username: String,
    /// Basic-auth password.
    pub password: SecretString,
    /// TLS verification strategy.
    pub tls: TlsVerification,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl IsyConfig {
    /// Minimal config for a local controller with default tuning.
    pub fn new(url: Url, username: impl Into<String>, password: SecretString) -> Self {
        Self {
            url,
            username: username.into(),
            password,
            tls: TlsVerification::default(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Which platforms `initialize` loads and whether live updates start.
///
/// Platforms gated off by missing controller features (e.g. network
/// resources without the networking module) are skipped regardless of
/// these flags.
#[derive(Debug, Clone, Copy)]
pub struct InitializeOptions {
    pub nodes: bool,
    pub programs: bool,
    pub variables: bool,
    pub network_resources: bool,
    /// Start the event stream after the bulk loads.
    pub live_updates: bool,
}

impl Default for InitializeOptions {
    fn default() -> Self {
        Self {
            nodes: true,
            programs: true,
            variables: true,
            network_resources: true,
            live_updates: true,
        }
    }
}

impl InitializeOptions {
    /// Load nodes only, no stream. Useful for one-shot queries.
    pub fn nodes_only() -> Self {
        Self {
            nodes: true,
            programs: false,
            variables: false,
            network_resources: false,
            live_updates: false,
        }
    }
}
