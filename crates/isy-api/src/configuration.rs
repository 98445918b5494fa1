// Connection probe and capacity negotiation.
//
// One call to /rest/config identifies the platform generation and which
// optional modules are installed. Current-generation firmware tolerates
// far more request concurrency, so a successful probe on that class
// triggers the one-time permit ceiling upgrade.

use serde::Deserialize;
use tracing::{debug, info};

use crate::client::IsyClient;
use crate::error::Error;

/// Feature description for the networking module.
const FEATURE_NETWORKING: &str = "Networking Module";
/// Feature description for portal integration.
const FEATURE_PORTAL: &str = "Portal Integration - UDI";

/// Hardware/firmware generation of the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformClass {
    /// Original ISY-994 class hardware: low request concurrency,
    /// half-duplex event socket.
    Legacy,
    /// IoX firmware (Polisy / eisy): higher concurrency ceilings and a
    /// duplex WebSocket event stream.
    Current,
}

/// One optional-module entry from the configuration document.
#[derive(Debug, Clone, Deserialize)]
pub struct Feature {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub desc: String,
    #[serde(default, alias = "isInstalled")]
    pub installed: bool,
}

/// Parsed `/rest/config` document.
///
/// Immutable once fetched; the only connection-level mutation a probe
/// performs is the one-time permit upgrade.
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigurationSnapshot {
    /// Firmware version string, e.g. `"5.8.0"`.
    #[serde(alias = "app_full_version")]
    pub firmware: String,
    /// Controller UUID.
    #[serde(default)]
    pub uuid: String,
    /// User-assigned controller name.
    #[serde(default)]
    pub name: String,
    /// Product model description.
    #[serde(default)]
    pub model: String,
    /// Platform identifier, e.g. `"IoX"` or `"ISY-C-994"`.
    #[serde(default)]
    pub platform: String,
    /// Whether the variables subsystem is present.
    #[serde(default)]
    pub variables: bool,
    /// Whether node definitions are available.
    #[serde(default, alias = "nodedefs")]
    pub node_defs: bool,
    /// Whether node servers are supported.
    #[serde(default, alias = "nodeServers")]
    pub node_servers: bool,
    /// Installed optional modules.
    #[serde(default)]
    pub features: Vec<Feature>,
}

impl ConfigurationSnapshot {
    /// Classify the platform generation from the identifier string.
    pub fn platform_class(&self) -> PlatformClass {
        let id = self.platform.to_ascii_lowercase();
        if id.contains("iox") || id.contains("polisy") || id.contains("eisy") {
            PlatformClass::Current
        } else {
            PlatformClass::Legacy
        }
    }

    fn feature_installed(&self, desc: &str) -> bool {
        self.features.iter().any(|f| f.desc == desc && f.installed)
    }

    /// Whether the networking (network resources) module is installed.
    pub fn networking_installed(&self) -> bool {
        self.feature_installed(FEATURE_NETWORKING)
    }

    /// Whether portal integration is installed.
    pub fn portal_installed(&self) -> bool {
        self.feature_installed(FEATURE_PORTAL)
    }
}

/// Probe the controller: fetch `/rest/config` and negotiate capacity.
///
/// Idempotent — the permit upgrade is applied at most once and never
/// downgraded, so repeated probes are harmless. A 401 surfaces as
/// [`Error::Authentication`] with zero retries.
pub async fn probe(client: &IsyClient) -> Result<ConfigurationSnapshot, Error> {
    let snapshot = client.get_config().await?;
    let class = snapshot.platform_class();
    info!(
        firmware = %snapshot.firmware,
        platform = %snapshot.platform,
        ?class,
        "controller probe complete"
    );
    if class == PlatformClass::Current {
        client.permits().upgrade();
    } else {
        debug!("legacy platform class, keeping conservative concurrency ceilings");
    }
    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(platform: &str, features: Vec<Feature>) -> ConfigurationSnapshot {
        ConfigurationSnapshot {
            firmware: "5.8.0".into(),
            uuid: "00:21:b9:00:00:01".into(),
            name: "Test".into(),
            model: "eisy".into(),
            platform: platform.into(),
            variables: true,
            node_defs: true,
            node_servers: false,
            features,
        }
    }

    #[test]
    fn platform_classification() {
        assert_eq!(
            snapshot("IoX", vec![]).platform_class(),
            PlatformClass::Current
        );
        assert_eq!(
            snapshot("eisy", vec![]).platform_class(),
            PlatformClass::Current
        );
        assert_eq!(
            snapshot("ISY-C-994", vec![]).platform_class(),
            PlatformClass::Legacy
        );
    }

    #[test]
    fn feature_detection() {
        let snap = snapshot(
            "IoX",
            vec![
                Feature {
                    id: "21010".into(),
                    desc: FEATURE_NETWORKING.into(),
                    installed: true,
                },
                Feature {
                    id: "21075".into(),
                    desc: FEATURE_PORTAL.into(),
                    installed: false,
                },
            ],
        );
        assert!(snap.networking_installed());
        assert!(!snap.portal_installed());
    }

    #[test]
    fn deserialize_config_document() {
        let json = r#"{
            "app_full_version": "5.8.4",
            "uuid": "00:21:b9:02:45:1b",
            "name": "Home",
            "model": "eisy",
            "platform": "IoX",
            "variables": true,
            "nodedefs": true,
            "features": [
                { "id": "21010", "desc": "Networking Module", "isInstalled": true }
            ]
        }"#;
        let snap: ConfigurationSnapshot = serde_json::from_str(json).expect("parse");
        assert_eq!(snap.firmware, "5.8.4");
        assert_eq!(snap.platform_class(), PlatformClass::Current);
        assert!(snap.networking_installed());
    }
}
