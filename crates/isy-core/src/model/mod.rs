// ── Domain model ──
//
// Entity records for the four controller platforms, plus the shared
// property-value and change-notification types. Wire documents are the
// controller's JSON rendering; conversion into records happens here so
// the store and router only ever see typed values.

pub mod network;
pub mod node;
pub mod program;
pub mod variable;

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Deserialize;

pub use network::{NetworkResource, NetworkResourcesDocument};
pub use node::{Node, NodesDocument, StatusDocument, build_nodes};
pub use program::{Program, ProgramsDocument, build_programs};
pub use variable::{
    Variable, VariableDefinitionsDocument, VariableKind, VariableValuesDocument, build_variables,
};

/// Status property id carried by most devices.
pub const PROP_STATUS: &str = "ST";

/// Entity address. Opaque to the engine: node addresses look like
/// `"2E 5C A1 1"`, programs use zero-padded hex ids, variables use a
/// `kind.id` composite.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(String);

impl Address {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Address {
    fn from(raw: &str) -> Self {
        Self(raw.to_owned())
    }
}

impl From<String> for Address {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

/// The four entity platforms the engine synchronizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum Platform {
    Nodes,
    Programs,
    Variables,
    NetworkResources,
}

/// Controller-wide busy state, from `_5` system status events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SystemStatus {
    NotBusy,
    Busy,
    Idle,
    SafeMode,
    #[default]
    Unknown,
}

impl SystemStatus {
    /// Map the wire action code (`"0"`..`"3"`).
    pub fn from_action(action: &str) -> Self {
        match action {
            "0" => Self::NotBusy,
            "1" => Self::Busy,
            "2" => Self::Idle,
            "3" => Self::SafeMode,
            _ => Self::Unknown,
        }
    }
}

// ── Property values ──────────────────────────────────────────────────

/// A typed property value.
///
/// The controller reports unknown values as an empty string or a
/// sentinel; both map to `Unknown` rather than a fake zero.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyData {
    Int(i64),
    Float(f64),
    Str(String),
    Unknown,
}

impl PropertyData {
    /// Interpret a raw wire value.
    pub fn from_wire(raw: &serde_json::Value) -> Self {
        match raw {
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Self::Int(i)
                } else if let Some(f) = n.as_f64() {
                    Self::Float(f)
                } else {
                    Self::Unknown
                }
            }
            serde_json::Value::String(s) => {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    Self::Unknown
                } else if let Ok(i) = trimmed.parse::<i64>() {
                    Self::Int(i)
                } else {
                    Self::Str(trimmed.to_owned())
                }
            }
            serde_json::Value::Bool(b) => Self::Int(i64::from(*b)),
            _ => Self::Unknown,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }
}

/// One property with provenance: the ordering stamp (`seq`) decides
/// whether an incoming write supersedes the stored value.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyValue {
    pub value: PropertyData,
    pub uom: Option<String>,
    pub precision: Option<u8>,
    pub formatted: Option<String>,
    pub seq: u64,
    pub last_update: DateTime<Utc>,
}

impl PropertyValue {
    pub fn new(value: PropertyData, seq: u64) -> Self {
        Self {
            value,
            uom: None,
            precision: None,
            formatted: None,
            seq,
            last_update: Utc::now(),
        }
    }

    pub fn with_uom(mut self, uom: Option<String>) -> Self {
        self.uom = uom;
        self
    }

    pub fn with_precision(mut self, precision: Option<u8>) -> Self {
        self.precision = precision;
        self
    }

    pub fn with_formatted(mut self, formatted: Option<String>) -> Self {
        self.formatted = formatted;
        self
    }
}

/// Shared wire shape for a property entry inside node and status
/// documents.
#[derive(Debug, Clone, Deserialize)]
pub struct PropertyDocument {
    /// Property id, e.g. `"ST"`.
    pub id: String,
    #[serde(default)]
    pub value: serde_json::Value,
    #[serde(default)]
    pub formatted: Option<String>,
    #[serde(default)]
    pub uom: Option<String>,
    #[serde(default, alias = "prec")]
    pub precision: Option<serde_json::Value>,
}

impl PropertyDocument {
    /// Convert into a stamped [`PropertyValue`].
    pub fn into_value(self, seq: u64) -> PropertyValue {
        let precision = parse_precision(self.precision.as_ref());
        PropertyValue::new(PropertyData::from_wire(&self.value), seq)
            .with_uom(self.uom)
            .with_precision(precision)
            .with_formatted(self.formatted)
    }
}

/// Precision arrives as either a number or a numeric string.
pub(crate) fn parse_precision(raw: Option<&serde_json::Value>) -> Option<u8> {
    let raw = raw?;
    raw.as_u64()
        .or_else(|| raw.as_str().and_then(|s| s.trim().parse().ok()))
        .and_then(|p| u8::try_from(p).ok())
}

// ── Entity records ───────────────────────────────────────────────────

/// Common surface every platform record exposes to the store.
///
/// `revision` orders structural fields (name, parent, enabled) the same
/// way each property's `seq` orders that property.
pub trait EntityRecord: Clone + Send + Sync + 'static {
    fn platform() -> Platform;
    fn address(&self) -> &Address;
    fn name(&self) -> &str;
    fn properties(&self) -> &HashMap<String, PropertyValue>;
    fn properties_mut(&mut self) -> &mut HashMap<String, PropertyValue>;
    fn revision(&self) -> u64;
    fn set_revision(&mut self, revision: u64);

    /// Whether the record carries an enabled flag the stream can
    /// toggle. Returns `false` for platforms without one.
    fn set_enabled(&mut self, _enabled: bool) -> bool {
        false
    }

    fn set_name(&mut self, name: String) {
        let _ = name;
    }
}

/// One change notification delivered to subscribers.
///
/// `property: None` marks a record-level change (bulk merge, creation,
/// removal, structural update).
#[derive(Debug, Clone)]
pub struct EntityChange {
    pub platform: Platform,
    pub address: Address,
    pub property: Option<String>,
    pub old: Option<PropertyValue>,
    pub new: Option<PropertyValue>,
    pub timestamp: DateTime<Utc>,
}
