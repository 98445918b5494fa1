// ── Event router ──
//
// Classifies stream messages by control code and dispatches them to the
// owning collection. Runs as the single consumer of the event channel,
// so arrival order is preserved and every delta is stamped exactly once,
// here, at arrival.
//
// Control codes: `_0` heartbeat, any non-underscore control is a node
// property update, `_1` is a trigger (variable or program), `_3` a node
// change, `_5` a system status change.

use std::sync::Arc;

use isy_api::EventMessage;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::model::program::{PROP_LAST_FINISH, PROP_LAST_RUN, PROP_PROGRAM_STATUS};
use crate::model::program::normalize_program_id;
use crate::model::variable::{PROP_INIT, PROP_VALUE};
use crate::model::{
    Address, PropertyData, PropertyValue, SystemStatus, VariableKind, parse_precision,
};
use crate::store::{DeltaOutcome, Registry};

/// Node-changed action: enabled flag toggled.
const ACTION_NODE_ENABLED: &str = "EN";
/// Node-changed action: node removed.
const ACTION_NODE_REMOVED: &str = "NR";
/// Node-changed action: node renamed.
const ACTION_NODE_RENAMED: &str = "NN";

/// Trigger action: variable value changed.
const ACTION_VAR_VALUE: &str = "6";
/// Trigger action: variable init value changed.
const ACTION_VAR_INIT: &str = "7";

/// What a stream message is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventCategory {
    Heartbeat,
    /// Property update for a node (control is the property id).
    NodeUpdate,
    /// Structural node change: enabled, removed, renamed, ...
    NodeChanged,
    VariableChanged,
    ProgramChanged,
    SystemStatus,
    Unknown,
}

/// Classify a message by its control code (and, for triggers, its
/// payload shape).
pub fn classify(message: &EventMessage) -> EventCategory {
    let control = message.control.as_str();
    match control {
        "" => EventCategory::Unknown,
        "_0" => EventCategory::Heartbeat,
        "_1" => match &message.event_info {
            Some(info) if info.get("var").is_some() => EventCategory::VariableChanged,
            Some(info) if info.get("id").is_some() => EventCategory::ProgramChanged,
            _ => EventCategory::Unknown,
        },
        "_3" => EventCategory::NodeChanged,
        "_5" => EventCategory::SystemStatus,
        _ if !control.starts_with('_') => EventCategory::NodeUpdate,
        _ => EventCategory::Unknown,
    }
}

/// Single-consumer routing task. Exits on cancellation or when the
/// stream side closes the channel.
pub(crate) async fn route_events(
    registry: Arc<Registry>,
    mut events: mpsc::Receiver<EventMessage>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                debug!("event router cancelled");
                return;
            }
            message = events.recv() => {
                let Some(message) = message else {
                    debug!("event channel closed, router exiting");
                    return;
                };
                dispatch(&registry, &message);
            }
        }
    }
}

/// Route one message into the registry.
pub(crate) fn dispatch(registry: &Registry, message: &EventMessage) {
    match classify(message) {
        EventCategory::Heartbeat => {
            // Liveness is tracked by the stream layer.
        }
        EventCategory::NodeUpdate => dispatch_node_update(registry, message),
        EventCategory::NodeChanged => dispatch_node_changed(registry, message),
        EventCategory::VariableChanged => dispatch_variable(registry, message),
        EventCategory::ProgramChanged => dispatch_program(registry, message),
        EventCategory::SystemStatus => {
            let action = action_str(message);
            let status = SystemStatus::from_action(action.as_deref().unwrap_or_default());
            debug!(?status, "system status changed");
            registry.set_system_status(status);
        }
        EventCategory::Unknown => {
            debug!(
                control = %message.control,
                seqnum = ?message.seqnum,
                "dropping unrecognized stream event"
            );
        }
    }
}

fn dispatch_node_update(registry: &Registry, message: &EventMessage) {
    let Some(node) = &message.node else {
        debug!(control = %message.control, "node update without address, dropping");
        return;
    };
    let address = Address::from(node.as_str());
    let stamp = registry.next_stamp();
    let value = property_from_action(message, stamp);

    match registry.nodes().apply_property(&address, &message.control, value) {
        DeltaOutcome::Applied => {}
        DeltaOutcome::IgnoredStale => {
            debug!(%address, control = %message.control, "stale node update ignored");
        }
        DeltaOutcome::UnknownAddress => {
            debug!(%address, control = %message.control, "node update for unloaded address");
        }
    }
}

fn dispatch_node_changed(registry: &Registry, message: &EventMessage) {
    let Some(node) = &message.node else {
        debug!("node-changed event without address, dropping");
        return;
    };
    let address = Address::from(node.as_str());
    let action = action_str(message).unwrap_or_default();

    match action.as_str() {
        ACTION_NODE_ENABLED => {
            let enabled = message
                .event_info
                .as_ref()
                .and_then(|info| info.get("enabled"))
                .and_then(serde_json::Value::as_bool)
                .unwrap_or(true);
            let stamp = registry.next_stamp();
            registry.nodes().set_enabled(&address, enabled, stamp);
        }
        ACTION_NODE_REMOVED => {
            if registry.nodes().remove(&address).is_some() {
                debug!(%address, "node removed");
            }
        }
        ACTION_NODE_RENAMED => {
            let Some(name) = message
                .event_info
                .as_ref()
                .and_then(|info| info.get("newName"))
                .and_then(serde_json::Value::as_str)
            else {
                warn!(%address, "node-renamed event without newName");
                return;
            };
            let stamp = registry.next_stamp();
            registry.nodes().rename(&address, name.to_owned(), stamp);
        }
        other => {
            debug!(%address, action = other, "unhandled node-changed action");
        }
    }
}

fn dispatch_variable(registry: &Registry, message: &EventMessage) {
    let Some(var) = message.event_info.as_ref().and_then(|info| info.get("var")) else {
        return;
    };
    let kind = var
        .get("type")
        .and_then(wire_u64)
        .and_then(|t| u8::try_from(t).ok())
        .and_then(VariableKind::from_wire_code);
    let id = var.get("id").and_then(wire_u64).and_then(|i| u32::try_from(i).ok());
    let (Some(kind), Some(id)) = (kind, id) else {
        warn!("variable event with unusable type/id, dropping");
        return;
    };

    let property = match action_str(message).as_deref() {
        Some(ACTION_VAR_INIT) => PROP_INIT,
        Some(ACTION_VAR_VALUE) | None => PROP_VALUE,
        Some(other) => {
            debug!(action = other, "unhandled variable action");
            return;
        }
    };
    let raw = var
        .get("val")
        .or_else(|| var.get("init"))
        .cloned()
        .unwrap_or(serde_json::Value::Null);
    let precision = parse_precision(var.get("prec"));

    let address = kind.address_for(id);
    let stamp = registry.next_stamp();
    let value = PropertyValue::new(PropertyData::from_wire(&raw), stamp).with_precision(precision);
    registry.variables().apply_property(&address, property, value);
}

fn dispatch_program(registry: &Registry, message: &EventMessage) {
    let Some(info) = &message.event_info else {
        return;
    };
    let Some(id) = info.get("id").and_then(wire_string) else {
        return;
    };
    let address = Address::new(normalize_program_id(&id));
    let stamp = registry.next_stamp();

    if let Some(status) = info.get("s") {
        let value = PropertyValue::new(PropertyData::from_wire(status), stamp);
        registry.programs().apply_property(&address, PROP_PROGRAM_STATUS, value);
    }
    if let Some(run) = info.get("r") {
        let value = PropertyValue::new(PropertyData::from_wire(run), stamp);
        registry.programs().apply_property(&address, PROP_LAST_RUN, value);
    }
    if let Some(finish) = info.get("f") {
        let value = PropertyValue::new(PropertyData::from_wire(finish), stamp);
        registry.programs().apply_property(&address, PROP_LAST_FINISH, value);
    }
    if info.get("on").is_some() {
        registry.programs().set_enabled(&address, true, stamp);
    } else if info.get("off").is_some() {
        registry.programs().set_enabled(&address, false, stamp);
    }
}

// ── Payload helpers ──────────────────────────────────────────────────

/// Build a stamped property value from a node update's action payload.
/// The action is either a bare scalar or `{ value, uom, prec }`.
fn property_from_action(message: &EventMessage, stamp: u64) -> PropertyValue {
    let (raw, uom, precision) = match &message.action {
        Some(serde_json::Value::Object(map)) => (
            map.get("value").cloned().unwrap_or(serde_json::Value::Null),
            map.get("uom")
                .and_then(wire_string),
            parse_precision(map.get("prec")),
        ),
        Some(other) => (other.clone(), None, None),
        None => (serde_json::Value::Null, None, None),
    };
    PropertyValue::new(PropertyData::from_wire(&raw), stamp)
        .with_uom(uom)
        .with_precision(precision)
        .with_formatted(message.fmt_act.clone())
}

fn action_str(message: &EventMessage) -> Option<String> {
    message.action.as_ref().and_then(wire_string)
}

/// Numbers and numeric strings both appear on the wire.
fn wire_u64(value: &serde_json::Value) -> Option<u64> {
    value
        .as_u64()
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
}

fn wire_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

// ── Tests ────────────────────────────────────────────────────────────
