// Integer and state variable records, from the definitions/values
// document pair.

use std::collections::HashMap;

use serde::Deserialize;

use super::{Address, EntityRecord, Platform, PropertyData, PropertyValue};

/// Property id for the current value.
pub const PROP_VALUE: &str = "value";
/// Property id for the init (power-on) value.
pub const PROP_INIT: &str = "init";

/// Variable kind, matching the controller's path segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum VariableKind {
    Integer,
    State,
}

impl VariableKind {
    /// The `/rest/vars/...` path segment for this kind.
    pub fn wire_code(self) -> u8 {
        match self {
            Self::Integer => 1,
            Self::State => 2,
        }
    }

    /// Composite address for a variable of this kind.
    pub fn address_for(self, id: u32) -> Address {
        Address::new(format!("{}.{id}", self.wire_code()))
    }

    pub fn from_wire_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Integer),
            2 => Some(Self::State),
            _ => None,
        }
    }
}

/// One integer or state variable.
#[derive(Debug, Clone)]
pub struct Variable {
    pub address: Address,
    pub kind: VariableKind,
    pub id: u32,
    pub name: String,
    pub precision: Option<u8>,
    /// `value` and `init` as stamped properties.
    pub properties: HashMap<String, PropertyValue>,
    pub revision: u64,
}

impl Variable {
    pub fn value(&self) -> Option<i64> {
        self.properties.get(PROP_VALUE).and_then(|p| p.value.as_int())
    }

    pub fn init(&self) -> Option<i64> {
        self.properties.get(PROP_INIT).and_then(|p| p.value.as_int())
    }
}

impl EntityRecord for Variable {
    fn platform() -> Platform {
        Platform::Variables
    }

    fn address(&self) -> &Address {
        &self.address
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn properties(&self) -> &HashMap<String, PropertyValue> {
        &self.properties
    }

    fn properties_mut(&mut self) -> &mut HashMap<String, PropertyValue> {
        &mut self.properties
    }

    fn revision(&self) -> u64 {
        self.revision
    }

    fn set_revision(&mut self, revision: u64) {
        self.revision = revision;
    }

    fn set_name(&mut self, name: String) {
        self.name = name;
    }
}

// ── Wire documents ───────────────────────────────────────────────────

/// `GET /rest/vars/definitions/{kind}` response: id to name mapping.
#[derive(Debug, Deserialize)]
pub struct VariableDefinitionsDocument {
    #[serde(default, alias = "e")]
    pub variables: Vec<VariableDefinition>,
}

#[derive(Debug, Deserialize)]
pub struct VariableDefinition {
    pub id: u32,
    #[serde(default)]
    pub name: String,
}

/// `GET /rest/vars/get/{kind}` response: current values.
#[derive(Debug, Deserialize)]
pub struct VariableValuesDocument {
    #[serde(default, alias = "var")]
    pub variables: Vec<VariableValueDocument>,
}

#[derive(Debug, Deserialize)]
pub struct VariableValueDocument {
    pub id: u32,
    #[serde(default, alias = "val")]
    pub value: serde_json::Value,
    #[serde(default)]
    pub init: serde_json::Value,
    #[serde(default, alias = "prec")]
    pub precision: Option<serde_json::Value>,
}

/// Join definitions with values into stamped records. Variables with a
/// value but no definition still get a record with an empty name.
pub fn build_variables(
    kind: VariableKind,
    definitions: VariableDefinitionsDocument,
    values: VariableValuesDocument,
    stamp: u64,
) -> Vec<Variable> {
    let names: HashMap<u32, String> = definitions
        .variables
        .into_iter()
        .map(|d| (d.id, d.name))
        .collect();

    values
        .variables
        .into_iter()
        .map(|doc| {
            let precision = super::parse_precision(doc.precision.as_ref());
            let mut properties = HashMap::new();
            properties.insert(
                PROP_VALUE.to_owned(),
                PropertyValue::new(PropertyData::from_wire(&doc.value), stamp)
                    .with_precision(precision),
            );
            properties.insert(
                PROP_INIT.to_owned(),
                PropertyValue::new(PropertyData::from_wire(&doc.init), stamp)
                    .with_precision(precision),
            );
            Variable {
                address: kind.address_for(doc.id),
                kind,
                id: doc.id,
                name: names.get(&doc.id).cloned().unwrap_or_default(),
                precision,
                properties,
                revision: stamp,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn joins_definitions_with_values() {
        let defs: VariableDefinitionsDocument = serde_json::from_str(
            r#"{ "e": [ { "id": 5, "name": "Sprinkler Zone" } ] }"#,
        )
        .expect("defs");
        let values: VariableValuesDocument = serde_json::from_str(
            r#"{ "var": [
                { "id": 5, "val": 42, "init": 0, "prec": "0" },
                { "id": 9, "val": 7, "init": 7 }
            ] }"#,
        )
        .expect("values");

        let records = build_variables(VariableKind::State, defs, values, 2);
        assert_eq!(records.len(), 2);

        let named = &records[0];
        assert_eq!(named.address.as_str(), "2.5");
        assert_eq!(named.name, "Sprinkler Zone");
        assert_eq!(named.value(), Some(42));
        assert_eq!(named.init(), Some(0));

        let unnamed = &records[1];
        assert_eq!(unnamed.name, "");
        assert_eq!(unnamed.value(), Some(7));
    }

    #[test]
    fn kind_codes_round_trip() {
        assert_eq!(VariableKind::Integer.wire_code(), 1);
        assert_eq!(VariableKind::from_wire_code(2), Some(VariableKind::State));
        assert_eq!(VariableKind::from_wire_code(3), None);
    }
}
