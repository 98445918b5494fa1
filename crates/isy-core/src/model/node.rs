// Node and group (scene) records, built from the `/rest/nodes` and
// `/rest/status` document pair.

use std::collections::HashMap;

use serde::Deserialize;

use super::{Address, EntityRecord, Platform, PropertyDocument, PropertyValue};

/// Flag bit marking a group record.
const FLAG_GROUP: u8 = 0x04;

/// One device node or group (scene).
#[derive(Debug, Clone)]
pub struct Node {
    pub address: Address,
    pub name: String,
    /// Folder or device this node sits under.
    pub parent: Option<Address>,
    /// Primary node of a multi-button device.
    pub primary: Option<Address>,
    pub family: Option<String>,
    pub enabled: bool,
    pub flags: u8,
    /// Member addresses, for groups.
    pub members: Vec<Address>,
    pub properties: HashMap<String, PropertyValue>,
    pub revision: u64,
}

impl Node {
    pub fn is_group(&self) -> bool {
        self.flags & FLAG_GROUP != 0 || !self.members.is_empty()
    }

    /// The `ST` status property, when known.
    pub fn status(&self) -> Option<&PropertyValue> {
        self.properties.get(super::PROP_STATUS)
    }
}

impl EntityRecord for Node {
    fn platform() -> Platform {
        Platform::Nodes
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

    fn set_enabled(&mut self, enabled: bool) -> bool {
        self.enabled = enabled;
        true
    }

    fn set_name(&mut self, name: String) {
        self.name = name;
    }
}

// ── Wire documents ───────────────────────────────────────────────────

/// `GET /rest/nodes` response: device nodes plus groups.
#[derive(Debug, Deserialize)]
pub struct NodesDocument {
    #[serde(default, alias = "node")]
    pub nodes: Vec<NodeDocument>,
    #[serde(default, alias = "group")]
    pub groups: Vec<GroupDocument>,
}

#[derive(Debug, Deserialize)]
pub struct NodeDocument {
    pub address: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub parent: Option<String>,
    /// Primary node address of a multi-button device.
    #[serde(default)]
    pub pnode: Option<String>,
    #[serde(default)]
    pub family: Option<serde_json::Value>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub flag: u8,
    #[serde(default)]
    pub property: Vec<PropertyDocument>,
}

#[derive(Debug, Deserialize)]
pub struct GroupDocument {
    pub address: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub flag: u8,
    #[serde(default, alias = "link")]
    pub members: Vec<String>,
}

fn default_enabled() -> bool {
    true
}

/// `GET /rest/status` response: property state per node address.
#[derive(Debug, Deserialize)]
pub struct StatusDocument {
    #[serde(default, alias = "node")]
    pub nodes: Vec<StatusEntry>,
}

#[derive(Debug, Deserialize)]
pub struct StatusEntry {
    pub id: String,
    #[serde(default, alias = "property")]
    pub properties: Vec<PropertyDocument>,
}

/// Fold the node and status documents into records, all stamped with
/// the bulk load's ordering stamp.
pub fn build_nodes(nodes: NodesDocument, status: Option<StatusDocument>, stamp: u64) -> Vec<Node> {
    let mut records: Vec<Node> = Vec::with_capacity(nodes.nodes.len() + nodes.groups.len());

    for doc in nodes.nodes {
        let properties = doc
            .property
            .into_iter()
            .map(|p| (p.id.clone(), p.into_value(stamp)))
            .collect();
        records.push(Node {
            address: Address::new(doc.address),
            name: doc.name,
            parent: doc.parent.map(Address::new),
            primary: doc.pnode.map(Address::new),
            family: doc.family.map(|f| match f {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            }),
            enabled: doc.enabled,
            flags: doc.flag,
            members: Vec::new(),
            properties,
            revision: stamp,
        });
    }

    for doc in nodes.groups {
        records.push(Node {
            address: Address::new(doc.address),
            name: doc.name,
            parent: doc.parent.map(Address::new),
            primary: None,
            family: None,
            enabled: true,
            flags: doc.flag | FLAG_GROUP,
            members: doc.members.into_iter().map(Address::new).collect(),
            properties: HashMap::new(),
            revision: stamp,
        });
    }

    if let Some(status) = status {
        let mut by_address: HashMap<String, usize> = HashMap::with_capacity(records.len());
        for (i, node) in records.iter().enumerate() {
            // Keep the first record when the controller repeats an address.
            by_address.entry(node.address.as_str().to_owned()).or_insert(i);
        }

        for entry in status.nodes {
            let Some(&index) = by_address.get(entry.id.as_str()) else {
                continue;
            };
            if let Some(node) = records.get_mut(index) {
                for p in entry.properties {
                    node.properties.insert(p.id.clone(), p.into_value(stamp));
                }
            }
        }
    }

    records
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PropertyData;
    use pretty_assertions::assert_eq;

    const NODES_JSON: &str = r#"{
        "node": [
            {
                "address": "2E 5C A1 1",
                "name": "Porch Light",
                "parent": "12345",
                "pnode": "2E 5C A1 1",
                "enabled": true,
                "flag": 128,
                "property": [
                    { "id": "ST", "value": 255, "formatted": "On", "uom": "100" }
                ]
            }
        ],
        "group": [
            {
                "address": "10028",
                "name": "Evening Scene",
                "flag": 132,
                "link": ["2E 5C A1 1"]
            }
        ]
    }"#;

    const STATUS_JSON: &str = r#"{
        "node": [
            {
                "id": "2E 5C A1 1",
                "property": [
                    { "id": "OL", "value": "191", "uom": "100", "prec": "0" }
                ]
            },
            { "id": "FF FF FF 1", "property": [{ "id": "ST", "value": 0 }] }
        ]
    }"#;

    #[test]
    fn builds_nodes_groups_and_folds_status() {
        let nodes: NodesDocument = serde_json::from_str(NODES_JSON).expect("nodes");
        let status: StatusDocument = serde_json::from_str(STATUS_JSON).expect("status");
        let records = build_nodes(nodes, Some(status), 7);

        assert_eq!(records.len(), 2);
        let light = &records[0];
        assert_eq!(light.address.as_str(), "2E 5C A1 1");
        assert!(!light.is_group());
        assert_eq!(light.status().map(|p| &p.value), Some(&PropertyData::Int(255)));
        // Status document contributed the on-level property.
        let level = light.properties.get("OL").expect("OL");
        assert_eq!(level.value, PropertyData::Int(191));
        assert_eq!(level.seq, 7);

        let scene = &records[1];
        assert!(scene.is_group());
        assert_eq!(scene.members, vec![Address::from("2E 5C A1 1")]);
    }

    #[test]
    fn status_for_unknown_address_is_skipped() {
        let nodes: NodesDocument = serde_json::from_str(NODES_JSON).expect("nodes");
        let status: StatusDocument = serde_json::from_str(STATUS_JSON).expect("status");
        let records = build_nodes(nodes, Some(status), 1);
        assert!(records.iter().all(|n| n.address.as_str() != "FF FF FF 1"));
    }
}
