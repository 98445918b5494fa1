// Network resource records, from `/rest/networking/resources`.
// Only present when the networking module is installed.

use std::collections::HashMap;

use serde::Deserialize;

use super::{Address, EntityRecord, Platform, PropertyValue};

/// One network resource (a stored HTTP/TCP command the controller can
/// fire on demand).
#[derive(Debug, Clone)]
pub struct NetworkResource {
    pub address: Address,
    pub id: u32,
    pub name: String,
    pub properties: HashMap<String, PropertyValue>,
    pub revision: u64,
}

impl EntityRecord for NetworkResource {
    fn platform() -> Platform {
        Platform::NetworkResources
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

/// `GET /rest/networking/resources` response.
#[derive(Debug, Deserialize)]
pub struct NetworkResourcesDocument {
    #[serde(default, alias = "NetRule")]
    pub resources: Vec<NetworkResourceDocument>,
}

#[derive(Debug, Deserialize)]
pub struct NetworkResourceDocument {
    pub id: u32,
    #[serde(default)]
    pub name: String,
}

impl NetworkResourcesDocument {
    /// Convert into stamped records.
    pub fn into_records(self, stamp: u64) -> Vec<NetworkResource> {
        self.resources
            .into_iter()
            .map(|doc| NetworkResource {
                address: Address::new(doc.id.to_string()),
                id: doc.id,
                name: doc.name,
                properties: HashMap::new(),
                revision: stamp,
            })
            .collect()
    }
}
