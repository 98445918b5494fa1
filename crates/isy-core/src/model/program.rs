// Program and program-folder records from `/rest/programs`.

use std::collections::HashMap;

use serde::Deserialize;

use super::{Address, EntityRecord, Platform, PropertyData, PropertyValue};

/// Property id for the program run status code.
pub const PROP_PROGRAM_STATUS: &str = "status";
/// Property id for the last run timestamp.
pub const PROP_LAST_RUN: &str = "lastRunTime";
/// Property id for the last finish timestamp.
pub const PROP_LAST_FINISH: &str = "lastFinishTime";

/// One program or program folder.
#[derive(Debug, Clone)]
pub struct Program {
    pub address: Address,
    pub name: String,
    pub folder: bool,
    pub parent: Option<Address>,
    pub enabled: bool,
    pub run_at_startup: bool,
    /// Run status plus last run/finish times, as stamped properties.
    pub properties: HashMap<String, PropertyValue>,
    pub revision: u64,
}

impl Program {
    /// The run status code, when known.
    pub fn status(&self) -> Option<i64> {
        self.properties
            .get(PROP_PROGRAM_STATUS)
            .and_then(|p| p.value.as_int())
    }
}

impl EntityRecord for Program {
    fn platform() -> Platform {
        Platform::Programs
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

/// `GET /rest/programs?subfolders=true` response.
#[derive(Debug, Deserialize)]
pub struct ProgramsDocument {
    #[serde(default, alias = "program")]
    pub programs: Vec<ProgramDocument>,
}

#[derive(Debug, Deserialize)]
pub struct ProgramDocument {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub folder: bool,
    #[serde(default, alias = "parentId")]
    pub parent_id: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default, alias = "runAtStartup")]
    pub run_at_startup: bool,
    #[serde(default)]
    pub status: Option<serde_json::Value>,
    #[serde(default, alias = "lastRunTime")]
    pub last_run: Option<String>,
    #[serde(default, alias = "lastFinishTime")]
    pub last_finish: Option<String>,
}

fn default_enabled() -> bool {
    true
}

/// Program ids come zero-padded to four digits on the event stream but
/// not always in the bulk document.
pub(crate) fn normalize_program_id(id: &str) -> String {
    format!("{id:0>4}")
}

/// Convert the bulk document into stamped records.
pub fn build_programs(document: ProgramsDocument, stamp: u64) -> Vec<Program> {
    document
        .programs
        .into_iter()
        .map(|doc| {
            let mut properties = HashMap::new();
            if let Some(status) = doc.status {
                properties.insert(
                    PROP_PROGRAM_STATUS.to_owned(),
                    PropertyValue::new(PropertyData::from_wire(&status), stamp),
                );
            }
            if let Some(run) = doc.last_run {
                properties.insert(
                    PROP_LAST_RUN.to_owned(),
                    PropertyValue::new(PropertyData::from_wire(&serde_json::Value::String(run)), stamp),
                );
            }
            if let Some(finish) = doc.last_finish {
                properties.insert(
                    PROP_LAST_FINISH.to_owned(),
                    PropertyValue::new(
                        PropertyData::from_wire(&serde_json::Value::String(finish)),
                        stamp,
                    ),
                );
            }
            Program {
                address: Address::new(normalize_program_id(&doc.id)),
                name: doc.name,
                folder: doc.folder,
                parent: doc.parent_id.as_deref().map(|p| Address::new(normalize_program_id(p))),
                enabled: doc.enabled,
                run_at_startup: doc.run_at_startup,
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
    fn builds_programs_with_status_properties() {
        let json = r#"{
            "program": [
                {
                    "id": "5A",
                    "name": "Night Lights",
                    "parentId": "1",
                    "enabled": true,
                    "status": 33,
                    "lastRunTime": "2026/08/26 21:00:00",
                    "lastFinishTime": "2026/08/26 21:00:01"
                },
                { "id": "1", "name": "My Programs", "folder": true }
            ]
        }"#;
        let document: ProgramsDocument = serde_json::from_str(json).expect("programs");
        let records = build_programs(document, 3);

        assert_eq!(records.len(), 2);
        let program = &records[0];
        assert_eq!(program.address.as_str(), "005A");
        assert_eq!(program.parent, Some(Address::from("0001")));
        assert_eq!(program.status(), Some(33));
        assert!(program.properties.contains_key(PROP_LAST_RUN));

        let folder = &records[1];
        assert!(folder.folder);
        assert!(folder.properties.is_empty());
    }

    #[test]
    fn program_ids_are_zero_padded() {
        assert_eq!(normalize_program_id("5A"), "005A");
        assert_eq!(normalize_program_id("01AB"), "01AB");
    }
}
