// ── Central reactive registry ──
//
// One collection per platform plus the shared ordering stamp. Bulk
// loaders take a stamp when the load begins; the router stamps each
// delta at arrival. The stamp source is registry-wide so bulk and delta
// writes across platforms are totally ordered.

pub mod collection;
mod notify;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::watch;

pub use collection::{DeltaOutcome, EntityCollection, MergeOutcome, PENDING_DELTA_LIMIT};
pub use notify::SubscriptionHandle;

use crate::model::{Address, NetworkResource, Node, Program, SystemStatus, Variable};
use crate::stream::EntityStream;

/// Central reactive store for all controller entities.
pub struct Registry {
    nodes: EntityCollection<Node>,
    programs: EntityCollection<Program>,
    variables: EntityCollection<Variable>,
    network_resources: EntityCollection<NetworkResource>,
    stamp: AtomicU64,
    system_status: watch::Sender<SystemStatus>,
}

impl Registry {
    pub fn new() -> Self {
        let (system_status, _) = watch::channel(SystemStatus::Unknown);
        Self {
            nodes: EntityCollection::new(),
            programs: EntityCollection::new(),
            variables: EntityCollection::new(),
            network_resources: EntityCollection::new(),
            stamp: AtomicU64::new(0),
            system_status,
        }
    }

    /// Take the next ordering stamp. Monotonic across the registry.
    pub fn next_stamp(&self) -> u64 {
        self.stamp.fetch_add(1, Ordering::SeqCst) + 1
    }

    // ── Collections ──────────────────────────────────────────────────

    pub fn nodes(&self) -> &EntityCollection<Node> {
        &self.nodes
    }

    pub fn programs(&self) -> &EntityCollection<Program> {
        &self.programs
    }

    pub fn variables(&self) -> &EntityCollection<Variable> {
        &self.variables
    }

    pub fn network_resources(&self) -> &EntityCollection<NetworkResource> {
        &self.network_resources
    }

    // ── Node hierarchy ───────────────────────────────────────────────

    /// Nodes whose parent is `address`.
    pub fn children_of(&self, address: &Address) -> Vec<Arc<Node>> {
        self.nodes
            .snapshot()
            .iter()
            .filter(|n| n.parent.as_ref() == Some(address))
            .map(Arc::clone)
            .collect()
    }

    /// Groups (scenes) that include `address` as a member.
    pub fn groups_containing(&self, address: &Address) -> Vec<Arc<Node>> {
        self.nodes
            .snapshot()
            .iter()
            .filter(|n| n.members.contains(address))
            .map(Arc::clone)
            .collect()
    }

    // ── System status ────────────────────────────────────────────────

    pub fn system_status(&self) -> SystemStatus {
        *self.system_status.borrow()
    }

    pub fn subscribe_system_status(&self) -> watch::Receiver<SystemStatus> {
        self.system_status.subscribe()
    }

    pub(crate) fn set_system_status(&self, status: SystemStatus) {
        self.system_status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }

    // ── Streams ──────────────────────────────────────────────────────

    pub fn stream_nodes(&self) -> EntityStream<Node> {
        EntityStream::new(self.nodes.subscribe_snapshot())
    }

    pub fn stream_programs(&self) -> EntityStream<Program> {
        EntityStream::new(self.programs.subscribe_snapshot())
    }

    pub fn stream_variables(&self) -> EntityStream<Variable> {
        EntityStream::new(self.variables.subscribe_snapshot())
    }

    pub fn stream_network_resources(&self) -> EntityStream<NetworkResource> {
        EntityStream::new(self.network_resources.subscribe_snapshot())
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use pretty_assertions::assert_eq;

    fn node(address: &str, parent: Option<&str>, members: &[&str]) -> Node {
        Node {
            address: Address::from(address),
            name: address.to_owned(),
            parent: parent.map(Address::from),
            primary: None,
            family: None,
            enabled: true,
            flags: if members.is_empty() { 0 } else { 0x04 },
            members: members.iter().map(|m| Address::from(*m)).collect(),
            properties: HashMap::new(),
            revision: 1,
        }
    }

    #[test]
    fn stamps_are_monotonic() {
        let registry = Registry::new();
        let a = registry.next_stamp();
        let b = registry.next_stamp();
        assert!(b > a);
    }

    #[test]
    fn hierarchy_queries() {
        let registry = Registry::new();
        registry.nodes().bulk_merge(
            vec![
                node("FOLDER", None, &[]),
                node("LIGHT 1", Some("FOLDER"), &[]),
                node("LIGHT 2", Some("FOLDER"), &[]),
                node("SCENE", None, &["LIGHT 1"]),
            ],
            1,
        );

        let children = registry.children_of(&Address::from("FOLDER"));
        assert_eq!(children.len(), 2);

        let scenes = registry.groups_containing(&Address::from("LIGHT 1"));
        assert_eq!(scenes.len(), 1);
        assert_eq!(scenes[0].address.as_str(), "SCENE");
    }

    #[test]
    fn system_status_watch_deduplicates() {
        let registry = Registry::new();
        let mut rx = registry.subscribe_system_status();
        assert_eq!(registry.system_status(), SystemStatus::Unknown);

        registry.set_system_status(SystemStatus::Busy);
        assert!(rx.has_changed().expect("live"));
        assert_eq!(*rx.borrow_and_update(), SystemStatus::Busy);

        registry.set_system_status(SystemStatus::Busy);
        assert!(!rx.has_changed().expect("live"));
    }
}
