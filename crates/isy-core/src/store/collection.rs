// ── Reactive entity collection with snapshot/delta reconciliation ──
//
// `DashMap` storage for lock-free reads, one sync mutation lock
// serializing `bulk_merge` against `apply_property` (never held across
// an await), `watch` snapshots for whole-collection consumers, and
// per-mutation change fan-out.
//
// Ordering: every write carries a registry stamp. Bulk loads stamp at
// request begin and apply on `>=`; stream deltas stamp at arrival and
// apply on `>`, so replaying an already-seen delta is a no-op and a
// slow snapshot never overwrites deltas that arrived while it was in
// flight.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use super::notify::ChangeFanout;
pub use super::notify::SubscriptionHandle;
use crate::model::{Address, EntityChange, EntityRecord, PropertyValue};

/// Deltas buffered per collection for addresses not yet loaded.
pub const PENDING_DELTA_LIMIT: usize = 64;

/// Result of reconciling one bulk snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MergeOutcome {
    pub created: usize,
    pub updated: usize,
    /// Records whose structure was outranked by newer deltas.
    pub stale: usize,
}

/// Result of applying one stream delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaOutcome {
    Applied,
    /// The stored value carried an equal or newer stamp.
    IgnoredStale,
    /// No record at that address yet; the delta was buffered (or
    /// dropped, past the buffer bound).
    UnknownAddress,
}

struct PendingDelta {
    address: Address,
    property: String,
    value: PropertyValue,
}

/// A reactive collection for a single entity platform.
pub struct EntityCollection<T: EntityRecord> {
    records: DashMap<Address, Arc<T>>,
    /// Serializes reconciliation. Sync-only; never held across awaits.
    mutation: Mutex<()>,
    pending: Mutex<VecDeque<PendingDelta>>,
    snapshot: watch::Sender<Arc<Vec<Arc<T>>>>,
    fanout: ChangeFanout,
}

impl<T: EntityRecord> EntityCollection<T> {
    pub(crate) fn new() -> Self {
        let (snapshot, _) = watch::channel(Arc::new(Vec::new()));
        Self {
            records: DashMap::new(),
            mutation: Mutex::new(()),
            pending: Mutex::new(VecDeque::new()),
            snapshot,
            fanout: ChangeFanout::new(),
        }
    }

    // ── Reads ────────────────────────────────────────────────────────

    pub fn get(&self, address: &Address) -> Option<Arc<T>> {
        self.records.get(address).map(|r| Arc::clone(r.value()))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn addresses(&self) -> Vec<Address> {
        self.records.iter().map(|r| r.key().clone()).collect()
    }

    /// Current snapshot (cheap `Arc` clone).
    pub fn snapshot(&self) -> Arc<Vec<Arc<T>>> {
        self.snapshot.borrow().clone()
    }

    /// Subscribe to whole-collection snapshots via a `watch` channel.
    pub fn subscribe_snapshot(&self) -> watch::Receiver<Arc<Vec<Arc<T>>>> {
        self.snapshot.subscribe()
    }

    /// Subscribe to per-record change notifications, optionally
    /// filtered to one address.
    pub fn subscribe(
        &self,
        filter: Option<Address>,
    ) -> (SubscriptionHandle, mpsc::Receiver<Arc<EntityChange>>) {
        self.fanout.subscribe(filter)
    }

    pub fn unsubscribe(&self, handle: SubscriptionHandle) {
        self.fanout.unsubscribe(handle);
    }

    #[cfg(test)]
    pub(crate) fn pending_len(&self) -> usize {
        self.lock_pending().len()
    }

    // ── Mutations ────────────────────────────────────────────────────

    /// Reconcile a bulk snapshot stamped at request begin.
    ///
    /// Structure applies when `stamp >= revision`; each property applies
    /// when `stamp >= property.seq`. New records replay any buffered
    /// deltas for their address, which win only if still newest.
    pub fn bulk_merge(&self, records: Vec<T>, stamp: u64) -> MergeOutcome {
        let _guard = self.lock_mutation();
        let mut outcome = MergeOutcome::default();

        for incoming in records {
            let address = incoming.address().clone();
            match self.records.get(&address).map(|r| Arc::clone(r.value())) {
                None => {
                    let mut record = incoming;
                    self.replay_pending(&address, &mut record);
                    self.records.insert(address.clone(), Arc::new(record));
                    outcome.created += 1;
                    self.publish_record_change(&address);
                }
                Some(stored) => {
                    let (merged, structure_applied) = merge_records(&stored, incoming, stamp);
                    if structure_applied {
                        outcome.updated += 1;
                    } else {
                        outcome.stale += 1;
                    }
                    self.records.insert(address.clone(), Arc::new(merged));
                    self.publish_record_change(&address);
                }
            }
        }

        self.rebuild_snapshot();
        debug!(
            platform = %T::platform(),
            stamp,
            created = outcome.created,
            updated = outcome.updated,
            stale = outcome.stale,
            "bulk merge complete"
        );
        outcome
    }

    /// Apply one stream delta. `value.seq` is the delta's arrival stamp
    /// and must outrank the stored property (`>`) to apply.
    pub fn apply_property(
        &self,
        address: &Address,
        property: &str,
        value: PropertyValue,
    ) -> DeltaOutcome {
        let _guard = self.lock_mutation();

        let Some(stored) = self.records.get(address).map(|r| Arc::clone(r.value())) else {
            self.buffer_pending(address, property, value);
            return DeltaOutcome::UnknownAddress;
        };

        if let Some(existing) = stored.properties().get(property) {
            if value.seq <= existing.seq {
                return DeltaOutcome::IgnoredStale;
            }
        }

        let old = stored.properties().get(property).cloned();
        let mut updated = (*stored).clone();
        updated
            .properties_mut()
            .insert(property.to_owned(), value.clone());
        self.records.insert(address.clone(), Arc::new(updated));
        self.rebuild_snapshot();
        self.fanout.publish(&Arc::new(EntityChange {
            platform: T::platform(),
            address: address.clone(),
            property: Some(property.to_owned()),
            old,
            new: Some(value),
            timestamp: Utc::now(),
        }));
        DeltaOutcome::Applied
    }

    /// Toggle the enabled flag from a node-changed event. Applies only
    /// when the delta stamp outranks the record revision.
    pub fn set_enabled(&self, address: &Address, enabled: bool, stamp: u64) -> DeltaOutcome {
        self.update_structure(address, stamp, |record| record.set_enabled(enabled))
    }

    /// Rename a record from a node-renamed event.
    pub fn rename(&self, address: &Address, name: String, stamp: u64) -> DeltaOutcome {
        self.update_structure(address, stamp, |record| {
            record.set_name(name.clone());
            true
        })
    }

    /// Remove a record (node-removed events). Pending deltas for the
    /// address are discarded with it.
    pub fn remove(&self, address: &Address) -> Option<Arc<T>> {
        let _guard = self.lock_mutation();
        let removed = self.records.remove(address).map(|(_, record)| record);
        if removed.is_some() {
            self.lock_pending().retain(|p| p.address != *address);
            self.rebuild_snapshot();
            self.publish_record_change(address);
        }
        removed
    }

    // ── Internals ────────────────────────────────────────────────────

    fn update_structure(
        &self,
        address: &Address,
        stamp: u64,
        mutate: impl FnOnce(&mut T) -> bool,
    ) -> DeltaOutcome {
        let _guard = self.lock_mutation();
        let Some(stored) = self.records.get(address).map(|r| Arc::clone(r.value())) else {
            return DeltaOutcome::UnknownAddress;
        };
        if stamp <= stored.revision() {
            return DeltaOutcome::IgnoredStale;
        }
        let mut updated = (*stored).clone();
        if !mutate(&mut updated) {
            return DeltaOutcome::IgnoredStale;
        }
        updated.set_revision(stamp);
        self.records.insert(address.clone(), Arc::new(updated));
        self.rebuild_snapshot();
        self.publish_record_change(address);
        DeltaOutcome::Applied
    }

    fn buffer_pending(&self, address: &Address, property: &str, value: PropertyValue) {
        let mut pending = self.lock_pending();
        if pending.len() >= PENDING_DELTA_LIMIT {
            warn!(
                platform = %T::platform(),
                address = %address,
                property,
                "pending delta buffer full, dropping delta for unknown address"
            );
            return;
        }
        debug!(
            platform = %T::platform(),
            address = %address,
            property,
            "buffering delta for address not yet loaded"
        );
        pending.push_back(PendingDelta {
            address: address.clone(),
            property: property.to_owned(),
            value,
        });
    }

    /// Drain buffered deltas for a newly created record, applying each
    /// only if it still outranks the stored property.
    fn replay_pending(&self, address: &Address, record: &mut T) {
        let mut pending = self.lock_pending();
        let mut index = 0;
        while index < pending.len() {
            if pending.get(index).is_some_and(|p| p.address == *address) {
                if let Some(delta) = pending.remove(index) {
                    let newest = record
                        .properties()
                        .get(&delta.property)
                        .is_none_or(|existing| delta.value.seq > existing.seq);
                    if newest {
                        record.properties_mut().insert(delta.property, delta.value);
                    }
                }
            } else {
                index += 1;
            }
        }
    }

    fn publish_record_change(&self, address: &Address) {
        self.fanout.publish(&Arc::new(EntityChange {
            platform: T::platform(),
            address: address.clone(),
            property: None,
            old: None,
            new: None,
            timestamp: Utc::now(),
        }));
    }

    fn rebuild_snapshot(&self) {
        let values: Vec<Arc<T>> = self.records.iter().map(|r| Arc::clone(r.value())).collect();
        // `send_modify` updates unconditionally, even with zero receivers.
        self.snapshot.send_modify(|snap| *snap = Arc::new(values));
    }

    fn lock_mutation(&self) -> MutexGuard<'_, ()> {
        self.mutation
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn lock_pending(&self) -> MutexGuard<'_, VecDeque<PendingDelta>> {
        self.pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Merge an incoming bulk record over the stored one. Returns the
/// merged record and whether the structure was applied (stamp outranked
/// the stored revision).
fn merge_records<T: EntityRecord>(stored: &Arc<T>, incoming: T, stamp: u64) -> (T, bool) {
    if stamp >= stored.revision() {
        // Fresh structure; keep only stored properties that a delta has
        // already pushed past this snapshot.
        let mut merged = incoming;
        merged.set_revision(stamp);
        for (name, property) in stored.properties() {
            if property.seq > stamp {
                merged
                    .properties_mut()
                    .insert(name.clone(), property.clone());
            }
        }
        (merged, true)
    } else {
        // Stale structure; still fold in properties the stored record
        // has no newer value for.
        let mut merged = (**stored).clone();
        for (name, property) in incoming.properties() {
            let apply = merged
                .properties()
                .get(name)
                .is_none_or(|existing| stamp >= existing.seq);
            if apply {
                merged
                    .properties_mut()
                    .insert(name.clone(), property.clone());
            }
        }
        (merged, false)
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::model::{Node, PropertyData};
    use pretty_assertions::assert_eq;

    fn node(address: &str, stamp: u64, status: i64) -> Node {
        let mut properties = HashMap::new();
        properties.insert(
            "ST".to_owned(),
            PropertyValue::new(PropertyData::Int(status), stamp),
        );
        Node {
            address: Address::from(address),
            name: format!("Node {address}"),
            parent: None,
            primary: None,
            family: None,
            enabled: true,
            flags: 0,
            members: Vec::new(),
            properties,
            revision: stamp,
        }
    }

    fn delta(value: i64, seq: u64) -> PropertyValue {
        PropertyValue::new(PropertyData::Int(value), seq)
    }

    fn status_of(collection: &EntityCollection<Node>, address: &str) -> Option<i64> {
        collection
            .get(&Address::from(address))
            .and_then(|n| n.properties.get("ST").and_then(|p| p.value.as_int()))
    }

    #[test]
    fn bulk_then_newer_delta_applies() {
        let collection = EntityCollection::new();
        collection.bulk_merge(vec![node("A", 1, 0)], 1);

        let outcome = collection.apply_property(&Address::from("A"), "ST", delta(255, 2));
        assert_eq!(outcome, DeltaOutcome::Applied);
        assert_eq!(status_of(&collection, "A"), Some(255));
    }

    #[test]
    fn stale_bulk_does_not_overwrite_newer_delta() {
        let collection = EntityCollection::new();
        collection.bulk_merge(vec![node("A", 1, 0)], 1);
        // Delta arrives while a refresh is in flight (refresh stamped 2
        // at begin, delta stamped 3 at arrival).
        collection.apply_property(&Address::from("A"), "ST", delta(255, 3));

        let outcome = collection.bulk_merge(vec![node("A", 2, 100)], 2);
        assert_eq!(outcome.updated, 1);
        // Converges to the max-stamp value.
        assert_eq!(status_of(&collection, "A"), Some(255));
    }

    #[test]
    fn bulk_replay_at_equal_stamp_applies() {
        let collection = EntityCollection::new();
        collection.bulk_merge(vec![node("A", 2, 10)], 2);
        // A retried snapshot with the same begin stamp may legitimately
        // repeat; bulk applies on >=.
        let outcome = collection.bulk_merge(vec![node("A", 2, 20)], 2);
        assert_eq!(outcome.updated, 1);
        assert_eq!(status_of(&collection, "A"), Some(20));
    }

    #[test]
    fn identical_delta_replay_is_a_no_op() {
        let collection = EntityCollection::new();
        collection.bulk_merge(vec![node("A", 1, 0)], 1);

        assert_eq!(
            collection.apply_property(&Address::from("A"), "ST", delta(255, 2)),
            DeltaOutcome::Applied
        );
        assert_eq!(
            collection.apply_property(&Address::from("A"), "ST", delta(255, 2)),
            DeltaOutcome::IgnoredStale
        );
    }

    #[test]
    fn early_delta_is_buffered_and_replayed_iff_newest() {
        let collection: EntityCollection<Node> = EntityCollection::new();

        // Two early deltas: one newer than the coming bulk, one older.
        assert_eq!(
            collection.apply_property(&Address::from("A"), "ST", delta(255, 5)),
            DeltaOutcome::UnknownAddress
        );
        assert_eq!(
            collection.apply_property(&Address::from("B"), "ST", delta(9, 1)),
            DeltaOutcome::UnknownAddress
        );
        assert_eq!(collection.pending_len(), 2);

        collection.bulk_merge(vec![node("A", 3, 0), node("B", 3, 0)], 3);
        assert_eq!(collection.pending_len(), 0);
        // A's delta (stamp 5) outranks the bulk (stamp 3); B's does not.
        assert_eq!(status_of(&collection, "A"), Some(255));
        assert_eq!(status_of(&collection, "B"), Some(0));
    }

    #[test]
    fn pending_buffer_is_bounded() {
        let collection: EntityCollection<Node> = EntityCollection::new();
        for i in 0..PENDING_DELTA_LIMIT {
            let address = Address::new(format!("N{i}"));
            collection.apply_property(&address, "ST", delta(1, i as u64 + 1));
        }
        assert_eq!(collection.pending_len(), PENDING_DELTA_LIMIT);

        // The 65th is dropped, not buffered.
        collection.apply_property(&Address::from("OVERFLOW"), "ST", delta(1, 99));
        assert_eq!(collection.pending_len(), PENDING_DELTA_LIMIT);

        collection.bulk_merge(vec![node("OVERFLOW", 100, 0)], 100);
        assert_eq!(status_of(&collection, "OVERFLOW"), Some(0));
    }

    #[test]
    fn enabled_toggle_outranks_older_bulk_only() {
        let collection = EntityCollection::new();
        collection.bulk_merge(vec![node("A", 1, 0)], 1);

        assert_eq!(
            collection.set_enabled(&Address::from("A"), false, 3),
            DeltaOutcome::Applied
        );
        // A stale refresh (stamped before the toggle arrived) must not
        // resurrect the enabled flag.
        collection.bulk_merge(vec![node("A", 2, 50)], 2);
        let record = collection.get(&Address::from("A")).expect("record");
        assert!(!record.enabled);
        // Its properties still applied where not outranked.
        assert_eq!(status_of(&collection, "A"), Some(50));

        assert_eq!(
            collection.set_enabled(&Address::from("A"), true, 2),
            DeltaOutcome::IgnoredStale
        );
    }

    #[test]
    fn remove_discards_record_and_pending() {
        let collection = EntityCollection::new();
        collection.bulk_merge(vec![node("A", 1, 0)], 1);
        assert!(collection.remove(&Address::from("A")).is_some());
        assert!(collection.is_empty());
        assert!(collection.remove(&Address::from("A")).is_none());
    }

    #[tokio::test]
    async fn mutations_notify_subscribers() {
        let collection = EntityCollection::new();
        let (_handle, mut rx) = collection.subscribe(None);

        collection.bulk_merge(vec![node("A", 1, 0)], 1);
        let created = rx.recv().await.expect("created");
        assert_eq!(created.address.as_str(), "A");
        assert_eq!(created.property, None);

        collection.apply_property(&Address::from("A"), "ST", delta(255, 2));
        let changed = rx.recv().await.expect("changed");
        assert_eq!(changed.property.as_deref(), Some("ST"));
        assert_eq!(
            changed.new.as_ref().map(|p| &p.value),
            Some(&PropertyData::Int(255))
        );
        assert_eq!(
            changed.old.as_ref().map(|p| &p.value),
            Some(&PropertyData::Int(0))
        );
    }

    #[test]
    fn snapshot_watch_reflects_mutations() {
        let collection = EntityCollection::new();
        let rx = collection.subscribe_snapshot();
        assert!(rx.borrow().is_empty());

        collection.bulk_merge(vec![node("A", 1, 0), node("B", 1, 0)], 1);
        assert_eq!(rx.borrow().len(), 2);
        assert_eq!(collection.snapshot().len(), 2);
    }
}
