//! The data-plane seam.
//!
//! The coordination core does not own a key-value engine. Everything it
//! needs from one — the slot→keys index, replication targeting, client
//! pausing — goes through the [`DataPlane`] trait. The host wires in the
//! real engine; tests and the demo server use [`MemoryDataPlane`].

use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;

use crate::slots::key_slot;

/// Operations the cluster core requires from the attached key-value engine
/// and its replication layer.
pub trait DataPlane {
    /// Number of keys currently stored in a slot.
    fn count_keys_in_slot(&self, slot: u16) -> usize;

    /// Up to `max` keys from a slot, for GETKEYSINSLOT and reshard tooling.
    fn keys_in_slot(&self, slot: u16, max: usize) -> Vec<Bytes>;

    /// Deletes every key in a slot, returning how many were removed. Called
    /// when slot ownership moves away while keys are still present.
    fn del_keys_in_slot(&mut self, slot: u16) -> usize;

    /// Drops the entire keyspace. Used when a replica is repurposed.
    fn flush_all(&mut self);

    /// Whether a key exists, for the ASK/TRYAGAIN missing-key checks.
    fn contains_key(&self, key: &[u8]) -> bool;

    /// Points replication at a new master.
    fn set_replication_master(&mut self, host: &str, port: u16);

    /// Detaches replication; this node serves its own data again.
    fn unset_replication_master(&mut self);

    /// Whether a replication target is currently configured.
    fn replication_master_set(&self) -> bool;

    /// The replication offset this node has processed (replica view) or
    /// produced (master view).
    fn replication_offset(&self) -> u64;

    /// Milliseconds since the last interaction with the master's
    /// replication stream. Bounds how stale a replica's data may be before
    /// it abstains from elections.
    fn master_link_age_ms(&self, now: u64) -> u64;

    /// Stops serving client writes until the deadline, for the manual
    /// failover offset sync.
    fn pause_clients(&mut self, deadline: u64);
}

/// In-memory [`DataPlane`]: a tiny string keyspace indexed per slot.
///
/// Backs the unit and integration tests and the standalone demo server.
/// Offsets and master-contact times are plain setters so tests can model
/// replication lag directly.
#[derive(Default)]
pub struct MemoryDataPlane {
    slots: HashMap<u16, BTreeMap<Bytes, Bytes>>,
    master: Option<(String, u16)>,
    offset: u64,
    last_master_contact: u64,
    paused_until: u64,
}

impl MemoryDataPlane {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a value.
    pub fn set(&mut self, key: impl Into<Bytes>, value: impl Into<Bytes>) {
        let key = key.into();
        self.slots
            .entry(key_slot(&key))
            .or_default()
            .insert(key, value.into());
    }

    /// Fetches a value.
    pub fn get(&self, key: &[u8]) -> Option<Bytes> {
        self.slots.get(&key_slot(key))?.get(key).cloned()
    }

    /// Inserts a key with an empty value (index-only helper for tests).
    pub fn add_key(&mut self, key: impl Into<Bytes>) {
        self.set(key, Bytes::new());
    }

    /// Removes a key.
    pub fn remove_key(&mut self, key: &[u8]) -> bool {
        let slot = key_slot(key);
        match self.slots.get_mut(&slot) {
            Some(map) => map.remove(key).is_some(),
            None => false,
        }
    }

    /// The replication target currently in effect, if any.
    pub fn master(&self) -> Option<(&str, u16)> {
        self.master.as_ref().map(|(h, p)| (h.as_str(), *p))
    }

    pub fn set_offset(&mut self, offset: u64) {
        self.offset = offset;
    }

    pub fn set_master_contact(&mut self, now: u64) {
        self.last_master_contact = now;
    }

    pub fn paused_until(&self) -> u64 {
        self.paused_until
    }
}

impl DataPlane for MemoryDataPlane {
    fn count_keys_in_slot(&self, slot: u16) -> usize {
        self.slots.get(&slot).map_or(0, |s| s.len())
    }

    fn keys_in_slot(&self, slot: u16, max: usize) -> Vec<Bytes> {
        self.slots
            .get(&slot)
            .map(|s| s.keys().take(max).cloned().collect())
            .unwrap_or_default()
    }

    fn del_keys_in_slot(&mut self, slot: u16) -> usize {
        self.slots.remove(&slot).map_or(0, |s| s.len())
    }

    fn flush_all(&mut self) {
        self.slots.clear();
    }

    fn contains_key(&self, key: &[u8]) -> bool {
        self.slots
            .get(&key_slot(key))
            .is_some_and(|s| s.contains_key(key))
    }

    fn set_replication_master(&mut self, host: &str, port: u16) {
        self.master = Some((host.to_string(), port));
    }

    fn unset_replication_master(&mut self) {
        self.master = None;
    }

    fn replication_master_set(&self) -> bool {
        self.master.is_some()
    }

    fn replication_offset(&self) -> u64 {
        self.offset
    }

    fn master_link_age_ms(&self, now: u64) -> u64 {
        now.saturating_sub(self.last_master_contact)
    }

    fn pause_clients(&mut self, deadline: u64) {
        self.paused_until = deadline;
    }
}
