//! The sighting store: the recent-sightings set and tracked-object queue
//! behind one mutex, per spec §4.7.
//!
//! Grounded on `examples/original_source/src/LBeacon.c`'s
//! `check_is_in_list`/`zigbee_free_list` admission logic, reworked to use
//! [`crate::slab::Slab`] + [`crate::list::List`] instead of raw pointer
//! lists, and a side [`std::collections::HashMap`] for O(1) address lookup
//! where the original did a linear scan — an engineering improvement the
//! arena+index design (spec §9) makes natural to add.

use std::collections::HashMap;

use crate::{
    address::MacAddress,
    list::List,
    record::{DeviceKind, Payload, RecentHook, SightingRecord, TrackedHook},
    slab::Slab,
};

/// Tunable parameters for a [`SightingStore`], sourced from [`crate::config::Config`].
#[derive(Clone, Copy, Debug)]
pub struct StoreConfig {
    /// Capacity of the sighting slab (spec §4.1).
    pub slab_capacity: usize,
    /// Maximum length of the tracked-object queue before the oldest entry
    /// is evicted (spec §4.7's overflow rule).
    pub tracked_queue_capacity: usize,
    /// Silence window after which a record is evicted from the
    /// recent-sightings set (spec §3).
    pub silence_timeout_ms: u64,
    /// Slab usage fraction at or above which `cleanup()` runs inline before
    /// a new admission (spec §4.7; default 0.70 per
    /// `original_source/src/LBeacon.h`'s `MEMPOOL_USAGE_THRESHOLD`).
    pub mempool_usage_threshold: f64,
}

/// Counters for sightings that could not be admitted or retained, per
/// spec §7 (`StoreFull` is "never fatal", just counted).
#[derive(Clone, Copy, Debug, Default)]
pub struct StoreMetrics {
    pub dropped_store_full: u64,
    pub dropped_tracked_overflow: u64,
}

/// A snapshot of the fields of a record drained for upload (spec §4.7's
/// `drain_for_upload`). Detached from the store so the gateway session can
/// serialize it without holding the store mutex across the UDP syscall
/// (spec §5: "Never hold the store mutex across a syscall").
#[derive(Clone, Debug)]
pub struct UploadRecord {
    pub address: MacAddress,
    pub kind: DeviceKind,
    pub first_seen_ms: u64,
    pub last_seen_ms: u64,
    pub rssi: i8,
    pub button_pressed: Option<bool>,
    pub battery_voltage: Option<u8>,
    pub payload: Payload,
}

impl From<&SightingRecord> for UploadRecord {
    fn from(rec: &SightingRecord) -> Self {
        Self {
            address: rec.address,
            kind: rec.kind,
            first_seen_ms: rec.first_seen_ms,
            last_seen_ms: rec.last_seen_ms,
            rssi: rec.rssi,
            button_pressed: rec.button_pressed,
            battery_voltage: rec.battery_voltage,
            payload: rec.payload.clone(),
        }
    }
}

/// Outcome of an `observe_*` admission (spec §4.7).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObserveOutcome {
    /// A new record was created.
    Inserted,
    /// An existing record's last-seen/RSSI/flags were refreshed.
    Updated,
    /// The slab was full; the sighting was dropped.
    Dropped,
}

/// The two linked lists and backing slab described in spec §4.7, guarded
/// by a single lock at the call site (the type itself is `!Sync` by
/// default; callers wrap it in a `std::sync::Mutex`, matching spec §5's
/// "State behind one mutex").
pub struct SightingStore {
    config: StoreConfig,
    slab: Slab<SightingRecord>,
    recent: List<SightingRecord, RecentHook>,
    tracked: List<SightingRecord, TrackedHook>,
    recent_index: HashMap<MacAddress, crate::slab::SlotId>,
    metrics: StoreMetrics,
}

impl SightingStore {
    /// Creates an empty store with the given configuration.
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            slab: Slab::with_capacity(config.slab_capacity),
            recent: List::new(),
            tracked: List::new(),
            recent_index: HashMap::new(),
            metrics: StoreMetrics::default(),
        }
    }

    /// Current drop counters.
    pub fn metrics(&self) -> StoreMetrics {
        self.metrics
    }

    /// Number of records linked into the recent-sightings set.
    pub fn recent_len(&self) -> usize {
        self.recent.len()
    }

    /// Number of records linked into the tracked-object queue.
    pub fn tracked_len(&self) -> usize {
        self.tracked.len()
    }

    /// Admits a BR/EDR sighting (spec §4.7).
    pub fn observe_br(&mut self, address: MacAddress, rssi: i8, now_ms: u64) -> ObserveOutcome {
        self.observe(address, DeviceKind::BrEdr, rssi, now_ms, None, None, Payload::default())
    }

    /// Admits a BLE sighting, with optional button/battery flags and the
    /// most recent advertising payload (spec §4.6, §4.7).
    pub fn observe_ble(
        &mut self, address: MacAddress, rssi: i8, now_ms: u64, button_pressed: Option<bool>,
        battery_voltage: Option<u8>, payload: Payload,
    ) -> ObserveOutcome {
        self.observe(address, DeviceKind::Ble, rssi, now_ms, button_pressed, battery_voltage, payload)
    }

    #[allow(clippy::too_many_arguments)]
    fn observe(
        &mut self, address: MacAddress, kind: DeviceKind, rssi: i8, now_ms: u64, button_pressed: Option<bool>,
        battery_voltage: Option<u8>, payload: Payload,
    ) -> ObserveOutcome {
        if let Some(&id) = self.recent_index.get(&address) {
            let rec = self.slab.get_mut(id);
            rec.observe_again(now_ms, rssi);
            if button_pressed.is_some() {
                rec.button_pressed = button_pressed;
            }
            if battery_voltage.is_some() {
                rec.battery_voltage = battery_voltage;
            }
            if !payload.as_bytes().is_empty() {
                rec.payload = payload;
            }

            if !self.tracked.is_linked(&self.slab, id) {
                self.push_tracked(id);
            }
            return ObserveOutcome::Updated;
        }

        if self.slab.usage() >= self.config.mempool_usage_threshold {
            self.cleanup(now_ms);
        }

        let mut rec = SightingRecord::new_observed(address, kind, now_ms, rssi);
        rec.button_pressed = button_pressed;
        rec.battery_voltage = battery_voltage;
        rec.payload = payload;

        let Some(id) = self.slab.acquire(rec) else {
            self.metrics.dropped_store_full += 1;
            return ObserveOutcome::Dropped;
        };

        self.recent.insert_head(&mut self.slab, id);
        self.recent_index.insert(address, id);
        self.push_tracked(id);

        ObserveOutcome::Inserted
    }

    /// Pushes `id` onto the tail of the tracked-object queue, evicting the
    /// oldest entry first if the queue is already at capacity (spec §4.7).
    fn push_tracked(&mut self, id: crate::slab::SlotId) {
        if self.tracked.len() >= self.config.tracked_queue_capacity {
            if let Some(evicted) = self.tracked.pop_head(&mut self.slab) {
                self.metrics.dropped_tracked_overflow += 1;
                if !self.recent.is_linked(&self.slab, evicted) {
                    self.slab.release(evicted);
                }
            }
        }
        self.tracked.insert_tail(&mut self.slab, id);
    }

    /// Pops up to `max_n` records from the head of the tracked-object
    /// queue and returns a stable snapshot of each (spec §4.7). Records
    /// remain in the recent-sightings set until [`Self::cleanup`] evicts
    /// them.
    pub fn drain_for_upload(&mut self, max_n: usize) -> Vec<UploadRecord> {
        let mut out = Vec::with_capacity(max_n.min(self.tracked.len()));
        for _ in 0..max_n {
            let Some(id) = self.tracked.pop_head(&mut self.slab) else { break };
            out.push(UploadRecord::from(self.slab.get(id)));
            if !self.recent.is_linked(&self.slab, id) {
                self.slab.release(id);
            }
        }
        out
    }

    /// Evicts every record whose silence window has elapsed, freeing slab
    /// slots that are unlinked from both lists afterward (spec §4.7).
    /// Returns the number of records evicted.
    pub fn cleanup(&mut self, now_ms: u64) -> usize {
        let timeout = self.config.silence_timeout_ms;
        let mut to_release = Vec::new();

        {
            let recent_index = &mut self.recent_index;
            let tracked = &self.tracked;
            self.recent.retain(&mut self.slab, |slab, id| {
                let rec = slab.get(id);
                if now_ms.saturating_sub(rec.last_seen_ms) <= timeout {
                    true
                } else {
                    recent_index.remove(&rec.address);
                    if !tracked.is_linked(slab, id) {
                        to_release.push(id);
                    }
                    false
                }
            });
        }

        let evicted = to_release.len();
        for id in to_release {
            self.slab.release(id);
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SightingStore {
        SightingStore::new(StoreConfig {
            slab_capacity: 16,
            tracked_queue_capacity: 16,
            silence_timeout_ms: 5_000,
            mempool_usage_threshold: 0.70,
        })
    }

    fn addr(s: &str) -> MacAddress {
        s.parse().unwrap()
    }

    /// S1 — first sighting.
    #[test]
    fn first_sighting_creates_one_record_in_both_lists() {
        let mut store = store();
        let outcome = store.observe_br(addr("AA:BB:CC:DD:EE:01"), -60, 1000);
        assert_eq!(outcome, ObserveOutcome::Inserted);
        assert_eq!(store.recent_len(), 1);
        assert_eq!(store.tracked_len(), 1);

        let uploaded = store.drain_for_upload(1);
        assert_eq!(uploaded.len(), 1);
        assert_eq!(uploaded[0].first_seen_ms, 1000);
        assert_eq!(uploaded[0].last_seen_ms, 1000);
        assert_eq!(uploaded[0].rssi, -60);
    }

    /// S2 — update does not duplicate.
    #[test]
    fn second_observe_updates_in_place() {
        let mut store = store();
        store.observe_br(addr("AA:BB:CC:DD:EE:01"), -60, 1000);
        let outcome = store.observe_br(addr("AA:BB:CC:DD:EE:01"), -55, 1500);
        assert_eq!(outcome, ObserveOutcome::Updated);
        assert_eq!(store.recent_len(), 1);
        assert_eq!(store.tracked_len(), 1);

        let uploaded = store.drain_for_upload(10);
        assert_eq!(uploaded.len(), 1);
        assert_eq!(uploaded[0].first_seen_ms, 1000);
        assert_eq!(uploaded[0].last_seen_ms, 1500);
        assert_eq!(uploaded[0].rssi, -55);
    }

    /// S3 — cleanup timeout.
    #[test]
    fn cleanup_evicts_after_silence_window_and_frees_the_slot() {
        let mut store = store();
        store.observe_br(addr("AA:BB:CC:DD:EE:01"), -60, 1000);
        store.observe_br(addr("AA:BB:CC:DD:EE:01"), -55, 1500);
        store.drain_for_upload(10);

        let evicted = store.cleanup(1500 + 5_000 + 1);
        assert_eq!(evicted, 1);
        assert_eq!(store.recent_len(), 0);
        assert_eq!(store.tracked_len(), 0);
        assert_eq!(store.slab.len(), 0, "slot must be released once unlinked from both lists");
    }

    #[test]
    fn cleanup_keeps_tracked_membership_if_upload_has_not_happened_yet() {
        let mut store = store();
        store.observe_br(addr("AA:BB:CC:DD:EE:01"), -60, 1000);
        // No drain_for_upload call: the record is still tracked.
        store.cleanup(1000 + 5_000 + 1);
        assert_eq!(store.recent_len(), 0, "recent-sightings entry is still timed out");
        assert_eq!(store.tracked_len(), 1, "tracked-object queue entry is untouched by cleanup");
        assert_eq!(store.slab.len(), 1, "slot stays allocated while still tracked");
    }

    #[test]
    fn drain_releases_the_slot_if_already_gone_from_recent() {
        let mut store = store();
        store.observe_br(addr("AA:BB:CC:DD:EE:01"), -60, 1000);
        // Times the record out of the recent set without draining it, so it
        // is left tracked-only (linked in neither-nor-both is the invariant
        // under test).
        store.cleanup(1000 + 5_000 + 1);
        assert_eq!(store.tracked_len(), 1);
        assert_eq!(store.slab.len(), 1);

        let uploaded = store.drain_for_upload(10);
        assert_eq!(uploaded.len(), 1);
        assert_eq!(store.slab.len(), 0, "slot must be released once drain unlinks it from its last list");
    }

    #[test]
    fn tracked_queue_overflow_releases_the_slot_if_already_gone_from_recent() {
        let mut store = SightingStore::new(StoreConfig {
            slab_capacity: 16,
            tracked_queue_capacity: 1,
            silence_timeout_ms: 5_000,
            mempool_usage_threshold: 0.70,
        });
        store.observe_br(addr("AA:BB:CC:DD:EE:01"), -60, 1000);
        store.cleanup(1000 + 5_000 + 1);
        assert_eq!(store.recent_len(), 0);
        assert_eq!(store.tracked_len(), 1);
        assert_eq!(store.slab.len(), 1);

        // Pushes a second record, evicting the first from the tracked
        // queue's head; since it is already unlinked from recent, eviction
        // must release its slot rather than orphan it.
        store.observe_br(addr("AA:BB:CC:DD:EE:02"), -60, 2000);
        assert_eq!(store.metrics().dropped_tracked_overflow, 1);
        assert_eq!(store.slab.len(), 1, "evicted record's slot must be released, not orphaned");
    }

    #[test]
    fn drain_for_upload_never_returns_the_same_record_twice() {
        let mut store = store();
        store.observe_br(addr("AA:BB:CC:DD:EE:01"), -60, 1000);
        store.observe_br(addr("AA:BB:CC:DD:EE:02"), -60, 1000);

        let first = store.drain_for_upload(1);
        assert_eq!(first.len(), 1);
        let second = store.drain_for_upload(10);
        assert_eq!(second.len(), 1);
        assert_ne!(first[0].address, second[0].address);
    }

    #[test]
    fn tracked_queue_overflow_evicts_oldest_and_counts_it() {
        let mut store = SightingStore::new(StoreConfig {
            slab_capacity: 16,
            tracked_queue_capacity: 2,
            silence_timeout_ms: 5_000,
            mempool_usage_threshold: 0.70,
        });
        store.observe_br(addr("AA:BB:CC:DD:EE:01"), -60, 1000);
        store.observe_br(addr("AA:BB:CC:DD:EE:02"), -60, 1000);
        store.observe_br(addr("AA:BB:CC:DD:EE:03"), -60, 1000);

        assert_eq!(store.tracked_len(), 2);
        assert_eq!(store.metrics().dropped_tracked_overflow, 1);
        assert_eq!(store.recent_len(), 3, "eviction from the tracked queue must not touch the recent-sightings set");
    }

    #[test]
    fn store_full_is_counted_and_never_panics() {
        let mut store = SightingStore::new(StoreConfig {
            slab_capacity: 1,
            tracked_queue_capacity: 1,
            silence_timeout_ms: 5_000,
            mempool_usage_threshold: 2.0, // disable inline cleanup for this test
        });
        store.observe_br(addr("AA:BB:CC:DD:EE:01"), -60, 1000);
        let outcome = store.observe_br(addr("AA:BB:CC:DD:EE:02"), -60, 1000);
        assert_eq!(outcome, ObserveOutcome::Dropped);
        assert_eq!(store.metrics().dropped_store_full, 1);
    }
}
