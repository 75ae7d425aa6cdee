//! The sighting record: one entry per distinct Bluetooth address currently
//! being tracked (spec §3).

use crate::{address::MacAddress, list::Link};

/// Maximum number of bytes of the most recent BLE advertising payload kept
/// on a record (spec §3).
pub const MAX_PAYLOAD_LEN: usize = 33;

/// Which radio produced a sighting.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
pub enum DeviceKind {
    /// Classic Bluetooth (BR/EDR).
    #[strum(serialize = "br_edr")]
    BrEdr,
    /// Bluetooth Low Energy.
    #[strum(serialize = "ble")]
    Ble,
}

/// The most recent BLE advertising payload observed for a record, if any.
/// Bounded to [`MAX_PAYLOAD_LEN`] bytes (spec §3); longer input is an
/// internal parsing error in the caller, not something this type repairs.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Payload(Vec<u8>);

impl Payload {
    /// Wraps `bytes`. Panics if longer than [`MAX_PAYLOAD_LEN`] — callers
    /// (the BLE scanner) are responsible for only ever handing over
    /// advertising-data fields, which the controller already bounds.
    pub fn new(bytes: Vec<u8>) -> Self {
        assert!(bytes.len() <= MAX_PAYLOAD_LEN, "advertising payload exceeds {MAX_PAYLOAD_LEN} bytes");
        Self(bytes)
    }

    /// Borrowed byte view.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// One observation of a Bluetooth device currently being tracked.
///
/// Carries two independent list hooks (spec §4.2): `recent_link` for
/// membership in the recent-sightings set, `tracked_link` for membership in
/// the tracked-object queue. A record may be linked in both, one, or
/// neither at any given time (it must be released to the slab only once
/// linked in neither — spec §3's invariant).
#[derive(Clone, Debug)]
pub struct SightingRecord {
    pub address: MacAddress,
    pub kind: DeviceKind,
    pub first_seen_ms: u64,
    pub last_seen_ms: u64,
    pub rssi: i8,
    pub button_pressed: Option<bool>,
    pub battery_voltage: Option<u8>,
    pub payload: Payload,

    pub(crate) recent_link: Link,
    pub(crate) tracked_link: Link,
}

impl SightingRecord {
    /// Creates a freshly observed record with `first_seen_ms == last_seen_ms`.
    pub fn new_observed(address: MacAddress, kind: DeviceKind, now_ms: u64, rssi: i8) -> Self {
        Self {
            address,
            kind,
            first_seen_ms: now_ms,
            last_seen_ms: now_ms,
            rssi,
            button_pressed: None,
            battery_voltage: None,
            payload: Payload::default(),
            recent_link: Link::new(),
            tracked_link: Link::new(),
        }
    }

    /// Updates the mutable observation fields on re-sighting. `first_seen_ms`
    /// is never touched after creation (spec S2).
    pub fn observe_again(&mut self, now_ms: u64, rssi: i8) {
        debug_assert!(self.first_seen_ms <= now_ms);
        self.last_seen_ms = now_ms;
        self.rssi = rssi;
    }
}

/// Hook for the recent-sightings set list.
pub struct RecentHook;
impl crate::list::LinkHook<SightingRecord> for RecentHook {
    fn link(item: &SightingRecord) -> Link {
        item.recent_link
    }
    fn set_link(item: &mut SightingRecord, link: Link) {
        item.recent_link = link;
    }
}

/// Hook for the tracked-object queue list.
pub struct TrackedHook;
impl crate::list::LinkHook<SightingRecord> for TrackedHook {
    fn link(item: &SightingRecord) -> Link {
        item.tracked_link
    }
    fn set_link(item: &mut SightingRecord, link: Link) {
        item.tracked_link = link;
    }
}
