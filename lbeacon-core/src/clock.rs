//! Wall-clock time as milliseconds since the Unix epoch.
//!
//! Every sighting timestamp and the `TrackedObjectsResp` wire format (spec
//! §6) use this representation directly — the legacy C code serialized a
//! `time_t` pointer's address into the upload packet instead of its value
//! (spec's Open Question log calls this "clearly a bug"); using one
//! epoch-millisecond `u64` throughout avoids ever needing that kind of
//! conversion at the wire boundary.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time, in milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}
