//! Configuration file parsing (spec §6): `key=value`, one pair per line.
//!
//! `examples/original_source/src/LBeacon.c`'s `get_config` reads the file
//! with `fgets` into fixed line buffers in a hardcoded order. This parser
//! is more permissive (recognizes keys by name, tolerates reordering and
//! blank lines, skips `#` comments) but keeps the same flat text format —
//! no serde/toml, per spec §1's Non-goals ("configuration file parsing" is
//! listed as an external collaborator interface, not a format to modernize).

use std::{collections::HashMap, net::Ipv4Addr, path::Path, str::FromStr};

use crate::{
    address::MacPrefix,
    error::{Error, ErrorKind, Result},
};

/// Fully parsed and validated configuration (spec §6's key table).
#[derive(Clone, Debug)]
pub struct Config {
    pub area_id: String,
    pub coordinate_x: f32,
    pub coordinate_y: f32,
    pub coordinate_z: i32,
    pub lowest_basement_level: i32,
    pub uuid: String,
    pub advertise_dongle_id: u16,
    pub advertise_interval_units_0625ms: u16,
    pub advertise_rssi_value: i8,
    pub scan_dongle_id: u16,
    pub scan_rssi_coverage: i8,
    pub gateway_addr: Ipv4Addr,
    pub gateway_port: u16,
    pub local_client_port: u16,
    pub mac_prefix_list: Vec<MacPrefix>,
}

impl Config {
    /// Reads and parses a configuration file from `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::with_message(ErrorKind::Config, format!("{}: {e}", path.as_ref().display())))?;
        Self::parse(&text)
    }

    /// Parses configuration text already read into memory.
    pub fn parse(text: &str) -> Result<Self> {
        let raw = parse_key_value(text);

        Ok(Self {
            area_id: require(&raw, "area_id")?,
            coordinate_x: require_parsed(&raw, "coordinate_X")?,
            coordinate_y: require_parsed(&raw, "coordinate_Y")?,
            coordinate_z: require_parsed(&raw, "coordinate_Z")?,
            lowest_basement_level: require_parsed(&raw, "lowest_basement_level")?,
            uuid: require_uuid(&raw)?,
            advertise_dongle_id: require_parsed(&raw, "advertise_dongle_id")?,
            advertise_interval_units_0625ms: require_parsed(&raw, "advertise_interval_in_units_0625_ms")?,
            advertise_rssi_value: require_parsed(&raw, "advertise_rssi_value")?,
            scan_dongle_id: require_parsed(&raw, "scan_dongle_id")?,
            scan_rssi_coverage: require_parsed(&raw, "scan_rssi_coverage")?,
            gateway_addr: require_parsed(&raw, "gateway_addr")?,
            gateway_port: require_parsed(&raw, "gateway_port")?,
            local_client_port: require_parsed(&raw, "local_client_port")?,
            mac_prefix_list: require_prefix_list(&raw)?,
        })
    }
}

fn parse_key_value(text: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            map.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    map
}

fn require(raw: &HashMap<String, String>, key: &str) -> Result<String> {
    raw.get(key).cloned().ok_or_else(|| Error::with_message(ErrorKind::Config, format!("missing key {key:?}")))
}

fn require_parsed<T: FromStr>(raw: &HashMap<String, String>, key: &str) -> Result<T> {
    let value = require(raw, key)?;
    value.parse().map_err(|_| Error::with_message(ErrorKind::Config, format!("invalid value for {key:?}: {value:?}")))
}

fn require_uuid(raw: &HashMap<String, String>) -> Result<String> {
    let uuid = require(raw, "uuid")?;
    if uuid.len() != 32 || !uuid.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(Error::with_message(ErrorKind::Config, format!("uuid must be 32 hex characters, got {uuid:?}")));
    }
    Ok(uuid)
}

fn require_prefix_list(raw: &HashMap<String, String>) -> Result<Vec<MacPrefix>> {
    let raw_list = require(raw, "mac_prefix_list")?;
    raw_list
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse().map_err(|_| Error::with_message(ErrorKind::Config, format!("invalid mac prefix {s:?}"))))
        .collect()
}
