//! Synchronous HCI command request/response, shared by the advertiser and
//! the BR/EDR scanner.
//!
//! Grounded on `examples/original_source/src/LBeacon.c`'s use of
//! `hci_send_req`: write a command packet, then poll the socket for the
//! matching `EVT_CMD_COMPLETE` (or `EVT_CMD_STATUS`) event and read its
//! status byte. BlueZ's userspace `hci_send_req` does this same
//! filter-then-poll dance over the same raw socket type as
//! [`crate::sock::HciSocket`].

use crate::{
    error::{Error, ErrorKind, Result},
    sock::HciSocket,
    sys::{event, opcode, pkt_type},
};

/// Builds a raw HCI command packet: packet type, opcode (little-endian),
/// parameter length, then parameters.
fn build_command(ogf: u16, ocf: u16, params: &[u8]) -> Vec<u8> {
    let opcode = opcode::pack(ogf, ocf);
    let mut packet = Vec::with_capacity(4 + params.len());
    packet.push(pkt_type::COMMAND);
    packet.extend_from_slice(&opcode.to_le_bytes());
    packet.push(params.len() as u8);
    packet.extend_from_slice(params);
    packet
}

/// Sends an HCI command on `sock` and blocks for its completion event,
/// returning the status byte BlueZ would hand back from `hci_send_req`.
///
/// `timeout_ms` bounds the wait for the response event; a timeout is
/// surfaced as [`ErrorKind::AdvertiseTimeout`] since every current caller
/// of this helper is on the advertising path (the scanner fires inquiry
/// and does not wait for a command-complete event).
pub fn send_command_request(sock: &HciSocket, ogf: u16, ocf: u16, params: &[u8], timeout_ms: i32) -> Result<u8> {
    let command = build_command(ogf, ocf, params);
    sock.send(&command).map_err(Error::from)?;

    let wanted_opcode = opcode::pack(ogf, ocf);
    let deadline = std::time::Instant::now() + std::time::Duration::from_millis(timeout_ms.max(0) as u64);

    loop {
        let remaining = deadline.saturating_duration_since(std::time::Instant::now());
        if remaining.is_zero() {
            return Err(Error::new(ErrorKind::AdvertiseTimeout));
        }
        let readable = sock
            .poll_readable(remaining.as_millis() as i32)
            .map_err(Error::from)?;
        if !readable {
            return Err(Error::new(ErrorKind::AdvertiseTimeout));
        }

        let mut buf = [0u8; 260];
        let n = sock.recv(&mut buf).map_err(Error::from)?;
        if n < 3 || buf[0] != pkt_type::EVENT {
            continue;
        }
        let evt_code = buf[1];
        let evt_params = &buf[3..n];

        match evt_code {
            c if c == event::CMD_COMPLETE => {
                // num_hci_command_packets(1) + opcode(2) + status(1) + ...
                if evt_params.len() < 4 {
                    continue;
                }
                let seen_opcode = u16::from_le_bytes([evt_params[1], evt_params[2]]);
                if seen_opcode != wanted_opcode {
                    continue;
                }
                return Ok(evt_params[3]);
            }
            c if c == event::CMD_STATUS => {
                if evt_params.len() < 4 {
                    continue;
                }
                let status = evt_params[0];
                let seen_opcode = u16::from_le_bytes([evt_params[2], evt_params[3]]);
                if seen_opcode != wanted_opcode {
                    continue;
                }
                return Ok(status);
            }
            _ => continue,
        }
    }
}
