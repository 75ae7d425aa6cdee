//! BLE advertiser: encodes the location-derived iBeacon-shaped payload and
//! drives the advertising dongle until shutdown (spec §4.4).
//!
//! Grounded on `examples/original_source/src/LBeacon.c`'s
//! `enable_advertising`/`disable_advertising`, which issue
//! `OCF_LE_SET_ADVERTISING_PARAMETERS`, `OCF_LE_SET_ADVERTISING_DATA` and
//! `OCF_LE_SET_ADVERTISE_ENABLE` over a raw HCI socket via `hci_send_req`.
//! This module reproduces that exact command sequence through
//! [`crate::hci::send_command_request`] instead of linking libbluetooth.

use crate::{
    error::{Error, ErrorKind, Result},
    hci,
    shutdown::ShutdownWatcher,
    sock::HciSocket,
    sys::opcode,
};

const EIR_FLAGS: u8 = 0x01;
const EIR_MANUFACTURER_SPECIFIC_DATA: u8 = 0xff;
const APPLE_COMPANY_ID: u16 = 0x004c;
const IBEACON_TYPE: u8 = 0x02;
const IBEACON_DATA_LEN: u8 = 0x15;
const GENERAL_DISCOVERABLE_BR_EDR_NOT_SUPPORTED: u8 = 0x1a;

const HCI_REQUEST_TIMEOUT_MS: i32 = 1_000;

/// Coordinates and identity a beacon advertises (spec §4.4).
#[derive(Clone, Copy, Debug)]
pub struct BeaconLocation {
    pub coordinate_x: f32,
    pub coordinate_y: f32,
    /// Raw level number (may be negative for basements); biased by
    /// `lowest_basement_level` before encoding so the wire value is
    /// non-negative.
    pub level: i32,
    pub lowest_basement_level: i32,
    /// 4-byte identifier carried alongside the coordinates (derived from
    /// the configured UUID).
    pub fixed_identifier: [u8; 4],
    /// Two's-complement calibrated RSSI at one meter.
    pub calibrated_rssi: i8,
}

impl BeaconLocation {
    fn biased_level(&self) -> u16 {
        (self.level - self.lowest_basement_level).max(0) as u16
    }

    /// Encodes the advertising-data payload described in spec §4.4: a
    /// flags AD structure, then a manufacturer-specific AD structure whose
    /// iBeacon-shaped body carries the coordinates, identifier and
    /// calibrated RSSI. The level (Z-coordinate) rides in the two bytes
    /// the original reserves right after the iBeacon preamble.
    pub fn encode_payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(30);

        // Flags AD structure.
        out.push(0x02); // length
        out.push(EIR_FLAGS);
        out.push(GENERAL_DISCOVERABLE_BR_EDR_NOT_SUPPORTED);

        let body_start = out.len();
        out.push(0x00); // manufacturer AD structure length, patched below
        out.push(EIR_MANUFACTURER_SPECIFIC_DATA);
        out.extend_from_slice(&APPLE_COMPANY_ID.to_le_bytes());
        out.push(IBEACON_TYPE);
        out.push(IBEACON_DATA_LEN);
        out.extend_from_slice(&self.biased_level().to_be_bytes());

        out.extend_from_slice(&self.coordinate_x.to_be_bytes());
        out.extend_from_slice(&self.fixed_identifier);
        out.extend_from_slice(&self.coordinate_y.to_be_bytes());
        out.push(self.calibrated_rssi as u8);

        let manufacturer_len = (out.len() - body_start - 1) as u8;
        out[body_start] = manufacturer_len;

        out
    }
}

/// Runs the advertiser until `shutdown` fires, then disables advertising
/// before returning.
///
/// Matches spec §4.4's error taxonomy: [`ErrorKind::AdvertiseOpen`] if the
/// dongle cannot be opened, [`ErrorKind::AdvertiseTimeout`] if a command
/// is not acknowledged within 1s, [`ErrorKind::AdvertiseStatus`] on a
/// non-zero status byte.
pub async fn run(
    dongle_id: u16, interval_units_0625ms: u16, location: BeaconLocation, mut shutdown: ShutdownWatcher,
) -> Result<()> {
    enable(dongle_id, interval_units_0625ms, location).await?;
    log::info!("advertiser: enabled on dongle {dongle_id}");

    shutdown.wait().await;

    disable(dongle_id).await
}

async fn enable(dongle_id: u16, interval_units_0625ms: u16, location: BeaconLocation) -> Result<()> {
    tokio::task::spawn_blocking(move || enable_blocking(dongle_id, interval_units_0625ms, location))
        .await
        .expect("advertiser enable task panicked")
}

async fn disable(dongle_id: u16) -> Result<()> {
    tokio::task::spawn_blocking(move || disable_blocking(dongle_id)).await.expect("advertiser disable task panicked")
}

fn open_dongle(dongle_id: u16) -> Result<HciSocket> {
    HciSocket::open(dongle_id).map_err(|_| Error::new(ErrorKind::AdvertiseOpen))
}

fn check_status(status: u8) -> Result<()> {
    if status == 0 {
        Ok(())
    } else {
        Err(Error::with_message(ErrorKind::AdvertiseStatus, format!("controller returned status {status:#04x}")))
    }
}

fn enable_blocking(dongle_id: u16, interval_units_0625ms: u16, location: BeaconLocation) -> Result<()> {
    let sock = open_dongle(dongle_id)?;

    let mut params = Vec::with_capacity(15);
    params.extend_from_slice(&interval_units_0625ms.to_le_bytes()); // min_interval
    params.extend_from_slice(&interval_units_0625ms.to_le_bytes()); // max_interval
    params.push(0x00); // advertising type: ADV_IND
    params.push(0x00); // own address type: public
    params.push(0x00); // peer address type
    params.extend_from_slice(&[0u8; 6]); // peer address
    params.push(0x07); // channel map: 37, 38, 39
    params.push(0x00); // filter policy
    let status = hci::send_command_request(
        &sock,
        opcode::OGF_LE_CTL,
        opcode::OCF_LE_SET_ADVERTISING_PARAMETERS,
        &params,
        HCI_REQUEST_TIMEOUT_MS,
    )?;
    check_status(status)?;

    let payload = location.encode_payload();
    let mut data_params = vec![payload.len() as u8];
    data_params.extend_from_slice(&payload);
    data_params.resize(32, 0); // HCI_Set_Advertising_Data always carries 31 data bytes + length
    let status =
        hci::send_command_request(&sock, opcode::OGF_LE_CTL, opcode::OCF_LE_SET_ADVERTISING_DATA, &data_params, HCI_REQUEST_TIMEOUT_MS)?;
    check_status(status)?;

    let status = hci::send_command_request(
        &sock,
        opcode::OGF_LE_CTL,
        opcode::OCF_LE_SET_ADVERTISE_ENABLE,
        &[0x01],
        HCI_REQUEST_TIMEOUT_MS,
    )?;
    check_status(status)
}

fn disable_blocking(dongle_id: u16) -> Result<()> {
    let sock = open_dongle(dongle_id)?;
    let status =
        hci::send_command_request(&sock, opcode::OGF_LE_CTL, opcode::OCF_LE_SET_ADVERTISE_ENABLE, &[0x00], HCI_REQUEST_TIMEOUT_MS)?;
    check_status(status)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn location() -> BeaconLocation {
        BeaconLocation {
            coordinate_x: 12.5,
            coordinate_y: -3.25,
            level: 1,
            lowest_basement_level: -2,
            fixed_identifier: [0xde, 0xad, 0xbe, 0xef],
            calibrated_rssi: -59,
        }
    }

    #[test]
    fn payload_carries_flags_then_manufacturer_structure() {
        let bytes = location().encode_payload();
        assert_eq!(bytes[0], 0x02);
        assert_eq!(bytes[1], EIR_FLAGS);
        assert_eq!(bytes[2], GENERAL_DISCOVERABLE_BR_EDR_NOT_SUPPORTED);
        assert_eq!(bytes[4], EIR_MANUFACTURER_SPECIFIC_DATA);
    }

    #[test]
    fn level_is_biased_to_be_non_negative() {
        let loc = location();
        assert_eq!(loc.biased_level(), 3); // 1 - (-2)
    }

    #[test]
    fn coordinates_and_identifier_round_trip_through_the_payload() {
        let loc = location();
        let bytes = loc.encode_payload();

        // Offsets: 0..3 flags AD, 3 len, 4 type, 5..7 company, 7 ibeacon type,
        // 8 ibeacon len, 9..11 level, 11..15 X, 15..19 identifier, 19..23 Y, 23 rssi.
        let x = f32::from_be_bytes(bytes[11..15].try_into().unwrap());
        let id: [u8; 4] = bytes[15..19].try_into().unwrap();
        let y = f32::from_be_bytes(bytes[19..23].try_into().unwrap());
        let rssi = bytes[23] as i8;

        assert_eq!(x, loc.coordinate_x);
        assert_eq!(id, loc.fixed_identifier);
        assert_eq!(y, loc.coordinate_y);
        assert_eq!(rssi, loc.calibrated_rssi);
    }

    #[test]
    fn calibrated_rssi_round_trips_as_twos_complement() {
        let mut loc = location();
        loc.calibrated_rssi = -1;
        let bytes = loc.encode_payload();
        assert_eq!(bytes[23], 0xff);
    }
}
