//! LE scan loop and advertisement classifier (spec §4.6).
//!
//! The scan loop itself runs blocking HCI reads inside `spawn_blocking`,
//! the same shape as [`crate::br`]'s inquiry loop. Each LE Advertising
//! Report is pushed into a small mutex-guarded temporary buffer (spec §5's
//! "temp-buffer mutex", taken before the store mutex per the documented
//! lock order); a separate async task drains it and runs the
//! manufacturer-data classifier described in spec §4.6, admitting matches
//! into the [`crate::store::SightingStore`].

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use crate::{
    address::MacAddress,
    error::{Error, ErrorKind, Result},
    hci,
    record::{Payload, MAX_PAYLOAD_LEN},
    shutdown::ShutdownWatcher,
    sock::HciSocket,
    store::SightingStore,
    sys::{event, opcode, pkt_type},
};

/// BeDITech generic push-button tag identifier (spec §4.6a).
const BUTTON_TAG_IDENTIFIER: &str = "0000000000000000";
/// BeDITech button-with-battery tag identifier (spec §4.6b).
const BATTERY_TAG_IDENTIFIER: &str = "05C6";

const LE_ADVERTISING_REPORT_SUBEVENT: u8 = 0x02;
const HCI_REQUEST_TIMEOUT_MS: i32 = 1_000;
const TEMP_BUFFER_CAPACITY: usize = 256;

/// Tunables for the LE scan loop.
#[derive(Clone, Copy, Debug)]
pub struct BleScanConfig {
    pub dongle_id: u16,
    pub scan_interval_units_0625ms: u16,
    pub scan_window_units_0625ms: u16,
}

/// One LE advertisement awaiting classification.
struct PendingAdvertisement {
    address: MacAddress,
    rssi: i8,
    data: Vec<u8>,
}

/// Mutex-guarded FIFO between the scan loop (producer) and the classifier
/// (consumer).
pub struct TempBleBuffer {
    inner: Mutex<VecDeque<PendingAdvertisement>>,
}

impl TempBleBuffer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { inner: Mutex::new(VecDeque::with_capacity(TEMP_BUFFER_CAPACITY)) })
    }

    fn push(&self, advertisement: PendingAdvertisement) {
        let mut buf = self.inner.lock().expect("temp BLE buffer mutex poisoned");
        if buf.len() >= TEMP_BUFFER_CAPACITY {
            buf.pop_front();
        }
        buf.push_back(advertisement);
    }

    fn drain(&self) -> Vec<PendingAdvertisement> {
        let mut buf = self.inner.lock().expect("temp BLE buffer mutex poisoned");
        buf.drain(..).collect()
    }
}

impl Default for TempBleBuffer {
    fn default() -> Self {
        Self { inner: Mutex::new(VecDeque::with_capacity(TEMP_BUFFER_CAPACITY)) }
    }
}

/// Runs the LE scan loop until `shutdown` fires.
pub async fn run_scan(config: BleScanConfig, buffer: Arc<TempBleBuffer>, shutdown: ShutdownWatcher) -> Result<()> {
    let flag = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
    let flag_for_blocking = flag.clone();

    let scan_task =
        tokio::task::spawn_blocking(move || scan_loop_blocking(config, buffer, flag_for_blocking));

    let mut shutdown = shutdown;
    shutdown.wait().await;
    flag.store(true, std::sync::atomic::Ordering::Release);

    scan_task.await.expect("BLE scan task panicked")
}

fn scan_loop_blocking(config: BleScanConfig, buffer: Arc<TempBleBuffer>, shutdown: Arc<std::sync::atomic::AtomicBool>) -> Result<()> {
    let sock = HciSocket::open(config.dongle_id).map_err(|_| Error::new(ErrorKind::DongleUnavailable))?;
    sock.set_event_filter(1 << event::LE_META_EVENT).map_err(Error::from)?;

    let mut scan_params = Vec::with_capacity(7);
    scan_params.push(0x00); // passive scanning
    scan_params.extend_from_slice(&config.scan_interval_units_0625ms.to_le_bytes());
    scan_params.extend_from_slice(&config.scan_window_units_0625ms.to_le_bytes());
    scan_params.push(0x00); // own address type: public
    scan_params.push(0x00); // filter policy: accept all
    let status = hci::send_command_request(&sock, opcode::OGF_LE_CTL, opcode::OCF_LE_SET_SCAN_PARAMETERS, &scan_params, HCI_REQUEST_TIMEOUT_MS)?;
    if status != 0 {
        return Err(Error::with_message(ErrorKind::DongleUnavailable, format!("LE set scan parameters returned {status:#04x}")));
    }

    let status = hci::send_command_request(&sock, opcode::OGF_LE_CTL, opcode::OCF_LE_SET_SCAN_ENABLE, &[0x01, 0x00], HCI_REQUEST_TIMEOUT_MS)?;
    if status != 0 {
        return Err(Error::with_message(ErrorKind::DongleUnavailable, format!("LE set scan enable returned {status:#04x}")));
    }

    let mut buf = [0u8; 260];
    while !shutdown.load(std::sync::atomic::Ordering::Acquire) {
        if !sock.poll_readable(1_000).map_err(Error::from)? {
            continue;
        }
        let n = sock.recv(&mut buf).map_err(Error::from)?;
        if n < 3 || buf[0] != pkt_type::EVENT || buf[1] != event::LE_META_EVENT {
            continue;
        }
        for advertisement in parse_le_meta_event(&buf[3..n]) {
            buffer.push(advertisement);
        }
    }

    let _ = hci::send_command_request(&sock, opcode::OGF_LE_CTL, opcode::OCF_LE_SET_SCAN_ENABLE, &[0x00, 0x00], HCI_REQUEST_TIMEOUT_MS);
    Ok(())
}

/// Parses the LE Advertising Report sub-event (one or more reports per
/// event) into pending advertisements.
fn parse_le_meta_event(params: &[u8]) -> Vec<PendingAdvertisement> {
    let mut out = Vec::new();
    if params.is_empty() || params[0] != LE_ADVERTISING_REPORT_SUBEVENT || params.len() < 2 {
        return out;
    }
    let num_reports = params[1] as usize;
    let mut offset = 2;

    // Fixed-size fields per report: event_type(1) + addr_type(1) + addr(6) = 8,
    // followed (after all addresses) by a per-report data_length + data + rssi(1)
    // block. BlueZ's kernel layout actually interleaves these per-report; we
    // walk report-by-report rather than assuming a single shared array.
    for _ in 0..num_reports {
        if offset + 9 > params.len() {
            break;
        }
        offset += 2; // event_type, address_type
        let mut addr_bytes = [0u8; 6];
        addr_bytes.copy_from_slice(&params[offset..offset + 6]);
        addr_bytes.reverse();
        let address = MacAddress::new(addr_bytes);
        offset += 6;

        let data_len = params[offset] as usize;
        offset += 1;
        if offset + data_len + 1 > params.len() {
            break;
        }
        let data = params[offset..offset + data_len].to_vec();
        offset += data_len;
        let rssi = params[offset] as i8;
        offset += 1;

        out.push(PendingAdvertisement { address, rssi, data });
    }
    out
}

/// Drains `buffer` once, classifying each advertisement per spec §4.6 and
/// admitting matches into `store`. Returns the number admitted.
pub fn classify_and_admit(buffer: &TempBleBuffer, store: &Mutex<SightingStore>, now_ms: u64) -> usize {
    let mut admitted = 0;
    for advertisement in buffer.drain() {
        if let Some((button_pressed, battery_voltage)) = classify(&advertisement.data) {
            let mut payload = advertisement.data.clone();
            payload.truncate(MAX_PAYLOAD_LEN);
            let mut store = store.lock().expect("sighting store mutex poisoned");
            store.observe_ble(
                advertisement.address,
                advertisement.rssi,
                now_ms,
                button_pressed,
                battery_voltage,
                Payload::new(payload),
            );
            admitted += 1;
        }
    }
    admitted
}

/// Searches the manufacturer-specific AD element of `data` for one of the
/// two BeDITech tag identifiers, returning `(button_pressed, battery_voltage)`
/// on a match.
fn classify(data: &[u8]) -> Option<(Option<bool>, Option<u8>)> {
    let manufacturer_field = find_manufacturer_specific_field(data)?;
    let hex = hex::encode_upper(manufacturer_field);

    if hex.contains(BUTTON_TAG_IDENTIFIER) {
        return Some((Some(true), None));
    }
    if let Some(pos) = hex.find(BATTERY_TAG_IDENTIFIER) {
        let after = &hex[pos + BATTERY_TAG_IDENTIFIER.len()..];
        if after.len() >= 2 {
            if let Ok(voltage) = u8::from_str_radix(&after[..2], 16) {
                return Some((None, Some(voltage)));
            }
        }
    }
    None
}

/// Walks the AD structure TLVs in a 31-byte advertising-data field looking
/// for the manufacturer-specific element (type `0xFF`).
fn find_manufacturer_specific_field(data: &[u8]) -> Option<&[u8]> {
    let mut offset = 0;
    while offset < data.len() {
        let len = data[offset] as usize;
        if len == 0 || offset + 1 + len > data.len() {
            break;
        }
        let ad_type = data[offset + 1];
        let ad_data = &data[offset + 2..offset + 1 + len];
        if ad_type == 0xff {
            return Some(ad_data);
        }
        offset += 1 + len;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreConfig;

    fn ad_structure(ad_type: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![(payload.len() + 1) as u8, ad_type];
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn finds_manufacturer_field_among_other_ad_structures() {
        let mut data = ad_structure(0x01, &[0x1a]); // flags
        data.extend(ad_structure(0xff, &[0x4c, 0x00, 0xde, 0xad]));
        assert_eq!(find_manufacturer_specific_field(&data), Some(&[0x4c, 0x00, 0xde, 0xad][..]));
    }

    #[test]
    fn classifies_button_tag_identifier() {
        let manufacturer = hex::decode("0000000000000000").unwrap();
        let data = ad_structure(0xff, &manufacturer);
        let (button, battery) = classify(&data).unwrap();
        assert_eq!(button, Some(true));
        assert_eq!(battery, None);
    }

    #[test]
    fn classifies_battery_tag_identifier_and_trailing_voltage() {
        let mut manufacturer = hex::decode("05C6").unwrap();
        manufacturer.push(0x50); // trailing hex byte: battery voltage
        let data = ad_structure(0xff, &manufacturer);
        let (button, battery) = classify(&data).unwrap();
        assert_eq!(button, None);
        assert_eq!(battery, Some(0x50));
    }

    #[test]
    fn non_matching_advertisement_is_discarded() {
        let data = ad_structure(0xff, &[0x4c, 0x00, 0x01, 0x02]);
        assert!(classify(&data).is_none());
    }

    #[test]
    fn parses_a_single_report_le_meta_event() {
        let mut params = vec![LE_ADVERTISING_REPORT_SUBEVENT, 0x01];
        params.push(0x00); // event type
        params.push(0x00); // address type
        let mut addr = [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff];
        addr.reverse();
        params.extend_from_slice(&addr);
        let ad = ad_structure(0x01, &[0x1a]);
        params.push(ad.len() as u8);
        params.extend_from_slice(&ad);
        params.push(0xc4u8); // rssi = -60

        let reports = parse_le_meta_event(&params);
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].rssi, -60);
        assert_eq!(reports[0].address, MacAddress::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]));
    }

    #[test]
    fn oversized_advertising_data_is_truncated_rather_than_panicking() {
        let mut manufacturer = hex::decode(BUTTON_TAG_IDENTIFIER).unwrap();
        manufacturer.extend(std::iter::repeat(0xaa).take(40));
        let data = ad_structure(0xff, &manufacturer);
        assert!(data.len() > MAX_PAYLOAD_LEN, "fixture must exceed the payload bound to exercise truncation");

        let buffer = TempBleBuffer::default();
        buffer.push(PendingAdvertisement { address: MacAddress::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]), rssi: -60, data });

        let store = Mutex::new(SightingStore::new(StoreConfig {
            slab_capacity: 4,
            tracked_queue_capacity: 4,
            silence_timeout_ms: 5_000,
            mempool_usage_threshold: 0.70,
        }));

        let admitted = classify_and_admit(&buffer, &store, 1_000);
        assert_eq!(admitted, 1, "oversized but otherwise valid advertisement is still admitted, just truncated");
    }
}
