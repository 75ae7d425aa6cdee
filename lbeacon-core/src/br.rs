//! BR/EDR inquiry scan loop (spec §4.5).
//!
//! Grounded on the inquiry-event handling implied by
//! `examples/original_source/src/LBeacon.h`'s `ScannedDevice` fields
//! (`rssi`, `scanned_mac_address`) and spec §4.5's exact parameters: LAP
//! `0x9e8b33` ([`crate::sys::GIAC_LAP`]), inquiry length `0x30`
//! ([`crate::sys::INQUIRY_LENGTH`]). Unlike the advertiser's commands, the
//! inquiry command itself does not complete synchronously — the
//! controller streams `EVT_INQUIRY_RESULT_WITH_RSSI` events and finally
//! `EVT_INQUIRY_COMPLETE`, so this loop talks to the socket directly
//! rather than going through [`crate::hci::send_command_request`].

use std::sync::{atomic::AtomicBool, Arc, Mutex};

use crate::{
    address::{MacAddress, MacPrefix},
    error::{Error, ErrorKind, Result},
    shutdown::ShutdownWatcher,
    sock::HciSocket,
    store::SightingStore,
    sys::{event, opcode, pkt_type, GIAC_LAP, INQUIRY_LENGTH},
};

/// Tunables for the BR/EDR inquiry loop, reloadable via `Reconfig` (spec
/// §4.8).
#[derive(Clone, Debug)]
pub struct BrScanConfig {
    pub dongle_id: u16,
    pub rssi_coverage: i8,
    pub accepted_prefixes: Vec<MacPrefix>,
}

/// Runs inquiry cycles until `shutdown` fires.
pub async fn run_scan(config: BrScanConfig, store: Arc<Mutex<SightingStore>>, shutdown: ShutdownWatcher) -> Result<()> {
    let flag = Arc::new(AtomicBool::new(false));
    let flag_for_blocking = flag.clone();
    let scan_task = tokio::task::spawn_blocking(move || scan_loop_blocking(config, store, flag_for_blocking));

    let mut shutdown = shutdown;
    shutdown.wait().await;
    flag.store(true, std::sync::atomic::Ordering::Release);

    scan_task.await.expect("BR/EDR scan task panicked")
}

fn scan_loop_blocking(config: BrScanConfig, store: Arc<Mutex<SightingStore>>, shutdown: Arc<AtomicBool>) -> Result<()> {
    let sock = HciSocket::open(config.dongle_id).map_err(|_| Error::new(ErrorKind::DongleUnavailable))?;
    let mask = (1u32 << event::INQUIRY_RESULT) | (1u32 << event::INQUIRY_RESULT_WITH_RSSI) | (1u32 << event::INQUIRY_COMPLETE);
    sock.set_event_filter(mask).map_err(Error::from)?;

    while !shutdown.load(std::sync::atomic::Ordering::Acquire) {
        issue_inquiry(&sock)?;
        run_one_inquiry_cycle(&sock, &config, &store, &shutdown)?;
    }
    Ok(())
}

fn issue_inquiry(sock: &HciSocket) -> Result<()> {
    let mut params = Vec::with_capacity(5);
    params.extend_from_slice(&GIAC_LAP);
    params.push(INQUIRY_LENGTH);
    params.push(0x00); // num_responses: unlimited
    let opcode = crate::sys::opcode::pack(opcode::OGF_LINK_CTL, opcode::OCF_INQUIRY);
    let mut packet = Vec::with_capacity(4 + params.len());
    packet.push(pkt_type::COMMAND);
    packet.extend_from_slice(&opcode.to_le_bytes());
    packet.push(params.len() as u8);
    packet.extend_from_slice(&params);
    sock.send(&packet).map_err(Error::from)?;
    Ok(())
}

fn run_one_inquiry_cycle(
    sock: &HciSocket, config: &BrScanConfig, store: &Mutex<SightingStore>, shutdown: &AtomicBool,
) -> Result<()> {
    let mut buf = [0u8; 260];
    loop {
        if shutdown.load(std::sync::atomic::Ordering::Acquire) {
            return Ok(());
        }
        if !sock.poll_readable(1_000).map_err(Error::from)? {
            continue;
        }
        let n = sock.recv(&mut buf).map_err(Error::from)?;
        if n < 3 || buf[0] != pkt_type::EVENT {
            continue;
        }
        let evt_code = buf[1];
        let params = &buf[3..n];

        match evt_code {
            c if c == event::INQUIRY_COMPLETE => return Ok(()),
            c if c == event::INQUIRY_RESULT_WITH_RSSI => {
                for (address, rssi) in parse_inquiry_result_with_rssi(params) {
                    admit_if_accepted(store, config, address, rssi);
                }
            }
            c if c == event::INQUIRY_RESULT => {
                log::debug!("BR/EDR inquiry result without RSSI, not admitted");
            }
            _ => {}
        }
    }
}

fn admit_if_accepted(store: &Mutex<SightingStore>, config: &BrScanConfig, address: MacAddress, rssi: i8) {
    if rssi <= config.rssi_coverage {
        return;
    }
    if !config.accepted_prefixes.iter().any(|prefix| address.matches_prefix(prefix)) {
        return;
    }
    let mut store = store.lock().expect("sighting store mutex poisoned");
    store.observe_br(address, rssi, crate::clock::now_ms());
}

/// Parses an `EVT_INQUIRY_RESULT_WITH_RSSI` event body: a count byte
/// followed by `count` fixed-size sub-records (address, page scan repetition
/// mode, reserved x2, class of device x3, clock offset x2, rssi x1).
fn parse_inquiry_result_with_rssi(params: &[u8]) -> Vec<(MacAddress, i8)> {
    const SUBRECORD_LEN: usize = 6 + 1 + 2 + 3 + 2 + 1;
    let mut out = Vec::new();
    if params.is_empty() {
        return out;
    }
    let count = params[0] as usize;
    let body = &params[1..];
    for i in 0..count {
        let start = i * SUBRECORD_LEN;
        if start + SUBRECORD_LEN > body.len() {
            break;
        }
        let mut addr_bytes = [0u8; 6];
        addr_bytes.copy_from_slice(&body[start..start + 6]);
        addr_bytes.reverse();
        let rssi = body[start + SUBRECORD_LEN - 1] as i8;
        out.push((MacAddress::new(addr_bytes), rssi));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subrecord(addr: [u8; 6], rssi: i8) -> Vec<u8> {
        let mut wire_addr = addr;
        wire_addr.reverse();
        let mut out = wire_addr.to_vec();
        out.push(0x00); // page scan repetition mode
        out.extend_from_slice(&[0u8; 2]); // reserved
        out.extend_from_slice(&[0u8; 3]); // class of device
        out.extend_from_slice(&[0u8; 2]); // clock offset
        out.push(rssi as u8);
        out
    }

    #[test]
    fn parses_multiple_subrecords() {
        let mut params = vec![2u8];
        params.extend(subrecord([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x01], -40));
        params.extend(subrecord([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x02], -70));

        let results = parse_inquiry_result_with_rssi(&params);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].1, -40);
        assert_eq!(results[1].1, -70);
    }

    #[test]
    fn admits_only_when_rssi_and_prefix_both_pass() {
        let store = Mutex::new(SightingStore::new(crate::store::StoreConfig {
            slab_capacity: 8,
            tracked_queue_capacity: 8,
            silence_timeout_ms: 5_000,
            mempool_usage_threshold: 0.70,
        }));
        let config = BrScanConfig {
            dongle_id: 0,
            rssi_coverage: -60,
            accepted_prefixes: vec!["AABB".parse().unwrap()],
        };

        admit_if_accepted(&store, &config, "AA:BB:CC:DD:EE:01".parse().unwrap(), -50);
        admit_if_accepted(&store, &config, "AA:BB:CC:DD:EE:02".parse().unwrap(), -90); // fails RSSI
        admit_if_accepted(&store, &config, "11:22:CC:DD:EE:03".parse().unwrap(), -50); // fails prefix

        assert_eq!(store.lock().unwrap().recent_len(), 1);
    }
}
