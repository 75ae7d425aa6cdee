//! Low-level Bluetooth HCI constants and raw socket address types.
//!
//! These mirror the structures BlueZ exposes in `<bluetooth/hci.h>` and
//! `<bluetooth/bluetooth.h>`. They are kept separate from [`crate::address`]
//! because they describe wire/ioctl layout, not the higher-level, owned
//! [`crate::address::MacAddress`] type.

use libc::sa_family_t;

/// `AF_BLUETOOTH` address family, as defined by the Linux kernel.
pub const AF_BLUETOOTH: i32 = 31;

/// `BTPROTO_HCI`: raw HCI socket protocol number.
pub const BTPROTO_HCI: i32 = 1;

/// HCI socket option level.
pub const SOL_HCI: i32 = 0;

/// Sets the HCI event/type filter on a raw HCI socket.
pub const HCI_FILTER: i32 = 2;

/// LAP used for general/unlimited inquiry access code (GIAC), per the
/// Bluetooth Assigned Numbers document. `spec.md` §4.5 pins this exact
/// value.
pub const GIAC_LAP: [u8; 3] = [0x33, 0x8b, 0x9e];

/// HCI inquiry length parameter requested by `spec.md` §4.5 (~38.4s, in
/// units of 1.28s).
pub const INQUIRY_LENGTH: u8 = 0x30;

/// HCI event codes relevant to the BR/EDR scan loop and command responses.
pub mod event {
    /// `EVT_INQUIRY_COMPLETE`
    pub const INQUIRY_COMPLETE: u8 = 0x01;
    /// `EVT_INQUIRY_RESULT`
    pub const INQUIRY_RESULT: u8 = 0x02;
    /// `EVT_CMD_COMPLETE`
    pub const CMD_COMPLETE: u8 = 0x0e;
    /// `EVT_CMD_STATUS`
    pub const CMD_STATUS: u8 = 0x0f;
    /// `EVT_INQUIRY_RESULT_WITH_RSSI`
    pub const INQUIRY_RESULT_WITH_RSSI: u8 = 0x22;
    /// `EVT_LE_META_EVENT`: wraps LE-specific sub-events such as advertising
    /// reports.
    pub const LE_META_EVENT: u8 = 0x3e;
}

/// HCI packet indicator bytes, prefixed to every packet written to or read
/// from a raw HCI socket (`<bluetooth/hci.h>`'s `HCI_*_PKT`).
pub mod pkt_type {
    pub const COMMAND: u8 = 0x01;
    pub const EVENT: u8 = 0x04;
}

/// Opcode group fields (OGF) and opcode command fields (OCF) for the HCI
/// commands this crate issues directly. Grounded on
/// `examples/original_source/src/LBeacon.c`'s `enable_advertising`/
/// `disable_advertising`/inquiry call sites.
pub mod opcode {
    pub const OGF_LINK_CTL: u16 = 0x01;
    pub const OCF_INQUIRY: u16 = 0x0001;

    pub const OGF_LE_CTL: u16 = 0x08;
    pub const OCF_LE_SET_ADVERTISING_PARAMETERS: u16 = 0x0006;
    pub const OCF_LE_SET_ADVERTISING_DATA: u16 = 0x0008;
    pub const OCF_LE_SET_SCAN_PARAMETERS: u16 = 0x000b;
    pub const OCF_LE_SET_SCAN_ENABLE: u16 = 0x000c;
    pub const OCF_LE_SET_ADVERTISE_ENABLE: u16 = 0x000a;

    /// Packs an (ogf, ocf) pair into the 16-bit opcode carried on the wire.
    pub const fn pack(ogf: u16, ocf: u16) -> u16 {
        (ogf << 10) | ocf
    }
}

/// `bdaddr_t`: six raw address octets in HCI wire order (reverse of the
/// canonical display order).
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct BdAddr {
    pub b: [u8; 6],
}

impl From<crate::address::MacAddress> for BdAddr {
    fn from(addr: crate::address::MacAddress) -> Self {
        let mut b = addr.octets();
        b.reverse();
        Self { b }
    }
}

impl From<BdAddr> for crate::address::MacAddress {
    fn from(mut addr: BdAddr) -> Self {
        addr.b.reverse();
        crate::address::MacAddress::new(addr.b)
    }
}

/// `sockaddr_hci`: address of a raw HCI socket, identifying a dongle by
/// its kernel device index and the channel to bind (raw vs. control).
#[repr(C)]
#[derive(Clone, Copy)]
pub struct SockaddrHci {
    pub hci_family: sa_family_t,
    pub hci_dev: u16,
    pub hci_channel: u16,
}

/// HCI channel used for raw inquiry/event access.
pub const HCI_CHANNEL_RAW: u16 = 0;
