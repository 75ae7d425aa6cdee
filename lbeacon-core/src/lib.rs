//! # lbeacon-core — the LBeacon sighting pipeline
//!
//! This crate implements the non-interactive half of an LBeacon node: the
//! part that runs unattended on fixed indoor-positioning hardware once it
//! has been installed at a known location.
//!
//! Four things happen concurrently, all driven from [`supervisor::run`]:
//!
//! * [advertising](ble::advertiser) a location-derived iBeacon-shaped
//!   payload over BLE, so that passing devices can estimate their
//!   position from RSSI to one or more beacons;
//! * [scanning](br) for classic Bluetooth (BR/EDR) devices in range,
//!   filtered by RSSI and MAC-address prefix;
//! * [scanning](ble::scanner) for BLE advertisements from tracked tags,
//!   classified by their manufacturer-specific data;
//! * forwarding accumulated sightings to a central [gateway] over UDP,
//!   and receiving live reconfiguration from it.
//!
//! A fixed-capacity [`store::SightingStore`] sits between the scanners and
//! the gateway session: one slab of records, indexed by two intrusive
//! linked lists (one for deduplication/dwell tracking, one for records
//! awaiting upload).
//!
//! This library depends on raw HCI sockets rather than a D-Bus-mediated
//! Bluetooth daemon, since advertising and inquiry scanning at the cadence
//! this firmware needs are not exposed by BlueZ's D-Bus API.

#![warn(missing_docs)]

#[cfg(not(target_os = "linux"))]
compile_error!("lbeacon-core only supports the Linux operating system.");

pub mod address;
pub mod ble;
pub mod br;
pub mod clock;
pub mod config;
pub mod error;
pub mod gateway;
pub mod health;
pub mod hci;
pub mod list;
pub mod packet_queue;
pub mod record;
pub mod shutdown;
pub mod slab;
pub mod sock;
pub mod store;
pub mod supervisor;
mod sys;

pub use address::{MacAddress, MacPrefix};
pub use error::{Error, ErrorKind, Result};
pub use record::{DeviceKind, SightingRecord};
