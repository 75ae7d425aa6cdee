//! Raw HCI socket primitives used by the BR/EDR scanner and BLE advertiser.
//!
//! Unlike the rest of this crate these calls are blocking; callers run them
//! inside `tokio::task::spawn_blocking` (spec §5: "Blocking syscalls ... are
//! the only suspension points" for the HCI-facing components).

use std::{
    io::{Error, ErrorKind, Result},
    mem::size_of,
    os::unix::io::{AsRawFd, RawFd},
};

use libc::{c_int, sockaddr, socklen_t, SOCK_CLOEXEC};

use crate::sys::{SockaddrHci, AF_BLUETOOTH, BTPROTO_HCI, HCI_CHANNEL_RAW};

/// A raw HCI socket bound to one dongle, closed on drop.
#[derive(Debug)]
pub struct HciSocket {
    fd: RawFd,
}

impl HciSocket {
    /// Opens a raw HCI socket bound to the dongle with kernel index `dev_id`.
    pub fn open(dev_id: u16) -> Result<Self> {
        let fd = match unsafe { libc::socket(AF_BLUETOOTH, libc::SOCK_RAW | SOCK_CLOEXEC, BTPROTO_HCI) } {
            -1 => return Err(Error::last_os_error()),
            fd => fd,
        };
        let this = Self { fd };

        let addr = SockaddrHci { hci_family: AF_BLUETOOTH as _, hci_dev: dev_id, hci_channel: HCI_CHANNEL_RAW };
        if unsafe {
            libc::bind(fd, &addr as *const _ as *const sockaddr, size_of::<SockaddrHci>() as socklen_t)
        } != 0
        {
            return Err(Error::last_os_error());
        }

        Ok(this)
    }

    /// Installs a filter accepting only the given HCI event type mask,
    /// mirroring `hci_filter_set_ptype`/`hci_filter_set_event` in BlueZ.
    pub fn set_event_filter(&self, event_mask: u32) -> Result<()> {
        // The kernel's `struct hci_filter` is four `u32`s: type mask,
        // event mask (low/high) and opcode. We only ever filter on events.
        let filter: [u32; 4] = [1 << 4 /* HCI_EVENT_PKT */, event_mask, 0, 0];
        if unsafe {
            libc::setsockopt(
                self.fd,
                crate::sys::SOL_HCI,
                crate::sys::HCI_FILTER,
                filter.as_ptr() as *const _,
                size_of::<[u32; 4]>() as socklen_t,
            )
        } != 0
        {
            return Err(Error::last_os_error());
        }
        Ok(())
    }

    /// Sends a raw HCI command packet (the caller supplies the full framing
    /// byte plus opcode and parameters).
    pub fn send(&self, packet: &[u8]) -> Result<usize> {
        match unsafe { libc::write(self.fd, packet.as_ptr() as *const _, packet.len()) } {
            -1 => Err(Error::last_os_error()),
            n => Ok(n as usize),
        }
    }

    /// Blocks until an HCI event packet arrives or the socket is closed
    /// from another thread (used to force wakeup on shutdown, per spec §5).
    pub fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        match unsafe { libc::read(self.fd, buf.as_mut_ptr() as *mut _, buf.len()) } {
            -1 => {
                let err = Error::last_os_error();
                if err.kind() == ErrorKind::Interrupted {
                    Ok(0)
                } else {
                    Err(err)
                }
            }
            n => Ok(n as usize),
        }
    }

    /// Waits for the socket to become readable, with a timeout, using
    /// `poll(2)`. Returns `Ok(true)` if readable, `Ok(false)` on timeout.
    pub fn poll_readable(&self, timeout_ms: i32) -> Result<bool> {
        let mut pfd = libc::pollfd { fd: self.fd, events: libc::POLLIN, revents: 0 };
        match unsafe { libc::poll(&mut pfd, 1, timeout_ms as c_int) } {
            -1 => Err(Error::last_os_error()),
            0 => Ok(false),
            _ => Ok(pfd.revents & libc::POLLIN != 0),
        }
    }
}

impl AsRawFd for HciSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for HciSocket {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opening_an_absent_dongle_fails_cleanly() {
        // Device index far beyond any plausible adapter count; the kernel
        // rejects the bind with ENODEV, which we must surface as an error
        // rather than panicking.
        let result = HciSocket::open(u16::MAX);
        assert!(result.is_err());
    }
}
