//! Error types for the LBeacon sighting pipeline.

use std::fmt;

/// Result type returned by fallible operations in this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// An error raised anywhere in the sighting pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Error {
    /// Error kind.
    pub kind: ErrorKind,
    /// Detailed message, if any extra context beyond the kind is available.
    pub message: String,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind) -> Self {
        Self { kind, message: String::new() }
    }

    pub(crate) fn with_message(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}: {}", self.kind, self.message)
        }
    }
}

impl std::error::Error for Error {}

/// Taxonomy of errors, and their handling policy per spec §7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, displaydoc::Display)]
#[non_exhaustive]
pub enum ErrorKind {
    /// configuration file parse failure or out-of-range value
    Config,
    /// another instance of LBeacon already holds the pid lock
    AlreadyRunning,
    /// the requested Bluetooth dongle could not be opened
    DongleUnavailable,
    /// the advertising controller did not acknowledge within the timeout
    AdvertiseTimeout,
    /// the advertising controller could not be opened
    AdvertiseOpen,
    /// the advertising controller returned a non-zero status byte
    AdvertiseStatus,
    /// the sighting slab is exhausted; the sighting was dropped
    StoreFull,
    /// a UDP send or receive to the gateway failed
    TransportError,
    /// a malformed packet was received from the gateway
    ProtocolError,
    /// cooperative shutdown was requested
    Shutdown,
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::with_message(ErrorKind::TransportError, err.to_string())
    }
}

impl From<nix::Error> for Error {
    fn from(err: nix::Error) -> Self {
        Self::with_message(ErrorKind::DongleUnavailable, err.to_string())
    }
}
