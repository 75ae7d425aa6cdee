//! Bluetooth device addresses.
//!
//! Storage is normalized (uppercase hex, colon separated) per spec §3;
//! comparison is case-insensitive because parsing always normalizes first.

use std::{
    fmt::{self, Debug, Display, Formatter},
    str::FromStr,
};

use macaddr::MacAddr6;

use crate::error::{Error, ErrorKind};

/// A canonical 17-character Bluetooth device address, e.g. `AA:BB:CC:DD:EE:FF`.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    /// Number of characters in the canonical string form, including colons
    /// but not a terminator (spec §3 counts the terminator separately).
    pub const STRING_LEN: usize = 17;

    /// Creates an address from six raw octets.
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    /// Raw octets, most significant first.
    pub const fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Returns whether `self` shares the leading `digits` hex digits with
    /// `prefix`. This implements the "prefix-only comparison" rule chosen
    /// to resolve the Open Question in spec §9 about `NUMBER_DIGITS_TO_COMPARE`
    /// versus split first/last comparison: we compare only the leading
    /// digits of the canonical hex string, ignoring colons.
    pub fn matches_prefix(&self, prefix: &MacPrefix) -> bool {
        let hex = self.to_hex_digits();
        hex.starts_with(prefix.digits())
    }

    fn to_hex_digits(&self) -> String {
        self.0.iter().map(|b| format!("{b:02X}")).collect()
    }
}

impl Display for MacAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl Debug for MacAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl FromStr for MacAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let octets: Vec<u8> = s
            .split(':')
            .map(|part| {
                u8::from_str_radix(part, 16)
                    .map_err(|_| Error::with_message(ErrorKind::ProtocolError, format!("invalid MAC address: {s}")))
            })
            .collect::<Result<_, _>>()?;
        let octets: [u8; 6] = octets
            .try_into()
            .map_err(|_| Error::with_message(ErrorKind::ProtocolError, format!("invalid MAC address: {s}")))?;
        Ok(Self(octets))
    }
}

impl From<MacAddr6> for MacAddress {
    fn from(addr: MacAddr6) -> Self {
        Self(addr.into_array())
    }
}

impl From<MacAddress> for MacAddr6 {
    fn from(addr: MacAddress) -> Self {
        addr.0.into()
    }
}

/// A configured acceptable MAC address prefix, e.g. `AA:BB`.
///
/// Stored as the leading hex digits with colons stripped, so that
/// [`MacAddress::matches_prefix`] is a plain string-prefix check.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MacPrefix(String);

impl MacPrefix {
    fn digits(&self) -> &str {
        &self.0
    }
}

impl Display for MacPrefix {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MacPrefix {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits: String = s.chars().filter(|c| *c != ':').collect();
        if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::with_message(ErrorKind::Config, format!("invalid MAC prefix: {s}")));
        }
        Ok(Self(digits.to_ascii_uppercase()))
    }
}
