use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::Error;

/// A 48-bit Ethernet hardware address.
///
/// Displayed and serialized as lower-case, colon-separated hex
/// (`aa:bb:cc:dd:ee:ff`). Parsing also accepts `-` separators and upper-case
/// digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    /// Builds an address from the first six bytes of a `chaddr` field.
    ///
    /// Shorter hardware addresses are zero-padded.
    pub fn from_hardware(bytes: &[u8]) -> Self {
        let mut octets = [0u8; 6];
        let len = bytes.len().min(6);
        octets[..len].copy_from_slice(&bytes[..len]);
        Self(octets)
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl FromStr for MacAddress {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_lowercase().replace('-', ":");
        let mut octets = [0u8; 6];
        let mut count = 0;

        for part in normalized.split(':') {
            if count == 6 || part.is_empty() || part.len() > 2 {
                return Err(Error::InvalidMac(value.to_string()));
            }
            octets[count] =
                u8::from_str_radix(part, 16).map_err(|_| Error::InvalidMac(value.to_string()))?;
            count += 1;
        }

        if count != 6 {
            return Err(Error::InvalidMac(value.to_string()));
        }

        Ok(Self(octets))
    }
}

impl Serialize for MacAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        value.parse().map_err(serde::de::Error::custom)
    }
}
