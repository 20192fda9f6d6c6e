use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable hardware identifier sent to the license authority and expected back
/// in its response. Encoded as the decimal value of the 48-bit MAC address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceIdentity(String);

impl DeviceIdentity {
    pub fn from_mac(mac: [u8; 6]) -> Self {
        let value = mac
            .iter()
            .fold(0_u64, |acc, byte| (acc << 8) | u64::from(*byte));
        Self(value.to_string())
    }

    /// Parses `AA:BB:CC:DD:EE:FF` (or `-` separated) notation.
    pub fn parse_mac(text: &str) -> Option<Self> {
        let mut mac = [0_u8; 6];
        let mut parts = text.trim().split([':', '-']);
        for byte in &mut mac {
            let part = parts.next()?;
            if part.len() != 2 {
                return None;
            }
            *byte = u8::from_str_radix(part, 16).ok()?;
        }
        if parts.next().is_some() {
            return None;
        }
        Some(Self::from_mac(mac))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn matches(&self, echoed: &str) -> bool {
        self.0 == echoed.trim()
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
