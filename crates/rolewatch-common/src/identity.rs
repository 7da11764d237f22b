//! Device identities and role labels

use crate::RolewatchError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Longest accepted non-MAC identifier
const MAX_IDENTITY_LEN: usize = 64;

/// Stable device key derived from the observed link-layer address
///
/// MAC addresses are normalised to lowercase colon form, so `AA-BB-..`,
/// `aabb..` and `aa:bb:..` all name the same device. Other stable tokens
/// are accepted verbatim.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    /// Parse and normalise an identity
    pub fn parse(raw: &str) -> Result<Self, RolewatchError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(RolewatchError::MalformedObservation("empty identity".into()));
        }

        if let Some(mac) = normalize_mac(raw) {
            return Ok(Self(mac));
        }

        let valid = raw.len() <= MAX_IDENTITY_LEN
            && raw
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, ':' | '.' | '_' | '-'));
        if !valid {
            return Err(RolewatchError::MalformedObservation(format!(
                "unusable identity {:?}",
                raw
            )));
        }
        Ok(Self(raw.to_string()))
    }

    /// Identity as string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// FNV-1a hash, stable across processes (used for shard selection)
    #[inline]
    pub fn stable_hash(&self) -> u64 {
        const FNV_OFFSET: u64 = 0xcbf29ce484222325;
        const FNV_PRIME: u64 = 0x100000001b3;

        let mut h = FNV_OFFSET;
        for byte in self.0.as_bytes() {
            h ^= *byte as u64;
            h = h.wrapping_mul(FNV_PRIME);
        }
        h
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// `aabbccddeeff`, or six octets split by one separator (`:` or `-`)
fn normalize_mac(raw: &str) -> Option<String> {
    let bytes = raw.as_bytes();
    let hex: Vec<u8> = match bytes.len() {
        12 => bytes.to_vec(),
        17 => {
            let sep = bytes[2];
            if sep != b':' && sep != b'-' {
                return None;
            }
            let mut hex = Vec::with_capacity(12);
            for (i, b) in bytes.iter().enumerate() {
                if i % 3 == 2 {
                    if *b != sep {
                        return None;
                    }
                } else {
                    hex.push(*b);
                }
            }
            hex
        }
        _ => return None,
    };
    if !hex.iter().all(u8::is_ascii_hexdigit) {
        return None;
    }

    let lower = String::from_utf8(hex).ok()?.to_ascii_lowercase();
    let octets: Vec<&str> = (0..6).map(|i| &lower[i * 2..i * 2 + 2]).collect();
    Some(octets.join(":"))
}

/// Behavioral role label (e.g. `printer`, `workstation`)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Label(String);

impl Label {
    /// Label of a device with no classification yet
    pub const UNKNOWN: &'static str = "unknown";

    /// Create a label (lowercased)
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(name.as_ref().trim().to_ascii_lowercase())
    }

    /// The `unknown` label
    pub fn unknown() -> Self {
        Self(Self::UNKNOWN.to_string())
    }

    /// Whether this is the `unknown` label
    pub fn is_unknown(&self) -> bool {
        self.0 == Self::UNKNOWN
    }

    /// Label as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Label {
    fn default() -> Self {
        Self::unknown()
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Label {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}
