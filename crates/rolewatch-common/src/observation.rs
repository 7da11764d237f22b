//! Observation wire format
//!
//! Capture agents publish one JSON object per observed flow. Every field is
//! optional at the wire level and a field of the wrong type is read as
//! absent rather than rejecting the whole message; the feature extractor
//! decides which missing fields are fatal.

use serde::de::{DeserializeOwned, Deserializer};
use serde::{Deserialize, Serialize};

/// Flow 5-tuple as reported by the capture agent
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowTuple {
    /// Source IP address
    #[serde(default, deserialize_with = "lenient")]
    pub src_ip: Option<String>,
    /// Destination IP address
    #[serde(default, deserialize_with = "lenient")]
    pub dst_ip: Option<String>,
    /// Source port
    #[serde(default, deserialize_with = "lenient")]
    pub src_port: Option<u16>,
    /// Destination port
    #[serde(default, deserialize_with = "lenient")]
    pub dst_port: Option<u16>,
    /// IP protocol number (TCP=6, UDP=17)
    #[serde(default, deserialize_with = "lenient")]
    pub protocol: Option<u8>,
}

/// One raw capture event
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    /// Device identity (link-layer address)
    #[serde(default, deserialize_with = "lenient")]
    pub identity: Option<String>,
    /// Epoch seconds (float) or epoch milliseconds (integer)
    #[serde(default, deserialize_with = "lenient")]
    pub timestamp: Option<f64>,
    /// Flow 5-tuple
    #[serde(default, deserialize_with = "lenient")]
    pub flow: Option<FlowTuple>,
    /// Byte counter
    #[serde(default, deserialize_with = "lenient")]
    pub bytes: Option<u64>,
    /// Packet counter
    #[serde(default, deserialize_with = "lenient")]
    pub packets: Option<u64>,
    /// Flow duration in seconds
    #[serde(default, deserialize_with = "lenient")]
    pub duration: Option<f64>,
    /// Hex-encoded payload sample (may be truncated)
    #[serde(default, deserialize_with = "lenient")]
    pub payload: Option<String>,
    /// Capture source tag (switch/segment)
    #[serde(default, deserialize_with = "lenient")]
    pub source: Option<String>,
}

impl Observation {
    /// Decode from a broker payload
    pub fn from_slice(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }

    /// Encode for publishing
    pub fn to_vec(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).ok())
}
