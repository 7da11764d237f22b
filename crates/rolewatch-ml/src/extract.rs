//! Feature Extractor
//!
//! Turns one raw observation into a fixed-shape feature vector. Partial or
//! truncated data yields a best-effort subset; only an unrecoverable
//! identity or timestamp is a hard failure.

use crate::{FeatureVector, FEATURE_DIM};
use rolewatch_common::{DeviceId, Observation, RolewatchError, RolewatchResult, Timestamp};
use std::net::IpAddr;

/// Feature slot indices
pub mod idx {
    /// log(1 + bytes), scaled
    pub const LOG_BYTES: usize = 0;
    /// log(1 + packets), scaled
    pub const LOG_PACKETS: usize = 1;
    /// Mean packet size / MTU
    pub const MEAN_PACKET: usize = 2;
    /// Protocol is TCP
    pub const TCP: usize = 3;
    /// Protocol is UDP
    pub const UDP: usize = 4;
    /// Any other protocol
    pub const OTHER_PROTO: usize = 5;
    /// Service port below 1024
    pub const WELL_KNOWN_PORT: usize = 6;
    /// Print service port (LPD, IPP, JetDirect)
    pub const PRINT_PORT: usize = 7;
    /// Streaming port (RTSP, RTMP, DVR)
    pub const STREAM_PORT: usize = 8;
    /// Remote admin / web service port
    pub const ADMIN_PORT: usize = 9;
    /// SIP signalling port
    pub const SIP_PORT: usize = 10;
    /// Discovery / IoT messaging port or multicast destination
    pub const DISCOVERY: usize = 11;
    /// Payload Shannon entropy / 8
    pub const ENTROPY: usize = 12;
    /// Printable fraction of payload
    pub const PRINTABLE: usize = 13;
    /// log(1 + bytes per second), scaled
    pub const LOG_RATE: usize = 14;
    /// Fraction of optional fields that were recoverable
    pub const COMPLETENESS: usize = 15;
}

const MTU: f32 = 1500.0;
const MAX_PAYLOAD_SAMPLE: usize = 256;
/// Integer timestamps above this are milliseconds, below are seconds
const MILLIS_THRESHOLD: f64 = 1.0e11;

const PRINT_PORTS: &[u16] = &[515, 631, 9100];
const STREAM_PORTS: &[u16] = &[554, 1935, 8554, 37777];
const ADMIN_PORTS: &[u16] = &[22, 80, 443, 3389, 8080, 8443];
const SIP_PORTS: &[u16] = &[5060, 5061];
const DISCOVERY_PORTS: &[u16] = &[1883, 1900, 5353, 5683, 8883];

/// Extracted, derived features of one observation
#[derive(Debug, Clone)]
pub struct FlowFeatures {
    /// Device identity
    pub identity: DeviceId,
    /// Observation timestamp
    pub observed_at: Timestamp,
    /// Capture source tag
    pub source: Option<String>,
    /// Lower of the flow's registered ports, if any
    pub service_port: Option<u16>,
    /// IP protocol
    pub protocol: Option<u8>,
    /// Packet count (zero when unknown)
    pub packets: u64,
    /// Decoded payload sample (truncated)
    pub payload: Vec<u8>,
    /// Fraction of optional fields recovered
    pub completeness: f32,
    /// Content fingerprint, distinguishes redeliveries from conflicts
    pub fingerprint: u64,
    /// Model input
    pub vector: FeatureVector,
}

/// Extract features from an observation
pub fn extract(obs: &Observation) -> RolewatchResult<FlowFeatures> {
    let identity = match obs.identity.as_deref() {
        Some(raw) => DeviceId::parse(raw)?,
        None => return Err(RolewatchError::MalformedObservation("missing identity".into())),
    };
    let observed_at = parse_timestamp(obs.timestamp)?;

    let flow = obs.flow.clone().unwrap_or_default();
    let service_port = service_port(flow.src_port, flow.dst_port);
    let payload = obs.payload.as_deref().map(decode_payload).unwrap_or_default();

    let present = [
        obs.flow.is_some() && (flow.src_port.is_some() || flow.dst_port.is_some()),
        flow.protocol.is_some(),
        obs.bytes.is_some(),
        obs.packets.is_some(),
        obs.duration.is_some(),
        !payload.is_empty(),
        obs.source.is_some(),
    ];
    let completeness = present.iter().filter(|p| **p).count() as f32 / present.len() as f32;

    let bytes = obs.bytes.unwrap_or(0);
    let packets = obs.packets.unwrap_or(0);

    let mut v = FeatureVector::new(FEATURE_DIM);
    v.set(idx::LOG_BYTES, (bytes as f32).ln_1p() / 20.0);
    v.set(idx::LOG_PACKETS, (packets as f32).ln_1p() / 15.0);
    if packets > 0 {
        v.set(idx::MEAN_PACKET, (bytes as f32 / packets as f32 / MTU).min(1.0));
    }
    match flow.protocol {
        Some(6) => v.set(idx::TCP, 1.0),
        Some(17) => v.set(idx::UDP, 1.0),
        Some(_) => v.set(idx::OTHER_PROTO, 1.0),
        None => {}
    }
    if let Some(port) = service_port {
        v.set(idx::WELL_KNOWN_PORT, if port < 1024 { 1.0 } else { 0.0 });
        v.set(idx::PRINT_PORT, port_class(port, PRINT_PORTS));
        v.set(idx::STREAM_PORT, port_class(port, STREAM_PORTS));
        v.set(idx::ADMIN_PORT, port_class(port, ADMIN_PORTS));
        v.set(idx::SIP_PORT, port_class(port, SIP_PORTS));
        v.set(idx::DISCOVERY, port_class(port, DISCOVERY_PORTS));
    }
    if is_group_address(flow.dst_ip.as_deref()) {
        v.set(idx::DISCOVERY, 1.0);
    }
    if !payload.is_empty() {
        v.set(idx::ENTROPY, shannon_entropy(&payload) / 8.0);
        v.set(idx::PRINTABLE, printable_ratio(&payload));
    }
    if let Some(duration) = obs.duration.filter(|d| d.is_finite() && *d > 0.0) {
        let rate = bytes as f64 / duration;
        v.set(idx::LOG_RATE, (rate as f32).ln_1p() / 20.0);
    }
    v.set(idx::COMPLETENESS, completeness);

    let fingerprint = fingerprint(obs, &payload);

    Ok(FlowFeatures {
        identity,
        observed_at,
        source: obs.source.clone(),
        service_port,
        protocol: flow.protocol,
        packets,
        payload,
        completeness,
        fingerprint,
        vector: v,
    })
}

fn parse_timestamp(raw: Option<f64>) -> RolewatchResult<Timestamp> {
    let value = raw.ok_or_else(|| RolewatchError::MalformedObservation("missing timestamp".into()))?;
    let ts = if value >= MILLIS_THRESHOLD {
        Some(Timestamp::from_millis(value.round() as u64)).filter(|_| value.is_finite())
    } else {
        Timestamp::from_secs_f64(value)
    };
    ts.ok_or_else(|| RolewatchError::MalformedObservation(format!("unusable timestamp {}", value)))
}

fn service_port(src: Option<u16>, dst: Option<u16>) -> Option<u16> {
    [src, dst]
        .into_iter()
        .flatten()
        .filter(|p| *p > 0 && *p < 49152)
        .min()
}

#[inline]
fn port_class(port: u16, class: &[u16]) -> f32 {
    if class.contains(&port) { 1.0 } else { 0.0 }
}

fn is_group_address(ip: Option<&str>) -> bool {
    match ip.and_then(|s| s.parse::<IpAddr>().ok()) {
        Some(IpAddr::V4(v4)) => v4.is_multicast() || v4.is_broadcast(),
        Some(IpAddr::V6(v6)) => v6.is_multicast(),
        None => false,
    }
}

/// Decode as many whole bytes of a hex payload as are intact
fn decode_payload(raw: &str) -> Vec<u8> {
    let digits: String = raw
        .chars()
        .filter(|c| !c.is_whitespace())
        .take_while(|c| c.is_ascii_hexdigit())
        .take(MAX_PAYLOAD_SAMPLE * 2)
        .collect();
    let whole = digits.len() - digits.len() % 2;
    hex::decode(&digits[..whole]).unwrap_or_default()
}

fn shannon_entropy(data: &[u8]) -> f32 {
    let mut counts = [0u32; 256];
    for b in data {
        counts[*b as usize] += 1;
    }
    let len = data.len() as f32;
    counts
        .iter()
        .filter(|c| **c > 0)
        .map(|c| {
            let p = *c as f32 / len;
            -p * p.log2()
        })
        .sum()
}

fn printable_ratio(data: &[u8]) -> f32 {
    let printable = data
        .iter()
        .filter(|b| matches!(**b, 0x20..=0x7e | b'\r' | b'\n' | b'\t'))
        .count();
    printable as f32 / data.len() as f32
}

fn fingerprint(obs: &Observation, payload: &[u8]) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;

    let flow = obs.flow.clone().unwrap_or_default();
    let mut h = FNV_OFFSET;
    let mut feed = |bytes: &[u8]| {
        for byte in bytes {
            h ^= *byte as u64;
            h = h.wrapping_mul(FNV_PRIME);
        }
    };
    feed(&obs.bytes.unwrap_or(u64::MAX).to_le_bytes());
    feed(&obs.packets.unwrap_or(u64::MAX).to_le_bytes());
    feed(&obs.duration.unwrap_or(-1.0).to_bits().to_le_bytes());
    feed(&flow.src_port.unwrap_or(0).to_le_bytes());
    feed(&flow.dst_port.unwrap_or(0).to_le_bytes());
    feed(&[flow.protocol.unwrap_or(0)]);
    feed(flow.src_ip.as_deref().unwrap_or("").as_bytes());
    feed(flow.dst_ip.as_deref().unwrap_or("").as_bytes());
    feed(payload);
    feed(obs.source.as_deref().unwrap_or("").as_bytes());
    h
}
