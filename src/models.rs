use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::error::RecordError;

/// Version reported for records that carry none.
pub const UNKNOWN_VERSION: &str = "0.0.0";

/// Pod telemetry as one RPC endpoint reported it, after coercion.
///
/// Field defaults when missing or garbage:
///
/// | Field | Default |
/// |-------|---------|
/// | `address` | `""` |
/// | `version` | `"0.0.0"` |
/// | `uptime`, `storage_committed`, `storage_used` | `0` |
/// | `is_public`, `is_operator` | `false` |
///
/// A record without a node key is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RawNodeRecord {
    pub pubkey: String,
    pub address: String,
    pub version: String,
    pub uptime: u64,
    pub storage_committed: u64,
    pub storage_used: u64,
    pub is_public: bool,
    pub is_operator: bool,
}

impl RawNodeRecord {
    pub fn from_value(value: &Value) -> Result<Self, RecordError> {
        let obj = value.as_object().ok_or(RecordError::NotAnObject)?;

        let pubkey = field(obj, &["pubkey", "pubKey", "node_key", "id"])
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .ok_or(RecordError::MissingKey)?
            .to_string();

        let address = field(obj, &["address", "addr"])
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim()
            .to_string();

        let version = field(obj, &["version"])
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .unwrap_or(UNKNOWN_VERSION)
            .to_string();

        Ok(Self {
            pubkey,
            address,
            version,
            uptime: coerce_u64(field(obj, &["uptime"])),
            storage_committed: coerce_u64(field(obj, &["storage_committed", "storageCommitted"])),
            storage_used: coerce_u64(field(obj, &["storage_used", "storageUsed"])),
            is_public: coerce_bool(field(obj, &["is_public", "isPublic"])),
            is_operator: coerce_bool(field(obj, &["is_operator", "isOperator"])),
        })
    }
}

fn field<'a>(obj: &'a Map<String, Value>, names: &[&str]) -> Option<&'a Value> {
    names.iter().find_map(|name| obj.get(*name)).filter(|v| !v.is_null())
}

/// Number or numeric string to f64. Anything else, including non-finite
/// values, becomes `None`.
pub fn coerce_f64(value: Option<&Value>) -> Option<f64> {
    let parsed = match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|v| v.is_finite())
}

pub fn coerce_u64(value: Option<&Value>) -> u64 {
    if let Some(Value::Number(n)) = value {
        if let Some(v) = n.as_u64() {
            return v;
        }
    }
    if let Some(Value::String(s)) = value {
        if let Ok(v) = s.trim().parse::<u64>() {
            return v;
        }
    }
    match coerce_f64(value) {
        Some(v) if v > 0.0 => v as u64,
        _ => 0,
    }
}

pub fn coerce_bool(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => matches!(s.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes"),
        Some(Value::Number(n)) => n.as_f64().map_or(false, |v| v != 0.0),
        _ => false,
    }
}

pub fn host_of(address: &str) -> &str {
    if let Ok(sock) = address.parse::<SocketAddr>() {
        // "[::1]:6000" keeps its brackets in the raw text
        let host = match sock {
            SocketAddr::V4(_) => address.rsplit_once(':').map_or(address, |(h, _)| h),
            SocketAddr::V6(_) => address
                .rsplit_once(':')
                .map_or(address, |(h, _)| h.trim_start_matches('[').trim_end_matches(']')),
        };
        return host;
    }
    match address.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') && port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => address,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Segment {
    Mainnet,
    Devnet,
}

/// Credit standing of a node against the ledger of its segment.
///
/// `NotInLedger` means the ledger answered and has no entry. `Unknown` means
/// the ledger could not be consulted at all. Both serialize as `null`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Credits {
    Known(f64),
    NotInLedger,
    Unknown,
}

impl Credits {
    pub fn amount(&self) -> Option<f64> {
        match self {
            Credits::Known(amount) => Some(*amount),
            Credits::NotInLedger | Credits::Unknown => None,
        }
    }
}

impl Serialize for Credits {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.amount().serialize(serializer)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditRecord {
    pub pod_id: String,
    pub credits: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoLocation {
    pub lat: f64,
    pub lon: f64,
    pub country: String,
    pub country_code: String,
    pub city: String,
}

impl GeoLocation {
    /// Location recorded for addresses with no public geolocation.
    pub fn sentinel() -> Self {
        Self {
            lat: 0.0,
            lon: 0.0,
            country: "Private Network".to_string(),
            country_code: String::new(),
            city: String::new(),
        }
    }

    pub fn is_sentinel(&self) -> bool {
        self.lat == 0.0 && self.lon == 0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HealthBreakdown {
    pub uptime: f64,
    pub version: f64,
    /// `None` only while the ledger is offline.
    pub reputation: Option<f64>,
    pub storage: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HealthScore {
    pub total: f64,
    pub breakdown: HealthBreakdown,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnrichedNode {
    pub pubkey: String,
    pub segment: Segment,
    pub address: String,
    pub version: String,
    pub uptime: u64,
    pub storage_committed: u64,
    pub storage_used: u64,
    pub credits: Credits,
    pub is_untracked: bool,
    pub is_public: bool,
    pub is_operator: bool,
    pub location: GeoLocation,
    pub health: f64,
    pub health_breakdown: HealthBreakdown,
    /// Credit rank within the node's segment.
    pub rank: usize,
    /// Health rank across both segments.
    pub health_rank: usize,
}

impl EnrichedNode {
    /// Node with observation fields filled in and everything computed later
    /// (location, health, ranks) left at neutral values.
    pub fn from_raw(raw: &RawNodeRecord, segment: Segment, credits: Credits, is_untracked: bool) -> Self {
        Self {
            pubkey: raw.pubkey.clone(),
            segment,
            address: raw.address.clone(),
            version: raw.version.clone(),
            uptime: raw.uptime,
            storage_committed: raw.storage_committed,
            storage_used: raw.storage_used,
            credits,
            is_untracked,
            is_public: raw.is_public,
            is_operator: raw.is_operator,
            location: GeoLocation::sentinel(),
            health: 0.0,
            health_breakdown: HealthBreakdown {
                uptime: 0.0,
                version: 0.0,
                reputation: None,
                storage: 0.0,
            },
            rank: 0,
            health_rank: 0,
        }
    }

    pub fn host(&self) -> &str {
        host_of(&self.address)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AverageBreakdown {
    pub uptime: f64,
    pub version: f64,
    pub reputation: Option<f64>,
    pub storage: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct NetworkStats {
    pub consensus_version: String,
    pub median_storage: f64,
    pub median_credits_mainnet: f64,
    pub median_credits_devnet: f64,
    pub total_nodes: usize,
    pub mainnet_nodes: usize,
    pub devnet_nodes: usize,
    pub private_online: bool,
    pub public_online: bool,
    pub credits_online: bool,
    pub private_records: usize,
    pub public_records: usize,
    pub duplicates_discarded: usize,
    pub key_conflicts: usize,
    pub average_health: f64,
    pub average_breakdown: AverageBreakdown,
}

#[derive(Debug, Clone, Serialize)]
pub struct PulseSnapshot {
    pub generated_at: DateTime<Utc>,
    /// `false` only when both RPC channels came back empty.
    pub online: bool,
    pub nodes: Vec<EnrichedNode>,
    pub stats: NetworkStats,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EndpointStatus {
    pub url: String,
    pub is_hero: bool,
    pub failures: u32,
    pub active: bool,
}
