use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{PulseError, PulseResult};
use crate::models::{coerce_f64, CreditRecord, Credits, Segment};
use crate::race::best_effort_all;
use crate::rpc::HTTP_CLIENT;

/// Field wrapping the record array in the object-shaped ledger response.
pub const WRAPPER_FIELD: &str = "pods_credits";

pub trait LedgerSource: Send + Sync {
    fn fetch_ledger(&self, segment: Segment) -> BoxFuture<'_, PulseResult<Vec<CreditRecord>>>;
}

/// Ledger served over plain HTTP GET, one url per segment.
#[derive(Debug, Clone)]
pub struct HttpLedger {
    pub mainnet_url: String,
    pub devnet_url: String,
}

impl LedgerSource for HttpLedger {
    fn fetch_ledger(&self, segment: Segment) -> BoxFuture<'_, PulseResult<Vec<CreditRecord>>> {
        let url = match segment {
            Segment::Mainnet => &self.mainnet_url,
            Segment::Devnet => &self.devnet_url,
        };
        async move {
            let response = HTTP_CLIENT.get(url.as_str()).send().await?;
            if !response.status().is_success() {
                return Err(PulseError::Status(response.status().as_u16()));
            }
            let body: Value = response.json().await?;
            parse_ledger(&body)
        }
        .boxed()
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum LedgerPayload {
    Bare(Vec<Value>),
    Wrapped { pods_credits: Vec<Value> },
}

/// Accepts either a bare array of records or an object wrapping the array
/// under [`WRAPPER_FIELD`]. Records without a key or a numeric credit value
/// are skipped.
pub fn parse_ledger(body: &Value) -> PulseResult<Vec<CreditRecord>> {
    let entries = match LedgerPayload::deserialize(body) {
        Ok(LedgerPayload::Bare(entries)) => entries,
        Ok(LedgerPayload::Wrapped { pods_credits }) => pods_credits,
        Err(_) => {
            return Err(PulseError::Malformed(format!(
                "expected an array or an object with `{WRAPPER_FIELD}`"
            )))
        }
    };

    Ok(entries
        .iter()
        .filter_map(|entry| {
            let obj = entry.as_object()?;
            let pod_id = ["pod_id", "podId", "pubkey"]
                .iter()
                .find_map(|name| obj.get(*name).and_then(Value::as_str))
                .map(str::trim)
                .filter(|id| !id.is_empty())?;
            let credits = coerce_f64(obj.get("credits"))?;
            Some(CreditRecord {
                pod_id: pod_id.to_string(),
                credits,
            })
        })
        .collect())
}

/// Both ledgers as lookup maps. A key in one map says nothing about the
/// other.
#[derive(Debug, Clone, Default)]
pub struct CreditsSnapshot {
    pub mainnet: HashMap<String, f64>,
    pub devnet: HashMap<String, f64>,
    /// True when either segment returned at least one record.
    pub online: bool,
}

impl CreditsSnapshot {
    pub fn from_records(mainnet: Vec<CreditRecord>, devnet: Vec<CreditRecord>) -> Self {
        let online = !mainnet.is_empty() || !devnet.is_empty();
        let into_map = |records: Vec<CreditRecord>| {
            records
                .into_iter()
                .map(|record| (record.pod_id, record.credits))
                .collect::<HashMap<_, _>>()
        };
        Self {
            mainnet: into_map(mainnet),
            devnet: into_map(devnet),
            online,
        }
    }

    pub fn ledger(&self, segment: Segment) -> &HashMap<String, f64> {
        match segment {
            Segment::Mainnet => &self.mainnet,
            Segment::Devnet => &self.devnet,
        }
    }

    /// Credit standing of `key` in the ledger of `segment`.
    pub fn standing(&self, segment: Segment, key: &str) -> Credits {
        match self.ledger(segment).get(key) {
            Some(amount) => Credits::Known(*amount),
            None if self.online => Credits::NotInLedger,
            None => Credits::Unknown,
        }
    }

    pub fn median(&self, segment: Segment) -> f64 {
        let values: Vec<f64> = self.ledger(segment).values().copied().collect();
        crate::pulse::median(values)
    }
}

pub struct CreditsFetcher {
    source: Arc<dyn LedgerSource>,
    timeout: Duration,
}

impl CreditsFetcher {
    pub fn new(source: Arc<dyn LedgerSource>, timeout: Duration) -> Self {
        Self { source, timeout }
    }

    /// Fetches both segments concurrently. A failing segment contributes an
    /// empty ledger and never affects its sibling.
    pub async fn fetch_credits(&self) -> CreditsSnapshot {
        let segments = [Segment::Mainnet, Segment::Devnet];
        let mut outcomes = best_effort_all(
            segments.iter().map(|segment| self.source.fetch_ledger(*segment)),
            self.timeout,
        )
        .await
        .into_iter()
        .zip(segments)
        .map(|(outcome, segment)| match outcome {
            Ok(records) => {
                debug!(?segment, records = records.len(), "ledger fetched");
                records
            }
            Err(err) => {
                warn!(?segment, %err, "ledger unavailable");
                Vec::new()
            }
        });

        let mainnet = outcomes.next().unwrap_or_default();
        let devnet = outcomes.next().unwrap_or_default();
        CreditsSnapshot::from_records(mainnet, devnet)
    }
}
