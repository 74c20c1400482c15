use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use once_cell::sync::Lazy;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::error::{PulseError, PulseResult};
use crate::models::RawNodeRecord;

pub const PODS_METHOD: &str = "get-pods-with-stats";

// Shared pooled client for every upstream (RPC, ledger, geolocation).
// Per-call deadlines are enforced by the callers with tokio timeouts.
pub static HTTP_CLIENT: Lazy<Client> = Lazy::new(|| {
    reqwest::ClientBuilder::new()
        .pool_idle_timeout(Duration::from_secs(300))
        .pool_max_idle_per_host(20)
        .timeout(Duration::from_secs(30))
        .connect_timeout(Duration::from_secs(10))
        .tcp_keepalive(Duration::from_secs(30))
        .user_agent("network-pulse/0.1")
        .build()
        .expect("Failed to create HTTP client")
});

#[derive(Debug, Clone, Serialize, Deserialize)]
struct JsonRpcRequest {
    jsonrpc: String,
    id: String,
    method: String,
    params: Value,
}

#[derive(Debug, Clone, Deserialize)]
struct JsonRpcResponse {
    result: Option<Value>,
    error: Option<JsonRpcError>,
}

#[derive(Debug, Clone, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

/// One polling unit: a single call of [`PODS_METHOD`] against one endpoint.
pub trait NodeSource: Send + Sync {
    fn fetch_pods<'a>(&'a self, endpoint: &'a str) -> BoxFuture<'a, PulseResult<Vec<RawNodeRecord>>>;
}

/// [`NodeSource`] speaking JSON-RPC 2.0 over HTTP.
#[derive(Debug, Clone, Default)]
pub struct JsonRpcSource;

impl NodeSource for JsonRpcSource {
    fn fetch_pods<'a>(&'a self, endpoint: &'a str) -> BoxFuture<'a, PulseResult<Vec<RawNodeRecord>>> {
        async move {
            let result = rpc_call(endpoint, PODS_METHOD, Value::Array(Vec::new())).await?;
            parse_pods(&result)
        }
        .boxed()
    }
}

async fn rpc_call(url: &str, method: &str, params: Value) -> PulseResult<Value> {
    let request = JsonRpcRequest {
        jsonrpc: "2.0".to_string(),
        id: Uuid::new_v4().to_string(),
        method: method.to_string(),
        params,
    };

    let response = HTTP_CLIENT
        .post(url)
        .header("Content-Type", "application/json")
        .json(&request)
        .send()
        .await?;

    if !response.status().is_success() {
        return Err(PulseError::Status(response.status().as_u16()));
    }

    let body = response.text().await?;
    let rpc_response: JsonRpcResponse = serde_json::from_str(&body)?;

    if let Some(error) = rpc_response.error {
        return Err(PulseError::Rpc {
            code: error.code,
            message: error.message,
        });
    }

    rpc_response
        .result
        .ok_or_else(|| PulseError::Malformed("missing result in RPC response".to_string()))
}

/// Validates the `result` of a pods call. The list lives at `result.pods`;
/// a missing or empty list counts as failure. Individual records without a
/// node key are dropped, and if none survive the response is malformed.
pub fn parse_pods(result: &Value) -> PulseResult<Vec<RawNodeRecord>> {
    let pods = result
        .get("pods")
        .and_then(Value::as_array)
        .ok_or_else(|| PulseError::Malformed("result.pods is not a list".to_string()))?;

    if pods.is_empty() {
        return Err(PulseError::Malformed("empty pod list".to_string()));
    }

    let mut records = Vec::with_capacity(pods.len());
    let mut rejected = 0usize;
    for pod in pods {
        match RawNodeRecord::from_value(pod) {
            Ok(record) => records.push(record),
            Err(_) => rejected += 1,
        }
    }
    if rejected > 0 {
        debug!(rejected, kept = records.len(), "dropped pod records without identity");
    }
    if records.is_empty() {
        return Err(PulseError::Malformed("no valid pod records".to_string()));
    }
    Ok(records)
}
