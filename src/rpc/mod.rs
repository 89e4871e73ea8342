//! JSON-RPC client for the fork node's wire contract.
//!
//! The methods consumed here (`eth_blockNumber`, `evm_snapshot`,
//! `evm_revert`, `anvil_dumpState`, `anvil_loadState`, `anvil_reset`) are
//! fixed wire contracts of anvil-style fork nodes. Calls block until the
//! network call completes or errors; transient failures are never retried
//! here — that is the caller's policy.

use serde::Deserialize;
use serde_json::{json, Value};

use crate::{AppError, Result};

/// JSON-RPC 2.0 response envelope.
#[derive(Debug, Deserialize)]
struct RpcResponse {
    result: Option<Value>,
    error: Option<RpcErrorBody>,
}

/// Node-side error object.
#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

/// Client for one fork node's JSON-RPC endpoint.
#[derive(Debug, Clone)]
pub struct RpcClient {
    http: reqwest::Client,
    endpoint: String,
}

impl RpcClient {
    /// Create a client for the given endpoint URL.
    #[must_use]
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }

    /// The endpoint URL this client talks to.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Issue a raw JSON-RPC call and unwrap the response envelope.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Rpc` on transport failure or a node-side error
    /// object.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        let response: RpcResponse = self
            .http
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await?
            .json()
            .await?;

        if let Some(err) = response.error {
            return Err(AppError::Rpc(format!(
                "{method} failed: {} (code {})",
                err.message, err.code
            )));
        }

        response
            .result
            .ok_or_else(|| AppError::Rpc(format!("{method} returned neither result nor error")))
    }

    /// Current block number of the fork.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Rpc` on transport failure or a malformed quantity.
    pub async fn block_number(&self) -> Result<u64> {
        let result = self.call("eth_blockNumber", json!([])).await?;
        parse_quantity(&result)
    }

    /// Take a cheap in-memory snapshot; returns the node's opaque token.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Rpc` on transport failure or a non-string token.
    pub async fn snapshot(&self) -> Result<String> {
        let result = self.call("evm_snapshot", json!([])).await?;
        result
            .as_str()
            .map(ToOwned::to_owned)
            .ok_or_else(|| AppError::Rpc(format!("evm_snapshot returned non-string: {result}")))
    }

    /// Revert the fork to a previously taken snapshot.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Rpc` on transport failure.
    pub async fn revert(&self, snapshot_id: &str) -> Result<bool> {
        let result = self.call("evm_revert", json!([snapshot_id])).await?;
        Ok(result.as_bool().unwrap_or(false))
    }

    /// Export the fork's full state as an opaque hex blob.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Rpc` on transport failure or a non-string blob.
    pub async fn dump_state(&self) -> Result<String> {
        let result = self.call("anvil_dumpState", json!([])).await?;
        result
            .as_str()
            .map(ToOwned::to_owned)
            .ok_or_else(|| AppError::Rpc(format!("anvil_dumpState returned non-string: {result}")))
    }

    /// Load a previously exported state blob into the fork.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Rpc` on transport failure.
    pub async fn load_state(&self, blob: &str) -> Result<bool> {
        let result = self.call("anvil_loadState", json!([blob])).await?;
        Ok(result.as_bool().unwrap_or(false))
    }

    /// Re-point the fork at an upstream URL, optionally pinned to a block.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Rpc` on transport failure.
    pub async fn reset(&self, upstream_url: &str, block_number: Option<u64>) -> Result<()> {
        let mut forking = json!({ "jsonRpcUrl": upstream_url });
        if let Some(block) = block_number {
            forking["blockNumber"] = json!(block);
        }
        self.call("anvil_reset", json!([{ "forking": forking }]))
            .await?;
        Ok(())
    }
}

/// Parse a JSON-RPC quantity (`0x`-prefixed hex string) into a `u64`.
///
/// # Errors
///
/// Returns `AppError::Rpc` if the value is not a well-formed quantity.
pub fn parse_quantity(value: &Value) -> Result<u64> {
    let raw = value
        .as_str()
        .ok_or_else(|| AppError::Rpc(format!("expected hex quantity, got: {value}")))?;
    let digits = raw
        .strip_prefix("0x")
        .ok_or_else(|| AppError::Rpc(format!("quantity missing 0x prefix: {raw}")))?;
    u64::from_str_radix(digits, 16)
        .map_err(|err| AppError::Rpc(format!("malformed quantity {raw}: {err}")))
}
