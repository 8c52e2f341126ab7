//! Minimal JSON-RPC 2.0 client for Ethereum nodes.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use log::*;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;

pub mod collectors;

pub use collectors::{eth_collectors, evm_collectors};

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("node answered with HTTP status {0}")]
    Status(u16),

    #[error("{message} (code {code})")]
    Remote { code: i64, message: String },

    #[error("unexpected response: {0}")]
    Decode(String),
}

#[derive(Debug, Deserialize)]
struct Reply {
    result: Option<Value>,
    error: Option<RemoteError>,
}

#[derive(Debug, Deserialize)]
struct RemoteError {
    code: i64,
    message: String,
}

#[derive(Debug)]
pub struct RpcClient {
    client: Client,
    url: String,
    next_id: AtomicU64,
}

impl RpcClient {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, RpcError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Call `method` and return its `result`.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        trace!(target: "Rpc", "-> {}", body);

        let response = self.client.post(&self.url).json(&body).send().await?;
        if !response.status().is_success() {
            return Err(RpcError::Status(response.status().as_u16()));
        }
        let reply: Reply = response.json().await?;
        if let Some(err) = reply.error {
            return Err(RpcError::Remote {
                code: err.code,
                message: err.message,
            });
        }
        reply
            .result
            .ok_or_else(|| RpcError::Decode(format!("{} returned no result", method)))
    }

    /// Call `method` and decode its result as a hex quantity.
    pub async fn quantity(&self, method: &str, params: Value) -> Result<f64, RpcError> {
        let result = self.call(method, params).await?;
        parse_quantity(&result)
    }
}

/// Decode a `0x`-prefixed hex quantity. Plain JSON numbers are accepted too.
pub fn parse_quantity(value: &Value) -> Result<f64, RpcError> {
    if let Some(n) = value.as_f64() {
        return Ok(n);
    }
    let text = value
        .as_str()
        .ok_or_else(|| RpcError::Decode(format!("expected quantity, got {}", value)))?;
    let digits = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .ok_or_else(|| RpcError::Decode(format!("quantity {:?} lacks 0x prefix", text)))?;
    u128::from_str_radix(digits, 16)
        .map(|n| n as f64)
        .map_err(|e| RpcError::Decode(format!("bad quantity {:?}: {}", text, e)))
}
