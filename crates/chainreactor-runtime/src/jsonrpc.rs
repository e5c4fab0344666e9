//! HTTP JSON-RPC chain source backed by `reqwest`.
//!
//! The endpoint is expected to answer with blocks already shaped as
//! [`RemoteBlock`] (an indexer gateway in front of the node). Method names are
//! configurable through [`RpcMethods`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use chainreactor_core::error::ReactorError;
use chainreactor_core::source::ChainSource;
use chainreactor_core::types::RemoteBlock;

/// A JSON-RPC 2.0 request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    pub params: Vec<Value>,
    pub id: u64,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            method: method.into(),
            params,
            id,
        }
    }
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
}

/// A JSON-RPC 2.0 response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: u64,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// The `result` value, or the RPC error as a source error.
    pub fn into_result(self) -> Result<Value, ReactorError> {
        if let Some(err) = self.error {
            return Err(ReactorError::Source(format!("JSON-RPC error {}: {}", err.code, err.message)));
        }
        Ok(self.result.unwrap_or(Value::Null))
    }
}

/// Method names used by [`JsonRpcSource`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcMethods {
    pub head_height: String,
    pub block_by_height: String,
    pub block_by_hash: String,
}

impl Default for RpcMethods {
    fn default() -> Self {
        Self {
            head_height: "chain_headHeight".into(),
            block_by_height: "chain_getBlockByHeight".into(),
            block_by_hash: "chain_getBlockByHash".into(),
        }
    }
}

/// Decode a block result; `null` means the node has no such block.
pub fn block_from_result(value: Value) -> Result<Option<RemoteBlock>, ReactorError> {
    if value.is_null() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_value(value)?))
}

/// Decode a height result given as a number or a decimal / `0x` hex string.
pub fn height_from_result(value: &Value) -> Result<u64, ReactorError> {
    if let Some(n) = value.as_u64() {
        return Ok(n);
    }
    let parsed = value.as_str().and_then(|s| match s.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    });
    parsed.ok_or_else(|| ReactorError::Decode(format!("invalid head height: {value}")))
}

/// [`ChainSource`] over HTTP JSON-RPC.
pub struct JsonRpcSource {
    url: String,
    http: reqwest::Client,
    methods: RpcMethods,
    next_id: AtomicU64,
}

impl JsonRpcSource {
    pub fn new(url: impl Into<String>, methods: RpcMethods, request_timeout: Duration) -> Result<Self, ReactorError> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| ReactorError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            url: url.into(),
            http,
            methods,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, ReactorError> {
        let req = JsonRpcRequest::new(self.next_id.fetch_add(1, Ordering::Relaxed), method, params);
        let resp = self
            .http
            .post(&self.url)
            .json(&req)
            .send()
            .await
            .map_err(|e| ReactorError::Source(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(ReactorError::Source(format!("HTTP {status}: {body}")));
        }

        let body = resp
            .json::<JsonRpcResponse>()
            .await
            .map_err(|e| ReactorError::Source(e.to_string()))?;
        body.into_result()
    }
}

#[async_trait]
impl ChainSource for JsonRpcSource {
    async fn head_height(&self) -> Result<u64, ReactorError> {
        let value = self.call(&self.methods.head_height, vec![]).await?;
        height_from_result(&value)
    }

    async fn block_by_height(&self, height: u64) -> Result<Option<RemoteBlock>, ReactorError> {
        let value = self.call(&self.methods.block_by_height, vec![json!(height)]).await?;
        block_from_result(value)
    }

    async fn block_by_hash(&self, hash: &str) -> Result<Option<RemoteBlock>, ReactorError> {
        let value = self.call(&self.methods.block_by_hash, vec![json!(hash)]).await?;
        block_from_result(value)
    }
}
