use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RpcError {
    /// The endpoint could not be reached or did not answer in time.
    #[error("connection to {endpoint} failed: {message}")]
    Connectivity { endpoint: String, message: String },

    #[error("request to {endpoint} timed out")]
    Timeout { endpoint: String },

    /// The node answered with a JSON-RPC error object.
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("malformed response: {0}")]
    Malformed(String),
}

impl RpcError {
    /// Errors after which the same request should be tried on the next endpoint.
    pub fn is_endpoint_failure(&self) -> bool {
        matches!(self, RpcError::Connectivity { .. } | RpcError::Timeout { .. })
    }
}

/// One upstream node speaking Ethereum JSON-RPC.
#[async_trait]
pub trait RpcTransport: Send + Sync {
    fn endpoint(&self) -> &str;

    /// Issue `method` and return the `result` member of the response.
    async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError>;
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

/// JSON-RPC over HTTP POST.
#[derive(Debug)]
pub struct HttpTransport {
    http: Client,
    url: String,
    next_id: AtomicU64,
}

impl HttpTransport {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            url: url.into(),
            next_id: AtomicU64::new(1),
        })
    }

    fn classify(&self, e: reqwest::Error) -> RpcError {
        if e.is_timeout() {
            RpcError::Timeout {
                endpoint: self.url.clone(),
            }
        } else if e.is_decode() {
            RpcError::Malformed(e.to_string())
        } else {
            RpcError::Connectivity {
                endpoint: self.url.clone(),
                message: e.to_string(),
            }
        }
    }
}

#[async_trait]
impl RpcTransport for HttpTransport {
    fn endpoint(&self) -> &str {
        &self.url
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let resp = self
            .http
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        // Rate limits and gateway errors mean this node is unusable right now.
        let status = resp.status();
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(RpcError::Connectivity {
                endpoint: self.url.clone(),
                message: format!("HTTP {status}"),
            });
        }

        let parsed: RpcResponse = resp.json().await.map_err(|e| self.classify(e))?;

        if let Some(err) = parsed.error {
            return Err(RpcError::Rpc {
                code: err.code,
                message: err.message,
            });
        }

        Ok(parsed.result.unwrap_or(Value::Null))
    }
}
