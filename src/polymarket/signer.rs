use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{ReplicationOrder, Side};

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("submission timed out")]
    Timeout,

    #[error("nonce conflict: {0}")]
    NonceConflict(String),

    #[error("transaction underpriced: {0}")]
    Underpriced(String),

    /// Permanent: the order itself was refused.
    #[error("rejected: {0}")]
    Rejected(String),

    #[error("transport error: {0}")]
    Transport(String),
}

impl SubmitError {
    /// Whether another attempt with the same order may succeed.
    pub fn is_transient(&self) -> bool {
        !matches!(self, SubmitError::Rejected(_))
    }

    /// Classify a failure message from the signing service.
    pub fn from_message(message: &str) -> Self {
        let lower = message.to_lowercase();
        if lower.contains("nonce") {
            SubmitError::NonceConflict(message.to_string())
        } else if lower.contains("underpriced") || lower.contains("fee too low") {
            SubmitError::Underpriced(message.to_string())
        } else if lower.contains("timeout") || lower.contains("timed out") {
            SubmitError::Timeout
        } else {
            SubmitError::Rejected(message.to_string())
        }
    }
}

/// What the signing collaborator receives. No key material.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct UnsignedOrder {
    pub order_id: Uuid,
    pub token_id: String,
    pub outcome_index: u32,
    pub side: Side,
    /// Base units, 6 decimals.
    pub size: u64,
    pub limit_price: Decimal,
}

impl From<&ReplicationOrder> for UnsignedOrder {
    fn from(order: &ReplicationOrder) -> Self {
        Self {
            order_id: order.id,
            token_id: order.market_id.clone(),
            outcome_index: order.outcome_index,
            side: order.side,
            size: order.size,
            limit_price: order.limit_price,
        }
    }
}

/// External "sign and submit" capability. Returns the transaction hash.
#[async_trait]
pub trait OrderSubmitter: Send + Sync {
    async fn sign_and_submit(&self, order: &UnsignedOrder) -> Result<String, SubmitError>;
}

#[derive(Debug, Deserialize)]
struct SignerResponse {
    #[serde(default)]
    tx_hash: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Posts unsigned orders to a signing sidecar over HTTP.
#[derive(Debug, Clone)]
pub struct HttpSigner {
    http: Client,
    url: String,
}

impl HttpSigner {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        Ok(Self {
            http: Client::builder().timeout(timeout).build()?,
            url: url.into(),
        })
    }
}

#[async_trait]
impl OrderSubmitter for HttpSigner {
    async fn sign_and_submit(&self, order: &UnsignedOrder) -> Result<String, SubmitError> {
        let resp = self
            .http
            .post(&self.url)
            .json(order)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    SubmitError::Timeout
                } else {
                    SubmitError::Transport(e.to_string())
                }
            })?;

        let status = resp.status();
        let body: SignerResponse = resp
            .json()
            .await
            .map_err(|e| SubmitError::Transport(format!("HTTP {status}: {e}")))?;

        if let Some(message) = body.error {
            return Err(match status {
                StatusCode::CONFLICT => SubmitError::NonceConflict(message),
                s if s.is_server_error() => SubmitError::Transport(message),
                _ => SubmitError::from_message(&message),
            });
        }
        if !status.is_success() {
            return Err(SubmitError::Transport(format!("HTTP {status}")));
        }

        body.tx_hash
            .ok_or_else(|| SubmitError::Transport("signer returned no tx_hash".into()))
    }
}
