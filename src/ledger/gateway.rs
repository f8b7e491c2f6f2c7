//! HTTP client for a remote ledger gateway
//!
//! The gateway exposes the same two verbs as the in-process ledger:
//! `POST {url}/submit` and `POST {url}/evaluate`, each taking the
//! `{"fn": ..., "args": ...}` request body. Successful calls answer
//! `{"result": ...}`; rejections answer `{"error": {"code", "message", "details"}}`.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

use crate::amount::Amount;
use crate::error::{EntityKind, Error, Result};

use super::{LedgerBackend, Query, Submission};

#[derive(Debug, Deserialize)]
struct GatewayResponse {
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<GatewayError>,
}

#[derive(Debug, Deserialize)]
struct GatewayError {
    code: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    details: serde_json::Value,
}

impl GatewayError {
    fn detail_str(&self, key: &str) -> String {
        self.details
            .get(key)
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string()
    }

    fn detail_amount(&self, key: &str) -> Amount {
        self.details
            .get(key)
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
            .unwrap_or_default()
    }

    fn detail_u64(&self, key: &str) -> u64 {
        self.details.get(key).and_then(|v| v.as_u64()).unwrap_or(0)
    }

    /// Map a structured rejection onto the domain taxonomy
    fn into_error(self, operation: &str) -> Error {
        match self.code.as_str() {
            "NotFound" => {
                let kind = match self.detail_str("kind").as_str() {
                    "primary_wallet" => EntityKind::PrimaryWallet,
                    "withdrawal" => EntityKind::Withdrawal,
                    _ => EntityKind::InternalWallet,
                };
                Error::NotFound {
                    kind,
                    id: self.detail_str("id"),
                }
            }
            "DuplicateId" => Error::DuplicateId(self.detail_str("id")),
            "InvalidAmount" => Error::InvalidAmount(self.message),
            "InsufficientBalance" => Error::InsufficientBalance {
                wallet_id: self.detail_str("wallet_id"),
                available: self.detail_amount("available"),
                required: self.detail_amount("required"),
            },
            "CrossChainTransfer" => Error::CrossChainTransfer {
                from_chain: self.detail_str("from_chain"),
                to_chain: self.detail_str("to_chain"),
            },
            "CrossPrimaryWalletTransfer" => Error::CrossPrimaryWalletTransfer {
                from_primary: self.detail_str("from_primary"),
                to_primary: self.detail_str("to_primary"),
            },
            "BaseWalletProtected" => Error::BaseWalletProtected {
                wallet_id: self.detail_str("wallet_id"),
            },
            "FeeConfigurationChanged" => Error::FeeConfigurationChanged {
                expected: self.detail_u64("expected"),
                current: self.detail_u64("current"),
            },
            other => Error::LedgerBackend {
                operation: operation.to_string(),
                reason: format!("{}: {}", other, self.message),
            },
        }
    }
}

/// Ledger-of-record reached over HTTP
pub struct GatewayLedger {
    client: Client,
    base_url: String,
}

impl GatewayLedger {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn call<B: serde::Serialize>(
        &self,
        verb: &str,
        operation: &str,
        body: &B,
    ) -> Result<serde_json::Value> {
        let url = format!("{}/{}", self.base_url, verb);
        debug!("POST {} ({})", url, operation);

        let transport = |e: reqwest::Error| Error::LedgerBackend {
            operation: operation.to_string(),
            reason: if e.is_timeout() {
                "gateway request timed out".to_string()
            } else {
                format!("HTTP request failed: {}", e)
            },
        };

        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        let text = response.text().await.map_err(transport)?;

        let parsed: GatewayResponse = serde_json::from_str(&text).map_err(|e| {
            warn!("Gateway answered {} with unparseable body", status);
            Error::LedgerBackend {
                operation: operation.to_string(),
                reason: format!("HTTP {}: unparseable response: {}", status, e),
            }
        })?;

        if let Some(error) = parsed.error {
            return Err(error.into_error(operation));
        }

        if !status.is_success() {
            return Err(Error::LedgerBackend {
                operation: operation.to_string(),
                reason: format!("HTTP {}", status),
            });
        }

        Ok(parsed.result.unwrap_or(serde_json::Value::Null))
    }
}

#[async_trait]
impl LedgerBackend for GatewayLedger {
    async fn submit(&self, submission: &Submission) -> Result<serde_json::Value> {
        self.call("submit", submission.name(), submission).await
    }

    async fn evaluate(&self, query: &Query) -> Result<serde_json::Value> {
        self.call("evaluate", query.name(), query).await
    }
}
