//! Ledger-of-record protocol
//!
//! All durable wallet state lives behind two verbs: `submit` for
//! state-changing operations and `evaluate` for read-only queries. Every
//! call carries an operation name plus arguments (`{"fn": ..., "args": ...}`)
//! so the same requests can be served in-process or by a remote gateway.
//!
//! ```text
//! WalletManager → Ledger (typed) → LedgerBackend ─┬─ MemoryLedger
//!                                                 └─ GatewayLedger
//! ```

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::amount::Amount;
use crate::error::{Error, Result};
use crate::wallet::types::{
    FeeApplication, FeeConfiguration, HistoryEntry, InternalWallet, VersionedFeeConfiguration,
    WalletMetadata, WithdrawalStatus,
};

pub mod gateway;
pub mod memory;

pub use gateway::GatewayLedger;
pub use memory::MemoryLedger;

/// State-changing operations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "fn", content = "args")]
pub enum Submission {
    CreateWallet {
        id: String,
        blockchain: String,
        primary_wallet_name: String,
        metadata: WalletMetadata,
    },
    Fund {
        wallet_id: String,
        amount: Amount,
    },
    SetBalance {
        wallet_id: String,
        /// Balance the caller read; the ledger rejects the write if it moved
        expected_previous: Amount,
        balance: Amount,
        fee: Option<FeeApplication>,
    },
    Transfer {
        transfer_id: String,
        from_id: String,
        to_id: String,
        amount: Amount,
        fee: Option<FeeApplication>,
        memo: Option<String>,
    },
    Withdraw {
        withdrawal_id: String,
        wallet_id: String,
        to_address: String,
        amount: Amount,
        fee: Amount,
    },
    RecordBroadcast {
        withdrawal_id: String,
        txid: Option<String>,
        status: WithdrawalStatus,
    },
    ReconcileCredit {
        wallet_id: String,
        amount: Amount,
        on_chain: Amount,
        internal_total: Amount,
    },
    SetFeeConfiguration {
        config: FeeConfiguration,
    },
}

impl Submission {
    /// Operation name as sent over the wire
    pub fn name(&self) -> &'static str {
        match self {
            Submission::CreateWallet { .. } => "CreateWallet",
            Submission::Fund { .. } => "Fund",
            Submission::SetBalance { .. } => "SetBalance",
            Submission::Transfer { .. } => "Transfer",
            Submission::Withdraw { .. } => "Withdraw",
            Submission::RecordBroadcast { .. } => "RecordBroadcast",
            Submission::ReconcileCredit { .. } => "ReconcileCredit",
            Submission::SetFeeConfiguration { .. } => "SetFeeConfiguration",
        }
    }
}

/// Read-only queries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "fn", content = "args")]
pub enum Query {
    GetWallet {
        id: String,
    },
    WalletExists {
        id: String,
    },
    ListByPrimaryWallet {
        blockchain: String,
        primary_wallet_name: String,
    },
    /// Entries touching a wallet, newest first
    History {
        wallet_id: String,
        /// Only entries committed before this sequence number
        #[serde(default, skip_serializing_if = "Option::is_none")]
        before_sequence: Option<u64>,
        limit: usize,
    },
    GetFeeConfiguration,
}

impl Query {
    /// Query name as sent over the wire
    pub fn name(&self) -> &'static str {
        match self {
            Query::GetWallet { .. } => "GetWallet",
            Query::WalletExists { .. } => "WalletExists",
            Query::ListByPrimaryWallet { .. } => "ListByPrimaryWallet",
            Query::History { .. } => "History",
            Query::GetFeeConfiguration => "GetFeeConfiguration",
        }
    }
}

/// A transactional store reached through submit/evaluate
///
/// Implementations own their internal consistency: a submission is applied
/// entirely or not at all.
#[async_trait]
pub trait LedgerBackend: Send + Sync {
    /// Apply a state-changing operation and return its durable result
    async fn submit(&self, submission: &Submission) -> Result<serde_json::Value>;

    /// Run a read-only query
    async fn evaluate(&self, query: &Query) -> Result<serde_json::Value>;
}

/// Typed view over a ledger backend
#[derive(Clone)]
pub struct Ledger {
    backend: Arc<dyn LedgerBackend>,
}

impl Ledger {
    pub fn new(backend: Arc<dyn LedgerBackend>) -> Self {
        Self { backend }
    }

    /// Submit and decode the result record
    pub async fn submit<T: DeserializeOwned>(&self, submission: &Submission) -> Result<T> {
        debug!("submit {}", submission.name());
        let value = self.backend.submit(submission).await?;
        decode(submission.name(), value)
    }

    /// Evaluate and decode the result
    pub async fn evaluate<T: DeserializeOwned>(&self, query: &Query) -> Result<T> {
        let value = self.backend.evaluate(query).await?;
        decode(query.name(), value)
    }

    pub async fn get_wallet(&self, id: &str) -> Result<Option<InternalWallet>> {
        self.evaluate(&Query::GetWallet { id: id.to_string() })
            .await
    }

    pub async fn wallet_exists(&self, id: &str) -> Result<bool> {
        self.evaluate(&Query::WalletExists { id: id.to_string() })
            .await
    }

    pub async fn list_by_primary_wallet(
        &self,
        blockchain: &str,
        primary_wallet_name: &str,
    ) -> Result<Vec<InternalWallet>> {
        self.evaluate(&Query::ListByPrimaryWallet {
            blockchain: blockchain.to_string(),
            primary_wallet_name: primary_wallet_name.to_string(),
        })
        .await
    }

    /// Up to `limit` entries older than `before_sequence`, newest first
    pub async fn history_page(
        &self,
        wallet_id: &str,
        before_sequence: Option<u64>,
        limit: usize,
    ) -> Result<Vec<HistoryEntry>> {
        self.evaluate(&Query::History {
            wallet_id: wallet_id.to_string(),
            before_sequence,
            limit,
        })
        .await
    }

    pub async fn fee_configuration(&self) -> Result<VersionedFeeConfiguration> {
        self.evaluate(&Query::GetFeeConfiguration).await
    }
}

fn decode<T: DeserializeOwned>(operation: &str, value: serde_json::Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| Error::LedgerBackend {
        operation: operation.to_string(),
        reason: format!("unexpected result shape: {}", e),
    })
}
