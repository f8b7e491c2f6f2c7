//! Core types for the sub-account ledger
//!
//! Defines internal wallets, the immutable receipts produced by the
//! ledger-of-record, and fee configuration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::amount::{Amount, SignedAmount};

/// Prefix reserved for base wallet ids
pub const BASE_WALLET_PREFIX: &str = "base:";

/// Id of the base wallet backing a primary wallet
pub fn base_wallet_id(blockchain: &str, primary_wallet_name: &str) -> String {
    format!("{}{}:{}", BASE_WALLET_PREFIX, blockchain, primary_wallet_name)
}

/// Free-form metadata attached to an internal wallet
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WalletMetadata {
    /// Absorbs reconciliation drift and fee income; never set directly
    #[serde(default)]
    pub is_base_wallet: bool,

    /// Human-readable label: "Payroll - Alice"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,

    /// Caller-defined attributes (role, customer number, ...)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
}

impl WalletMetadata {
    pub fn labeled(label: impl Into<String>) -> Self {
        Self {
            label: Some(label.into()),
            ..Default::default()
        }
    }

    pub(crate) fn base() -> Self {
        Self {
            is_base_wallet: true,
            label: Some("Unassigned funds".to_string()),
            attributes: BTreeMap::new(),
        }
    }
}

/// An off-chain sub-account of a primary wallet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InternalWallet {
    /// Globally unique, caller-assigned id
    pub id: String,

    /// Chain of the backing primary wallet: "bitcoin"
    pub blockchain: String,

    /// Name of the backing primary wallet
    pub primary_wallet_name: String,

    /// Current balance
    pub balance: Amount,

    pub metadata: WalletMetadata,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl InternalWallet {
    pub fn is_base_wallet(&self) -> bool {
        self.metadata.is_base_wallet
    }

    /// Check if both wallets are backed by the same primary wallet
    pub fn shares_primary_with(&self, other: &InternalWallet) -> bool {
        self.blockchain == other.blockchain && self.primary_wallet_name == other.primary_wallet_name
    }
}

/// Receipt of an internal transfer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub id: String,

    pub from_id: String,

    pub to_id: String,

    /// Gross amount debited from the source
    pub amount: Amount,

    /// Amount credited to the destination
    pub net_amount: Amount,

    /// Fee split off to the fee wallet
    pub fee: Amount,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fee_wallet_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memo: Option<String>,

    pub timestamp: DateTime<Utc>,
}

/// Status of the on-chain leg of a withdrawal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum WithdrawalStatus {
    /// Debited internally, not yet broadcast
    Pending,

    /// Broadcast to the network
    Broadcast,

    /// Broadcast failed after the debit; needs manual reconciliation
    Failed { reason: String },
}

impl std::fmt::Display for WithdrawalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WithdrawalStatus::Pending => write!(f, "pending"),
            WithdrawalStatus::Broadcast => write!(f, "broadcast"),
            WithdrawalStatus::Failed { reason } => write!(f, "failed ({})", reason),
        }
    }
}

/// Receipt of a withdrawal to an on-chain address
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WithdrawalRecord {
    pub id: String,

    pub from_id: String,

    pub to_address: String,

    pub amount: Amount,

    /// Network fee, debited on top of the amount
    pub fee: Amount,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub txid: Option<String>,

    pub status: WithdrawalStatus,

    pub timestamp: DateTime<Utc>,
}

impl WithdrawalRecord {
    /// Total debited from the internal balance
    pub fn debited(&self) -> Amount {
        Amount::from_sat(self.amount.to_sat().saturating_add(self.fee.to_sat()))
    }
}

/// A committed mutation, as recorded by the ledger-of-record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum LedgerEvent {
    Created {
        wallet_id: String,
    },
    Funded {
        wallet_id: String,
        amount: Amount,
    },
    BalanceUpdated {
        wallet_id: String,
        previous: Amount,
        current: Amount,
        fee: Amount,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fee_wallet_id: Option<String>,
    },
    Transfer(TransferRecord),
    Withdrawal(WithdrawalRecord),
    ReconciliationCredit {
        wallet_id: String,
        amount: Amount,
        on_chain: Amount,
        internal_total: Amount,
    },
}

impl LedgerEvent {
    /// Check if this event changed or created the given wallet
    pub fn touches(&self, id: &str) -> bool {
        match self {
            LedgerEvent::Created { wallet_id }
            | LedgerEvent::Funded { wallet_id, .. }
            | LedgerEvent::ReconciliationCredit { wallet_id, .. } => wallet_id == id,
            LedgerEvent::BalanceUpdated {
                wallet_id,
                fee_wallet_id,
                ..
            } => wallet_id == id || fee_wallet_id.as_deref() == Some(id),
            LedgerEvent::Transfer(t) => {
                t.from_id == id || t.to_id == id || t.fee_wallet_id.as_deref() == Some(id)
            }
            LedgerEvent::Withdrawal(w) => w.from_id == id,
        }
    }
}

/// One entry of a wallet's history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Commit order assigned by the ledger-of-record
    pub sequence: u64,

    pub timestamp: DateTime<Utc>,

    pub event: LedgerEvent,
}

/// Requested change to a wallet balance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalanceUpdate {
    /// Overwrite with an absolute balance
    Set(Amount),

    /// Adjust by a signed delta
    Delta(SignedAmount),
}

/// Fee parameters, versioned by the ledger-of-record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeeConfiguration {
    /// Percentage applied when no merchant override exists (2.5 = 2.5%)
    pub default_fee_percentage: f64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_fee_amount: Option<Amount>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_fee_amount: Option<Amount>,

    /// Per-payee percentage overrides, keyed by internal wallet id
    #[serde(default)]
    pub merchant_specific_fees: BTreeMap<String, f64>,
}

impl Default for FeeConfiguration {
    fn default() -> Self {
        Self {
            default_fee_percentage: 0.0,
            min_fee_amount: None,
            max_fee_amount: None,
            merchant_specific_fees: BTreeMap::new(),
        }
    }
}

/// Fee configuration together with the version it was read at
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct VersionedFeeConfiguration {
    pub version: u64,

    pub config: FeeConfiguration,
}

/// Fee split requested as part of a mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeeApplication {
    pub fee_wallet_id: String,

    pub fee: Amount,

    /// Fee configuration version the split was computed against
    pub config_version: u64,
}

/// Result of an `update_balance` call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceUpdateReceipt {
    pub wallet: InternalWallet,

    pub previous: Amount,

    pub fee: Amount,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fee_wallet_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transfer(from: &str, to: &str, fee_wallet: Option<&str>) -> TransferRecord {
        TransferRecord {
            id: "t1".to_string(),
            from_id: from.to_string(),
            to_id: to.to_string(),
            amount: Amount::from_sat(100),
            net_amount: Amount::from_sat(98),
            fee: Amount::from_sat(2),
            fee_wallet_id: fee_wallet.map(str::to_string),
            memo: None,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_base_wallet_id() {
        assert_eq!(base_wallet_id("bitcoin", "treasury"), "base:bitcoin:treasury");
    }

    #[test]
    fn test_transfer_touches_all_parties() {
        let event = LedgerEvent::Transfer(transfer("alice", "bob", Some("base:bitcoin:t")));
        assert!(event.touches("alice"));
        assert!(event.touches("bob"));
        assert!(event.touches("base:bitcoin:t"));
        assert!(!event.touches("carol"));
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let event = LedgerEvent::Funded {
            wallet_id: "alice".to_string(),
            amount: Amount::from_sat(150_000_000),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "funded");
        assert_eq!(json["amount"], "1.50000000");
    }

    #[test]
    fn test_withdrawal_status_serialization() {
        let status = WithdrawalStatus::Failed {
            reason: "timeout".to_string(),
        };
        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("\"state\":\"failed\""));
    }
}
