//! Error types for the sub-account ledger

use serde::Serialize;
use thiserror::Error;

use crate::amount::Amount;

/// Result type alias using our custom Error
pub type Result<T> = std::result::Result<T, Error>;

/// What kind of entity a lookup failed to find
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    InternalWallet,
    PrimaryWallet,
    TransferSource,
    TransferDestination,
    Withdrawal,
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityKind::InternalWallet => write!(f, "internal wallet"),
            EntityKind::PrimaryWallet => write!(f, "primary wallet"),
            EntityKind::TransferSource => write!(f, "transfer source wallet"),
            EntityKind::TransferDestination => write!(f, "transfer destination wallet"),
            EntityKind::Withdrawal => write!(f, "withdrawal"),
        }
    }
}

/// Main error type for the ledger
#[derive(Error, Debug)]
pub enum Error {
    // Validation errors (detected before any external call)
    #[error("{kind} not found: {id}")]
    NotFound { kind: EntityKind, id: String },

    #[error("Wallet id already exists: {0}")]
    DuplicateId(String),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Insufficient balance in {wallet_id}: {available} available, {required} required")]
    InsufficientBalance {
        wallet_id: String,
        available: Amount,
        required: Amount,
    },

    #[error("Cross-chain transfer rejected: {from_chain} -> {to_chain}")]
    CrossChainTransfer { from_chain: String, to_chain: String },

    #[error("Cross-primary-wallet transfer rejected: {from_primary} -> {to_primary}")]
    CrossPrimaryWalletTransfer {
        from_primary: String,
        to_primary: String,
    },

    #[error("Base wallet balance cannot be set directly: {wallet_id}")]
    BaseWalletProtected { wallet_id: String },

    #[error("OP_RETURN payload is {len} bytes, maximum is {max}")]
    OversizeAuxData { len: usize, max: usize },

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid signing secret: {0}")]
    InvalidSecret(String),

    #[error("Invalid wallet id: {0}")]
    InvalidId(String),

    // Chain connector errors
    #[error("{blockchain} connector {operation} failed: {reason}")]
    ConnectorFailure {
        blockchain: String,
        operation: String,
        reason: String,
    },

    #[error("Connector {operation} timed out after {timeout_ms}ms")]
    ConnectorTimeout { operation: String, timeout_ms: u64 },

    #[error("Withdrawal {withdrawal_id} debited {debited} but broadcast failed: {reason}")]
    BroadcastFailed {
        withdrawal_id: String,
        debited: Amount,
        reason: String,
    },

    #[error("Transaction build failed: {0}")]
    TransactionBuild(String),

    // Ledger-of-record errors
    #[error("Ledger backend {operation} failed: {reason}")]
    LedgerBackend { operation: String, reason: String },

    #[error("Fee configuration changed: computed against v{expected}, ledger is at v{current}")]
    FeeConfigurationChanged { expected: u64, current: u64 },

    #[error("Reconciliation deficit on {blockchain}/{primary_wallet}: internal balances exceed chain by {shortfall}")]
    ReconciliationDeficit {
        blockchain: String,
        primary_wallet: String,
        shortfall: Amount,
    },

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl Error {
    /// Stable machine-readable code for this error
    pub fn code(&self) -> &'static str {
        match self {
            Error::NotFound { .. } => "NotFound",
            Error::DuplicateId(_) => "DuplicateId",
            Error::InvalidAmount(_) => "InvalidAmount",
            Error::InsufficientBalance { .. } => "InsufficientBalance",
            Error::CrossChainTransfer { .. } => "CrossChainTransfer",
            Error::CrossPrimaryWalletTransfer { .. } => "CrossPrimaryWalletTransfer",
            Error::BaseWalletProtected { .. } => "BaseWalletProtected",
            Error::OversizeAuxData { .. } => "OversizeAuxData",
            Error::InvalidAddress(_) => "InvalidAddress",
            Error::InvalidSecret(_) => "InvalidSecret",
            Error::InvalidId(_) => "InvalidId",
            Error::ConnectorFailure { .. } => "ConnectorFailure",
            Error::ConnectorTimeout { .. } => "ConnectorTimeout",
            Error::BroadcastFailed { .. } => "BroadcastFailed",
            Error::TransactionBuild(_) => "TransactionBuild",
            Error::LedgerBackend { .. } => "LedgerBackendFailure",
            Error::FeeConfigurationChanged { .. } => "FeeConfigurationChanged",
            Error::ReconciliationDeficit { .. } => "ReconciliationDeficit",
            Error::Config(_) => "Config",
            Error::Serialization(_) => "Serialization",
            Error::Io(_) => "Io",
            Error::Anyhow(_) => "Internal",
        }
    }

    /// Check if this error was raised by input validation, before any state changed
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::NotFound { .. }
                | Error::DuplicateId(_)
                | Error::InvalidAmount(_)
                | Error::InsufficientBalance { .. }
                | Error::CrossChainTransfer { .. }
                | Error::CrossPrimaryWalletTransfer { .. }
                | Error::BaseWalletProtected { .. }
                | Error::OversizeAuxData { .. }
                | Error::InvalidAddress(_)
                | Error::InvalidSecret(_)
                | Error::InvalidId(_)
        )
    }

    /// Check if this error came from talking to a chain
    pub fn is_connector_failure(&self) -> bool {
        matches!(
            self,
            Error::ConnectorFailure { .. }
                | Error::ConnectorTimeout { .. }
                | Error::BroadcastFailed { .. }
        )
    }

    /// Check if a caller may retry the operation as-is
    ///
    /// A failed broadcast is never retryable: the debit is already committed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConnectorFailure { .. }
                | Error::ConnectorTimeout { .. }
                | Error::LedgerBackend { .. }
                | Error::FeeConfigurationChanged { .. }
        )
    }

    /// Structured body suitable for an API error response
    pub fn to_body(&self) -> serde_json::Value {
        let mut body = serde_json::json!({
            "code": self.code(),
            "message": self.to_string(),
        });

        let details = match self {
            Error::NotFound { kind, id } => serde_json::json!({ "kind": kind, "id": id }),
            Error::DuplicateId(id) => serde_json::json!({ "id": id }),
            Error::InsufficientBalance {
                wallet_id,
                available,
                required,
            } => serde_json::json!({
                "wallet_id": wallet_id,
                "available": available,
                "required": required,
            }),
            Error::CrossChainTransfer {
                from_chain,
                to_chain,
            } => serde_json::json!({ "from_chain": from_chain, "to_chain": to_chain }),
            Error::CrossPrimaryWalletTransfer {
                from_primary,
                to_primary,
            } => serde_json::json!({ "from_primary": from_primary, "to_primary": to_primary }),
            Error::BaseWalletProtected { wallet_id } => {
                serde_json::json!({ "wallet_id": wallet_id })
            }
            Error::OversizeAuxData { len, max } => serde_json::json!({ "len": len, "max": max }),
            Error::BroadcastFailed {
                withdrawal_id,
                debited,
                ..
            } => serde_json::json!({ "withdrawal_id": withdrawal_id, "debited": debited }),
            Error::FeeConfigurationChanged { expected, current } => {
                serde_json::json!({ "expected": expected, "current": current })
            }
            Error::ReconciliationDeficit {
                blockchain,
                primary_wallet,
                shortfall,
            } => serde_json::json!({
                "blockchain": blockchain,
                "primary_wallet": primary_wallet,
                "shortfall": shortfall,
            }),
            _ => serde_json::Value::Null,
        };

        if !details.is_null() {
            body["details"] = details;
        }
        body
    }
}

// Conversion from serde_json errors
impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

// Conversion from I/O errors
impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_classification() {
        assert!(Error::DuplicateId("a".into()).is_validation());
        assert!(Error::OversizeAuxData { len: 81, max: 80 }.is_validation());
        assert!(!Error::LedgerBackend {
            operation: "Fund".into(),
            reason: "down".into()
        }
        .is_validation());
    }

    #[test]
    fn test_broadcast_failure_is_not_retryable() {
        let err = Error::BroadcastFailed {
            withdrawal_id: "w1".into(),
            debited: Amount::from_sat(10),
            reason: "timeout".into(),
        };
        assert!(err.is_connector_failure());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_error_body_carries_context() {
        let err = Error::InsufficientBalance {
            wallet_id: "alice".into(),
            available: Amount::from_sat(5),
            required: Amount::from_sat(10),
        };
        let body = err.to_body();
        assert_eq!(body["code"], "InsufficientBalance");
        assert_eq!(body["details"]["wallet_id"], "alice");
        assert_eq!(body["details"]["required"], "0.00000010");
    }
}
