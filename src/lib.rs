//! Subledger Library
//!
//! Internal sub-account ledger over primary UTXO wallets: transfers between
//! sub-accounts stay off-chain, withdrawals broadcast from the primary
//! address, and reconciliation keeps the two views in agreement.

pub mod amount;
pub mod cli;
pub mod config;
pub mod connector;
pub mod error;
pub mod ledger;
pub mod policy;
pub mod transaction;
pub mod wallet;

// Re-export commonly used types
pub use amount::{Amount, SignedAmount};
pub use config::Config;
pub use error::{Error, Result};
pub use wallet::WalletManager;
