//! Chain connector capability
//!
//! One fixed operation set, implemented independently per connection mode:
//! - `FullNodeConnector`: JSON-RPC to a Bitcoin-Core-style node
//! - `ApiConnector`: Esplora-style REST API
//! - `SimulatedConnector`: in-process mock chain
//!
//! Every call made by the ledger goes through `Bounded`, which caps it with
//! a timeout. A negative answer ("address invalid") is `Ok(false)`, never an
//! error.

pub mod api;
pub mod bounded;
pub mod full_node;
pub mod simulated;

pub use api::ApiConnector;
pub use bounded::Bounded;
pub use full_node::FullNodeConnector;
pub use simulated::{SentTransaction, SimulatedConnector};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::amount::{Amount, SignedAmount, UNITS_PER_COIN};
use crate::error::{Error, Result};
use crate::transaction::{FeeMode, SigningSecret};

/// How a primary wallet reaches its chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionMode {
    FullNode,
    Api,
    Simulated,
}

impl fmt::Display for ConnectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionMode::FullNode => write!(f, "full_node"),
            ConnectionMode::Api => write!(f, "api"),
            ConnectionMode::Simulated => write!(f, "simulated"),
        }
    }
}

/// Options for sends and fee estimates
#[derive(Debug, Clone)]
pub struct SendOptions {
    /// Required to send; ignored by fee estimates
    pub secret: Option<SigningSecret>,

    /// Absolute network fee, paid exactly; estimated when unset
    pub fee: Option<Amount>,

    /// Null-data payload for the outgoing transaction
    pub op_return: Option<Vec<u8>>,

    /// Blocks to confirmation for fee estimation
    pub confirmation_target: u16,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            secret: None,
            fee: None,
            op_return: None,
            confirmation_target: 6,
        }
    }
}

impl SendOptions {
    pub(crate) fn require_secret(&self) -> Result<&SigningSecret> {
        self.secret
            .as_ref()
            .ok_or_else(|| Error::InvalidSecret("a signing secret is required to send".to_string()))
    }

    /// A caller-fixed fee must not absorb dust change
    pub(crate) fn fee_mode(&self) -> FeeMode {
        match self.fee {
            Some(_) => FeeMode::Exact,
            None => FeeMode::FoldDust,
        }
    }
}

/// A transaction as seen from the primary wallet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainTransaction {
    pub txid: String,

    /// Net effect on the wallet: positive for receipts
    pub amount: SignedAmount,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fee: Option<Amount>,

    pub confirmations: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_height: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Operations every connection mode supplies
#[async_trait]
pub trait ChainConnector: Send + Sync {
    /// Check the endpoint answers; unreachable is `Ok(false)`
    async fn test_connection(&self) -> Result<bool>;

    /// Spendable balance of the primary address
    async fn get_balance(&self) -> Result<Amount>;

    /// Most recent transactions touching the primary address, newest first
    async fn get_transaction_history(&self, limit: usize) -> Result<Vec<ChainTransaction>>;

    /// Build, sign and broadcast a payment; returns the txid
    async fn send_transaction(
        &self,
        to_address: &str,
        amount: Amount,
        options: &SendOptions,
    ) -> Result<String>;

    /// Check an address is well-formed for this chain and network
    async fn verify_address(&self, address: &str) -> Result<bool>;

    /// Absolute network fee for a payment
    ///
    /// With `options.fee` set, checks that exact fee can be paid from the
    /// current UTXOs and returns it.
    async fn estimate_fee(
        &self,
        to_address: &str,
        amount: Amount,
        options: &SendOptions,
    ) -> Result<Amount>;

    async fn get_blockchain_height(&self) -> Result<u64>;

    async fn get_transaction(&self, txid: &str) -> Result<ChainTransaction>;

    /// Whether the chain uses UTXO accounting
    async fn verify_utxo_wallet(&self) -> Result<bool>;
}

/// Coin-denominated float from a node or API into minor units
pub(crate) fn coins_to_amount(value: f64) -> Result<Amount> {
    if !value.is_finite() || value < 0.0 {
        return Err(Error::InvalidAmount(format!("bad chain amount {}", value)));
    }
    Ok(Amount::from_sat((value * UNITS_PER_COIN as f64).round() as u64))
}

pub(crate) fn coins_to_signed(value: f64) -> Result<SignedAmount> {
    let magnitude = coins_to_amount(value.abs())?;
    let sat = magnitude.to_sat() as i64;
    Ok(SignedAmount::from_sat(if value < 0.0 { -sat } else { sat }))
}

/// Absolute fee for `vsize` at `sat_per_vb`, rounded up
pub(crate) fn fee_for_vsize(sat_per_vb: f64, vsize: u64) -> Amount {
    let rate = if sat_per_vb.is_finite() && sat_per_vb > 1.0 {
        sat_per_vb
    } else {
        1.0
    };
    Amount::from_sat((rate * vsize as f64).ceil() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coins_to_amount_rounds() {
        assert_eq!(coins_to_amount(0.1).unwrap(), Amount::from_sat(10_000_000));
        assert_eq!(coins_to_amount(0.29999999).unwrap(), Amount::from_sat(29_999_999));
        assert!(coins_to_amount(-0.1).is_err());
        assert_eq!(coins_to_signed(-0.5).unwrap().to_sat(), -50_000_000);
    }

    #[test]
    fn test_fee_floor_is_one_sat_per_vbyte() {
        assert_eq!(fee_for_vsize(0.2, 141), Amount::from_sat(141));
        assert_eq!(fee_for_vsize(2.5, 141), Amount::from_sat(353));
    }
}
