//! UTXO transaction construction
//!
//! Builds and signs raw transactions from explicit inputs and outputs.
//! Used only on the withdrawal path, after the ledger has debited the
//! internal balance.

pub mod builder;
pub mod coin_selection;

pub use builder::TransactionBuilder;
pub use coin_selection::{select_coins, CoinSelection, FeeMode, DUST_LIMIT_SAT};

use bitcoin::PrivateKey;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::amount::Amount;
use crate::error::{Error, Result};

/// Chain policy limit for null-data outputs
pub const MAX_OP_RETURN_BYTES: usize = 80;

/// WIF-encoded private key, supplied at call time and never logged
#[derive(Clone)]
pub struct SigningSecret(String);

impl SigningSecret {
    pub fn new(wif: impl Into<String>) -> Self {
        Self(wif.into().trim().to_string())
    }

    /// Load from the environment variable named `var`
    pub fn from_env(var: &str) -> Result<Self> {
        std::env::var(var)
            .map(Self::new)
            .map_err(|_| Error::Config(format!("Signing secret env var {} is not set", var)))
    }

    /// Check the secret decodes as a WIF private key without using it
    pub fn validate(&self) -> Result<()> {
        self.private_key().map(|_| ())
    }

    pub(crate) fn private_key(&self) -> Result<PrivateKey> {
        PrivateKey::from_wif(&self.0)
            .map_err(|e| Error::InvalidSecret(format!("not a WIF private key: {}", e)))
    }
}

impl fmt::Debug for SigningSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SigningSecret(***)")
    }
}

/// A spendable output being consumed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    pub txid: String,
    pub output_index: u32,
    pub value: Amount,
}

/// A payment output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    pub address: String,
    pub value: Amount,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildOptions {
    /// Null-data payload, appended as the last output with value 0
    pub op_return: Option<Vec<u8>>,
}

/// Signed, serialized transaction ready for broadcast
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTransaction {
    pub txid: String,
    pub tx_hex: String,
}

/// Reject null-data payloads over the policy limit
pub fn check_op_return(payload: Option<&[u8]>) -> Result<()> {
    match payload {
        Some(data) if data.len() > MAX_OP_RETURN_BYTES => Err(Error::OversizeAuxData {
            len: data.len(),
            max: MAX_OP_RETURN_BYTES,
        }),
        _ => Ok(()),
    }
}

/// Virtual size of a P2WPKH spend, rounded up
pub fn estimate_vsize(inputs: usize, outputs: usize, op_return_len: Option<usize>) -> u64 {
    // weight units: 42 overhead, 272 per input (68 vB), 124 per P2WPKH output (31 vB)
    let mut weight = 42 + 272 * inputs as u64 + 124 * outputs as u64;
    if let Some(len) = op_return_len {
        // value + script length + OP_RETURN + push opcode(s) + data
        let push = if len > 75 { 2 } else { 1 };
        weight += 4 * (8 + 1 + 1 + push + len as u64);
    }
    weight.div_ceil(4)
}
