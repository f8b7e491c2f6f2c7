//! Fee computation
//!
//! `compute_fee` is pure; `FeePolicy` is the strategy object the wallet
//! manager is constructed with.

use serde::{Deserialize, Serialize};

use crate::amount::Amount;
use crate::wallet::types::FeeConfiguration;

/// How a gross amount divides between payee and fee wallet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeSplit {
    pub fee: Amount,
    pub net: Amount,
}

/// Split `amount` for `payee_id` under `config`
///
/// The payee's override percentage wins over the default. The fee is
/// rounded to the minor unit, clamped into `[min, max]` when configured,
/// then capped at the gross amount.
pub fn compute_fee(amount: Amount, payee_id: &str, config: &FeeConfiguration) -> FeeSplit {
    let percentage = config
        .merchant_specific_fees
        .get(payee_id)
        .copied()
        .unwrap_or(config.default_fee_percentage);

    let mut fee = amount.percent(percentage);
    if let Some(min) = config.min_fee_amount {
        fee = fee.max(min);
    }
    if let Some(max) = config.max_fee_amount {
        fee = fee.min(max);
    }
    let fee = fee.min(amount);

    FeeSplit {
        fee,
        net: amount.saturating_sub(fee),
    }
}

/// Strategy deciding the fee on a credit
pub trait FeePolicy: Send + Sync {
    fn name(&self) -> &str;

    fn compute_fee(&self, amount: Amount, payee_id: &str, config: &FeeConfiguration) -> FeeSplit;
}

/// Percentage fee with per-merchant overrides
#[derive(Debug, Clone, Copy, Default)]
pub struct MerchantFeePolicy;

impl FeePolicy for MerchantFeePolicy {
    fn name(&self) -> &str {
        "merchant"
    }

    fn compute_fee(&self, amount: Amount, payee_id: &str, config: &FeeConfiguration) -> FeeSplit {
        compute_fee(amount, payee_id, config)
    }
}
