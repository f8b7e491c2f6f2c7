//! Largest-first UTXO selection

use crate::amount::Amount;
use crate::error::{Error, Result};

use super::{TxInput, TxOutput};

/// Outputs below this value are not relayed; smaller change goes to the fee
pub const DUST_LIMIT_SAT: u64 = 546;

/// Inputs chosen for a payment, plus what comes back
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoinSelection {
    pub inputs: Vec<TxInput>,

    /// Change returned to the primary address; zero when folded into the fee
    pub change: Amount,

    /// Fee actually paid, including any dust folded in
    pub fee: Amount,
}

impl CoinSelection {
    /// Payment output first, change (if any) second
    pub fn outputs(&self, to_address: &str, amount: Amount, change_address: &str) -> Vec<TxOutput> {
        let mut outputs = vec![TxOutput {
            address: to_address.to_string(),
            value: amount,
        }];
        if !self.change.is_zero() {
            outputs.push(TxOutput {
                address: change_address.to_string(),
                value: self.change,
            });
        }
        outputs
    }
}

/// How leftover value below the dust limit is handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeeMode {
    /// Dust change is added to the fee
    FoldDust,
    /// The fee is paid exactly; more inputs are pulled in to lift change
    /// above the dust limit, and selection fails if none are left
    Exact,
}

/// Pick UTXOs, largest first, until `amount + fee` is covered
pub fn select_coins(
    utxos: &[TxInput],
    amount: Amount,
    fee: Amount,
    mode: FeeMode,
) -> Result<CoinSelection> {
    let target = amount.checked_add(fee)?;

    let mut candidates: Vec<&TxInput> = utxos.iter().collect();
    candidates.sort_by(|a, b| {
        b.value
            .cmp(&a.value)
            .then_with(|| a.txid.cmp(&b.txid))
            .then_with(|| a.output_index.cmp(&b.output_index))
    });

    let is_dust = |excess: Amount| !excess.is_zero() && excess.to_sat() < DUST_LIMIT_SAT;

    let mut selected = Vec::new();
    let mut total = Amount::ZERO;
    for utxo in candidates {
        if total >= target {
            let settled = mode == FeeMode::FoldDust || !is_dust(total.saturating_sub(target));
            if settled {
                break;
            }
        }
        total = total.checked_add(utxo.value)?;
        selected.push(utxo.clone());
    }

    if total < target {
        return Err(Error::TransactionBuild(format!(
            "insufficient on-chain funds: {} spendable, {} required",
            total, target
        )));
    }

    let excess = total.saturating_sub(target);
    let (change, fee) = match (is_dust(excess), mode) {
        (false, _) => (excess, fee),
        (true, FeeMode::FoldDust) => (Amount::ZERO, fee.checked_add(excess)?),
        (true, FeeMode::Exact) => {
            return Err(Error::TransactionBuild(format!(
                "change of {} is below the dust limit; fee {} cannot be paid exactly",
                excess, fee
            )))
        }
    };

    Ok(CoinSelection {
        inputs: selected,
        change,
        fee,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utxo(tag: char, value: u64) -> TxInput {
        TxInput {
            txid: tag.to_string().repeat(64),
            output_index: 0,
            value: Amount::from_sat(value),
        }
    }

    #[test]
    fn test_largest_first() {
        let utxos = vec![utxo('a', 1_000), utxo('b', 50_000), utxo('c', 20_000)];
        let selection =
            select_coins(&utxos, Amount::from_sat(55_000), Amount::from_sat(1_000), FeeMode::FoldDust)
                .unwrap();
        assert_eq!(selection.inputs.len(), 2);
        assert_eq!(selection.inputs[0].value, Amount::from_sat(50_000));
        assert_eq!(selection.change, Amount::from_sat(14_000));
        assert_eq!(selection.fee, Amount::from_sat(1_000));
    }

    #[test]
    fn test_dust_change_goes_to_fee() {
        let utxos = vec![utxo('a', 10_500)];
        let selection =
            select_coins(&utxos, Amount::from_sat(9_000), Amount::from_sat(1_000), FeeMode::FoldDust)
                .unwrap();
        assert!(selection.change.is_zero());
        assert_eq!(selection.fee, Amount::from_sat(1_500));

        let outputs = selection.outputs("dest", Amount::from_sat(9_000), "change");
        assert_eq!(outputs.len(), 1);
    }

    #[test]
    fn test_insufficient_utxos() {
        let utxos = vec![utxo('a', 1_000)];
        let err = select_coins(&utxos, Amount::from_sat(1_000), Amount::from_sat(1), FeeMode::Exact)
            .unwrap_err();
        assert!(matches!(err, Error::TransactionBuild(_)));
    }

    #[test]
    fn test_exact_fee_pulls_in_another_input() {
        let utxos = vec![utxo('a', 10_200), utxo('b', 5_000)];
        let selection =
            select_coins(&utxos, Amount::from_sat(9_000), Amount::from_sat(1_000), FeeMode::Exact)
                .unwrap();
        assert_eq!(selection.inputs.len(), 2);
        assert_eq!(selection.change, Amount::from_sat(5_200));
        assert_eq!(selection.fee, Amount::from_sat(1_000));
    }

    #[test]
    fn test_exact_fee_rejects_dust_change() {
        let utxos = vec![utxo('a', 10_200)];
        let err =
            select_coins(&utxos, Amount::from_sat(9_000), Amount::from_sat(1_000), FeeMode::Exact)
                .unwrap_err();
        assert!(matches!(err, Error::TransactionBuild(_)));

        // No change at all is fine
        let selection =
            select_coins(&utxos, Amount::from_sat(9_200), Amount::from_sat(1_000), FeeMode::Exact)
                .unwrap();
        assert!(selection.change.is_zero());
        assert_eq!(selection.fee, Amount::from_sat(1_000));
    }
}
