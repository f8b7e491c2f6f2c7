//! Payroll runs
//!
//! A run pays several employees from one employer wallet. The whole run is
//! validated against the employer's balance before the first transfer.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{info, warn};
use uuid::Uuid;

use crate::amount::Amount;
use crate::error::{Error, Result};
use crate::wallet::types::TransferRecord;
use crate::wallet::WalletManager;

/// One employee's share of a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayrollSplit {
    pub employee_id: String,
    pub amount: Amount,
}

impl PayrollSplit {
    pub fn new(employee_id: impl Into<String>, amount: Amount) -> Self {
        Self {
            employee_id: employee_id.into(),
            amount,
        }
    }
}

/// Payroll file format
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayrollDefinition {
    pub employer_id: String,
    pub splits: Vec<PayrollSplit>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayrollReceipt {
    pub run_id: String,
    pub employer_id: String,
    pub total: Amount,
    pub transfers: Vec<TransferRecord>,
}

/// Executes payroll runs; salary transfers are fee-exempt
#[derive(Clone)]
pub struct PayrollProcessor {
    manager: WalletManager,
}

impl PayrollProcessor {
    pub fn new(manager: WalletManager) -> Self {
        Self { manager }
    }

    /// Pay every split from `employer_id`
    ///
    /// Fails without moving anything if the employer cannot cover the total.
    /// A failure part-way through (a concurrent debit of the employer)
    /// leaves the earlier transfers in place; the error names the run.
    pub async fn process(&self, employer_id: &str, splits: &[PayrollSplit]) -> Result<PayrollReceipt> {
        if splits.is_empty() {
            return Err(Error::InvalidAmount("payroll has no splits".to_string()));
        }

        let mut seen = HashSet::new();
        for split in splits {
            split
                .amount
                .ensure_positive(&format!("salary for {}", split.employee_id))?;
            if split.employee_id == employer_id {
                return Err(Error::InvalidId(format!(
                    "employer {} cannot pay itself",
                    employer_id
                )));
            }
            if !seen.insert(split.employee_id.as_str()) {
                return Err(Error::DuplicateId(split.employee_id.clone()));
            }
        }

        let total = Amount::sum(splits.iter().map(|s| &s.amount))?;
        let available = self.manager.get_balance(employer_id).await?;
        if available < total {
            return Err(Error::InsufficientBalance {
                wallet_id: employer_id.to_string(),
                available,
                required: total,
            });
        }

        let run_id = Uuid::new_v4().to_string();
        let memo = format!("payroll:{}", run_id);
        info!(
            "Payroll {} from {}: {} employees, total {}",
            run_id,
            employer_id,
            splits.len(),
            total
        );

        let mut transfers = Vec::with_capacity(splits.len());
        for split in splits {
            match self
                .manager
                .transfer_exempt(employer_id, &split.employee_id, split.amount, Some(memo.clone()))
                .await
            {
                Ok(record) => transfers.push(record),
                Err(e) => {
                    warn!(
                        "Payroll {} stopped at {} after {} of {} transfers: {}",
                        run_id,
                        split.employee_id,
                        transfers.len(),
                        splits.len(),
                        e
                    );
                    return Err(e);
                }
            }
        }

        Ok(PayrollReceipt {
            run_id,
            employer_id: employer_id.to_string(),
            total,
            transfers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::{ConnectionMode, SimulatedConnector};
    use crate::ledger::{Ledger, MemoryLedger};
    use crate::policy::MerchantFeePolicy;
    use crate::wallet::registry::{PrimaryWallet, PrimaryWalletRegistry};
    use crate::wallet::types::{FeeConfiguration, WalletMetadata};
    use std::sync::Arc;
    use std::time::Duration;

    fn amt(s: &str) -> Amount {
        s.parse().unwrap()
    }

    async fn setup() -> (WalletManager, PayrollProcessor) {
        let chain = Arc::new(SimulatedConnector::new(
            "bitcoin",
            bitcoin::Network::Regtest,
            "addr",
        ));
        let registry = PrimaryWalletRegistry::new()
            .with(PrimaryWallet::new(
                "bitcoin",
                "payroll",
                ConnectionMode::Simulated,
                bitcoin::Network::Regtest,
                "addr",
                chain,
                Duration::from_secs(1),
            ))
            .unwrap();
        let manager = WalletManager::new(
            Ledger::new(Arc::new(MemoryLedger::new())),
            Arc::new(registry),
        )
        .with_fee_policy(Arc::new(MerchantFeePolicy));

        for id in ["acme", "emp1", "emp2"] {
            manager
                .create("bitcoin", "payroll", id, WalletMetadata::default())
                .await
                .unwrap();
        }
        let processor = PayrollProcessor::new(manager.clone());
        (manager, processor)
    }

    #[tokio::test]
    async fn test_salaries_are_fee_exempt() {
        let (manager, processor) = setup().await;
        manager
            .set_fee_configuration(FeeConfiguration {
                default_fee_percentage: 5.0,
                ..Default::default()
            })
            .await
            .unwrap();
        manager.fund("acme", amt("1")).await.unwrap();

        let receipt = processor
            .process(
                "acme",
                &[
                    PayrollSplit::new("emp1", amt("0.6")),
                    PayrollSplit::new("emp2", amt("0.4")),
                ],
            )
            .await
            .unwrap();

        assert_eq!(receipt.total, amt("1"));
        assert_eq!(receipt.transfers.len(), 2);
        let memo = format!("payroll:{}", receipt.run_id);
        assert!(receipt
            .transfers
            .iter()
            .all(|t| t.fee.is_zero() && t.memo.as_deref() == Some(memo.as_str())));
        assert_eq!(manager.get_balance("emp1").await.unwrap(), amt("0.6"));
        assert!(manager.get_balance("acme").await.unwrap().is_zero());
    }

    #[tokio::test]
    async fn test_underfunded_run_moves_nothing() {
        let (manager, processor) = setup().await;
        manager.fund("acme", amt("0.5")).await.unwrap();

        let err = processor
            .process(
                "acme",
                &[
                    PayrollSplit::new("emp1", amt("0.3")),
                    PayrollSplit::new("emp2", amt("0.3")),
                ],
            )
            .await
            .unwrap_err();

        assert!(matches!(err, Error::InsufficientBalance { .. }));
        assert!(manager.get_balance("emp1").await.unwrap().is_zero());
        assert_eq!(manager.get_balance("acme").await.unwrap(), amt("0.5"));
    }

    #[tokio::test]
    async fn test_rejects_malformed_runs() {
        let (manager, processor) = setup().await;
        manager.fund("acme", amt("1")).await.unwrap();

        assert!(matches!(
            processor.process("acme", &[]).await,
            Err(Error::InvalidAmount(_))
        ));
        assert!(matches!(
            processor
                .process("acme", &[PayrollSplit::new("emp1", Amount::ZERO)])
                .await,
            Err(Error::InvalidAmount(_))
        ));
        assert!(matches!(
            processor
                .process(
                    "acme",
                    &[
                        PayrollSplit::new("emp1", amt("0.1")),
                        PayrollSplit::new("emp1", amt("0.1")),
                    ],
                )
                .await,
            Err(Error::DuplicateId(_))
        ));
        assert!(matches!(
            processor
                .process("acme", &[PayrollSplit::new("acme", amt("0.1"))])
                .await,
            Err(Error::InvalidId(_))
        ));
    }
}
