//! Reconciliation of internal balances against the chain
//!
//! For one primary wallet the invariant is
//! `on_chain == sum(internal balances, base wallet included)`. A surplus
//! (deposits sent straight to the primary address) is credited to the base
//! wallet. A shortfall is never papered over: it is reported and left for
//! an operator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{error, info, warn};

use crate::amount::{Amount, SignedAmount};
use crate::connector::ChainConnector;
use crate::error::{Error, Result};
use crate::ledger::Submission;

use super::locks::WalletGuard;
use super::manager::WalletManager;
use super::types::InternalWallet;

/// Attempts to lock a stable wallet set before giving up
const MAX_LOCK_ATTEMPTS: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReconciliationOutcome {
    /// Nothing to do
    Balanced,

    /// Surplus credited to the base wallet
    Credited {
        amount: Amount,
        base_wallet_id: String,
    },

    /// Chain holds less than the ledger says
    Deficit { shortfall: Amount },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub blockchain: String,
    pub primary_wallet: String,
    pub on_chain: Amount,
    pub internal_total: Amount,
    /// `on_chain - internal_total`
    pub drift: SignedAmount,
    pub outcome: ReconciliationOutcome,
    pub timestamp: DateTime<Utc>,
}

impl ReconciliationReport {
    /// Turn a deficit into `ReconciliationDeficit`
    pub fn into_result(self) -> Result<Self> {
        match self.outcome {
            ReconciliationOutcome::Deficit { shortfall } => Err(Error::ReconciliationDeficit {
                blockchain: self.blockchain,
                primary_wallet: self.primary_wallet,
                shortfall,
            }),
            _ => Ok(self),
        }
    }
}

/// Result of reconciling one primary wallet in a sweep
#[derive(Debug)]
pub struct ReconciliationRun {
    pub blockchain: String,
    pub primary_wallet: String,
    pub result: Result<ReconciliationReport>,
}

impl WalletManager {
    /// Reconcile one primary wallet
    ///
    /// Every internal wallet of the primary is locked while the chain
    /// balance is read, so an in-flight withdrawal cannot show up as drift.
    pub async fn reconcile(
        &self,
        blockchain: &str,
        primary_wallet_name: &str,
    ) -> Result<ReconciliationReport> {
        let primary = self.registry().get(blockchain, primary_wallet_name)?;
        let base = self
            .ensure_base_wallet(blockchain, primary_wallet_name)
            .await?;

        let (_guard, wallets) = self
            .lock_primary_wallets(blockchain, primary_wallet_name)
            .await?;

        let on_chain = primary.connector().get_balance().await?;
        let internal_total = Amount::sum(wallets.iter().map(|w| &w.balance))?;
        let drift = on_chain.signed_diff(internal_total);

        let outcome = if drift.is_positive() {
            let amount = drift.unsigned_abs();
            self.ledger()
                .submit::<InternalWallet>(&Submission::ReconcileCredit {
                    wallet_id: base.id.clone(),
                    amount,
                    on_chain,
                    internal_total,
                })
                .await?;
            info!(
                "Reconciled {}/{}: credited {} to {}",
                blockchain, primary_wallet_name, amount, base.id
            );
            ReconciliationOutcome::Credited {
                amount,
                base_wallet_id: base.id,
            }
        } else if drift.is_negative() {
            let shortfall = drift.unsigned_abs();
            error!(
                blockchain = %blockchain,
                primary_wallet = %primary_wallet_name,
                on_chain = %on_chain,
                internal_total = %internal_total,
                "Reconciliation deficit of {}",
                shortfall
            );
            ReconciliationOutcome::Deficit { shortfall }
        } else {
            info!(
                "Reconciled {}/{}: balanced at {}",
                blockchain, primary_wallet_name, on_chain
            );
            ReconciliationOutcome::Balanced
        };

        Ok(ReconciliationReport {
            blockchain: blockchain.to_string(),
            primary_wallet: primary_wallet_name.to_string(),
            on_chain,
            internal_total,
            drift,
            outcome,
            timestamp: Utc::now(),
        })
    }

    /// Reconcile every configured primary wallet, continuing past failures
    pub async fn reconcile_all(&self) -> Vec<ReconciliationRun> {
        let mut runs = Vec::with_capacity(self.registry().len());
        for primary in self.registry().iter() {
            let result = self.reconcile(&primary.blockchain, &primary.name).await;
            if let Err(e) = &result {
                warn!(
                    "Reconciliation of {}/{} failed: {}",
                    primary.blockchain, primary.name, e
                );
            }
            runs.push(ReconciliationRun {
                blockchain: primary.blockchain.clone(),
                primary_wallet: primary.name.clone(),
                result,
            });
        }
        runs
    }

    /// Lock all wallets of a primary, retrying if one is created meanwhile
    async fn lock_primary_wallets(
        &self,
        blockchain: &str,
        primary_wallet_name: &str,
    ) -> Result<(WalletGuard, Vec<InternalWallet>)> {
        for attempt in 1..=MAX_LOCK_ATTEMPTS {
            let ids: BTreeSet<String> = self
                .ledger()
                .list_by_primary_wallet(blockchain, primary_wallet_name)
                .await?
                .into_iter()
                .map(|w| w.id)
                .collect();

            let guard = self.locks().lock_all(&ids).await;

            let wallets = self
                .ledger()
                .list_by_primary_wallet(blockchain, primary_wallet_name)
                .await?;
            if wallets.iter().all(|w| ids.contains(&w.id)) && wallets.len() == ids.len() {
                return Ok((guard, wallets));
            }
            warn!(
                "Wallet set of {}/{} changed while locking (attempt {})",
                blockchain, primary_wallet_name, attempt
            );
        }

        Err(Error::LedgerBackend {
            operation: "reconcile".to_string(),
            reason: format!(
                "wallet set of {}/{} kept changing",
                blockchain, primary_wallet_name
            ),
        })
    }
}
