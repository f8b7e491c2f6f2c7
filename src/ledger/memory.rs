//! Single-process ledger-of-record
//!
//! Holds all wallet state behind one async mutex and applies each
//! submission atomically. Optionally persists a JSON snapshot after every
//! committed submission so CLI invocations share state.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::amount::Amount;
use crate::error::{EntityKind, Error, Result};
use crate::wallet::types::{
    FeeApplication, HistoryEntry, InternalWallet, LedgerEvent, TransferRecord,
    VersionedFeeConfiguration, WithdrawalRecord, WithdrawalStatus,
};

use super::{LedgerBackend, Query, Submission};

/// Everything the ledger knows, in snapshot form
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct LedgerState {
    wallets: BTreeMap<String, InternalWallet>,
    withdrawals: BTreeMap<String, WithdrawalRecord>,
    /// Oldest first
    events: Vec<HistoryEntry>,
    fee_config: VersionedFeeConfiguration,
    next_sequence: u64,
}

impl LedgerState {
    fn wallet(&self, id: &str) -> Result<&InternalWallet> {
        self.wallets.get(id).ok_or_else(|| Error::NotFound {
            kind: EntityKind::InternalWallet,
            id: id.to_string(),
        })
    }

    fn record(&mut self, event: LedgerEvent) {
        self.next_sequence += 1;
        self.events.push(HistoryEntry {
            sequence: self.next_sequence,
            timestamp: Utc::now(),
            event,
        });
    }

    fn check_fee(&self, fee: &FeeApplication) -> Result<()> {
        if fee.config_version != self.fee_config.version {
            return Err(Error::FeeConfigurationChanged {
                expected: fee.config_version,
                current: self.fee_config.version,
            });
        }
        let fee_wallet = self.wallet(&fee.fee_wallet_id)?;
        if !fee_wallet.is_base_wallet() {
            return Err(Error::LedgerBackend {
                operation: "fee".to_string(),
                reason: format!("fee wallet {} is not a base wallet", fee.fee_wallet_id),
            });
        }
        Ok(())
    }

    /// Credit a wallet; callers have already validated the wallet exists
    fn credit(&mut self, id: &str, amount: Amount) -> Result<InternalWallet> {
        let now = Utc::now();
        let wallet = self.wallets.get_mut(id).ok_or_else(|| Error::NotFound {
            kind: EntityKind::InternalWallet,
            id: id.to_string(),
        })?;
        wallet.balance = wallet.balance.checked_add(amount)?;
        wallet.updated_at = now;
        Ok(wallet.clone())
    }

    fn debit(&mut self, id: &str, amount: Amount) -> Result<InternalWallet> {
        let now = Utc::now();
        let wallet = self.wallets.get_mut(id).ok_or_else(|| Error::NotFound {
            kind: EntityKind::InternalWallet,
            id: id.to_string(),
        })?;
        wallet.balance =
            wallet
                .balance
                .checked_sub(amount)
                .ok_or_else(|| Error::InsufficientBalance {
                    wallet_id: id.to_string(),
                    available: wallet.balance,
                    required: amount,
                })?;
        wallet.updated_at = now;
        Ok(wallet.clone())
    }

    /// Validate and apply one submission. On error nothing has changed.
    fn apply(&mut self, submission: &Submission) -> Result<serde_json::Value> {
        match submission {
            Submission::CreateWallet {
                id,
                blockchain,
                primary_wallet_name,
                metadata,
            } => {
                if self.wallets.contains_key(id) {
                    return Err(Error::DuplicateId(id.clone()));
                }
                let now = Utc::now();
                let wallet = InternalWallet {
                    id: id.clone(),
                    blockchain: blockchain.clone(),
                    primary_wallet_name: primary_wallet_name.clone(),
                    balance: Amount::ZERO,
                    metadata: metadata.clone(),
                    created_at: now,
                    updated_at: now,
                };
                self.wallets.insert(id.clone(), wallet.clone());
                self.record(LedgerEvent::Created {
                    wallet_id: id.clone(),
                });
                Ok(serde_json::to_value(wallet)?)
            }

            Submission::Fund { wallet_id, amount } => {
                amount.ensure_positive("fund amount")?;
                self.wallet(wallet_id)?;
                let wallet = self.credit(wallet_id, *amount)?;
                self.record(LedgerEvent::Funded {
                    wallet_id: wallet_id.clone(),
                    amount: *amount,
                });
                Ok(serde_json::to_value(wallet)?)
            }

            Submission::SetBalance {
                wallet_id,
                expected_previous,
                balance,
                fee,
            } => {
                let current = self.wallet(wallet_id)?;
                if current.is_base_wallet() {
                    return Err(Error::BaseWalletProtected {
                        wallet_id: wallet_id.clone(),
                    });
                }
                let previous = current.balance;
                if previous != *expected_previous {
                    return Err(Error::LedgerBackend {
                        operation: submission.name().to_string(),
                        reason: format!(
                            "balance of {} moved from {} to {}",
                            wallet_id, expected_previous, previous
                        ),
                    });
                }
                if let Some(fee) = fee {
                    self.check_fee(fee)?;
                }

                let now = Utc::now();
                let wallet = {
                    let w = self.wallets.get_mut(wallet_id).ok_or_else(|| Error::NotFound {
                        kind: EntityKind::InternalWallet,
                        id: wallet_id.clone(),
                    })?;
                    w.balance = *balance;
                    w.updated_at = now;
                    w.clone()
                };

                let (fee_amount, fee_wallet_id) = match fee {
                    Some(fee) if !fee.fee.is_zero() => {
                        self.credit(&fee.fee_wallet_id, fee.fee)?;
                        (fee.fee, Some(fee.fee_wallet_id.clone()))
                    }
                    _ => (Amount::ZERO, None),
                };

                self.record(LedgerEvent::BalanceUpdated {
                    wallet_id: wallet_id.clone(),
                    previous,
                    current: *balance,
                    fee: fee_amount,
                    fee_wallet_id: fee_wallet_id.clone(),
                });

                Ok(serde_json::json!({
                    "wallet": wallet,
                    "previous": previous,
                    "fee": fee_amount,
                    "fee_wallet_id": fee_wallet_id,
                }))
            }

            Submission::Transfer {
                transfer_id,
                from_id,
                to_id,
                amount,
                fee,
                memo,
            } => {
                amount.ensure_positive("transfer amount")?;
                let from = self.wallet(from_id)?;
                let to = self.wallet(to_id)?;
                if from.blockchain != to.blockchain {
                    return Err(Error::CrossChainTransfer {
                        from_chain: from.blockchain.clone(),
                        to_chain: to.blockchain.clone(),
                    });
                }
                if from.primary_wallet_name != to.primary_wallet_name {
                    return Err(Error::CrossPrimaryWalletTransfer {
                        from_primary: from.primary_wallet_name.clone(),
                        to_primary: to.primary_wallet_name.clone(),
                    });
                }
                if from.balance < *amount {
                    return Err(Error::InsufficientBalance {
                        wallet_id: from_id.clone(),
                        available: from.balance,
                        required: *amount,
                    });
                }

                let fee_amount = match fee {
                    Some(fee) => {
                        self.check_fee(fee)?;
                        if fee.fee > *amount {
                            return Err(Error::InvalidAmount(format!(
                                "fee {} exceeds transfer amount {}",
                                fee.fee, amount
                            )));
                        }
                        fee.fee
                    }
                    None => Amount::ZERO,
                };
                let net_amount = amount.saturating_sub(fee_amount);

                self.debit(from_id, *amount)?;
                self.credit(to_id, net_amount)?;
                let fee_wallet_id = match fee {
                    Some(fee) if !fee_amount.is_zero() => {
                        self.credit(&fee.fee_wallet_id, fee_amount)?;
                        Some(fee.fee_wallet_id.clone())
                    }
                    _ => None,
                };

                let record = TransferRecord {
                    id: transfer_id.clone(),
                    from_id: from_id.clone(),
                    to_id: to_id.clone(),
                    amount: *amount,
                    net_amount,
                    fee: fee_amount,
                    fee_wallet_id,
                    memo: memo.clone(),
                    timestamp: Utc::now(),
                };
                self.record(LedgerEvent::Transfer(record.clone()));
                Ok(serde_json::to_value(record)?)
            }

            Submission::Withdraw {
                withdrawal_id,
                wallet_id,
                to_address,
                amount,
                fee,
            } => {
                amount.ensure_positive("withdrawal amount")?;
                if self.withdrawals.contains_key(withdrawal_id) {
                    return Err(Error::DuplicateId(withdrawal_id.clone()));
                }
                let required = amount.checked_add(*fee)?;
                self.debit(wallet_id, required)?;

                let record = WithdrawalRecord {
                    id: withdrawal_id.clone(),
                    from_id: wallet_id.clone(),
                    to_address: to_address.clone(),
                    amount: *amount,
                    fee: *fee,
                    txid: None,
                    status: WithdrawalStatus::Pending,
                    timestamp: Utc::now(),
                };
                self.withdrawals
                    .insert(withdrawal_id.clone(), record.clone());
                self.record(LedgerEvent::Withdrawal(record.clone()));
                Ok(serde_json::to_value(record)?)
            }

            Submission::RecordBroadcast {
                withdrawal_id,
                txid,
                status,
            } => {
                let record = self
                    .withdrawals
                    .get_mut(withdrawal_id)
                    .ok_or_else(|| Error::NotFound {
                        kind: EntityKind::Withdrawal,
                        id: withdrawal_id.clone(),
                    })?;
                record.txid = txid.clone();
                record.status = status.clone();
                let record = record.clone();

                // Keep the history entry in step with the receipt
                for entry in self.events.iter_mut().rev() {
                    if let LedgerEvent::Withdrawal(w) = &mut entry.event {
                        if w.id == *withdrawal_id {
                            *w = record.clone();
                            break;
                        }
                    }
                }
                Ok(serde_json::to_value(record)?)
            }

            Submission::ReconcileCredit {
                wallet_id,
                amount,
                on_chain,
                internal_total,
            } => {
                amount.ensure_positive("reconciliation credit")?;
                if !self.wallet(wallet_id)?.is_base_wallet() {
                    return Err(Error::LedgerBackend {
                        operation: submission.name().to_string(),
                        reason: format!("{} is not a base wallet", wallet_id),
                    });
                }
                let wallet = self.credit(wallet_id, *amount)?;
                self.record(LedgerEvent::ReconciliationCredit {
                    wallet_id: wallet_id.clone(),
                    amount: *amount,
                    on_chain: *on_chain,
                    internal_total: *internal_total,
                });
                Ok(serde_json::to_value(wallet)?)
            }

            Submission::SetFeeConfiguration { config } => {
                self.fee_config = VersionedFeeConfiguration {
                    version: self.fee_config.version + 1,
                    config: config.clone(),
                };
                Ok(serde_json::to_value(&self.fee_config)?)
            }
        }
    }

    fn query(&self, query: &Query) -> Result<serde_json::Value> {
        match query {
            Query::GetWallet { id } => Ok(serde_json::to_value(self.wallets.get(id))?),
            Query::WalletExists { id } => Ok(serde_json::Value::Bool(self.wallets.contains_key(id))),
            Query::ListByPrimaryWallet {
                blockchain,
                primary_wallet_name,
            } => {
                let wallets: Vec<&InternalWallet> = self
                    .wallets
                    .values()
                    .filter(|w| {
                        w.blockchain == *blockchain && w.primary_wallet_name == *primary_wallet_name
                    })
                    .collect();
                Ok(serde_json::to_value(wallets)?)
            }
            Query::History {
                wallet_id,
                before_sequence,
                limit,
            } => {
                let entries: Vec<&HistoryEntry> = self
                    .events
                    .iter()
                    .rev()
                    .skip_while(|e| before_sequence.is_some_and(|before| e.sequence >= before))
                    .filter(|e| e.event.touches(wallet_id))
                    .take(*limit)
                    .collect();
                Ok(serde_json::to_value(entries)?)
            }
            Query::GetFeeConfiguration => Ok(serde_json::to_value(&self.fee_config)?),
        }
    }
}

/// In-process ledger-of-record
pub struct MemoryLedger {
    state: Mutex<LedgerState>,
    snapshot_path: Option<PathBuf>,
}

impl MemoryLedger {
    /// Create an empty, non-persistent ledger
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LedgerState::default()),
            snapshot_path: None,
        }
    }

    /// Open a ledger persisted at `path`, starting empty if the file does not exist
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let state = match tokio::fs::read_to_string(&path).await {
            Ok(content) => {
                let state: LedgerState = serde_json::from_str(&content).map_err(|e| {
                    Error::Serialization(format!(
                        "Failed to parse ledger snapshot {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                info!(
                    "Loaded ledger snapshot: {} wallets, {} events",
                    state.wallets.len(),
                    state.events.len()
                );
                state
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No ledger snapshot at {}, starting empty", path.display());
                LedgerState::default()
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            state: Mutex::new(state),
            snapshot_path: Some(path),
        })
    }

    /// Write the snapshot through a temp file so a crash never leaves it half-written
    async fn save_snapshot(&self, state: &LedgerState) -> Result<()> {
        if let Some(path) = &self.snapshot_path {
            let json = serde_json::to_string_pretty(state).map_err(|e| {
                Error::Serialization(format!("Failed to serialize ledger: {}", e))
            })?;

            let tmp = path.with_extension("tmp");
            tokio::fs::write(&tmp, json).await.map_err(|e| {
                Error::Io(format!("Failed to write ledger snapshot: {}", e))
            })?;
            tokio::fs::rename(&tmp, path).await.map_err(|e| {
                Error::Io(format!("Failed to replace ledger snapshot: {}", e))
            })?;

            debug!("Saved ledger snapshot");
        }
        Ok(())
    }
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LedgerBackend for MemoryLedger {
    async fn submit(&self, submission: &Submission) -> Result<serde_json::Value> {
        let mut state = self.state.lock().await;

        // Apply to a scratch copy so a failed persist leaves memory untouched
        let mut next = state.clone();
        let result = next.apply(submission)?;
        self.save_snapshot(&next).await?;
        *state = next;

        Ok(result)
    }

    async fn evaluate(&self, query: &Query) -> Result<serde_json::Value> {
        let state = self.state.lock().await;
        state.query(query)
    }
}
