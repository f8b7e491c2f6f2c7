//! Wallet manager - sub-account operations
//!
//! Validates every request, serializes mutations per wallet id, and maps
//! each mutation onto one ledger-of-record submission. Holds no balances
//! of its own: every decision reads current state from the ledger after
//! the relevant locks are taken.

use futures::stream::{self, BoxStream, StreamExt};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::amount::Amount;
use crate::config::is_valid_id;
use crate::connector::{ChainConnector, SendOptions};
use crate::error::{EntityKind, Error, Result};
use crate::ledger::{Ledger, Submission};
use crate::policy::FeePolicy;
use crate::transaction::{check_op_return, SigningSecret};

use super::locks::WalletLocks;
use super::registry::{PrimaryWallet, PrimaryWalletRegistry};
use super::types::{
    base_wallet_id, BalanceUpdate, BalanceUpdateReceipt, FeeApplication, FeeConfiguration,
    HistoryEntry, InternalWallet, TransferRecord, VersionedFeeConfiguration, WalletMetadata,
    WithdrawalRecord, WithdrawalStatus, BASE_WALLET_PREFIX,
};

/// Entries fetched per history page
const HISTORY_PAGE_SIZE: usize = 50;

/// Request to move funds from an internal wallet to an on-chain address
#[derive(Debug, Clone)]
pub struct WithdrawRequest {
    pub wallet_id: String,

    pub to_address: String,

    pub amount: Amount,

    /// Network fee, debited on top of `amount`
    pub fee: Amount,

    pub op_return: Option<Vec<u8>>,
}

/// Core sub-account manager
#[derive(Clone)]
pub struct WalletManager {
    /// Ledger-of-record
    ledger: Ledger,

    /// Configured primary wallets
    registry: Arc<PrimaryWalletRegistry>,

    /// Per-wallet serialization
    locks: Arc<WalletLocks>,

    /// Applied to credits when set
    fee_policy: Option<Arc<dyn FeePolicy>>,
}

impl WalletManager {
    pub fn new(ledger: Ledger, registry: Arc<PrimaryWalletRegistry>) -> Self {
        Self {
            ledger,
            registry,
            locks: Arc::new(WalletLocks::new()),
            fee_policy: None,
        }
    }

    /// Apply `policy` to transfers and balance credits
    pub fn with_fee_policy(mut self, policy: Arc<dyn FeePolicy>) -> Self {
        info!("Fee policy enabled: {}", policy.name());
        self.fee_policy = Some(policy);
        self
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn registry(&self) -> &PrimaryWalletRegistry {
        &self.registry
    }

    pub(crate) fn locks(&self) -> &WalletLocks {
        &self.locks
    }

    /// Create an internal wallet with zero balance
    pub async fn create(
        &self,
        blockchain: &str,
        primary_wallet_name: &str,
        id: &str,
        metadata: WalletMetadata,
    ) -> Result<InternalWallet> {
        if !is_valid_id(id) {
            return Err(Error::InvalidId(format!("{:?} is not a valid wallet id", id)));
        }
        if id.starts_with(BASE_WALLET_PREFIX) {
            return Err(Error::InvalidId(format!(
                "ids starting with {:?} are reserved",
                BASE_WALLET_PREFIX
            )));
        }
        if metadata.is_base_wallet {
            return Err(Error::BaseWalletProtected {
                wallet_id: id.to_string(),
            });
        }
        self.registry.get(blockchain, primary_wallet_name)?;

        let _guard = self.locks.lock(id).await;
        if self.ledger.wallet_exists(id).await? {
            return Err(Error::DuplicateId(id.to_string()));
        }

        let wallet: InternalWallet = self
            .ledger
            .submit(&Submission::CreateWallet {
                id: id.to_string(),
                blockchain: blockchain.to_string(),
                primary_wallet_name: primary_wallet_name.to_string(),
                metadata,
            })
            .await?;

        info!(
            "Created wallet {} on {}/{}",
            wallet.id, wallet.blockchain, wallet.primary_wallet_name
        );
        Ok(wallet)
    }

    /// Return the base wallet of a primary wallet, creating it if missing
    pub async fn ensure_base_wallet(
        &self,
        blockchain: &str,
        primary_wallet_name: &str,
    ) -> Result<InternalWallet> {
        self.registry.get(blockchain, primary_wallet_name)?;
        let id = base_wallet_id(blockchain, primary_wallet_name);

        let _guard = self.locks.lock(&id).await;
        if let Some(wallet) = self.ledger.get_wallet(&id).await? {
            return Ok(wallet);
        }

        let created = self
            .ledger
            .submit::<InternalWallet>(&Submission::CreateWallet {
                id: id.clone(),
                blockchain: blockchain.to_string(),
                primary_wallet_name: primary_wallet_name.to_string(),
                metadata: WalletMetadata::base(),
            })
            .await;

        match created {
            Ok(wallet) => {
                info!("Created base wallet {}", wallet.id);
                Ok(wallet)
            }
            // Another process sharing the ledger got there first
            Err(Error::DuplicateId(_)) => self.get_wallet(&id).await,
            Err(e) => Err(e),
        }
    }

    /// Create the base wallet of every configured primary wallet
    pub async fn bootstrap(&self) -> Result<Vec<InternalWallet>> {
        let mut bases = Vec::with_capacity(self.registry.len());
        for primary in self.registry.iter() {
            bases.push(
                self.ensure_base_wallet(&primary.blockchain, &primary.name)
                    .await?,
            );
        }
        Ok(bases)
    }

    /// Credit an internal wallet
    ///
    /// Base wallets only change through reconciliation and fee income, so
    /// funding one directly is rejected.
    pub async fn fund(&self, id: &str, amount: Amount) -> Result<InternalWallet> {
        amount.ensure_positive("fund amount")?;

        let _guard = self.locks.lock(id).await;
        let wallet = self.get_wallet(id).await?;
        if wallet.is_base_wallet() {
            return Err(Error::BaseWalletProtected {
                wallet_id: id.to_string(),
            });
        }

        let wallet: InternalWallet = self
            .ledger
            .submit(&Submission::Fund {
                wallet_id: id.to_string(),
                amount,
            })
            .await?;

        info!("Funded {} with {} (balance {})", id, amount, wallet.balance);
        Ok(wallet)
    }

    /// Set or adjust a balance directly
    ///
    /// When a fee policy is active, a credit (new balance above the old one)
    /// pays the fee to the base wallet of the same primary wallet.
    pub async fn update_balance(
        &self,
        id: &str,
        update: BalanceUpdate,
    ) -> Result<BalanceUpdateReceipt> {
        let wallet = self.get_wallet(id).await?;
        if wallet.is_base_wallet() {
            return Err(Error::BaseWalletProtected {
                wallet_id: id.to_string(),
            });
        }
        if let BalanceUpdate::Delta(delta) = update {
            if delta.to_sat() == 0 {
                return Err(Error::InvalidAmount("balance delta must be non-zero".to_string()));
            }
        }

        let base = match self.fee_policy {
            Some(_) => Some(
                self.ensure_base_wallet(&wallet.blockchain, &wallet.primary_wallet_name)
                    .await?,
            ),
            None => None,
        };

        let _guard = self.locks.lock(id).await;
        let wallet = self.get_wallet(id).await?;
        let previous = wallet.balance;

        let target = match update {
            BalanceUpdate::Set(balance) => balance,
            BalanceUpdate::Delta(delta) if delta.is_negative() => previous
                .checked_sub(delta.unsigned_abs())
                .ok_or_else(|| Error::InsufficientBalance {
                    wallet_id: id.to_string(),
                    available: previous,
                    required: delta.unsigned_abs(),
                })?,
            BalanceUpdate::Delta(delta) => previous.checked_add(delta.unsigned_abs())?,
        };

        let fee = match (&self.fee_policy, base) {
            (Some(policy), Some(base)) if target > previous => {
                let versioned = self.ledger.fee_configuration().await?;
                let credit = target.saturating_sub(previous);
                let split = policy.compute_fee(credit, id, &versioned.config);
                (!split.fee.is_zero()).then(|| FeeApplication {
                    fee_wallet_id: base.id,
                    fee: split.fee,
                    config_version: versioned.version,
                })
            }
            _ => None,
        };

        let balance = match &fee {
            Some(fee) => target.saturating_sub(fee.fee),
            None => target,
        };

        let receipt: BalanceUpdateReceipt = self
            .ledger
            .submit(&Submission::SetBalance {
                wallet_id: id.to_string(),
                expected_previous: previous,
                balance,
                fee,
            })
            .await?;

        info!(
            "Updated {} balance {} -> {} (fee {})",
            id, receipt.previous, receipt.wallet.balance, receipt.fee
        );
        Ok(receipt)
    }

    /// Move funds off-ledger to an on-chain address
    ///
    /// Checks the chain can pay exactly `amount + fee`, debits that, then
    /// broadcasts. A send failure after
    /// the debit is reported as `BroadcastFailed` and is never retried:
    /// the debit stands until reconciled.
    pub async fn withdraw(
        &self,
        request: WithdrawRequest,
        secret: &SigningSecret,
    ) -> Result<WithdrawalRecord> {
        check_op_return(request.op_return.as_deref())?;
        request.amount.ensure_positive("withdrawal amount")?;

        let wallet = self.get_wallet(&request.wallet_id).await?;
        let primary = self
            .registry
            .get(&wallet.blockchain, &wallet.primary_wallet_name)?;

        let _guard = self.locks.lock(&request.wallet_id).await;
        let wallet = self.get_wallet(&request.wallet_id).await?;

        let required = request.amount.checked_add(request.fee)?;
        if wallet.balance < required {
            return Err(Error::InsufficientBalance {
                wallet_id: wallet.id,
                available: wallet.balance,
                required,
            });
        }

        secret.validate()?;
        if !primary.connector().verify_address(&request.to_address).await? {
            return Err(Error::InvalidAddress(request.to_address));
        }

        let options = SendOptions {
            secret: Some(secret.clone()),
            fee: Some(request.fee),
            op_return: request.op_return.clone(),
            ..Default::default()
        };

        // The chain must be able to pay exactly amount + fee; dust change
        // folded into the fee would outrun the debit
        primary
            .connector()
            .estimate_fee(&request.to_address, request.amount, &options)
            .await?;

        let withdrawal_id = Uuid::new_v4().to_string();
        let mut record: WithdrawalRecord = self
            .ledger
            .submit(&Submission::Withdraw {
                withdrawal_id: withdrawal_id.clone(),
                wallet_id: request.wallet_id.clone(),
                to_address: request.to_address.clone(),
                amount: request.amount,
                fee: request.fee,
            })
            .await?;
        debug!("Withdrawal {} debited {}", withdrawal_id, required);

        match send(&primary, &request, &options).await {
            Ok(txid) => {
                let broadcast = self
                    .ledger
                    .submit::<WithdrawalRecord>(&Submission::RecordBroadcast {
                        withdrawal_id: withdrawal_id.clone(),
                        txid: Some(txid.clone()),
                        status: WithdrawalStatus::Broadcast,
                    })
                    .await;

                match broadcast {
                    Ok(updated) => record = updated,
                    Err(e) => {
                        // Funds moved; only the receipt is behind
                        warn!(
                            "Withdrawal {} broadcast as {} but receipt update failed: {}",
                            withdrawal_id, txid, e
                        );
                        record.txid = Some(txid.clone());
                        record.status = WithdrawalStatus::Broadcast;
                    }
                }

                info!(
                    "Withdrew {} from {} to {} in {}",
                    request.amount, request.wallet_id, request.to_address, txid
                );
                Ok(record)
            }
            Err(e) => {
                error!(
                    withdrawal_id = %withdrawal_id,
                    wallet_id = %request.wallet_id,
                    debited = %required,
                    "Broadcast failed after debit: {}",
                    e
                );

                if let Err(record_err) = self
                    .ledger
                    .submit::<WithdrawalRecord>(&Submission::RecordBroadcast {
                        withdrawal_id: withdrawal_id.clone(),
                        txid: None,
                        status: WithdrawalStatus::Failed {
                            reason: e.to_string(),
                        },
                    })
                    .await
                {
                    warn!(
                        "Could not mark withdrawal {} failed: {}",
                        withdrawal_id, record_err
                    );
                }

                Err(Error::BroadcastFailed {
                    withdrawal_id,
                    debited: required,
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Move funds between two wallets of the same primary wallet
    ///
    /// Applies the fee policy, if any, to the payee's credit.
    pub async fn transfer(
        &self,
        from_id: &str,
        to_id: &str,
        amount: Amount,
        memo: Option<String>,
    ) -> Result<TransferRecord> {
        self.transfer_inner(from_id, to_id, amount, memo, true)
            .await
    }

    /// Transfer the exact amount, bypassing the fee policy
    pub async fn transfer_exempt(
        &self,
        from_id: &str,
        to_id: &str,
        amount: Amount,
        memo: Option<String>,
    ) -> Result<TransferRecord> {
        self.transfer_inner(from_id, to_id, amount, memo, false)
            .await
    }

    async fn transfer_inner(
        &self,
        from_id: &str,
        to_id: &str,
        amount: Amount,
        memo: Option<String>,
        apply_fee: bool,
    ) -> Result<TransferRecord> {
        amount.ensure_positive("transfer amount")?;
        if from_id == to_id {
            return Err(Error::InvalidId(format!(
                "cannot transfer from {} to itself",
                from_id
            )));
        }

        let (from, to) = self.transfer_parties(from_id, to_id).await?;
        check_same_primary(&from, &to)?;

        let policy = match &self.fee_policy {
            Some(policy) if apply_fee && !to.is_base_wallet() => Some(policy.clone()),
            _ => None,
        };
        let base = match policy {
            Some(_) => Some(
                self.ensure_base_wallet(&to.blockchain, &to.primary_wallet_name)
                    .await?,
            ),
            None => None,
        };

        let _guard = self.locks.lock_all([from_id, to_id]).await;
        let (from, to) = self.transfer_parties(from_id, to_id).await?;

        if from.balance < amount {
            return Err(Error::InsufficientBalance {
                wallet_id: from.id,
                available: from.balance,
                required: amount,
            });
        }

        let fee = match (policy, base) {
            (Some(policy), Some(base)) => {
                let versioned = self.ledger.fee_configuration().await?;
                let split = policy.compute_fee(amount, &to.id, &versioned.config);
                (!split.fee.is_zero()).then(|| FeeApplication {
                    fee_wallet_id: base.id,
                    fee: split.fee,
                    config_version: versioned.version,
                })
            }
            _ => None,
        };

        let record: TransferRecord = self
            .ledger
            .submit(&Submission::Transfer {
                transfer_id: Uuid::new_v4().to_string(),
                from_id: from_id.to_string(),
                to_id: to_id.to_string(),
                amount,
                fee,
                memo,
            })
            .await?;

        info!(
            "Transferred {} from {} to {} (net {}, fee {})",
            record.amount, record.from_id, record.to_id, record.net_amount, record.fee
        );
        Ok(record)
    }

    /// Look up both sides of a transfer, naming whichever is missing
    async fn transfer_parties(
        &self,
        from_id: &str,
        to_id: &str,
    ) -> Result<(InternalWallet, InternalWallet)> {
        let from = self
            .ledger
            .get_wallet(from_id)
            .await?
            .ok_or_else(|| Error::NotFound {
                kind: EntityKind::TransferSource,
                id: from_id.to_string(),
            })?;
        let to = self
            .ledger
            .get_wallet(to_id)
            .await?
            .ok_or_else(|| Error::NotFound {
                kind: EntityKind::TransferDestination,
                id: to_id.to_string(),
            })?;
        Ok((from, to))
    }

    pub async fn get_wallet(&self, id: &str) -> Result<InternalWallet> {
        self.ledger
            .get_wallet(id)
            .await?
            .ok_or_else(|| Error::NotFound {
                kind: EntityKind::InternalWallet,
                id: id.to_string(),
            })
    }

    pub async fn get_balance(&self, id: &str) -> Result<Amount> {
        Ok(self.get_wallet(id).await?.balance)
    }

    /// Up to `limit` history entries touching `id`, newest first
    ///
    /// Pages are fetched from the ledger as the stream is consumed. The
    /// stream is finite and cannot be restarted.
    pub async fn history(
        &self,
        id: &str,
        limit: usize,
    ) -> Result<BoxStream<'static, Result<HistoryEntry>>> {
        self.get_wallet(id).await?;

        struct Cursor {
            ledger: Ledger,
            wallet_id: String,
            /// Sequence of the oldest entry fetched so far
            before_sequence: Option<u64>,
            remaining: usize,
            buffer: VecDeque<HistoryEntry>,
            exhausted: bool,
        }

        let cursor = Cursor {
            ledger: self.ledger.clone(),
            wallet_id: id.to_string(),
            before_sequence: None,
            remaining: limit,
            buffer: VecDeque::new(),
            exhausted: false,
        };

        let entries = stream::unfold(cursor, |mut cursor| async move {
            if cursor.remaining == 0 {
                return None;
            }
            if cursor.buffer.is_empty() && !cursor.exhausted {
                let page_size = cursor.remaining.min(HISTORY_PAGE_SIZE);
                match cursor
                    .ledger
                    .history_page(&cursor.wallet_id, cursor.before_sequence, page_size)
                    .await
                {
                    Ok(page) => {
                        cursor.exhausted = page.len() < page_size;
                        if let Some(oldest) = page.last() {
                            cursor.before_sequence = Some(oldest.sequence);
                        }
                        cursor.buffer.extend(page);
                    }
                    Err(e) => {
                        cursor.remaining = 0;
                        return Some((Err(e), cursor));
                    }
                }
            }
            let entry = cursor.buffer.pop_front()?;
            cursor.remaining -= 1;
            Some((Ok(entry), cursor))
        });

        Ok(entries.boxed())
    }

    pub async fn list_by_primary_wallet(
        &self,
        blockchain: &str,
        primary_wallet_name: &str,
    ) -> Result<Vec<InternalWallet>> {
        self.registry.get(blockchain, primary_wallet_name)?;
        self.ledger
            .list_by_primary_wallet(blockchain, primary_wallet_name)
            .await
    }

    /// Replace the fee configuration; bumps its version
    pub async fn set_fee_configuration(
        &self,
        config: FeeConfiguration,
    ) -> Result<VersionedFeeConfiguration> {
        let valid = |p: f64| p.is_finite() && (0.0..=100.0).contains(&p);
        if !valid(config.default_fee_percentage)
            || !config.merchant_specific_fees.values().all(|p| valid(*p))
        {
            return Err(Error::InvalidAmount(
                "fee percentages must be between 0 and 100".to_string(),
            ));
        }
        if let (Some(min), Some(max)) = (config.min_fee_amount, config.max_fee_amount) {
            if min > max {
                return Err(Error::InvalidAmount(format!(
                    "minimum fee {} exceeds maximum {}",
                    min, max
                )));
            }
        }

        let versioned: VersionedFeeConfiguration = self
            .ledger
            .submit(&Submission::SetFeeConfiguration { config })
            .await?;
        info!("Fee configuration now at version {}", versioned.version);
        Ok(versioned)
    }

    pub async fn fee_configuration(&self) -> Result<VersionedFeeConfiguration> {
        self.ledger.fee_configuration().await
    }
}

fn check_same_primary(from: &InternalWallet, to: &InternalWallet) -> Result<()> {
    if from.shares_primary_with(to) {
        return Ok(());
    }
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
    Ok(())
}

async fn send(
    primary: &PrimaryWallet,
    request: &WithdrawRequest,
    options: &SendOptions,
) -> Result<String> {
    primary
        .connector()
        .send_transaction(&request.to_address, request.amount, options)
        .await
}
