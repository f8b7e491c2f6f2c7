//! In-process mock chain
//!
//! Holds a single synthetic UTXO worth the whole balance. Sends go through
//! the real transaction builder so OP_RETURN limits and signing errors
//! surface exactly as they would against a node.

use async_trait::async_trait;
use bitcoin::Network;
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::amount::{Amount, SignedAmount};
use crate::error::{Error, Result};
use crate::transaction::{
    check_op_return, estimate_vsize, select_coins, BuildOptions, FeeMode, TransactionBuilder,
    TxInput,
};

use super::{fee_for_vsize, ChainConnector, ChainTransaction, SendOptions};

/// A broadcast recorded by the mock chain
#[derive(Debug, Clone, PartialEq)]
pub struct SentTransaction {
    pub txid: String,
    pub to_address: String,
    pub amount: Amount,
    pub fee: Amount,
    pub op_return: Option<Vec<u8>>,
    pub tx_hex: String,
}

struct ChainState {
    balance: Amount,
    height: u64,
    /// Oldest first
    history: Vec<ChainTransaction>,
    sent: Vec<SentTransaction>,
    fail_next_send: Option<String>,
    stall_next_send: Option<Duration>,
    send_attempts: usize,
    reachable: bool,
    latency: Duration,
    /// sat/vB
    fee_rate: f64,
    nonce: u64,
}

/// Mock chain backing one primary wallet
pub struct SimulatedConnector {
    blockchain: String,
    address: String,
    builder: TransactionBuilder,
    state: RwLock<ChainState>,
}

impl SimulatedConnector {
    pub fn new(blockchain: impl Into<String>, network: Network, address: impl Into<String>) -> Self {
        Self {
            blockchain: blockchain.into(),
            address: address.into(),
            builder: TransactionBuilder::new(network),
            state: RwLock::new(ChainState {
                balance: Amount::ZERO,
                height: 100,
                history: Vec::new(),
                sent: Vec::new(),
                fail_next_send: None,
                stall_next_send: None,
                send_attempts: 0,
                reachable: true,
                latency: Duration::ZERO,
                fee_rate: 2.0,
                nonce: 0,
            }),
        }
    }

    /// Overwrite the on-chain balance without recording a transaction
    pub async fn set_balance(&self, balance: Amount) {
        self.state.write().await.balance = balance;
    }

    /// Simulate an external deposit to the primary address; returns its txid
    pub async fn deposit(&self, amount: Amount) -> Result<String> {
        let mut state = self.state.write().await;
        state.balance = state.balance.checked_add(amount)?;
        state.height += 1;
        let txid = self.next_txid(&mut state, "deposit");
        let record = ChainTransaction {
            txid: txid.clone(),
            amount: amount.signed_diff(Amount::ZERO),
            fee: None,
            confirmations: 1,
            block_height: Some(state.height),
            timestamp: Some(Utc::now()),
        };
        state.history.push(record);
        info!("Simulated deposit of {} to {}", amount, self.address);
        Ok(txid)
    }

    /// Make the next send fail with `reason`
    pub async fn fail_next_send(&self, reason: impl Into<String>) {
        self.state.write().await.fail_next_send = Some(reason.into());
    }

    /// Hold the next send for `delay` before it touches the chain
    pub async fn stall_next_send(&self, delay: Duration) {
        self.state.write().await.stall_next_send = Some(delay);
    }

    /// Sends started, including failed and abandoned ones
    pub async fn send_attempts(&self) -> usize {
        self.state.read().await.send_attempts
    }

    pub async fn set_reachable(&self, reachable: bool) {
        self.state.write().await.reachable = reachable;
    }

    /// Delay every call by `latency`
    pub async fn set_latency(&self, latency: Duration) {
        self.state.write().await.latency = latency;
    }

    pub async fn sent_transactions(&self) -> Vec<SentTransaction> {
        self.state.read().await.sent.clone()
    }

    fn next_txid(&self, state: &mut ChainState, label: &str) -> String {
        state.nonce += 1;
        let mut hasher = Sha256::new();
        hasher.update(self.address.as_bytes());
        hasher.update(label.as_bytes());
        hasher.update(state.nonce.to_le_bytes());
        hex::encode(hasher.finalize())
    }

    /// Apply latency and reachability before touching state
    async fn enter(&self, operation: &str) -> Result<()> {
        let (latency, reachable) = {
            let state = self.state.read().await;
            (state.latency, state.reachable)
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if !reachable {
            return Err(Error::ConnectorFailure {
                blockchain: self.blockchain.clone(),
                operation: operation.to_string(),
                reason: "simulated chain unreachable".to_string(),
            });
        }
        Ok(())
    }

    /// The whole balance as one spendable output
    fn balance_utxo(txid: String, balance: Amount) -> TxInput {
        TxInput {
            txid,
            output_index: 0,
            value: balance,
        }
    }

    fn fee_estimate(&self, fee_rate: f64, options: &SendOptions) -> Amount {
        let vsize = estimate_vsize(1, 2, options.op_return.as_ref().map(Vec::len));
        fee_for_vsize(fee_rate, vsize)
    }
}

#[async_trait]
impl ChainConnector for SimulatedConnector {
    async fn test_connection(&self) -> Result<bool> {
        Ok(self.enter("test_connection").await.is_ok())
    }

    async fn get_balance(&self) -> Result<Amount> {
        self.enter("get_balance").await?;
        Ok(self.state.read().await.balance)
    }

    async fn get_transaction_history(&self, limit: usize) -> Result<Vec<ChainTransaction>> {
        self.enter("get_transaction_history").await?;
        let state = self.state.read().await;
        Ok(state
            .history
            .iter()
            .rev()
            .take(limit)
            .map(|tx| {
                let mut tx = tx.clone();
                if let Some(height) = tx.block_height {
                    tx.confirmations = state.height.saturating_sub(height) + 1;
                }
                tx
            })
            .collect())
    }

    async fn send_transaction(
        &self,
        to_address: &str,
        amount: Amount,
        options: &SendOptions,
    ) -> Result<String> {
        let stall = {
            let mut state = self.state.write().await;
            state.send_attempts += 1;
            state.stall_next_send.take()
        };
        if let Some(delay) = stall {
            tokio::time::sleep(delay).await;
        }

        self.enter("send_transaction").await?;
        let secret = options.require_secret()?;
        check_op_return(options.op_return.as_deref())?;

        let mut state = self.state.write().await;
        if let Some(reason) = state.fail_next_send.take() {
            return Err(Error::ConnectorFailure {
                blockchain: self.blockchain.clone(),
                operation: "send_transaction".to_string(),
                reason,
            });
        }

        let fee = match options.fee {
            Some(fee) => fee,
            None => self.fee_estimate(state.fee_rate, options),
        };
        let utxo = Self::balance_utxo(self.next_txid(&mut state, "utxo"), state.balance);
        let selection = select_coins(&[utxo], amount, fee, options.fee_mode())?;
        let outputs = selection.outputs(to_address, amount, &self.address);
        let signed = self.builder.create_and_sign(
            secret,
            &selection.inputs,
            &outputs,
            &BuildOptions {
                op_return: options.op_return.clone(),
            },
        )?;

        let spent = amount.checked_add(selection.fee)?;
        state.balance = state.balance.saturating_sub(spent);
        state.height += 1;
        let height = state.height;
        state.history.push(ChainTransaction {
            txid: signed.txid.clone(),
            amount: SignedAmount::from_sat(-(spent.to_sat() as i64)),
            fee: Some(selection.fee),
            confirmations: 1,
            block_height: Some(height),
            timestamp: Some(Utc::now()),
        });
        state.sent.push(SentTransaction {
            txid: signed.txid.clone(),
            to_address: to_address.to_string(),
            amount,
            fee: selection.fee,
            op_return: options.op_return.clone(),
            tx_hex: signed.tx_hex,
        });

        debug!("Simulated broadcast {} paying {} to {}", signed.txid, amount, to_address);
        Ok(signed.txid)
    }

    async fn verify_address(&self, address: &str) -> Result<bool> {
        self.enter("verify_address").await?;
        Ok(self.builder.parse_address(address).is_ok())
    }

    async fn estimate_fee(
        &self,
        _to_address: &str,
        amount: Amount,
        options: &SendOptions,
    ) -> Result<Amount> {
        self.enter("estimate_fee").await?;
        let state = self.state.read().await;
        if let Some(fee) = options.fee {
            let utxo = Self::balance_utxo("00".repeat(32), state.balance);
            select_coins(&[utxo], amount, fee, FeeMode::Exact)?;
            return Ok(fee);
        }
        Ok(self.fee_estimate(state.fee_rate, options))
    }

    async fn get_blockchain_height(&self) -> Result<u64> {
        self.enter("get_blockchain_height").await?;
        Ok(self.state.read().await.height)
    }

    async fn get_transaction(&self, txid: &str) -> Result<ChainTransaction> {
        self.enter("get_transaction").await?;
        let state = self.state.read().await;
        state
            .history
            .iter()
            .find(|tx| tx.txid == txid)
            .cloned()
            .ok_or_else(|| Error::ConnectorFailure {
                blockchain: self.blockchain.clone(),
                operation: "get_transaction".to_string(),
                reason: format!("unknown transaction {}", txid),
            })
    }

    async fn verify_utxo_wallet(&self) -> Result<bool> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::SigningSecret;
    use bitcoin::secp256k1::SecretKey;
    use bitcoin::PrivateKey;

    fn secret(byte: u8) -> SigningSecret {
        let key = PrivateKey::new(SecretKey::from_slice(&[byte; 32]).unwrap(), Network::Regtest);
        SigningSecret::new(key.to_wif())
    }

    fn chain() -> SimulatedConnector {
        let builder = TransactionBuilder::new(Network::Regtest);
        let address = builder.address_for(&secret(1)).unwrap().to_string();
        SimulatedConnector::new("bitcoin", Network::Regtest, address)
    }

    fn destination() -> String {
        TransactionBuilder::new(Network::Regtest)
            .address_for(&secret(9))
            .unwrap()
            .to_string()
    }

    #[tokio::test]
    async fn test_send_debits_balance_and_records() {
        let chain = chain();
        chain.deposit(Amount::from_sat(100_000)).await.unwrap();

        let options = SendOptions {
            secret: Some(secret(1)),
            fee: Some(Amount::from_sat(1_000)),
            ..Default::default()
        };
        let txid = chain
            .send_transaction(&destination(), Amount::from_sat(40_000), &options)
            .await
            .unwrap();

        assert_eq!(chain.get_balance().await.unwrap(), Amount::from_sat(59_000));
        let sent = chain.sent_transactions().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].txid, txid);

        let history = chain.get_transaction_history(10).await.unwrap();
        assert_eq!(history[0].txid, txid);
        assert!(history[0].amount.is_negative());
        assert_eq!(history[1].confirmations, 2);
    }

    #[tokio::test]
    async fn test_injected_failure_leaves_balance() {
        let chain = chain();
        chain.set_balance(Amount::from_sat(100_000)).await;
        chain.fail_next_send("mempool full").await;

        let options = SendOptions {
            secret: Some(secret(1)),
            fee: Some(Amount::from_sat(1_000)),
            ..Default::default()
        };
        let err = chain
            .send_transaction(&destination(), Amount::from_sat(40_000), &options)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConnectorFailure { ref reason, .. } if reason == "mempool full"));
        assert_eq!(chain.get_balance().await.unwrap(), Amount::from_sat(100_000));
    }

    #[tokio::test]
    async fn test_verify_address_is_network_aware() {
        let chain = chain();
        assert!(chain.verify_address(&destination()).await.unwrap());
        assert!(!chain
            .verify_address("bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4")
            .await
            .unwrap());
        assert!(!chain.verify_address("definitely not").await.unwrap());
    }

    #[tokio::test]
    async fn test_unreachable_chain() {
        let chain = chain();
        chain.set_reachable(false).await;
        assert!(!chain.test_connection().await.unwrap());
        assert!(matches!(
            chain.get_balance().await,
            Err(Error::ConnectorFailure { .. })
        ));
    }

    #[tokio::test]
    async fn test_fixed_fee_never_absorbs_dust() {
        let chain = chain();
        chain.set_balance(Amount::from_sat(100_000)).await;
        let options = SendOptions {
            secret: Some(secret(1)),
            fee: Some(Amount::from_sat(1_000)),
            ..Default::default()
        };

        // 98_800 + 1_000 leaves 200 sat of change
        let amount = Amount::from_sat(98_800);
        assert!(matches!(
            chain.estimate_fee(&destination(), amount, &options).await,
            Err(Error::TransactionBuild(_))
        ));
        assert!(matches!(
            chain.send_transaction(&destination(), amount, &options).await,
            Err(Error::TransactionBuild(_))
        ));
        assert_eq!(chain.get_balance().await.unwrap(), Amount::from_sat(100_000));
        assert_eq!(chain.send_attempts().await, 1);
    }
}
