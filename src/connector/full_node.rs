//! Bitcoin-Core-style full node over JSON-RPC
//!
//! Wallet-less: balance and UTXOs come from `scantxoutset`, so the node
//! needs no imported keys. `listtransactions` only sees the primary address
//! if it has been imported as watch-only.

use async_trait::async_trait;
use bitcoin::Network;
use chrono::DateTime;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use crate::amount::{Amount, SignedAmount};
use crate::error::{Error, Result};
use crate::transaction::{
    check_op_return, estimate_vsize, select_coins, BuildOptions, FeeMode, TransactionBuilder,
    TxInput,
};

use super::{coins_to_amount, coins_to_signed, fee_for_vsize, ChainConnector, ChainTransaction, SendOptions};

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: serde_json::Value,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct ScanResult {
    #[serde(default)]
    unspents: Vec<ScanUnspent>,
    total_amount: f64,
}

#[derive(Debug, Deserialize)]
struct ScanUnspent {
    txid: String,
    vout: u32,
    amount: f64,
}

#[derive(Debug, Deserialize)]
struct SmartFee {
    /// BTC per kvB
    #[serde(default)]
    feerate: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ListedTransaction {
    #[serde(default)]
    address: Option<String>,
    txid: String,
    amount: f64,
    #[serde(default)]
    fee: Option<f64>,
    #[serde(default)]
    confirmations: i64,
    #[serde(default)]
    blockheight: Option<u64>,
    #[serde(default)]
    time: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct RawTransaction {
    txid: String,
    #[serde(default)]
    confirmations: Option<u64>,
    #[serde(default)]
    blocktime: Option<i64>,
    #[serde(default)]
    vout: Vec<RawOutput>,
}

#[derive(Debug, Deserialize)]
struct RawOutput {
    value: f64,
    #[serde(rename = "scriptPubKey")]
    script_pub_key: RawScript,
}

#[derive(Debug, Deserialize)]
struct RawScript {
    #[serde(default)]
    address: Option<String>,
}

/// JSON-RPC connector for one primary address
pub struct FullNodeConnector {
    blockchain: String,
    endpoint: String,
    rpc_user: Option<String>,
    rpc_password: Option<String>,
    address: String,
    builder: TransactionBuilder,
    client: Client,
}

impl FullNodeConnector {
    pub fn new(
        blockchain: impl Into<String>,
        endpoint: impl Into<String>,
        rpc_user: Option<String>,
        rpc_password: Option<String>,
        address: impl Into<String>,
        network: Network,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            blockchain: blockchain.into(),
            endpoint: endpoint.into(),
            rpc_user,
            rpc_password,
            address: address.into(),
            builder: TransactionBuilder::new(network),
            client,
        })
    }

    fn failure(&self, operation: &str, reason: impl Into<String>) -> Error {
        Error::ConnectorFailure {
            blockchain: self.blockchain.clone(),
            operation: operation.to_string(),
            reason: reason.into(),
        }
    }

    async fn call<T: for<'de> Deserialize<'de>>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<T> {
        let request = serde_json::json!({
            "jsonrpc": "1.0",
            "id": "subledger",
            "method": method,
            "params": params,
        });

        debug!("RPC {} -> {}", method, self.endpoint);

        let mut builder = self.client.post(&self.endpoint).json(&request);
        if let Some(user) = &self.rpc_user {
            builder = builder.basic_auth(user, self.rpc_password.as_ref());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| self.failure(method, format!("RPC request failed: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| self.failure(method, format!("RPC read failed: {}", e)))?;

        // Core answers errors with HTTP 500 and a JSON body
        let parsed: RpcResponse = serde_json::from_str(&body)
            .map_err(|_| self.failure(method, format!("HTTP {}: {}", status, body)))?;

        if let Some(error) = parsed.error {
            return Err(self.failure(method, format!("RPC error {}: {}", error.code, error.message)));
        }

        serde_json::from_value(parsed.result)
            .map_err(|e| self.failure(method, format!("malformed result: {}", e)))
    }

    async fn scan(&self) -> Result<ScanResult> {
        self.call(
            "scantxoutset",
            serde_json::json!(["start", [format!("addr({})", self.address)]]),
        )
        .await
    }

    async fn fee_rate(&self, confirmation_target: u16) -> Result<f64> {
        let estimate: SmartFee = self
            .call("estimatesmartfee", serde_json::json!([confirmation_target]))
            .await?;
        // BTC/kvB to sat/vB, kept to millisat precision
        Ok(estimate
            .feerate
            .map(|r| (r * 1e8).round() / 1000.0)
            .unwrap_or(1.0))
    }

    async fn utxos(&self) -> Result<Vec<TxInput>> {
        self.scan()
            .await?
            .unspents
            .into_iter()
            .map(|u| {
                Ok(TxInput {
                    txid: u.txid,
                    output_index: u.vout,
                    value: coins_to_amount(u.amount)?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl ChainConnector for FullNodeConnector {
    async fn test_connection(&self) -> Result<bool> {
        match self.call::<u64>("getblockcount", serde_json::json!([])).await {
            Ok(_) => Ok(true),
            Err(e) => {
                debug!("Full node {} not reachable: {}", self.endpoint, e);
                Ok(false)
            }
        }
    }

    async fn get_balance(&self) -> Result<Amount> {
        coins_to_amount(self.scan().await?.total_amount)
    }

    async fn get_transaction_history(&self, limit: usize) -> Result<Vec<ChainTransaction>> {
        let listed: Vec<ListedTransaction> = self
            .call("listtransactions", serde_json::json!(["*", limit.max(1) * 4, 0, true]))
            .await?;

        // listtransactions is oldest first
        listed
            .into_iter()
            .rev()
            .filter(|tx| tx.address.as_deref() == Some(self.address.as_str()))
            .take(limit)
            .map(|tx| {
                Ok(ChainTransaction {
                    txid: tx.txid,
                    amount: coins_to_signed(tx.amount)?,
                    fee: tx.fee.map(|f| coins_to_amount(f.abs())).transpose()?,
                    confirmations: tx.confirmations.max(0) as u64,
                    block_height: tx.blockheight,
                    timestamp: tx.time.and_then(|t| DateTime::from_timestamp(t, 0)),
                })
            })
            .collect()
    }

    async fn send_transaction(
        &self,
        to_address: &str,
        amount: Amount,
        options: &SendOptions,
    ) -> Result<String> {
        let secret = options.require_secret()?;
        check_op_return(options.op_return.as_deref())?;

        let fee = match options.fee {
            Some(fee) => fee,
            None => self.estimate_fee(to_address, amount, options).await?,
        };

        let utxos = self.utxos().await?;
        let selection = select_coins(&utxos, amount, fee, options.fee_mode())?;
        let outputs = selection.outputs(to_address, amount, &self.address);
        let signed = self.builder.create_and_sign(
            secret,
            &selection.inputs,
            &outputs,
            &BuildOptions {
                op_return: options.op_return.clone(),
            },
        )?;

        let txid: String = self
            .call("sendrawtransaction", serde_json::json!([signed.tx_hex]))
            .await?;
        Ok(txid)
    }

    async fn verify_address(&self, address: &str) -> Result<bool> {
        if self.builder.parse_address(address).is_err() {
            return Ok(false);
        }

        #[derive(Deserialize)]
        struct Validation {
            isvalid: bool,
        }
        let validation: Validation = self
            .call("validateaddress", serde_json::json!([address]))
            .await?;
        Ok(validation.isvalid)
    }

    async fn estimate_fee(
        &self,
        _to_address: &str,
        amount: Amount,
        options: &SendOptions,
    ) -> Result<Amount> {
        if let Some(fee) = options.fee {
            let utxos = self.utxos().await?;
            select_coins(&utxos, amount, fee, FeeMode::Exact)?;
            return Ok(fee);
        }

        let rate = self.fee_rate(options.confirmation_target).await?;
        let utxos = self.utxos().await?;
        let inputs = select_coins(&utxos, amount, Amount::ZERO, FeeMode::FoldDust)
            .map(|s| s.inputs.len())
            .unwrap_or(1);
        let vsize = estimate_vsize(inputs, 2, options.op_return.as_ref().map(Vec::len));
        Ok(fee_for_vsize(rate, vsize))
    }

    async fn get_blockchain_height(&self) -> Result<u64> {
        self.call("getblockcount", serde_json::json!([])).await
    }

    async fn get_transaction(&self, txid: &str) -> Result<ChainTransaction> {
        let raw: RawTransaction = self
            .call("getrawtransaction", serde_json::json!([txid, true]))
            .await?;

        let received = raw
            .vout
            .iter()
            .filter(|o| o.script_pub_key.address.as_deref() == Some(self.address.as_str()))
            .map(|o| coins_to_amount(o.value))
            .collect::<Result<Vec<_>>>()?;
        let received = Amount::sum(received.iter())?;

        Ok(ChainTransaction {
            txid: raw.txid,
            amount: SignedAmount::from_sat(received.to_sat() as i64),
            fee: None,
            confirmations: raw.confirmations.unwrap_or(0),
            block_height: None,
            timestamp: raw.blocktime.and_then(|t| DateTime::from_timestamp(t, 0)),
        })
    }

    async fn verify_utxo_wallet(&self) -> Result<bool> {
        Ok(true)
    }
}
