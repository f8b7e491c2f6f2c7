//! Esplora-style REST API connector

use async_trait::async_trait;
use bitcoin::Network;
use chrono::DateTime;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

use crate::amount::{Amount, SignedAmount};
use crate::error::{Error, Result};
use crate::transaction::{
    check_op_return, estimate_vsize, select_coins, BuildOptions, FeeMode, TransactionBuilder,
    TxInput,
};

use super::{fee_for_vsize, ChainConnector, ChainTransaction, SendOptions};

#[derive(Debug, Deserialize)]
struct AddressInfo {
    chain_stats: TxoStats,
    mempool_stats: TxoStats,
}

#[derive(Debug, Deserialize)]
struct TxoStats {
    funded_txo_sum: u64,
    spent_txo_sum: u64,
}

#[derive(Debug, Deserialize)]
struct Utxo {
    txid: String,
    vout: u32,
    value: u64,
}

#[derive(Debug, Deserialize)]
struct EsploraTx {
    txid: String,
    #[serde(default)]
    fee: Option<u64>,
    status: TxStatus,
    #[serde(default)]
    vin: Vec<EsploraInput>,
    #[serde(default)]
    vout: Vec<EsploraOutput>,
}

#[derive(Debug, Deserialize)]
struct TxStatus {
    confirmed: bool,
    #[serde(default)]
    block_height: Option<u64>,
    #[serde(default)]
    block_time: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct EsploraInput {
    #[serde(default)]
    prevout: Option<EsploraOutput>,
}

#[derive(Debug, Deserialize)]
struct EsploraOutput {
    #[serde(default)]
    scriptpubkey_address: Option<String>,
    value: u64,
}

/// REST connector for one primary address
pub struct ApiConnector {
    blockchain: String,
    base_url: String,
    address: String,
    builder: TransactionBuilder,
    client: Client,
}

impl ApiConnector {
    pub fn new(
        blockchain: impl Into<String>,
        base_url: impl Into<String>,
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
            base_url: base_url.into().trim_end_matches('/').to_string(),
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

    async fn get_text(&self, path: &str) -> Result<String> {
        let url = format!("{}{}", self.base_url, path);
        debug!("GET {}", url);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| self.failure(path, format!("request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(self.failure(path, format!("API error {}: {}", status, body)));
        }

        response
            .text()
            .await
            .map_err(|e| self.failure(path, format!("read failed: {}", e)))
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let body = self.get_text(path).await?;
        serde_json::from_str(&body)
            .map_err(|e| self.failure(path, format!("malformed response: {}", e)))
    }

    async fn tip_height(&self) -> Result<u64> {
        let text = self.get_text("/blocks/tip/height").await?;
        text.trim()
            .parse()
            .map_err(|e| self.failure("/blocks/tip/height", format!("bad height {:?}: {}", text, e)))
    }

    async fn utxos(&self) -> Result<Vec<TxInput>> {
        let utxos: Vec<Utxo> = self
            .get_json(&format!("/address/{}/utxo", self.address))
            .await?;
        Ok(utxos
            .into_iter()
            .map(|u| TxInput {
                txid: u.txid,
                output_index: u.vout,
                value: Amount::from_sat(u.value),
            })
            .collect())
    }

    async fn fee_rate(&self, confirmation_target: u16) -> Result<f64> {
        let estimates: BTreeMap<String, f64> = self.get_json("/fee-estimates").await?;
        let by_target: BTreeMap<u16, f64> = estimates
            .into_iter()
            .filter_map(|(k, v)| k.parse().ok().map(|k| (k, v)))
            .collect();
        // Closest target no faster than requested
        Ok(by_target
            .range(confirmation_target..)
            .next()
            .map(|(_, rate)| *rate)
            .unwrap_or(1.0))
    }

    fn to_chain_transaction(&self, tx: EsploraTx, tip: u64) -> ChainTransaction {
        let ours = |o: &EsploraOutput| o.scriptpubkey_address.as_deref() == Some(self.address.as_str());
        let received: u64 = tx.vout.iter().filter(|o| ours(o)).map(|o| o.value).sum();
        let spent: u64 = tx
            .vin
            .iter()
            .filter_map(|i| i.prevout.as_ref())
            .filter(|o| ours(o))
            .map(|o| o.value)
            .sum();

        let confirmations = match (tx.status.confirmed, tx.status.block_height) {
            (true, Some(height)) => tip.saturating_sub(height) + 1,
            _ => 0,
        };

        ChainTransaction {
            txid: tx.txid,
            amount: SignedAmount::from_sat(received as i64 - spent as i64),
            fee: tx.fee.map(Amount::from_sat),
            confirmations,
            block_height: tx.status.block_height,
            timestamp: tx.status.block_time.and_then(|t| DateTime::from_timestamp(t, 0)),
        }
    }
}

#[async_trait]
impl ChainConnector for ApiConnector {
    async fn test_connection(&self) -> Result<bool> {
        match self.tip_height().await {
            Ok(_) => Ok(true),
            Err(e) => {
                debug!("API {} not reachable: {}", self.base_url, e);
                Ok(false)
            }
        }
    }

    async fn get_balance(&self) -> Result<Amount> {
        let info: AddressInfo = self
            .get_json(&format!("/address/{}", self.address))
            .await?;
        // Outgoing spends count as soon as they hit the mempool, receipts once confirmed
        let balance = info
            .chain_stats
            .funded_txo_sum
            .saturating_sub(info.chain_stats.spent_txo_sum)
            .saturating_sub(info.mempool_stats.spent_txo_sum);
        Ok(Amount::from_sat(balance))
    }

    async fn get_transaction_history(&self, limit: usize) -> Result<Vec<ChainTransaction>> {
        let tip = self.tip_height().await?;
        let txs: Vec<EsploraTx> = self
            .get_json(&format!("/address/{}/txs", self.address))
            .await?;
        Ok(txs
            .into_iter()
            .take(limit)
            .map(|tx| self.to_chain_transaction(tx, tip))
            .collect())
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

        let url = format!("{}/tx", self.base_url);
        let response = self
            .client
            .post(&url)
            .body(signed.tx_hex)
            .send()
            .await
            .map_err(|e| self.failure("/tx", format!("broadcast failed: {}", e)))?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(self.failure("/tx", format!("API error {}: {}", status, body)));
        }
        Ok(body.trim().to_string())
    }

    async fn verify_address(&self, address: &str) -> Result<bool> {
        Ok(self.builder.parse_address(address).is_ok())
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
        self.tip_height().await
    }

    async fn get_transaction(&self, txid: &str) -> Result<ChainTransaction> {
        let tip = self.tip_height().await?;
        let tx: EsploraTx = self.get_json(&format!("/tx/{}", txid)).await?;
        Ok(self.to_chain_transaction(tx, tip))
    }

    async fn verify_utxo_wallet(&self) -> Result<bool> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const ADDRESS: &str = "bcrt1qw508d6qejxtdg4y5r3zarvary0c5xw7kygt080";

    fn connector(server: &MockServer) -> ApiConnector {
        ApiConnector::new(
            "bitcoin",
            server.uri(),
            ADDRESS,
            Network::Regtest,
            Duration::from_secs(2),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_balance_counts_mempool_spends_only() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(format!("/address/{}", ADDRESS)))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "address": ADDRESS,
                "chain_stats": { "funded_txo_sum": 100_000, "spent_txo_sum": 30_000 },
                "mempool_stats": { "funded_txo_sum": 5_000, "spent_txo_sum": 10_000 }
            })))
            .mount(&server)
            .await;

        let balance = connector(&server).get_balance().await.unwrap();
        assert_eq!(balance, Amount::from_sat(60_000));
    }

    #[tokio::test]
    async fn test_history_nets_inputs_and_outputs() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/blocks/tip/height"))
            .respond_with(ResponseTemplate::new(200).set_body_string("110"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("/address/{}/txs", ADDRESS)))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {
                    "txid": "bb".repeat(32),
                    "fee": 200,
                    "status": { "confirmed": true, "block_height": 105, "block_time": 1_700_000_000 },
                    "vin": [{ "prevout": { "scriptpubkey_address": ADDRESS, "value": 50_000 } }],
                    "vout": [
                        { "scriptpubkey_address": "somebody", "value": 20_000 },
                        { "scriptpubkey_address": ADDRESS, "value": 29_800 }
                    ]
                },
                {
                    "txid": "aa".repeat(32),
                    "status": { "confirmed": false },
                    "vin": [],
                    "vout": [{ "scriptpubkey_address": ADDRESS, "value": 50_000 }]
                }
            ])))
            .mount(&server)
            .await;

        let history = connector(&server).get_transaction_history(10).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].amount.to_sat(), -20_200);
        assert_eq!(history[0].confirmations, 6);
        assert_eq!(history[1].amount.to_sat(), 50_000);
        assert_eq!(history[1].confirmations, 0);
    }

    #[tokio::test]
    async fn test_fee_rate_picks_nearest_slower_target() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/fee-estimates"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "1": 30.0, "3": 20.0, "10": 5.0, "144": 1.5
            })))
            .mount(&server)
            .await;

        let connector = connector(&server);
        assert_eq!(connector.fee_rate(3).await.unwrap(), 20.0);
        assert_eq!(connector.fee_rate(6).await.unwrap(), 5.0);
        assert_eq!(connector.fee_rate(1000).await.unwrap(), 1.0);
    }

    #[tokio::test]
    async fn test_http_error_is_connector_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/blocks/tip/height"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let connector = connector(&server);
        assert!(matches!(
            connector.get_blockchain_height().await,
            Err(Error::ConnectorFailure { .. })
        ));
        assert!(!connector.test_connection().await.unwrap());
    }

    #[tokio::test]
    async fn test_malformed_body_is_connector_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(format!("/address/{}", ADDRESS)))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>maintenance</html>"))
            .mount(&server)
            .await;

        let err = connector(&server).get_balance().await.unwrap_err();
        assert!(err.is_connector_failure());
        assert!(matches!(err, Error::ConnectorFailure { ref operation, .. } if operation.ends_with(ADDRESS)));
    }

    #[tokio::test]
    async fn test_fixed_fee_estimate_checks_exact_payment() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(format!("/address/{}/utxo", ADDRESS)))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                { "txid": "aa".repeat(32), "vout": 0, "value": 10_200 }
            ])))
            .mount(&server)
            .await;

        let connector = connector(&server);
        let options = SendOptions {
            fee: Some(Amount::from_sat(1_000)),
            ..Default::default()
        };
        let fee = connector
            .estimate_fee(ADDRESS, Amount::from_sat(5_000), &options)
            .await
            .unwrap();
        assert_eq!(fee, Amount::from_sat(1_000));

        // 200 sat of change would be dust
        assert!(matches!(
            connector
                .estimate_fee(ADDRESS, Amount::from_sat(9_000), &options)
                .await,
            Err(Error::TransactionBuild(_))
        ));
    }
}
