//! Timeout decorator for connectors

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::amount::Amount;
use crate::error::{Error, Result};

use super::{ChainConnector, ChainTransaction, SendOptions};

/// Caps every call on the wrapped connector with a timeout
///
/// A timed-out call is abandoned, not retried. For `send_transaction` that
/// means the broadcast may or may not have happened.
#[derive(Clone)]
pub struct Bounded {
    inner: Arc<dyn ChainConnector>,
    timeout: Duration,
}

impl Bounded {
    pub fn new(inner: Arc<dyn ChainConnector>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn run<T>(&self, operation: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                warn!(operation, timeout_ms = self.timeout.as_millis() as u64, "Connector call timed out");
                Err(Error::ConnectorTimeout {
                    operation: operation.to_string(),
                    timeout_ms: self.timeout.as_millis() as u64,
                })
            }
        }
    }
}

#[async_trait]
impl ChainConnector for Bounded {
    async fn test_connection(&self) -> Result<bool> {
        // A hung endpoint is as good as an unreachable one
        match self.run("test_connection", self.inner.test_connection()).await {
            Err(Error::ConnectorTimeout { .. }) => Ok(false),
            other => other,
        }
    }

    async fn get_balance(&self) -> Result<Amount> {
        self.run("get_balance", self.inner.get_balance()).await
    }

    async fn get_transaction_history(&self, limit: usize) -> Result<Vec<ChainTransaction>> {
        self.run(
            "get_transaction_history",
            self.inner.get_transaction_history(limit),
        )
        .await
    }

    async fn send_transaction(
        &self,
        to_address: &str,
        amount: Amount,
        options: &SendOptions,
    ) -> Result<String> {
        self.run(
            "send_transaction",
            self.inner.send_transaction(to_address, amount, options),
        )
        .await
    }

    async fn verify_address(&self, address: &str) -> Result<bool> {
        self.run("verify_address", self.inner.verify_address(address))
            .await
    }

    async fn estimate_fee(
        &self,
        to_address: &str,
        amount: Amount,
        options: &SendOptions,
    ) -> Result<Amount> {
        self.run(
            "estimate_fee",
            self.inner.estimate_fee(to_address, amount, options),
        )
        .await
    }

    async fn get_blockchain_height(&self) -> Result<u64> {
        self.run("get_blockchain_height", self.inner.get_blockchain_height())
            .await
    }

    async fn get_transaction(&self, txid: &str) -> Result<ChainTransaction> {
        self.run("get_transaction", self.inner.get_transaction(txid))
            .await
    }

    async fn verify_utxo_wallet(&self) -> Result<bool> {
        self.run("verify_utxo_wallet", self.inner.verify_utxo_wallet())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::SimulatedConnector;
    use bitcoin::Network;

    #[tokio::test]
    async fn test_slow_call_becomes_timeout() {
        let chain = Arc::new(SimulatedConnector::new("bitcoin", Network::Regtest, "unused"));
        chain.set_latency(Duration::from_millis(200)).await;
        let bounded = Bounded::new(chain, Duration::from_millis(20));

        let err = bounded.get_balance().await.unwrap_err();
        assert!(matches!(
            err,
            Error::ConnectorTimeout { ref operation, timeout_ms: 20 } if operation == "get_balance"
        ));
        assert!(!bounded.test_connection().await.unwrap());
    }

    #[tokio::test]
    async fn test_fast_call_passes_through() {
        let chain = Arc::new(SimulatedConnector::new("bitcoin", Network::Regtest, "unused"));
        chain.set_balance(Amount::from_sat(1_000)).await;
        let bounded = Bounded::new(chain, Duration::from_secs(1));
        assert_eq!(bounded.get_balance().await.unwrap(), Amount::from_sat(1_000));
    }
}
