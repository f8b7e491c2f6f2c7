//! Configured primary wallets and their connectors

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::config::{Config, PrimaryWalletConfig};
use crate::connector::{
    ApiConnector, Bounded, ChainConnector, ConnectionMode, FullNodeConnector, SimulatedConnector,
};
use crate::error::{EntityKind, Error, Result};
use crate::transaction::SigningSecret;

/// One on-chain address under management
pub struct PrimaryWallet {
    pub blockchain: String,

    pub name: String,

    pub connection_mode: ConnectionMode,

    pub network: bitcoin::Network,

    pub address: String,

    /// Env var holding the WIF signing secret
    pub secret_env: Option<String>,

    connector: Bounded,
}

impl PrimaryWallet {
    pub fn new(
        blockchain: impl Into<String>,
        name: impl Into<String>,
        connection_mode: ConnectionMode,
        network: bitcoin::Network,
        address: impl Into<String>,
        connector: Arc<dyn ChainConnector>,
        timeout: Duration,
    ) -> Self {
        Self {
            blockchain: blockchain.into(),
            name: name.into(),
            connection_mode,
            network,
            address: address.into(),
            secret_env: None,
            connector: Bounded::new(connector, timeout),
        }
    }

    pub fn with_secret_env(mut self, var: impl Into<String>) -> Self {
        self.secret_env = Some(var.into());
        self
    }

    /// Timeout-bounded connector for this wallet's chain
    pub fn connector(&self) -> &Bounded {
        &self.connector
    }

    /// Read the signing secret from the configured env var
    pub fn signing_secret(&self) -> Result<SigningSecret> {
        let var = self.secret_env.as_deref().ok_or_else(|| {
            Error::Config(format!(
                "No secret_env configured for {}/{}",
                self.blockchain, self.name
            ))
        })?;
        SigningSecret::from_env(var)
    }

    async fn from_config(config: &PrimaryWalletConfig, timeout: Duration) -> Result<Self> {
        let network = config.network.to_network();
        let endpoint = || {
            config.endpoint.clone().ok_or_else(|| {
                Error::Config(format!("Primary wallet {} has no endpoint", config.name))
            })
        };

        let connector: Arc<dyn ChainConnector> = match config.connection_mode {
            ConnectionMode::FullNode => Arc::new(FullNodeConnector::new(
                &config.blockchain,
                endpoint()?,
                config.rpc_user.clone(),
                config.rpc_password.clone(),
                &config.address,
                network,
                timeout,
            )?),
            ConnectionMode::Api => Arc::new(ApiConnector::new(
                &config.blockchain,
                endpoint()?,
                &config.address,
                network,
                timeout,
            )?),
            ConnectionMode::Simulated => {
                let chain = SimulatedConnector::new(&config.blockchain, network, &config.address);
                if let Some(balance) = config.simulated_balance {
                    chain.set_balance(balance).await;
                }
                Arc::new(chain)
            }
        };

        let mut wallet = Self::new(
            &config.blockchain,
            &config.name,
            config.connection_mode,
            network,
            &config.address,
            connector,
            timeout,
        );
        wallet.secret_env = config.secret_env.clone();
        Ok(wallet)
    }
}

/// All primary wallets, keyed by (blockchain, name)
#[derive(Default)]
pub struct PrimaryWalletRegistry {
    wallets: BTreeMap<(String, String), Arc<PrimaryWallet>>,
}

impl PrimaryWalletRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build every configured primary wallet with its bounded connector
    pub async fn from_config(config: &Config) -> Result<Self> {
        let timeout = Duration::from_millis(config.connector.timeout_ms);
        let mut registry = Self::new();
        for wallet_config in &config.primary_wallets {
            let wallet = PrimaryWallet::from_config(wallet_config, timeout).await?;
            info!(
                "Registered primary wallet {}/{} ({} mode)",
                wallet.blockchain, wallet.name, wallet.connection_mode
            );
            registry.insert(wallet)?;
        }
        Ok(registry)
    }

    pub fn insert(&mut self, wallet: PrimaryWallet) -> Result<()> {
        let key = (wallet.blockchain.clone(), wallet.name.clone());
        if self.wallets.contains_key(&key) {
            return Err(Error::Config(format!(
                "Duplicate primary wallet {}/{}",
                key.0, key.1
            )));
        }
        self.wallets.insert(key, Arc::new(wallet));
        Ok(())
    }

    /// Builder-style insert
    pub fn with(mut self, wallet: PrimaryWallet) -> Result<Self> {
        self.insert(wallet)?;
        Ok(self)
    }

    pub fn get(&self, blockchain: &str, name: &str) -> Result<Arc<PrimaryWallet>> {
        self.wallets
            .get(&(blockchain.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| Error::NotFound {
                kind: EntityKind::PrimaryWallet,
                id: format!("{}/{}", blockchain, name),
            })
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<PrimaryWallet>> {
        self.wallets.values()
    }

    pub fn len(&self) -> usize {
        self.wallets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wallets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simulated(name: &str) -> PrimaryWallet {
        let chain = Arc::new(SimulatedConnector::new(
            "bitcoin",
            bitcoin::Network::Regtest,
            "addr",
        ));
        PrimaryWallet::new(
            "bitcoin",
            name,
            ConnectionMode::Simulated,
            bitcoin::Network::Regtest,
            "addr",
            chain,
            Duration::from_secs(1),
        )
    }

    #[test]
    fn test_lookup_and_unknown_primary() {
        let registry = PrimaryWalletRegistry::new().with(simulated("treasury")).unwrap();
        assert!(registry.get("bitcoin", "treasury").is_ok());

        let err = registry.get("bitcoin", "payroll").err().unwrap();
        assert!(matches!(
            err,
            Error::NotFound { kind: EntityKind::PrimaryWallet, ref id } if id == "bitcoin/payroll"
        ));
    }

    #[test]
    fn test_duplicate_primary_rejected() {
        let registry = PrimaryWalletRegistry::new().with(simulated("treasury")).unwrap();
        assert!(registry.with(simulated("treasury")).is_err());
    }

    #[test]
    fn test_from_config_seeds_simulated_chain() {
        let config: Config = serde_json::from_value(serde_json::json!({
            "primary_wallets": [{
                "blockchain": "bitcoin",
                "name": "treasury",
                "connection_mode": "simulated",
                "network": "regtest",
                "address": "bcrt1qw508d6qejxtdg4y5r3zarvary0c5xw7kygt080",
                "secret_env": "TREASURY_WIF",
                "simulated_balance": "0.25"
            }]
        }))
        .unwrap();

        let registry = tokio_test::block_on(PrimaryWalletRegistry::from_config(&config)).unwrap();
        let wallet = registry.get("bitcoin", "treasury").unwrap();
        assert_eq!(wallet.network, bitcoin::Network::Regtest);
        assert_eq!(wallet.secret_env.as_deref(), Some("TREASURY_WIF"));

        let balance = tokio_test::block_on(wallet.connector().get_balance()).unwrap();
        assert_eq!(balance, crate::amount::Amount::from_sat(25_000_000));
    }

    #[test]
    fn test_missing_secret_env() {
        let wallet = simulated("treasury");
        assert!(matches!(wallet.signing_secret(), Err(Error::Config(_))));
    }
}
