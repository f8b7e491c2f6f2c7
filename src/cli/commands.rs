//! CLI command implementations

use anyhow::{Context, Result};
use dialoguer::Confirm;
use futures::StreamExt;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::amount::{Amount, SignedAmount};
use crate::config::{Config, LedgerBackendKind};
use crate::connector::{ChainConnector, SendOptions};
use crate::ledger::{GatewayLedger, Ledger, LedgerBackend, MemoryLedger};
use crate::policy::{MerchantFeePolicy, PayrollDefinition, PayrollProcessor};
use crate::wallet::{
    BalanceUpdate, FeeConfiguration, PrimaryWalletRegistry, ReconciliationOutcome,
    WalletManager, WalletMetadata, WithdrawRequest,
};

/// Arguments of `wallet withdraw`
pub struct WithdrawArgs {
    pub id: String,
    pub to_address: String,
    pub amount: Amount,
    pub fee: Option<Amount>,
    pub op_return: Option<String>,
    pub force: bool,
}

/// Open the configured ledger backend
async fn open_ledger(config: &Config) -> Result<Ledger> {
    let timeout = Duration::from_millis(config.ledger.timeout_ms);
    let backend: Arc<dyn LedgerBackend> = match config.ledger.backend {
        LedgerBackendKind::Memory => match &config.ledger.snapshot_path {
            Some(path) => Arc::new(
                MemoryLedger::open(path)
                    .await
                    .with_context(|| format!("Failed to open ledger snapshot {}", path))?,
            ),
            None => {
                warn!("No snapshot_path configured; ledger state is lost on exit");
                Arc::new(MemoryLedger::new())
            }
        },
        LedgerBackendKind::Gateway => {
            let url = config
                .ledger
                .gateway_url
                .as_deref()
                .context("ledger.gateway_url is required for the gateway backend")?;
            Arc::new(GatewayLedger::new(url, timeout)?)
        }
    };
    Ok(Ledger::new(backend))
}

/// Wire registry, ledger and fee policy into a manager
async fn build_manager(config: &Config) -> Result<WalletManager> {
    let registry = PrimaryWalletRegistry::from_config(config)
        .await
        .context("Failed to set up primary wallets")?;
    let ledger = open_ledger(config).await?;

    let mut manager = WalletManager::new(ledger, Arc::new(registry));
    if config.fees.enabled {
        manager = manager.with_fee_policy(Arc::new(MerchantFeePolicy));

        // Seed an untouched ledger from config; afterwards the ledger owns it
        if manager.fee_configuration().await?.version == 0 {
            manager
                .set_fee_configuration(config.fees.to_fee_configuration())
                .await?;
        }
    }

    manager.bootstrap().await?;
    Ok(manager)
}

/// Print `value` as JSON, or run the text renderer
fn emit<T: Serialize>(json: bool, value: &T, text: impl FnOnce(&T)) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        text(value);
    }
    Ok(())
}

/// Show configuration
pub fn show_config(config: &Config) -> Result<()> {
    println!("{}", config.masked_display());
    Ok(())
}

#[derive(Serialize)]
struct HealthRow {
    blockchain: String,
    primary_wallet: String,
    mode: String,
    reachable: bool,
    height: Option<u64>,
    balance: Option<Amount>,
    utxo_wallet: Option<bool>,
    error: Option<String>,
}

/// Check health of every primary wallet's connector
pub async fn health(config: &Config, json: bool) -> Result<()> {
    let registry = PrimaryWalletRegistry::from_config(config).await?;

    let mut rows = Vec::with_capacity(registry.len());
    for primary in registry.iter() {
        let connector = primary.connector();
        let mut row = HealthRow {
            blockchain: primary.blockchain.clone(),
            primary_wallet: primary.name.clone(),
            mode: primary.connection_mode.to_string(),
            reachable: connector.test_connection().await.unwrap_or(false),
            height: None,
            balance: None,
            utxo_wallet: None,
            error: None,
        };

        if row.reachable {
            let checks = async {
                row.height = Some(connector.get_blockchain_height().await?);
                row.balance = Some(connector.get_balance().await?);
                row.utxo_wallet = Some(connector.verify_utxo_wallet().await?);
                Ok::<_, crate::error::Error>(())
            };
            let outcome = checks.await;
            if let Err(e) = outcome {
                row.error = Some(e.to_string());
            }
        }
        rows.push(row);
    }

    let healthy = rows.iter().all(|r| r.reachable && r.error.is_none());
    emit(json, &rows, |rows| {
        println!("\n=== SYSTEM HEALTH CHECK ===\n");
        for row in rows {
            print!("{}/{} ({})... ", row.blockchain, row.primary_wallet, row.mode);
            match (&row.error, row.reachable) {
                (_, false) => println!("UNREACHABLE"),
                (Some(e), true) => println!("FAILED: {}", e),
                (None, true) => println!(
                    "OK (height {}, balance {})",
                    row.height.unwrap_or_default(),
                    row.balance.unwrap_or_default()
                ),
            }
        }
        println!();
        if healthy {
            println!("All systems healthy!");
        } else {
            println!("Some systems are unhealthy. Check the errors above.");
        }
    })
}

pub async fn wallet_create(
    config: &Config,
    blockchain: &str,
    primary: &str,
    id: &str,
    label: Option<String>,
    json: bool,
) -> Result<()> {
    let manager = build_manager(config).await?;
    let metadata = match label {
        Some(label) => WalletMetadata::labeled(label),
        None => WalletMetadata::default(),
    };
    let wallet = manager.create(blockchain, primary, id, metadata).await?;
    emit(json, &wallet, |w| {
        println!(
            "Wallet '{}' created on {}/{}",
            w.id, w.blockchain, w.primary_wallet_name
        );
    })
}

pub async fn wallet_fund(config: &Config, id: &str, amount: Amount, json: bool) -> Result<()> {
    let manager = build_manager(config).await?;
    let wallet = manager.fund(id, amount).await?;
    emit(json, &wallet, |w| {
        println!("Funded {} with {}. Balance: {}", w.id, amount, w.balance);
    })
}

pub async fn wallet_set_balance(
    config: &Config,
    id: &str,
    balance: Option<Amount>,
    delta: Option<SignedAmount>,
    json: bool,
) -> Result<()> {
    let update = match (balance, delta) {
        (Some(balance), None) => BalanceUpdate::Set(balance),
        (None, Some(delta)) => BalanceUpdate::Delta(delta),
        _ => anyhow::bail!("Pass exactly one of --balance or --delta"),
    };

    let manager = build_manager(config).await?;
    let receipt = manager.update_balance(id, update).await?;
    emit(json, &receipt, |r| {
        println!(
            "{}: {} -> {}",
            r.wallet.id, r.previous, r.wallet.balance
        );
        if let Some(fee_wallet) = &r.fee_wallet_id {
            println!("Fee {} credited to {}", r.fee, fee_wallet);
        }
    })
}

pub async fn wallet_transfer(
    config: &Config,
    from: &str,
    to: &str,
    amount: Amount,
    memo: Option<String>,
    json: bool,
) -> Result<()> {
    let manager = build_manager(config).await?;
    let record = manager.transfer(from, to, amount, memo).await?;
    emit(json, &record, |r| {
        println!("\n=== TRANSFER COMPLETE ===");
        println!("From: {}", r.from_id);
        println!("To: {}", r.to_id);
        println!("Amount: {}", r.amount);
        println!("Net: {}", r.net_amount);
        if let Some(fee_wallet) = &r.fee_wallet_id {
            println!("Fee: {} (to {})", r.fee, fee_wallet);
        }
    })
}

pub async fn wallet_withdraw(config: &Config, args: WithdrawArgs, json: bool) -> Result<()> {
    let op_return = args
        .op_return
        .as_deref()
        .map(hex::decode)
        .transpose()
        .context("--op-return must be hex")?;

    let manager = build_manager(config).await?;
    let wallet = manager.get_wallet(&args.id).await?;
    let primary = manager
        .registry()
        .get(&wallet.blockchain, &wallet.primary_wallet_name)?;
    let secret = primary.signing_secret()?;

    let fee = match args.fee {
        Some(fee) => fee,
        None => {
            let options = SendOptions {
                op_return: op_return.clone(),
                ..Default::default()
            };
            primary
                .connector()
                .estimate_fee(&args.to_address, args.amount, &options)
                .await
                .context("Fee estimation failed; pass --fee explicitly")?
        }
    };

    if !args.force {
        let confirmed = Confirm::new()
            .with_prompt(format!(
                "Withdraw {} (fee {}) from {} to {}? This cannot be undone.",
                args.amount, fee, args.id, args.to_address
            ))
            .default(false)
            .interact()?;

        if !confirmed {
            info!("Withdrawal cancelled by user");
            return Ok(());
        }
    }

    let record = manager
        .withdraw(
            WithdrawRequest {
                wallet_id: args.id,
                to_address: args.to_address,
                amount: args.amount,
                fee,
                op_return,
            },
            &secret,
        )
        .await?;

    emit(json, &record, |r| {
        println!("\n=== WITHDRAWAL BROADCAST ===");
        println!("Id: {}", r.id);
        println!("Amount: {}", r.amount);
        println!("Fee: {}", r.fee);
        println!("To: {}", r.to_address);
        if let Some(txid) = &r.txid {
            println!("Txid: {}", txid);
        }
    })
}

pub async fn wallet_balance(config: &Config, id: &str, json: bool) -> Result<()> {
    let manager = build_manager(config).await?;
    let wallet = manager.get_wallet(id).await?;
    emit(json, &wallet, |w| println!("{}: {}", w.id, w.balance))
}

pub async fn wallet_history(config: &Config, id: &str, limit: usize, json: bool) -> Result<()> {
    let manager = build_manager(config).await?;
    let mut entries = manager.history(id, limit).await?;

    if !json {
        println!("\n=== HISTORY: {} ===\n", id);
    }
    let mut count = 0;
    while let Some(entry) = entries.next().await {
        let entry = entry?;
        if json {
            println!("{}", serde_json::to_string(&entry)?);
        } else {
            println!(
                "#{:<6} {} {}",
                entry.sequence,
                entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
                serde_json::to_string(&entry.event)?
            );
        }
        count += 1;
    }
    if !json && count == 0 {
        println!("No history.");
    }
    Ok(())
}

pub async fn wallet_list(config: &Config, blockchain: &str, primary: &str, json: bool) -> Result<()> {
    let manager = build_manager(config).await?;
    let wallets = manager.list_by_primary_wallet(blockchain, primary).await?;
    emit(json, &wallets, |wallets| {
        println!("\n=== WALLETS: {}/{} ===\n", blockchain, primary);
        println!("{:<32} {:>20} {}", "ID", "BALANCE", "LABEL");
        println!("{}", "-".repeat(72));
        for w in wallets {
            println!(
                "{:<32} {:>20} {}",
                w.id,
                w.balance.to_string(),
                w.metadata.label.as_deref().unwrap_or("")
            );
        }
        println!();
    })
}

pub async fn reconcile(
    config: &Config,
    target: Option<(String, String)>,
    json: bool,
) -> Result<()> {
    let manager = build_manager(config).await?;

    let reports = match target {
        Some((blockchain, primary)) => vec![manager.reconcile(&blockchain, &primary).await?],
        None => {
            let mut reports = Vec::new();
            let mut failures = 0;
            for run in manager.reconcile_all().await {
                match run.result {
                    Ok(report) => reports.push(report),
                    Err(e) => {
                        failures += 1;
                        eprintln!(
                            "{}/{}: reconciliation failed: {}",
                            run.blockchain, run.primary_wallet, e
                        );
                    }
                }
            }
            if failures > 0 && reports.is_empty() {
                anyhow::bail!("Reconciliation failed for every primary wallet");
            }
            reports
        }
    };

    let deficit = reports
        .iter()
        .any(|r| matches!(r.outcome, ReconciliationOutcome::Deficit { .. }));

    emit(json, &reports, |reports| {
        println!("\n=== RECONCILIATION ===\n");
        for r in reports {
            print!(
                "{}/{}: on-chain {}, internal {} -> ",
                r.blockchain, r.primary_wallet, r.on_chain, r.internal_total
            );
            match &r.outcome {
                ReconciliationOutcome::Balanced => println!("balanced"),
                ReconciliationOutcome::Credited {
                    amount,
                    base_wallet_id,
                } => println!("credited {} to {}", amount, base_wallet_id),
                ReconciliationOutcome::Deficit { shortfall } => {
                    println!("DEFICIT of {} (operator action required)", shortfall)
                }
            }
        }
    })?;

    if deficit {
        anyhow::bail!("Reconciliation found a deficit");
    }
    Ok(())
}

pub async fn fees_show(config: &Config, json: bool) -> Result<()> {
    let manager = build_manager(config).await?;
    let versioned = manager.fee_configuration().await?;
    emit(json, &versioned, |v| {
        println!("\n=== FEE CONFIGURATION (version {}) ===\n", v.version);
        println!("Policy enabled: {}", config.fees.enabled);
        println!("Default: {}%", v.config.default_fee_percentage);
        if let Some(min) = v.config.min_fee_amount {
            println!("Minimum: {}", min);
        }
        if let Some(max) = v.config.max_fee_amount {
            println!("Maximum: {}", max);
        }
        for (merchant, pct) in &v.config.merchant_specific_fees {
            println!("  {}: {}%", merchant, pct);
        }
    })
}

pub async fn fees_set(
    config: &Config,
    default_percentage: f64,
    min: Option<Amount>,
    max: Option<Amount>,
    merchants: &[String],
    json: bool,
) -> Result<()> {
    let mut fee_config = FeeConfiguration {
        default_fee_percentage: default_percentage,
        min_fee_amount: min,
        max_fee_amount: max,
        ..Default::default()
    };
    for entry in merchants {
        let (id, pct) = entry
            .split_once('=')
            .with_context(|| format!("Expected ID=PCT, got {:?}", entry))?;
        let pct: f64 = pct
            .trim()
            .parse()
            .with_context(|| format!("Invalid percentage in {:?}", entry))?;
        fee_config
            .merchant_specific_fees
            .insert(id.trim().to_string(), pct);
    }

    let manager = build_manager(config).await?;
    let versioned = manager.set_fee_configuration(fee_config).await?;
    emit(json, &versioned, |v| {
        println!("Fee configuration updated to version {}", v.version);
    })
}

pub async fn payroll_run(config: &Config, file: &Path, json: bool) -> Result<()> {
    let contents = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("Failed to read payroll file {}", file.display()))?;
    let definition: PayrollDefinition =
        serde_json::from_str(&contents).context("Invalid payroll file")?;

    let manager = build_manager(config).await?;
    let receipt = PayrollProcessor::new(manager)
        .process(&definition.employer_id, &definition.splits)
        .await?;

    emit(json, &receipt, |r| {
        println!("\n=== PAYROLL {} ===", r.run_id);
        println!("Employer: {}", r.employer_id);
        println!("Total: {}", r.total);
        for t in &r.transfers {
            println!("  {} <- {}", t.to_id, t.amount);
        }
    })
}
