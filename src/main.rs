//! Subledger - internal sub-accounts over primary UTXO wallets
//!
//! # WARNING
//! - Withdrawals broadcast real transactions from the primary address.
//! - A failed broadcast leaves the debit in place until reconciliation.
//! - Keep signing secrets in environment variables, never in config files.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::error;

use subledger::cli::commands;
use subledger::config::Config;
use subledger::{Amount, SignedAmount};

/// Subledger - internal wallet ledger
#[derive(Parser)]
#[command(name = "subledger")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, default_value = "config.toml")]
    config: String,

    /// Emit JSON logs and JSON command output
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show current configuration (secrets masked)
    Config,

    /// Check every primary wallet's chain connection
    Health,

    /// Internal wallet commands
    Wallet {
        #[command(subcommand)]
        action: WalletAction,
    },

    /// Compare on-chain and internal balances
    Reconcile {
        /// Only this blockchain (requires --primary)
        #[arg(long, requires = "primary")]
        blockchain: Option<String>,

        /// Only this primary wallet
        #[arg(long, requires = "blockchain")]
        primary: Option<String>,
    },

    /// Fee configuration
    Fees {
        #[command(subcommand)]
        action: FeesAction,
    },

    /// Payroll runs
    Payroll {
        #[command(subcommand)]
        action: PayrollAction,
    },
}

#[derive(Subcommand)]
enum WalletAction {
    /// Create an internal wallet
    Create {
        /// Wallet id (letters, digits, '.', '_', '-', ':')
        id: String,

        #[arg(long, default_value = "bitcoin")]
        blockchain: String,

        /// Primary wallet name
        #[arg(long)]
        primary: String,

        /// Human-readable label
        #[arg(long)]
        label: Option<String>,
    },

    /// Credit an internal wallet
    Fund { id: String, amount: Amount },

    /// Set or adjust a balance directly
    SetBalance {
        id: String,

        /// New absolute balance
        #[arg(long, conflicts_with = "delta")]
        balance: Option<Amount>,

        /// Signed adjustment, e.g. -0.25
        #[arg(long, allow_hyphen_values = true)]
        delta: Option<SignedAmount>,
    },

    /// Move funds between two internal wallets
    Transfer {
        from: String,
        to: String,
        amount: Amount,

        #[arg(long)]
        memo: Option<String>,
    },

    /// Send funds on-chain from an internal wallet
    Withdraw {
        id: String,
        to_address: String,
        amount: Amount,

        /// Network fee; estimated when omitted
        #[arg(long)]
        fee: Option<Amount>,

        /// OP_RETURN payload as hex (max 80 bytes)
        #[arg(long)]
        op_return: Option<String>,

        /// Skip confirmation prompt
        #[arg(long)]
        force: bool,
    },

    /// Show one wallet's balance
    Balance { id: String },

    /// Show a wallet's history, newest first
    History {
        id: String,

        /// Number of records to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// List wallets of a primary wallet
    List {
        #[arg(long, default_value = "bitcoin")]
        blockchain: String,

        #[arg(long)]
        primary: String,
    },
}

#[derive(Subcommand)]
enum FeesAction {
    /// Show the current fee configuration
    Show,

    /// Replace the fee configuration
    Set {
        /// Default percentage, 0-100
        #[arg(long)]
        default_percentage: f64,

        #[arg(long)]
        min: Option<Amount>,

        #[arg(long)]
        max: Option<Amount>,

        /// Per-merchant override, as id=percentage (repeatable)
        #[arg(long = "merchant", value_name = "ID=PCT")]
        merchants: Vec<String>,
    },
}

#[derive(Subcommand)]
enum PayrollAction {
    /// Run payroll from a JSON file: {"employer_id": .., "splits": [..]}
    Run { file: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Parse CLI arguments
    let cli = Cli::parse();

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive("subledger=info".parse()?);
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_writer(std::io::stderr);
    if cli.json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    // Load configuration
    let config = match Config::load(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Failed to load configuration: {:#}", e);
            std::process::exit(1);
        }
    };

    let json = cli.json;
    let result = match cli.command {
        Commands::Config => commands::show_config(&config),
        Commands::Health => commands::health(&config, json).await,
        Commands::Wallet { action } => match action {
            WalletAction::Create {
                id,
                blockchain,
                primary,
                label,
            } => commands::wallet_create(&config, &blockchain, &primary, &id, label, json).await,
            WalletAction::Fund { id, amount } => {
                commands::wallet_fund(&config, &id, amount, json).await
            }
            WalletAction::SetBalance { id, balance, delta } => {
                commands::wallet_set_balance(&config, &id, balance, delta, json).await
            }
            WalletAction::Transfer {
                from,
                to,
                amount,
                memo,
            } => commands::wallet_transfer(&config, &from, &to, amount, memo, json).await,
            WalletAction::Withdraw {
                id,
                to_address,
                amount,
                fee,
                op_return,
                force,
            } => {
                commands::wallet_withdraw(
                    &config,
                    commands::WithdrawArgs {
                        id,
                        to_address,
                        amount,
                        fee,
                        op_return,
                        force,
                    },
                    json,
                )
                .await
            }
            WalletAction::Balance { id } => commands::wallet_balance(&config, &id, json).await,
            WalletAction::History { id, limit } => {
                commands::wallet_history(&config, &id, limit, json).await
            }
            WalletAction::List {
                blockchain,
                primary,
            } => commands::wallet_list(&config, &blockchain, &primary, json).await,
        },
        Commands::Reconcile {
            blockchain,
            primary,
        } => commands::reconcile(&config, blockchain.zip(primary), json).await,
        Commands::Fees { action } => match action {
            FeesAction::Show => commands::fees_show(&config, json).await,
            FeesAction::Set {
                default_percentage,
                min,
                max,
                merchants,
            } => commands::fees_set(&config, default_percentage, min, max, &merchants, json).await,
        },
        Commands::Payroll { action } => match action {
            PayrollAction::Run { file } => commands::payroll_run(&config, &file, json).await,
        },
    };

    if let Err(e) = result {
        error!("Command failed: {:#}", e);
        std::process::exit(1);
    }

    Ok(())
}
