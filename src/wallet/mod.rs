//! Internal wallet management
//!
//! Internal wallets are ledger-only sub-accounts of a primary on-chain
//! wallet. Each primary wallet also owns a base wallet that collects fees
//! and reconciliation surplus.
//!
//! # Architecture
//!
//! ```text
//! PrimaryWalletRegistry → WalletManager → Ledger (memory | gateway)
//!          ↓                   ↓
//!   Bounded connector     WalletLocks
//! ```
//!
//! # Invariants
//!
//! - Balances never go negative
//! - Transfers stay within one primary wallet
//! - Base wallets change only through fees and reconciliation

pub mod locks;
pub mod manager;
pub mod reconcile;
pub mod registry;
pub mod types;

pub use locks::{WalletGuard, WalletLocks};
pub use manager::{WalletManager, WithdrawRequest};
pub use reconcile::{ReconciliationOutcome, ReconciliationReport, ReconciliationRun};
pub use registry::{PrimaryWallet, PrimaryWalletRegistry};
pub use types::{
    base_wallet_id, BalanceUpdate, BalanceUpdateReceipt, FeeConfiguration, HistoryEntry,
    InternalWallet, LedgerEvent, TransferRecord, VersionedFeeConfiguration, WalletMetadata,
    WithdrawalRecord, WithdrawalStatus,
};
