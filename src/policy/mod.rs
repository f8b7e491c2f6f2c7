//! Fee and payroll policies layered on the wallet manager

pub mod fee;
pub mod payroll;

pub use fee::{compute_fee, FeePolicy, FeeSplit, MerchantFeePolicy};
pub use payroll::{PayrollDefinition, PayrollProcessor, PayrollReceipt, PayrollSplit};
