//! Upload byte budgets and billable session quotas.
//!
//! [`ByteBudgetEnforcer`] gates upload-presign requests per project, device and IP.
//! [`SessionQuotaGate`] decides whether a team may record another billable session in the
//! current billing period, caching usage with single-flight protection.

pub mod alerts;
pub mod byte_budget;
pub mod config;
pub mod errors;
pub mod memory;
pub mod metrics_defs;
pub mod period;
pub mod session_gate;
pub mod types;
pub mod usage;

pub use byte_budget::{BudgetRequest, ByteBudgetEnforcer};
pub use errors::{ErrorKind, QuotaError};
pub use session_gate::SessionQuotaGate;
pub use types::SessionLimitCheck;
