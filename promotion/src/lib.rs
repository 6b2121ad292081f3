//! Replay promotion.
//!
//! [`PromotionEngine`] reaches one irrevocable verdict per session: keep the full replay
//! or not. [`FunnelLearner`] supplies the navigation model some of its rules rely on, and
//! [`FunnelJob`] persists the stricter per-project funnel used for failed-funnel detection.

pub mod config;
pub mod engine;
pub mod errors;
pub mod funnel;
pub mod funnel_job;
pub mod memory;
pub mod metrics_defs;
pub mod rules;
pub mod sampling;
pub mod scoring;
pub mod store;
pub mod types;

pub use engine::PromotionEngine;
pub use errors::PromotionError;
pub use funnel::FunnelLearner;
pub use funnel_job::FunnelJob;
pub use types::{FunnelProfile, PromotionReason, PromotionResult};
