//! Ingest governance: upload byte budgets, billable session quotas and replay promotion,
//! behind one service object.

pub mod config;
pub mod service;
pub mod telemetry;

pub use service::{Collaborators, Governor};
