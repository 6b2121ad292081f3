pub mod clock;
pub mod metrics_defs;
pub mod tasks;
