//! Projection tooling: rebuilds, live consumption and lag tracking.
//!
//! All projections are:
//! - **Rebuildable**: reset and refold from the event stream at any time
//! - **Idempotent**: live delivery goes through an inbox

pub mod consistency;
pub mod rebuild;
pub mod runner;

pub use consistency::{
    ConsistencyMonitor, ConsistencyReport, DEFAULT_LAG_THRESHOLD_MS, DEFAULT_WINDOW,
    ProjectionConsistencyStats,
};
pub use rebuild::{ProjectionRebuildManager, RebuildError, RebuildReport};
pub use runner::{ProjectionRunner, RunnerError};
