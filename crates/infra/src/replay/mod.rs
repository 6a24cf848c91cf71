//! Event replay: read-only folds of a stream with filtering and progress.

pub mod monitor;
pub mod replayer;

pub use monitor::ReplayMonitor;
pub use replayer::{
    EventReplayer, ProjectionHandler, ReplayError, ReplayHandler, ReplayOptions, ReplayProgress,
    ReplayStats,
};
