//! Periodic and on-demand clustering runs.

pub mod engine;
pub mod history;

// Re-export common types
pub use self::engine::{run_scheduler_loop, RunTrigger};
pub use self::history::{RunRecord, RunStatus};
