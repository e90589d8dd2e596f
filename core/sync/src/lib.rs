//! bwsync sync core
//!
//! Scheduling and orchestration of vault export runs:
//! - Cron schedule evaluation with overrun handling
//! - One-shot export runs over a vault client session
//! - Retention of timestamped run directories
//! - The long-running service loop

pub mod engine;
pub mod retention;
pub mod schedule;
pub mod scheduler;

// Re-export main types
pub use engine::{run_directory_name, PruneStatus, SyncEngine, SyncOutcome, RUN_DIRECTORY_FORMAT};
pub use retention::{prune, PruneReport};
pub use schedule::{next_delay, sample, CronSchedule, ScheduleDriver, Tick, MIN_RUN_INTERVAL};
pub use scheduler::ScheduleLoop;
