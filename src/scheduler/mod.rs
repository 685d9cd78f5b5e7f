//! The priority-preemptive scheduler.
//!
//! `resources` and `planner` are pure functions over plain records; the
//! worker wires them to the store, queue, and lock service. The mover
//! promotes delayed jobs and the sweeper re-enqueues deployments lost in
//! the commit-then-crash gap.

pub mod mover;
pub mod planner;
pub mod resources;
pub mod retry;
pub mod sweeper;
pub mod worker;

pub use mover::DelayedJobMover;
pub use planner::{plan, Decision};
pub use retry::RetryPolicy;
pub use sweeper::{RecoverySweeper, RecoverySweeperConfig};
pub use worker::{CycleOutcome, SchedulerWorker, SchedulerWorkerConfig, WorkerError};
