//! The extraction engine.
//!
//! - [`gaps`] - Gap detection against the completion ledger
//! - [`planner`] - Gap expansion into fingerprinted tasks
//! - [`claimer`] - Atomic leasing and the status state machine
//! - [`executor`] - Discovery and pagination under a shared limiter
//! - [`writer`] - The single, batching content writer
//! - [`reconciler`] - Expected vs. persisted pages
//! - [`harvest`] - The full cycle

pub mod claimer;
pub mod executor;
pub mod gaps;
pub mod harvest;
pub mod limiter;
pub mod planner;
pub mod reconciler;
pub mod retry;
pub mod writer;

pub use claimer::TaskClaimer;
pub use executor::{FetchExecutor, TaskOutcome};
pub use gaps::GapDetector;
pub use harvest::{Harvester, RunSummary, StatusReport};
pub use limiter::AdaptiveLimiter;
pub use planner::{PlanOutcome, TaskPlanner};
pub use reconciler::Reconciler;
pub use retry::RetryPolicy;
pub use writer::{ContentWriter, WriterHandle, WriterStats};
