//! Resumable, deduplicated mirror of a paginated, date-partitioned REST API.
//!
//! Work is split into tasks (endpoint, date window, optional category code).
//! Tasks are planned from gaps in a completion ledger, leased atomically to
//! workers, fetched page by page under a shared concurrency limit, persisted
//! through a single writer into content-addressed storage, and reconciled at
//! page granularity so a crash or a flaky page never costs more than the
//! pages that are actually missing.
//!
//! # Usage
//!
//! ```rust,ignore
//! use harvester::{Harvester, HarvestConfig, HttpPageSource, RunContext, SqliteStore};
//!
//! let config = HarvestConfig::from_env()?;
//! let store = SqliteStore::connect(&config.database_url).await?;
//! let source = HttpPageSource::from_config(&config)?;
//! let harvester = Harvester::new(store, catalog, config, source);
//!
//! let range = harvester.resolve_range(Some(start), Some(end))?;
//! let summary = harvester.run(range, &RunContext::new("worker-1")).await?;
//! std::process::exit(summary.exit_code());
//! ```
//!
//! # Modules
//!
//! - [`traits`] - Seams for the upstream API and the completion ledger
//! - [`types`] - Tasks, claims, pages, content and configuration
//! - [`pipeline`] - Planner, claimer, executor, writer, reconciler, harvester
//! - [`stores`] - SQLite storage
//! - [`sources`] - HTTP page source
//! - [`testing`] - Mock implementations for testing

pub mod context;
pub mod error;
pub mod pipeline;
pub mod sources;
pub mod stores;
pub mod testing;
pub mod traits;
pub mod types;

// Re-export core types at crate root
pub use context::{CounterSnapshot, RunContext};
pub use error::{FetchError, HarvestError, PlanningError};
pub use pipeline::{
    AdaptiveLimiter, ContentWriter, FetchExecutor, GapDetector, Harvester, Reconciler,
    RetryPolicy, RunSummary, StatusReport, TaskClaimer, TaskOutcome, TaskPlanner, WriterHandle,
    WriterStats,
};
pub use sources::HttpPageSource;
pub use stores::{Holder, SqliteStore};
pub use traits::{ledger::CompletionLedger, source::PageSource};
pub use types::{
    claim::{Claim, ClaimStatus},
    config::{EndpointCatalog, EndpointConfig, HarvestConfig, TaskWindow},
    content::{content_hash, ContentBlob, PageResult, RequestRecord},
    gap::{DateRange, Gap, MonthBucket},
    page::{Discovery, PageRequest, PageResponse, RawResponse, UpstreamEnvelope},
    plan::Plan,
    task::{Task, TaskId, TaskStatus},
};
