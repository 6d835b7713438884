//! The harvest cycle.
//!
//! ```text
//! stale-plan check -> find_gaps -> plan
//! loop {
//!     release_expired -> claim_pending -> Claimed->Executing
//!     execute (worker pool) -> flush writer
//!     apply outcomes -> release claims -> re-arm partial tasks
//! }
//! refresh ledger -> summary
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::context::{CounterSnapshot, RunContext};
use crate::error::{HarvestError, PlanningError, Result};
use crate::pipeline::claimer::TaskClaimer;
use crate::pipeline::executor::{FetchExecutor, TaskOutcome};
use crate::pipeline::gaps::GapDetector;
use crate::pipeline::limiter::AdaptiveLimiter;
use crate::pipeline::planner::{expand_gap, TaskPlanner};
use crate::pipeline::reconciler::{missing_pages, Reconciler};
use crate::pipeline::writer::{ContentWriter, WriterHandle, WriterStats};
use crate::stores::{Holder, SqliteStore};
use crate::traits::ledger::CompletionLedger;
use crate::traits::source::PageSource;
use crate::types::claim::ClaimStatus;
use crate::types::config::{EndpointCatalog, HarvestConfig};
use crate::types::gap::{DateRange, Gap, MonthBucket};
use crate::types::task::{Task, TaskStatus};

/// What a run did and where the range stands afterwards.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub fingerprint: String,
    pub range: DateRange,
    pub gaps: usize,
    pub tasks_planned: usize,
    pub tasks_created: usize,
    /// Claim/fetch passes executed.
    pub passes: usize,
    /// Task counts by status within the range.
    pub counts: BTreeMap<TaskStatus, u64>,
    pub writer: WriterStats,
    pub requests: CounterSnapshot,
    /// Passes whose writes failed; their tasks were left to lease expiry.
    pub persistence_failures: usize,
    pub cancelled: bool,
}

impl RunSummary {
    pub fn count(&self, status: TaskStatus) -> u64 {
        self.counts.get(&status).copied().unwrap_or(0)
    }

    /// 0 on full success, 1 if any task failed or results could not be
    /// persisted, 130 if the run was interrupted.
    pub fn exit_code(&self) -> i32 {
        if self.count(TaskStatus::Failed) > 0 || self.persistence_failures > 0 {
            1
        } else if self.cancelled {
            130
        } else {
            0
        }
    }
}

/// Task counts, optionally restricted to a range.
#[derive(Debug, Clone)]
pub struct StatusReport {
    pub range: Option<DateRange>,
    pub counts: BTreeMap<TaskStatus, u64>,
    pub open_plans: Vec<String>,
}

impl StatusReport {
    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }
}

/// Bookkeeping carried across claim passes.
#[derive(Default)]
struct LoopProgress {
    passes: usize,
    persistence_failures: usize,
    touched: BTreeSet<(String, MonthBucket)>,
}

/// Orchestrates planning, claiming, fetching, persistence and reconciliation.
pub struct Harvester<S> {
    store: SqliteStore,
    catalog: Arc<EndpointCatalog>,
    config: HarvestConfig,
    executor: FetchExecutor<S>,
}

impl<S: PageSource> Harvester<S> {
    pub fn new(store: SqliteStore, catalog: EndpointCatalog, config: HarvestConfig, source: S) -> Self {
        let catalog = Arc::new(catalog);
        let executor = FetchExecutor::new(
            source,
            catalog.clone(),
            AdaptiveLimiter::from_config(&config),
            config.retry.clone(),
        );
        Self {
            store,
            catalog,
            config,
            executor,
        }
    }

    pub fn store(&self) -> &SqliteStore {
        &self.store
    }

    fn planner(&self) -> TaskPlanner<'_> {
        TaskPlanner::new(&self.store, &self.catalog, &self.config.environment)
    }

    /// Resolve the run range from optional bounds, honouring backfill mode.
    pub fn resolve_range(
        &self,
        start: Option<chrono::NaiveDate>,
        end: Option<chrono::NaiveDate>,
    ) -> std::result::Result<DateRange, PlanningError> {
        self.planner().resolve_range(start, end, self.config.backfill)
    }

    /// Harvest `range` until no claimable work remains or the run is cancelled.
    pub async fn run(&self, range: DateRange, ctx: &RunContext) -> Result<RunSummary> {
        let planner = self.planner();
        let fingerprint = planner.fingerprint(&range);
        info!(
            range = %range,
            fingerprint = %fingerprint,
            worker_id = %ctx.worker_id(),
            "Harvest starting"
        );

        let stale = self.stale_plans(&planner, &fingerprint).await?;

        let gaps = GapDetector::new(self.store.clone())
            .find_gaps(&self.catalog.names(), &range)
            .await;
        let plan = planner.plan(&gaps, &range).await?;

        for stale_fp in &stale {
            planner.adopt(stale_fp, &plan.fingerprint).await?;
        }

        let claimer = TaskClaimer::new(
            self.store.clone(),
            ctx.worker_id(),
            self.config.lease_duration,
        );
        let reconciler = Reconciler::new(self.store.clone());

        // Leftovers of an earlier crash: judged now, re-armed below.
        for task in reconciler.reconcile_open().await? {
            if task.status == TaskStatus::Partial {
                self.rearm(&claimer, task).await?;
            }
        }

        let (writer, writer_join) =
            ContentWriter::new(self.store.clone(), self.config.writer_batch)
                .spawn(self.config.writer_capacity);

        let mut progress = LoopProgress::default();
        let loop_result = self
            .claim_loop(ctx, &claimer, &reconciler, &writer, &mut progress)
            .await;

        drop(writer);
        let writer_stats = writer_join.await.unwrap_or_else(|e| {
            error!(error = %e, "Content writer task panicked");
            WriterStats::default()
        });
        loop_result?;

        self.refresh_ledger(&progress.touched).await?;

        let summary = RunSummary {
            fingerprint: plan.fingerprint,
            range,
            gaps: gaps.len(),
            tasks_planned: plan.planned,
            tasks_created: plan.created,
            passes: progress.passes,
            counts: self.store.status_counts(Some(&range)).await?,
            writer: writer_stats,
            requests: ctx.snapshot(),
            persistence_failures: progress.persistence_failures,
            cancelled: ctx.is_cancelled(),
        };
        info!(
            passes = summary.passes,
            completed = summary.count(TaskStatus::Completed),
            partial = summary.count(TaskStatus::Partial),
            failed = summary.count(TaskStatus::Failed),
            persistence_failures = summary.persistence_failures,
            requests = summary.requests.requests,
            cancelled = summary.cancelled,
            "Harvest finished"
        );
        Ok(summary)
    }

    async fn claim_loop(
        &self,
        ctx: &RunContext,
        claimer: &TaskClaimer,
        reconciler: &Reconciler,
        writer: &WriterHandle,
        progress: &mut LoopProgress,
    ) -> Result<()> {
        while !ctx.is_cancelled() {
            claimer.release_expired().await?;

            let claimed = claimer.claim_pending(self.config.claim_batch).await?;
            if claimed.is_empty() {
                break;
            }
            progress.passes += 1;

            let mut executing = Vec::with_capacity(claimed.len());
            let mut nothing_missing = Vec::new();
            for mut task in claimed {
                self.refresh_missing(&mut task).await?;
                match claimer.begin_execution(&task).await {
                    Ok(task) if task.total_pages.is_some() && task.missing_pages.is_empty() => {
                        nothing_missing.push(task)
                    }
                    Ok(task) => executing.push(task),
                    Err(
                        HarvestError::ClaimConflict { task_id, .. }
                        | HarvestError::LeaseLost { task_id, .. },
                    ) => {
                        warn!(task_id = %task_id, "Lost task before execution");
                    }
                    Err(e) => return Err(e),
                }
            }

            let mut results = self
                .executor
                .execute_all(executing, writer, ctx, self.config.max_tasks_in_flight)
                .await;
            results.extend(nothing_missing.into_iter().map(|task| {
                (
                    task,
                    Ok(TaskOutcome::Fetched {
                        pages_ok: 0,
                        pages_failed: 0,
                    }),
                )
            }));

            if let Err(e) = writer.flush().await {
                match e {
                    HarvestError::Persistence { .. } => {
                        // Outcomes are unknowable; leases expire and the tasks are retried.
                        error!(error = %e, "Persistence failed, leaving tasks to lease expiry");
                        progress.persistence_failures += 1;
                        continue;
                    }
                    other => return Err(other),
                }
            }

            for (task, result) in results {
                if let Some(done) = self.apply_outcome(claimer, reconciler, task, result).await? {
                    if done.status == TaskStatus::Completed {
                        progress
                            .touched
                            .insert((done.endpoint.clone(), MonthBucket::of(done.data_date)));
                    }
                }
            }
        }
        Ok(())
    }

    /// Turn one fetch result into a status change. Returns the task if it was settled.
    async fn apply_outcome(
        &self,
        claimer: &TaskClaimer,
        reconciler: &Reconciler,
        task: Task,
        result: Result<TaskOutcome>,
    ) -> Result<Option<Task>> {
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(HarvestError::WriterClosed) => return Err(HarvestError::WriterClosed),
            Err(e) => TaskOutcome::Permanent {
                error: e.to_string(),
            },
        };

        let settled = match self.settle(claimer, reconciler, &task, outcome).await {
            Ok(Some(settled)) => settled,
            Ok(None) => return Ok(None),
            Err(
                e @ (HarvestError::ClaimConflict { .. } | HarvestError::LeaseLost { .. }),
            ) => {
                // Another worker owns the task now; its outcome wins.
                warn!(task_id = %task.task_id, error = %e, "Dropping outcome for lost task");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        claimer.release(&settled.task_id, ClaimStatus::Released).await?;

        if settled.status == TaskStatus::Partial {
            return Ok(Some(self.rearm(claimer, settled).await?));
        }
        Ok(Some(settled))
    }

    /// Write the terminal or partial status for one outcome under this worker's lease.
    async fn settle(
        &self,
        claimer: &TaskClaimer,
        reconciler: &Reconciler,
        task: &Task,
        outcome: TaskOutcome,
    ) -> Result<Option<Task>> {
        let settled = match outcome {
            TaskOutcome::Cancelled => return Ok(None),
            TaskOutcome::NoData => {
                let mut done = task.clone();
                done.status = TaskStatus::Completed;
                done.total_pages = Some(0);
                done.total_records = Some(0);
                done.missing_pages.clear();
                done.last_error = None;
                claimer.commit(&done, task.status).await?;
                done
            }
            TaskOutcome::Permanent { error } => {
                error!(task_id = %task.task_id, error = %error, "Task failed permanently");
                // Reload so totals learned during this fetch are kept.
                let mut failed = self.store.require_task(&task.task_id).await?;
                failed.status = TaskStatus::Failed;
                failed.last_error = Some(error);
                claimer.commit(&failed, task.status).await?;
                failed
            }
            TaskOutcome::Fetched { .. } => {
                reconciler
                    .reconcile(&task.task_id, Holder::Worker(claimer.worker_id()))
                    .await?
            }
        };
        Ok(Some(settled))
    }

    /// Recompute the missing set of a task whose totals are already known,
    /// so a task recovered from an expired lease resumes instead of starting over.
    async fn refresh_missing(&self, task: &mut Task) -> Result<()> {
        if task.total_pages.is_some() {
            let persisted = self.store.persisted_pages(&task.task_id).await?;
            task.missing_pages = missing_pages(task.total_pages, &persisted);
        }
        Ok(())
    }

    /// Partial -> Pending for another cycle, or Failed once cycles run out.
    async fn rearm(&self, claimer: &TaskClaimer, task: Task) -> Result<Task> {
        let mut next = task.clone();
        if task.attempts < self.config.max_task_cycles {
            next.status = TaskStatus::Pending;
        } else {
            next.status = TaskStatus::Failed;
            next.last_error = Some(format!(
                "pages still missing after {} cycles: {:?}",
                task.attempts, task.missing_pages
            ));
            warn!(task_id = %task.task_id, missing = ?task.missing_pages, "Giving up on partial task");
        }
        // The claim is already released; a Partial task cannot be claimed meanwhile.
        claimer.commit_unleased(&next, task.status).await?;
        Ok(next)
    }

    /// Collect stale open plans. Aborts unless stale work may be adopted.
    async fn stale_plans(&self, planner: &TaskPlanner<'_>, current: &str) -> Result<Vec<String>> {
        let mut stale = Vec::new();
        for fingerprint in self.store.open_fingerprints().await? {
            if fingerprint == current || planner.validate_fingerprint(&fingerprint).await? {
                continue;
            }
            if !self.config.replan_stale {
                return Err(HarvestError::FingerprintMismatch {
                    persisted: fingerprint,
                    current: current.to_string(),
                });
            }
            warn!(stale = %fingerprint, "Adopting open tasks from a stale plan");
            stale.push(fingerprint);
        }
        Ok(stale)
    }

    /// Mark buckets complete once every task the full month expands to is Completed.
    async fn refresh_ledger(&self, touched: &BTreeSet<(String, MonthBucket)>) -> Result<()> {
        for (endpoint_name, bucket) in touched {
            let Some(endpoint) = self.catalog.get(endpoint_name) else {
                continue;
            };
            let month = bucket.range();
            let expected = expand_gap(endpoint, &Gap::new(endpoint_name.clone(), month), "");
            let statuses = self.store.task_statuses(endpoint_name, &month).await?;

            let complete = expected
                .iter()
                .all(|t| statuses.get(&t.task_id) == Some(&TaskStatus::Completed));
            if complete {
                self.store.mark_complete(endpoint_name, *bucket).await?;
                info!(endpoint = %endpoint_name, bucket = %bucket, "Bucket complete");
            }
        }
        Ok(())
    }

    pub async fn status(&self, range: Option<&DateRange>) -> Result<StatusReport> {
        Ok(StatusReport {
            range: range.copied(),
            counts: self.store.status_counts(range).await?,
            open_plans: self.store.open_fingerprints().await?,
        })
    }

    /// Force re-extraction of tasks in `range`. Leased tasks are skipped.
    pub async fn reset(&self, endpoint: Option<&str>, range: &DateRange) -> Result<usize> {
        if let Some(name) = endpoint {
            if self.catalog.get(name).is_none() {
                return Err(PlanningError::UnknownEndpoint(name.to_string()).into());
            }
        }

        let reset = self.store.reset_tasks(endpoint, range).await?;
        let buckets: BTreeSet<(String, MonthBucket)> = reset
            .iter()
            .map(|t| (t.endpoint.clone(), MonthBucket::of(t.data_date)))
            .collect();
        for (endpoint, bucket) in &buckets {
            self.store.invalidate(endpoint, *bucket).await?;
        }

        info!(count = reset.len(), range = %range, "Reset tasks for re-extraction");
        Ok(reset.len())
    }
}
