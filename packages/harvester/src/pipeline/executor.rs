//! Fetch executor: discovery plus pagination for claimed tasks.
//!
//! One executor serves every endpoint; per-endpoint differences live in
//! [`EndpointConfig`]. Requests from all in-flight tasks share one
//! [`AdaptiveLimiter`]. Fetched pages go to the writer queue; the executor
//! itself never touches storage.

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tracing::{debug, warn};

use crate::context::RunContext;
use crate::error::{FetchError, FetchResult, PlanningError, Result};
use crate::pipeline::limiter::AdaptiveLimiter;
use crate::pipeline::retry::RetryPolicy;
use crate::pipeline::writer::WriterHandle;
use crate::traits::source::PageSource;
use crate::types::config::{EndpointCatalog, EndpointConfig};
use crate::types::page::{
    Discovery, PageRequest, PageResponse, RawResponse, UpstreamEnvelope, PAGE_PARAM,
    PAGE_SIZE_PARAM,
};
use crate::types::task::Task;

/// How a task's fetch pass ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Pages were requested; reconciliation decides the final status.
    Fetched { pages_ok: usize, pages_failed: usize },
    /// Discovery answered 404: nothing to harvest for this window.
    NoData,
    /// A non-retryable rejection. The task fails without retry.
    Permanent { error: String },
    /// Stopped mid-fetch. The task stays leased until the claim expires.
    Cancelled,
}

enum AttemptError {
    Cancelled,
    Failed(FetchError),
}

enum Discovered {
    Pages(u32),
    Done(TaskOutcome),
}

enum PageFetch {
    Stored,
    Missing,
    Rejected(String),
    Cancelled,
}

/// Build the GET for one page of a task.
pub fn build_request(endpoint: &EndpointConfig, task: &Task, page: u32) -> PageRequest {
    let mut query = vec![
        (PAGE_PARAM.to_string(), page.to_string()),
        (PAGE_SIZE_PARAM.to_string(), endpoint.page_size.to_string()),
        (
            endpoint.start_param.clone(),
            task.data_date.format("%Y%m%d").to_string(),
        ),
        (
            endpoint.end_param.clone(),
            task.window_end.format("%Y%m%d").to_string(),
        ),
    ];
    if let (Some(param), Some(code)) = (&endpoint.category_param, &task.category_code) {
        query.push((param.clone(), code.clone()));
    }

    PageRequest {
        task_id: task.task_id.clone(),
        endpoint: task.endpoint.clone(),
        path: endpoint.path.clone(),
        page_number: page,
        data_date: task.data_date,
        query,
    }
}

pub struct FetchExecutor<S> {
    source: S,
    catalog: Arc<EndpointCatalog>,
    limiter: AdaptiveLimiter,
    retry: RetryPolicy,
}

impl<S: PageSource> FetchExecutor<S> {
    pub fn new(
        source: S,
        catalog: Arc<EndpointCatalog>,
        limiter: AdaptiveLimiter,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            source,
            catalog,
            limiter,
            retry,
        }
    }

    pub fn limiter(&self) -> &AdaptiveLimiter {
        &self.limiter
    }

    /// Run a bounded pool over `tasks`, at most `max_in_flight` at a time.
    pub async fn execute_all(
        &self,
        tasks: Vec<Task>,
        writer: &WriterHandle,
        ctx: &RunContext,
        max_in_flight: usize,
    ) -> Vec<(Task, Result<TaskOutcome>)> {
        stream::iter(tasks)
            .map(|task| async move {
                let outcome = self.execute(&task, writer, ctx).await;
                (task, outcome)
            })
            .buffer_unordered(max_in_flight.max(1))
            .collect()
            .await
    }

    /// Fetch one task: discovery first (unless resuming), then the remaining pages.
    pub async fn execute(
        &self,
        task: &Task,
        writer: &WriterHandle,
        ctx: &RunContext,
    ) -> Result<TaskOutcome> {
        let endpoint = self
            .catalog
            .get(&task.endpoint)
            .ok_or_else(|| PlanningError::UnknownEndpoint(task.endpoint.clone()))?;

        let pages: Vec<u32> = match task.resume_pages() {
            Some(pages) => {
                debug!(task_id = %task.task_id, pages = ?pages, "Resuming missing pages");
                pages
            }
            None => match self.discover(endpoint, task, writer, ctx).await? {
                Discovered::Pages(total) => (2..=total).collect(),
                Discovered::Done(outcome) => return Ok(outcome),
            },
        };

        let results: Vec<Result<PageFetch>> = stream::iter(pages)
            .map(|page| self.fetch_page(endpoint, task, page, writer, ctx))
            .buffer_unordered(self.limiter.max())
            .collect()
            .await;

        // The discovery page was stored unless this is a resume.
        let mut pages_ok = usize::from(task.resume_pages().is_none());
        let mut pages_failed = 0;
        let mut rejected = None;
        let mut cancelled = false;
        for result in results {
            match result? {
                PageFetch::Stored => pages_ok += 1,
                PageFetch::Missing => pages_failed += 1,
                PageFetch::Rejected(error) => rejected = Some(error),
                PageFetch::Cancelled => cancelled = true,
            }
        }

        if cancelled {
            return Ok(TaskOutcome::Cancelled);
        }
        if let Some(error) = rejected {
            return Ok(TaskOutcome::Permanent { error });
        }
        Ok(TaskOutcome::Fetched {
            pages_ok,
            pages_failed,
        })
    }

    async fn discover(
        &self,
        endpoint: &EndpointConfig,
        task: &Task,
        writer: &WriterHandle,
        ctx: &RunContext,
    ) -> Result<Discovered> {
        let request = build_request(endpoint, task, 1);

        let raw = match self.fetch_with_retry(&request, ctx).await {
            Ok(raw) => raw,
            Err(AttemptError::Cancelled) => return Ok(Discovered::Done(TaskOutcome::Cancelled)),
            Err(AttemptError::Failed(error)) => {
                ctx.record_page_failure();
                writer
                    .enqueue(PageResponse::failure(
                        &request,
                        error.http_status(),
                        error.to_string(),
                    ))
                    .await?;
                let error = error.escalate();
                let outcome = match error {
                    FetchError::Permanent { .. } => TaskOutcome::Permanent {
                        error: error.to_string(),
                    },
                    _ => TaskOutcome::Fetched {
                        pages_ok: 0,
                        pages_failed: 1,
                    },
                };
                return Ok(Discovered::Done(outcome));
            }
        };

        if raw.status == 404 {
            debug!(task_id = %task.task_id, "Discovery returned 404, no data");
            writer.enqueue(PageResponse::no_data(&request, 404)).await?;
            return Ok(Discovered::Done(TaskOutcome::NoData));
        }

        let checked = UpstreamEnvelope::parse(&raw.body)
            .and_then(|envelope| Ok((envelope.checked_pages(endpoint.max_pages)?, envelope)));
        let (total_pages, envelope) = match checked {
            Ok(checked) => checked,
            Err(error) => {
                warn!(task_id = %task.task_id, error = %error, "Malformed discovery response");
                ctx.record_page_failure();
                writer
                    .enqueue(PageResponse::failure(&request, Some(raw.status), error.to_string()))
                    .await?;
                return Ok(Discovered::Done(TaskOutcome::Fetched {
                    pages_ok: 0,
                    pages_failed: 1,
                }));
            }
        };

        let discovery = Discovery {
            total_pages,
            total_records: envelope.total_records,
        };
        debug!(
            task_id = %task.task_id,
            total_pages = discovery.total_pages,
            total_records = discovery.total_records,
            "Discovery complete"
        );

        ctx.record_page();
        let record_count = envelope.data.len() as u32;
        writer
            .enqueue(
                PageResponse::success(&request, raw.status, raw.body, record_count)
                    .with_discovery(discovery),
            )
            .await?;
        Ok(Discovered::Pages(discovery.total_pages))
    }

    async fn fetch_page(
        &self,
        endpoint: &EndpointConfig,
        task: &Task,
        page: u32,
        writer: &WriterHandle,
        ctx: &RunContext,
    ) -> Result<PageFetch> {
        let request = build_request(endpoint, task, page);

        let raw = match self.fetch_with_retry(&request, ctx).await {
            Ok(raw) => raw,
            Err(AttemptError::Cancelled) => return Ok(PageFetch::Cancelled),
            Err(AttemptError::Failed(error)) => {
                ctx.record_page_failure();
                warn!(task_id = %task.task_id, page, error = %error, "Page fetch failed");
                writer
                    .enqueue(PageResponse::failure(
                        &request,
                        error.http_status(),
                        error.to_string(),
                    ))
                    .await?;
                // Exhausted 5xx is permanent; exhausted transport or 429 leaves the page missing.
                let error = error.escalate();
                return Ok(match error {
                    FetchError::Permanent { .. } => PageFetch::Rejected(error.to_string()),
                    _ => PageFetch::Missing,
                });
            }
        };

        if raw.status == 404 {
            ctx.record_page_failure();
            writer
                .enqueue(PageResponse::failure(&request, Some(404), "page not found"))
                .await?;
            return Ok(PageFetch::Missing);
        }

        match UpstreamEnvelope::parse(&raw.body) {
            Ok(envelope) => {
                ctx.record_page();
                let record_count = envelope.data.len() as u32;
                writer
                    .enqueue(PageResponse::success(&request, raw.status, raw.body, record_count))
                    .await?;
                Ok(PageFetch::Stored)
            }
            Err(error) => {
                ctx.record_page_failure();
                writer
                    .enqueue(PageResponse::failure(&request, Some(raw.status), error.to_string()))
                    .await?;
                Ok(PageFetch::Missing)
            }
        }
    }

    /// Retry transient failures with backoff until success, exhaustion or cancellation.
    async fn fetch_with_retry(
        &self,
        request: &PageRequest,
        ctx: &RunContext,
    ) -> std::result::Result<RawResponse, AttemptError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = tokio::select! {
                biased;
                _ = ctx.token().cancelled() => return Err(AttemptError::Cancelled),
                result = self.attempt(request, ctx) => result,
            };

            let error = match result {
                Ok(raw) => return Ok(raw),
                Err(error) => error,
            };

            let retry_after = match &error {
                FetchError::RateLimited { retry_after } => {
                    ctx.record_rate_limited();
                    self.limiter.on_rate_limited();
                    *retry_after
                }
                _ => None,
            };

            if !self.retry.should_retry(attempt, &error) {
                return Err(AttemptError::Failed(error));
            }

            ctx.record_retry();
            let delay = self.retry.delay_for(attempt, retry_after);
            warn!(
                task_id = %request.task_id,
                page = request.page_number,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Retrying request"
            );

            tokio::select! {
                biased;
                _ = ctx.token().cancelled() => return Err(AttemptError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// One exchange under a limiter permit. 404 is passed through to the caller.
    async fn attempt(&self, request: &PageRequest, ctx: &RunContext) -> FetchResult<RawResponse> {
        let _permit = self.limiter.acquire().await?;
        ctx.record_request();
        let raw = self.source.fetch(request).await?;
        if raw.status == 404 {
            return Ok(raw);
        }
        raw.classify()?;
        self.limiter.on_success();
        Ok(raw)
    }
}
