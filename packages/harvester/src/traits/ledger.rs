//! Completion ledger: which (endpoint, month) buckets are fully harvested.

use std::collections::HashSet;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::gap::{DateRange, MonthBucket};

#[async_trait]
pub trait CompletionLedger: Send + Sync {
    /// Buckets of `endpoint` overlapping `range` recorded as complete.
    async fn completed_buckets(&self, endpoint: &str, range: &DateRange)
        -> Result<HashSet<MonthBucket>>;

    /// Record a bucket as complete. Idempotent.
    async fn mark_complete(&self, endpoint: &str, bucket: MonthBucket) -> Result<()>;

    /// Forget a bucket so it is detected as a gap again.
    async fn invalidate(&self, endpoint: &str, bucket: MonthBucket) -> Result<()>;
}
