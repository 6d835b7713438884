//! The single content writer.
//!
//! Every persistence mutation of a fetch pass funnels through one task that
//! drains a bounded queue and commits in batches. Producers suspend when the
//! queue is full.

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::error::{HarvestError, Result};
use crate::stores::{BatchOutcome, SqliteStore};
use crate::types::page::PageResponse;

/// Messages accepted by the writer task.
pub enum WriterCommand {
    Page(Box<PageResponse>),
    /// Commit everything queued before this and report failures since the last flush.
    Flush(oneshot::Sender<FlushReport>),
}

#[derive(Debug, Clone, Default)]
pub struct FlushReport {
    pub failed_batches: usize,
    pub last_error: Option<String>,
}

/// Totals over the writer's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterStats {
    pub records: usize,
    pub pages: usize,
    pub blobs_created: usize,
    pub blobs_reused: usize,
    /// Exchanges recorded without a stored body.
    pub failures: usize,
    pub batches: usize,
    pub failed_batches: usize,
}

impl WriterStats {
    fn absorb(&mut self, outcome: BatchOutcome) {
        self.records += outcome.records;
        self.pages += outcome.pages;
        self.blobs_created += outcome.blobs_created;
        self.blobs_reused += outcome.blobs_reused;
        self.failures += outcome.failures;
        self.batches += 1;
    }
}

/// Producer side of the writer queue.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<WriterCommand>,
}

impl WriterHandle {
    /// Queue a fetched page, waiting while the queue is full.
    pub async fn enqueue(&self, response: PageResponse) -> Result<()> {
        self.tx
            .send(WriterCommand::Page(Box::new(response)))
            .await
            .map_err(|_| HarvestError::WriterClosed)
    }

    /// Wait until everything queued so far is committed.
    ///
    /// Fails with `Persistence` if any batch since the previous flush could not be written.
    pub async fn flush(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(WriterCommand::Flush(reply))
            .await
            .map_err(|_| HarvestError::WriterClosed)?;
        let report = rx.await.map_err(|_| HarvestError::WriterClosed)?;

        match report.last_error {
            Some(last_error) if report.failed_batches > 0 => Err(HarvestError::Persistence {
                failed_batches: report.failed_batches,
                last_error,
            }),
            _ => Ok(()),
        }
    }
}

pub struct ContentWriter {
    store: SqliteStore,
    batch_size: usize,
    buffer: Vec<PageResponse>,
    stats: WriterStats,
    pending_failures: FlushReport,
}

impl ContentWriter {
    pub fn new(store: SqliteStore, batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            store,
            batch_size,
            buffer: Vec::with_capacity(batch_size),
            stats: WriterStats::default(),
            pending_failures: FlushReport::default(),
        }
    }

    /// Start the writer task. It ends, returning its stats, once every handle is dropped.
    pub fn spawn(self, capacity: usize) -> (WriterHandle, JoinHandle<WriterStats>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let join = tokio::spawn(self.run(rx));
        (WriterHandle { tx }, join)
    }

    async fn run(mut self, mut rx: mpsc::Receiver<WriterCommand>) -> WriterStats {
        while let Some(command) = rx.recv().await {
            match command {
                WriterCommand::Page(response) => {
                    self.buffer.push(*response);
                    if self.buffer.len() >= self.batch_size {
                        self.commit().await;
                    }
                }
                WriterCommand::Flush(reply) => {
                    self.commit().await;
                    let report = std::mem::take(&mut self.pending_failures);
                    // The requester may have given up waiting.
                    let _ = reply.send(report);
                }
            }
        }

        self.commit().await;
        info!(
            records = self.stats.records,
            blobs_created = self.stats.blobs_created,
            blobs_reused = self.stats.blobs_reused,
            failed_batches = self.stats.failed_batches,
            "Content writer drained"
        );
        self.stats
    }

    async fn commit(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut self.buffer);
        match self.store.write_batch(&batch).await {
            Ok(outcome) => {
                debug!(records = outcome.records, pages = outcome.pages, "Committed batch");
                self.stats.absorb(outcome);
            }
            Err(e) => {
                // The batch is dropped; its tasks stay leased and are recovered on expiry.
                error!(error = %e, size = batch.len(), "Failed to commit batch");
                self.stats.failed_batches += 1;
                self.pending_failures.failed_batches += 1;
                self.pending_failures.last_error = Some(e.to_string());
            }
        }
    }
}
