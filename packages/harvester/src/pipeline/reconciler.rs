//! Page-level reconciliation of expected vs. persisted pages.

use std::collections::BTreeSet;

use tracing::debug;

use crate::error::{HarvestError, Result};
use crate::stores::{Holder, SqliteStore};
use crate::types::task::{validate_transition, Task, TaskId, TaskStatus};

/// `{1..=total_pages} - persisted`, ascending. Unknown totals mean discovery is missing.
pub fn missing_pages(total_pages: Option<u32>, persisted: &BTreeSet<u32>) -> Vec<u32> {
    match total_pages {
        Some(total) => (1..=total.max(1))
            .filter(|page| !persisted.contains(page))
            .collect(),
        None if persisted.contains(&1) => Vec::new(),
        None => vec![1],
    }
}

pub struct Reconciler {
    store: SqliteStore,
}

impl Reconciler {
    pub fn new(store: SqliteStore) -> Self {
        Self { store }
    }

    /// Recompute one task's missing pages and move it to Completed or Partial.
    ///
    /// Tasks outside {Executing, Partial} are returned unchanged. The write
    /// lands only while `holder` describes the task's lease.
    pub async fn reconcile(&self, task_id: &TaskId, holder: Holder<'_>) -> Result<Task> {
        let task = self.store.require_task(task_id).await?;
        if !matches!(task.status, TaskStatus::Executing | TaskStatus::Partial) {
            return Ok(task);
        }

        let persisted = self.store.persisted_pages(task_id).await?;
        let missing = missing_pages(task.total_pages, &persisted);

        let from = task.status;
        let mut next = task.clone();
        next.missing_pages = missing;
        next.status = if next.missing_pages.is_empty() {
            TaskStatus::Completed
        } else {
            TaskStatus::Partial
        };
        if next.status == TaskStatus::Completed {
            next.last_error = None;
        }

        // Partial -> Partial only refreshes the missing set.
        if from != next.status {
            validate_transition(task_id, from, next.status)?;
        }
        if !self.store.save_task(&next, from, holder).await? {
            let current = self.store.require_task(task_id).await?;
            return Err(match holder {
                Holder::Worker(worker_id) if current.status == from => HarvestError::LeaseLost {
                    task_id: task_id.to_string(),
                    worker_id: worker_id.to_string(),
                },
                _ => HarvestError::ClaimConflict {
                    task_id: task_id.to_string(),
                    expected: from,
                },
            });
        }

        debug!(
            task_id = %task_id,
            status = %next.status,
            missing = next.missing_pages.len(),
            "Reconciled task"
        );
        Ok(next)
    }

    /// Reconcile every Executing or Partial task that no worker currently holds.
    pub async fn reconcile_open(&self) -> Result<Vec<Task>> {
        let held = self.store.actively_claimed().await?;
        let mut candidates = self.store.tasks_with_status(TaskStatus::Executing).await?;
        candidates.extend(self.store.tasks_with_status(TaskStatus::Partial).await?);

        let mut reconciled = Vec::new();
        for task in candidates {
            if held.contains(&task.task_id) {
                continue;
            }
            reconciled.push(self.reconcile(&task.task_id, Holder::Nobody).await?);
        }
        Ok(reconciled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_pages() {
        let persisted = BTreeSet::from([1, 2, 4]);
        assert_eq!(missing_pages(Some(5), &persisted), vec![3, 5]);
        assert_eq!(missing_pages(Some(5), &BTreeSet::from([1, 2, 3, 4, 5])), Vec::<u32>::new());
        assert_eq!(missing_pages(None, &BTreeSet::new()), vec![1]);
        assert_eq!(missing_pages(Some(0), &BTreeSet::new()), vec![1]);
        assert_eq!(missing_pages(Some(0), &BTreeSet::from([1])), Vec::<u32>::new());
    }
}
