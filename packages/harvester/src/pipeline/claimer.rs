//! Task claiming and the guarded status state machine.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::error::{HarvestError, Result};
use crate::stores::{Holder, SqliteStore};
use crate::types::claim::ClaimStatus;
use crate::types::task::{validate_transition, Task, TaskId, TaskStatus};

/// Leases tasks to one worker and applies validated status transitions.
#[derive(Clone)]
pub struct TaskClaimer {
    store: SqliteStore,
    worker_id: String,
    lease_duration: Duration,
}

impl TaskClaimer {
    pub fn new(store: SqliteStore, worker_id: impl Into<String>, lease_duration: Duration) -> Self {
        Self {
            store,
            worker_id: worker_id.into(),
            lease_duration,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Atomically lease up to `limit` pending tasks for the configured lease duration.
    pub async fn claim_pending(&self, limit: usize) -> Result<Vec<Task>> {
        self.claim_pending_for(limit, self.lease_duration).await
    }

    pub async fn claim_pending_for(&self, limit: usize, lease: Duration) -> Result<Vec<Task>> {
        let tasks = self
            .store
            .claim_pending(&self.worker_id, limit, lease, Utc::now())
            .await?;
        if !tasks.is_empty() {
            debug!(
                worker_id = %self.worker_id,
                count = tasks.len(),
                lease_secs = lease.as_secs(),
                "Claimed tasks"
            );
        }
        Ok(tasks)
    }

    /// Validate and apply a transition from the task's current status.
    ///
    /// Raises `InvalidTransition` without touching the task when the table
    /// forbids the move, `ClaimConflict` when the status changed between the
    /// read and the write, and `LeaseLost` when this worker no longer holds
    /// the task.
    pub async fn update_status(&self, task_id: &TaskId, next: TaskStatus) -> Result<Task> {
        let mut task = self.store.require_task(task_id).await?;
        let from = task.status;
        validate_transition(task_id, from, next)?;

        if !self
            .store
            .compare_and_set_status(task_id, from, next, Holder::Worker(&self.worker_id))
            .await?
        {
            return Err(self.write_rejected(task_id, from).await?);
        }
        task.status = next;
        Ok(task)
    }

    /// Claimed -> Executing, counting one more fetch cycle.
    pub async fn begin_execution(&self, task: &Task) -> Result<Task> {
        let mut next = task.clone();
        next.status = TaskStatus::Executing;
        next.attempts += 1;
        self.commit(&next, task.status).await?;
        Ok(next)
    }

    /// Persist `task` (status and fields) as a transition from `from`.
    ///
    /// Lands only while this worker holds the task's active claim.
    pub async fn commit(&self, task: &Task, from: TaskStatus) -> Result<()> {
        validate_transition(&task.task_id, from, task.status)?;
        if !self
            .store
            .save_task(task, from, Holder::Worker(&self.worker_id))
            .await?
        {
            return Err(self.write_rejected(&task.task_id, from).await?);
        }
        Ok(())
    }

    /// Persist a transition on a task nobody holds, such as re-arming a
    /// Partial task after its claim was released.
    pub async fn commit_unleased(&self, task: &Task, from: TaskStatus) -> Result<()> {
        validate_transition(&task.task_id, from, task.status)?;
        if !self.store.save_task(task, from, Holder::Nobody).await? {
            return Err(HarvestError::ClaimConflict {
                task_id: task.task_id.to_string(),
                expected: from,
            });
        }
        Ok(())
    }

    /// Explain why a guarded write matched no row.
    async fn write_rejected(&self, task_id: &TaskId, expected: TaskStatus) -> Result<HarvestError> {
        let current = self.store.require_task(task_id).await?;
        if current.status != expected {
            return Ok(HarvestError::ClaimConflict {
                task_id: task_id.to_string(),
                expected,
            });
        }
        warn!(task_id = %task_id, worker_id = %self.worker_id, "Write rejected, lease no longer held");
        Ok(HarvestError::LeaseLost {
            task_id: task_id.to_string(),
            worker_id: self.worker_id.clone(),
        })
    }

    /// Fail expired leases and return their tasks to pending.
    pub async fn release_expired(&self) -> Result<Vec<TaskId>> {
        self.release_expired_at(Utc::now()).await
    }

    pub async fn release_expired_at(&self, now: DateTime<Utc>) -> Result<Vec<TaskId>> {
        let released = self.store.release_expired(now).await?;
        if !released.is_empty() {
            warn!(count = released.len(), "Released expired claims");
        }
        Ok(released)
    }

    /// Close this worker's claim on a task.
    pub async fn release(&self, task_id: &TaskId, outcome: ClaimStatus) -> Result<bool> {
        let released = self
            .store
            .release_claim(task_id, &self.worker_id, outcome)
            .await?;
        if !released {
            info!(task_id = %task_id, worker_id = %self.worker_id, "No active claim to release");
        }
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    async fn setup() -> (TaskClaimer, Task) {
        let store = SqliteStore::in_memory().await.unwrap();
        let date = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
        let task = Task::new("contratos", date, date, None, "fp");
        store.insert_tasks(std::slice::from_ref(&task)).await.unwrap();
        (
            TaskClaimer::new(store, "w1", Duration::from_secs(60)),
            task,
        )
    }

    #[tokio::test]
    async fn test_full_happy_path() {
        let (claimer, task) = setup().await;

        let claimed = claimer.claim_pending(10).await.unwrap();
        assert_eq!(claimed.len(), 1);

        let executing = claimer.begin_execution(&claimed[0]).await.unwrap();
        assert_eq!(executing.attempts, 1);

        let done = claimer
            .update_status(&task.task_id, TaskStatus::Completed)
            .await
            .unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert!(claimer.release(&task.task_id, ClaimStatus::Released).await.unwrap());
        assert!(!claimer.release(&task.task_id, ClaimStatus::Released).await.unwrap());
    }

    #[tokio::test]
    async fn test_invalid_transition_leaves_task_unchanged() {
        let (claimer, task) = setup().await;

        let err = claimer
            .update_status(&task.task_id, TaskStatus::Executing)
            .await
            .unwrap_err();
        assert!(matches!(err, HarvestError::InvalidTransition { .. }));
        assert_eq!(
            claimer.store.require_task(&task.task_id).await.unwrap().status,
            TaskStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_stale_commit_is_claim_conflict() {
        let (claimer, task) = setup().await;
        let claimed = claimer.claim_pending(1).await.unwrap().remove(0);

        // Lease expires and the task goes back to the pool behind our back.
        claimer
            .release_expired_at(Utc::now() + chrono::Duration::seconds(120))
            .await
            .unwrap();

        let err = claimer.begin_execution(&claimed).await.unwrap_err();
        assert!(matches!(
            err,
            HarvestError::ClaimConflict {
                expected: TaskStatus::Claimed,
                ..
            }
        ));
        assert_eq!(
            claimer.store.require_task(&task.task_id).await.unwrap().status,
            TaskStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_expired_worker_cannot_settle_reclaimed_task() {
        let (slow, task) = setup().await;
        let claimed = slow
            .claim_pending_for(1, Duration::from_secs(1))
            .await
            .unwrap()
            .remove(0);
        let executing = slow.begin_execution(&claimed).await.unwrap();

        let other = TaskClaimer::new(slow.store.clone(), "w2", Duration::from_secs(60));
        other
            .release_expired_at(Utc::now() + chrono::Duration::seconds(5))
            .await
            .unwrap();
        let reclaimed = other.claim_pending(1).await.unwrap().remove(0);
        let running = other.begin_execution(&reclaimed).await.unwrap();

        // The first worker finishes late and tries to fail the task.
        let mut failed = executing.clone();
        failed.status = TaskStatus::Failed;
        let err = slow.commit(&failed, TaskStatus::Executing).await.unwrap_err();
        assert!(matches!(err, HarvestError::LeaseLost { .. }));
        assert!(matches!(
            slow.update_status(&task.task_id, TaskStatus::Completed)
                .await
                .unwrap_err(),
            HarvestError::LeaseLost { .. }
        ));

        let current = slow.store.require_task(&task.task_id).await.unwrap();
        assert_eq!(current.status, TaskStatus::Executing);
        let claim = slow.store.active_claim(&task.task_id).await.unwrap().unwrap();
        assert!(claim.is_owned_by("w2"));

        let mut done = running.clone();
        done.status = TaskStatus::Completed;
        other.commit(&done, TaskStatus::Executing).await.unwrap();
    }

    #[tokio::test]
    async fn test_unleased_commit_requires_no_active_claim() {
        let (claimer, task) = setup().await;
        let claimed = claimer.claim_pending(1).await.unwrap().remove(0);
        let executing = claimer.begin_execution(&claimed).await.unwrap();
        let mut partial = executing.clone();
        partial.status = TaskStatus::Partial;
        partial.missing_pages = vec![2];
        claimer.commit(&partial, TaskStatus::Executing).await.unwrap();

        let mut pending = partial.clone();
        pending.status = TaskStatus::Pending;
        assert!(claimer
            .commit_unleased(&pending, TaskStatus::Partial)
            .await
            .is_err());

        claimer.release(&task.task_id, ClaimStatus::Released).await.unwrap();
        claimer
            .commit_unleased(&pending, TaskStatus::Partial)
            .await
            .unwrap();
        assert_eq!(
            claimer.store.require_task(&task.task_id).await.unwrap().status,
            TaskStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_unknown_task() {
        let (claimer, _) = setup().await;
        let err = claimer
            .update_status(&TaskId::from_raw("missing"), TaskStatus::Claimed)
            .await
            .unwrap_err();
        assert!(matches!(err, HarvestError::TaskNotFound { .. }));
    }
}
