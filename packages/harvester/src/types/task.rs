//! Task model and its status state machine.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{HarvestError, Result};

/// Lifecycle of a harvesting task.
///
/// ```text
/// Pending -> Claimed -> Executing -> Completed | Partial | Failed
/// Partial -> Pending (re-arm) | Completed | Failed
/// Failed  -> Pending (retry)
/// Claimed | Executing -> Pending (lease expiry)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Claimed,
    Executing,
    Partial,
    Completed,
    Failed,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 6] = [
        TaskStatus::Pending,
        TaskStatus::Claimed,
        TaskStatus::Executing,
        TaskStatus::Partial,
        TaskStatus::Completed,
        TaskStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Claimed => "claimed",
            TaskStatus::Executing => "executing",
            TaskStatus::Partial => "partial",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    /// Terminal unless an operator resets the task.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// The central transition table. Every automatic status change goes through here.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Claimed)
                | (Claimed, Executing)
                | (Claimed, Failed)
                | (Claimed, Pending)
                | (Executing, Completed)
                | (Executing, Partial)
                | (Executing, Failed)
                | (Executing, Pending)
                | (Partial, Pending)
                | (Partial, Completed)
                | (Partial, Failed)
                | (Failed, Pending)
        )
    }

    /// Operator reset (force re-extraction). Never allowed while a worker holds the task.
    pub fn can_reset(self) -> bool {
        !matches!(self, TaskStatus::Claimed | TaskStatus::Executing)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = HarvestError;

    fn from_str(s: &str) -> Result<Self> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| HarvestError::Config(format!("unknown task status: {s}")))
    }
}

/// Validate a transition, raising `InvalidTransition` when the table forbids it.
pub fn validate_transition(task_id: &TaskId, from: TaskStatus, to: TaskStatus) -> Result<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(HarvestError::InvalidTransition {
            task_id: task_id.to_string(),
            from,
            to,
        })
    }
}

/// Deterministic task identifier derived from (endpoint, date, modality).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Hash of `endpoint|date|category`; an absent category is the empty modality.
    pub fn derive(endpoint: &str, data_date: NaiveDate, category_code: Option<&str>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(endpoint.as_bytes());
        hasher.update(b"|");
        hasher.update(data_date.format("%Y-%m-%d").to_string().as_bytes());
        hasher.update(b"|");
        hasher.update(category_code.unwrap_or("").as_bytes());
        let digest = hex::encode(hasher.finalize());
        Self(digest[..32].to_string())
    }

    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One unit of harvesting work: an endpoint, a date window and an optional category code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: TaskId,
    pub endpoint: String,
    /// First day of the window (the task's "date").
    pub data_date: NaiveDate,
    /// Last day of the window, inclusive.
    pub window_end: NaiveDate,
    pub category_code: Option<String>,
    pub status: TaskStatus,
    /// Unknown until the discovery response is persisted.
    pub total_pages: Option<u32>,
    pub total_records: Option<u64>,
    /// Pages still to fetch after the last reconciliation.
    pub missing_pages: Vec<u32>,
    pub plan_fingerprint: String,
    /// Number of fetch cycles this task went through.
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(
        endpoint: impl Into<String>,
        data_date: NaiveDate,
        window_end: NaiveDate,
        category_code: Option<String>,
        plan_fingerprint: impl Into<String>,
    ) -> Self {
        let endpoint = endpoint.into();
        let now = Utc::now();
        Self {
            task_id: TaskId::derive(&endpoint, data_date, category_code.as_deref()),
            endpoint,
            data_date,
            window_end,
            category_code,
            status: TaskStatus::Pending,
            total_pages: None,
            total_records: None,
            missing_pages: Vec::new(),
            plan_fingerprint: plan_fingerprint.into(),
            attempts: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Pages a resumed fetch should request, or `None` when a full discovery pass is needed.
    pub fn resume_pages(&self) -> Option<Vec<u32>> {
        match self.total_pages {
            Some(_) if !self.missing_pages.is_empty() && !self.missing_pages.contains(&1) => {
                Some(self.missing_pages.clone())
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_id_is_deterministic() {
        let date = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
        let a = TaskId::derive("contratos", date, Some("6"));
        let b = TaskId::derive("contratos", date, Some("6"));
        let c = TaskId::derive("contratos", date, Some("8"));
        let d = TaskId::derive("contratos", date, None);

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert_eq!(a.as_str().len(), 32);
    }

    #[test]
    fn test_terminal_states_have_no_automatic_exit_except_retry() {
        for next in TaskStatus::ALL {
            assert!(!TaskStatus::Completed.can_transition_to(next));
        }
        assert!(TaskStatus::Failed.can_transition_to(TaskStatus::Pending));
        assert!(!TaskStatus::Failed.can_transition_to(TaskStatus::Executing));
    }

    #[test]
    fn test_completed_to_executing_is_invalid() {
        let id = TaskId::from_raw("t1");
        let err = validate_transition(&id, TaskStatus::Completed, TaskStatus::Executing).unwrap_err();
        assert!(matches!(
            err,
            HarvestError::InvalidTransition {
                from: TaskStatus::Completed,
                to: TaskStatus::Executing,
                ..
            }
        ));
    }

    #[test]
    fn test_lease_expiry_paths() {
        assert!(TaskStatus::Claimed.can_transition_to(TaskStatus::Pending));
        assert!(TaskStatus::Executing.can_transition_to(TaskStatus::Pending));
        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::Executing));
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for status in TaskStatus::ALL {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
        assert!("running".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn test_resume_pages() {
        let date = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
        let mut task = Task::new("e", date, date, None, "fp");
        assert_eq!(task.resume_pages(), None);

        task.total_pages = Some(5);
        task.missing_pages = vec![3, 5];
        assert_eq!(task.resume_pages(), Some(vec![3, 5]));

        task.missing_pages = vec![1, 4];
        assert_eq!(task.resume_pages(), None);
    }
}
