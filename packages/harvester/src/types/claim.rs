//! Time-bounded leases over tasks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::task::TaskId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimStatus {
    /// Lease held by a worker.
    Active,
    /// Worker finished with the task (completed or failed).
    Released,
    /// Lease expired or the worker gave up; the task went back to the pool.
    Failed,
}

impl ClaimStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClaimStatus::Active => "active",
            ClaimStatus::Released => "released",
            ClaimStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(ClaimStatus::Active),
            "released" => Some(ClaimStatus::Released),
            "failed" => Some(ClaimStatus::Failed),
            _ => None,
        }
    }
}

/// A lease granting one worker exclusive execution rights over a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claim {
    pub claim_id: String,
    pub task_id: TaskId,
    pub worker_id: String,
    pub claimed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: ClaimStatus,
}

impl Claim {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_owned_by(&self, worker_id: &str) -> bool {
        self.worker_id == worker_id
    }
}
