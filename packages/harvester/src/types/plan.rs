//! Persisted plan metadata.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::gap::DateRange;

/// The configuration a set of tasks was planned under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub fingerprint: String,
    pub range: DateRange,
    pub catalog_version: String,
    pub environment: String,
    pub created_at: DateTime<Utc>,
}
