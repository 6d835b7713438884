//! Persisted content: deduplicated blobs, request log and page results.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::task::TaskId;

/// SHA-256 of the exact response bytes, lowercase hex.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Deduplicated storage unit keyed by content hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentBlob {
    pub content_hash: String,
    pub size: u64,
    pub reference_count: u64,
    pub created_at: DateTime<Utc>,
}

/// Append-only log entry, one per HTTP exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestRecord {
    pub request_id: i64,
    pub task_id: TaskId,
    pub endpoint: String,
    pub parameters: serde_json::Value,
    pub http_status: Option<u16>,
    pub content_hash: Option<String>,
    pub data_date: NaiveDate,
    pub page_number: u32,
    pub error: Option<String>,
    pub fetched_at: DateTime<Utc>,
}

/// A successfully persisted page of a task. Immutable once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageResult {
    pub task_id: TaskId,
    pub page_number: u32,
    pub record_count: u32,
    pub content_hash: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_bytes_same_hash() {
        assert_eq!(content_hash(b"{\"data\":[]}"), content_hash(b"{\"data\":[]}"));
    }

    #[test]
    fn test_hash_is_byte_exact() {
        // No normalization: whitespace differences are different content.
        assert_ne!(content_hash(b"{\"data\":[]}"), content_hash(b"{ \"data\": [] }"));
        assert_eq!(content_hash(b"").len(), 64);
    }
}
