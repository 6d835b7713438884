//! Upstream request/response shapes.

use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::task::TaskId;
use crate::error::{FetchError, FetchResult};

/// Query parameter carrying the page number.
pub const PAGE_PARAM: &str = "pagina";
/// Query parameter carrying the page size.
pub const PAGE_SIZE_PARAM: &str = "tamanhoPagina";

/// A single GET against the upstream API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub task_id: TaskId,
    pub endpoint: String,
    /// Path appended to the base URL.
    pub path: String,
    pub page_number: u32,
    pub data_date: NaiveDate,
    /// Ordered query parameters, page parameters included.
    pub query: Vec<(String, String)>,
}

impl PageRequest {
    /// Query parameters as a JSON object, as stored on the request record.
    pub fn parameters(&self) -> serde_json::Value {
        let map = self
            .query
            .iter()
            .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
            .collect::<serde_json::Map<_, _>>();
        serde_json::Value::Object(map)
    }
}

/// Raw HTTP exchange as returned by a `PageSource`.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub body: Vec<u8>,
    /// Parsed `Retry-After` header.
    pub retry_after: Option<Duration>,
}

impl RawResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            body: body.into(),
            retry_after: None,
        }
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    /// Map the status code onto the error taxonomy. 404 is handled by the caller.
    pub fn classify(&self) -> FetchResult<()> {
        match self.status {
            200..=299 => Ok(()),
            429 => Err(FetchError::RateLimited {
                retry_after: self.retry_after,
            }),
            500..=599 => Err(FetchError::Upstream {
                status: self.status,
            }),
            status => Err(FetchError::Permanent { status }),
        }
    }
}

/// JSON envelope returned by every paginated endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpstreamEnvelope {
    #[serde(default)]
    pub data: Vec<serde_json::Value>,
    #[serde(rename = "totalRegistros", default)]
    pub total_records: u64,
    #[serde(rename = "totalPaginas", default)]
    pub total_pages: u32,
}

impl UpstreamEnvelope {
    /// Parse a success body. 204 and empty bodies are an empty page.
    pub fn parse(body: &[u8]) -> FetchResult<Self> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }
        serde_json::from_slice(body).map_err(|e| FetchError::Decode(e.to_string()))
    }

    /// `totalPaginas == 0` still counts as one (empty) page so the task is marked checked.
    pub fn effective_pages(&self) -> u32 {
        self.total_pages.max(1)
    }

    /// `effective_pages`, rejected when it exceeds `max_pages` or when the
    /// record count could not fill that many pages.
    pub fn checked_pages(&self, max_pages: u32) -> FetchResult<u32> {
        let pages = self.effective_pages();
        if pages > max_pages || u64::from(pages) > self.total_records.max(1) {
            return Err(FetchError::Decode(format!(
                "implausible totalPaginas {} for totalRegistros {} (limit {max_pages})",
                self.total_pages, self.total_records
            )));
        }
        Ok(pages)
    }
}

/// Totals learned from a discovery (page 1) response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Discovery {
    pub total_pages: u32,
    pub total_records: u64,
}

/// One fetched page (or failed exchange) on its way to the writer.
#[derive(Debug, Clone)]
pub struct PageResponse {
    pub task_id: TaskId,
    pub endpoint: String,
    pub parameters: serde_json::Value,
    pub page_number: u32,
    pub data_date: NaiveDate,
    pub http_status: Option<u16>,
    /// Body of a successful page. Failed exchanges carry none.
    pub body: Option<Vec<u8>>,
    pub record_count: Option<u32>,
    /// Present on discovery responses only.
    pub discovery: Option<Discovery>,
    pub error: Option<String>,
    pub fetched_at: DateTime<Utc>,
}

impl PageResponse {
    pub fn success(request: &PageRequest, status: u16, body: Vec<u8>, record_count: u32) -> Self {
        Self {
            task_id: request.task_id.clone(),
            endpoint: request.endpoint.clone(),
            parameters: request.parameters(),
            page_number: request.page_number,
            data_date: request.data_date,
            http_status: Some(status),
            body: Some(body),
            record_count: Some(record_count),
            discovery: None,
            error: None,
            fetched_at: Utc::now(),
        }
    }

    pub fn failure(request: &PageRequest, http_status: Option<u16>, error: impl Into<String>) -> Self {
        Self {
            task_id: request.task_id.clone(),
            endpoint: request.endpoint.clone(),
            parameters: request.parameters(),
            page_number: request.page_number,
            data_date: request.data_date,
            http_status,
            body: None,
            record_count: None,
            discovery: None,
            error: Some(error.into()),
            fetched_at: Utc::now(),
        }
    }

    /// An exchange that carried no data (e.g. 404). Recorded, but nothing is stored.
    pub fn no_data(request: &PageRequest, status: u16) -> Self {
        Self {
            task_id: request.task_id.clone(),
            endpoint: request.endpoint.clone(),
            parameters: request.parameters(),
            page_number: request.page_number,
            data_date: request.data_date,
            http_status: Some(status),
            body: None,
            record_count: Some(0),
            discovery: None,
            error: None,
            fetched_at: Utc::now(),
        }
    }

    pub fn with_discovery(mut self, discovery: Discovery) -> Self {
        self.discovery = Some(discovery);
        self
    }

    pub fn is_success(&self) -> bool {
        self.body.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(RawResponse::new(200, "{}").classify().is_ok());
        assert!(RawResponse::new(204, "").classify().is_ok());
        assert!(matches!(
            RawResponse::new(429, "").classify(),
            Err(FetchError::RateLimited { .. })
        ));
        assert!(matches!(
            RawResponse::new(503, "").classify(),
            Err(FetchError::Upstream { status: 503 })
        ));
        assert!(matches!(
            RawResponse::new(400, "").classify(),
            Err(FetchError::Permanent { status: 400 })
        ));
    }

    #[test]
    fn test_envelope_parse() {
        let body = br#"{"data":[{"id":1},{"id":2}],"totalRegistros":12,"totalPaginas":6}"#;
        let envelope = UpstreamEnvelope::parse(body).unwrap();
        assert_eq!(envelope.data.len(), 2);
        assert_eq!(envelope.total_records, 12);
        assert_eq!(envelope.total_pages, 6);
    }

    #[test]
    fn test_empty_body_is_one_empty_page() {
        let envelope = UpstreamEnvelope::parse(b"").unwrap();
        assert!(envelope.data.is_empty());
        assert_eq!(envelope.total_pages, 0);
        assert_eq!(envelope.effective_pages(), 1);
    }

    #[test]
    fn test_page_count_is_bounded() {
        let envelope = |pages: u32, records: u64| UpstreamEnvelope {
            data: Vec::new(),
            total_records: records,
            total_pages: pages,
        };

        assert_eq!(envelope(3, 120).checked_pages(100).unwrap(), 3);
        assert_eq!(envelope(0, 0).checked_pages(100).unwrap(), 1);
        assert!(matches!(
            envelope(u32::MAX, 10).checked_pages(100),
            Err(FetchError::Decode(_))
        ));
        assert!(matches!(
            envelope(u32::MAX, u64::MAX).checked_pages(100),
            Err(FetchError::Decode(_))
        ));
        assert!(matches!(envelope(5, 2).checked_pages(100), Err(FetchError::Decode(_))));
    }

    #[test]
    fn test_malformed_body_is_decode_error() {
        assert!(matches!(
            UpstreamEnvelope::parse(b"<html>"),
            Err(FetchError::Decode(_))
        ));
    }
}
