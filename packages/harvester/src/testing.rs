//! Testing utilities including mock implementations.
//!
//! These let applications and tests drive a harvest without a real upstream
//! API or an external ledger.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{FetchResult, HarvestError, Result};
use crate::traits::{ledger::CompletionLedger, source::PageSource};
use crate::types::gap::{DateRange, MonthBucket};
use crate::types::page::{PageRequest, RawResponse};

/// A scripted upstream API.
///
/// Responses resolve in this order: queued sequence entries for the
/// (path, page), a fixed response for the (path, page), a generated listing
/// for the path, and finally 404.
#[derive(Clone, Default)]
pub struct MockPageSource {
    listings: Arc<RwLock<HashMap<String, Listing>>>,
    fixed: Arc<RwLock<HashMap<(String, u32), RawResponse>>>,
    sequences: Arc<RwLock<HashMap<(String, u32), VecDeque<FetchResult<RawResponse>>>>>,
    delay: Option<Duration>,

    /// Call tracking for assertions
    calls: Arc<RwLock<Vec<MockFetchCall>>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

#[derive(Debug, Clone, Copy)]
struct Listing {
    total_pages: u32,
    records_per_page: usize,
}

/// Record of a request made to the mock source.
#[derive(Debug, Clone)]
pub struct MockFetchCall {
    pub path: String,
    pub page_number: u32,
    pub query: Vec<(String, String)>,
}

impl MockPageSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve a paginated listing for `path`: every page reports `total_pages`.
    pub fn with_listing(self, path: impl Into<String>, total_pages: u32, records_per_page: usize) -> Self {
        self.listings.write().unwrap().insert(
            path.into(),
            Listing {
                total_pages,
                records_per_page,
            },
        );
        self
    }

    /// Always answer (path, page) with `response`.
    pub fn with_response(self, path: impl Into<String>, page: u32, response: RawResponse) -> Self {
        self.fixed
            .write()
            .unwrap()
            .insert((path.into(), page), response);
        self
    }

    /// Answer the next requests for (path, page) with `responses`, in order.
    pub fn with_sequence(
        self,
        path: impl Into<String>,
        page: u32,
        responses: Vec<FetchResult<RawResponse>>,
    ) -> Self {
        self.sequences
            .write()
            .unwrap()
            .entry((path.into(), page))
            .or_default()
            .extend(responses);
        self
    }

    /// Hold every request for `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<MockFetchCall> {
        self.calls.read().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.read().unwrap().len()
    }

    /// Distinct page numbers requested, ascending.
    pub fn requested_pages(&self) -> Vec<u32> {
        let mut pages: Vec<u32> = self
            .calls
            .read()
            .unwrap()
            .iter()
            .map(|c| c.page_number)
            .collect();
        pages.sort_unstable();
        pages.dedup();
        pages
    }

    /// Highest number of requests that were in flight at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn respond(&self, request: &PageRequest) -> FetchResult<RawResponse> {
        let key = (request.path.clone(), request.page_number);

        if let Some(next) = self
            .sequences
            .write()
            .unwrap()
            .get_mut(&key)
            .and_then(VecDeque::pop_front)
        {
            return next;
        }
        if let Some(fixed) = self.fixed.read().unwrap().get(&key) {
            return Ok(fixed.clone());
        }
        if let Some(listing) = self.listings.read().unwrap().get(&request.path) {
            return Ok(RawResponse::new(
                200,
                fixtures::listing_body(
                    &request.query,
                    request.page_number,
                    listing.total_pages,
                    listing.records_per_page,
                ),
            ));
        }
        Ok(RawResponse::new(404, ""))
    }
}

#[async_trait]
impl PageSource for MockPageSource {
    async fn fetch(&self, request: &PageRequest) -> FetchResult<RawResponse> {
        self.calls.write().unwrap().push(MockFetchCall {
            path: request.path.clone(),
            page_number: request.page_number,
            query: request.query.clone(),
        });

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let response = self.respond(request);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        response
    }
}

/// In-memory completion ledger.
#[derive(Clone, Default)]
pub struct MemoryLedger {
    complete: Arc<RwLock<HashSet<(String, MonthBucket)>>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_complete(self, endpoint: impl Into<String>, bucket: MonthBucket) -> Self {
        self.complete
            .write()
            .unwrap()
            .insert((endpoint.into(), bucket));
        self
    }

    pub fn is_complete(&self, endpoint: &str, bucket: MonthBucket) -> bool {
        self.complete
            .read()
            .unwrap()
            .contains(&(endpoint.to_string(), bucket))
    }
}

#[async_trait]
impl CompletionLedger for MemoryLedger {
    async fn completed_buckets(
        &self,
        endpoint: &str,
        range: &DateRange,
    ) -> Result<HashSet<MonthBucket>> {
        let wanted: HashSet<MonthBucket> = range.months().into_iter().collect();
        Ok(self
            .complete
            .read()
            .unwrap()
            .iter()
            .filter(|(e, b)| e == endpoint && wanted.contains(b))
            .map(|(_, b)| *b)
            .collect())
    }

    async fn mark_complete(&self, endpoint: &str, bucket: MonthBucket) -> Result<()> {
        self.complete
            .write()
            .unwrap()
            .insert((endpoint.to_string(), bucket));
        Ok(())
    }

    async fn invalidate(&self, endpoint: &str, bucket: MonthBucket) -> Result<()> {
        self.complete
            .write()
            .unwrap()
            .remove(&(endpoint.to_string(), bucket));
        Ok(())
    }
}

/// A ledger whose backing service is down.
#[derive(Clone, Copy, Default)]
pub struct UnavailableLedger;

#[async_trait]
impl CompletionLedger for UnavailableLedger {
    async fn completed_buckets(
        &self,
        _endpoint: &str,
        _range: &DateRange,
    ) -> Result<HashSet<MonthBucket>> {
        Err(HarvestError::LedgerUnavailable("connection refused".into()))
    }

    async fn mark_complete(&self, _endpoint: &str, _bucket: MonthBucket) -> Result<()> {
        Err(HarvestError::LedgerUnavailable("connection refused".into()))
    }

    async fn invalidate(&self, _endpoint: &str, _bucket: MonthBucket) -> Result<()> {
        Err(HarvestError::LedgerUnavailable("connection refused".into()))
    }
}

/// Small builders for test data.
pub mod fixtures {
    use chrono::NaiveDate;
    use serde_json::json;

    use crate::types::config::{EndpointCatalog, EndpointConfig};
    use crate::types::task::Task;

    pub fn date(year: i32, month: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(year, month, day).unwrap()
    }

    /// An endpoint served at `/v1/{name}`.
    pub fn endpoint(name: &str) -> EndpointConfig {
        EndpointConfig::new(name, format!("/v1/{name}"))
    }

    /// Catalogue version "1" with a single daily `contratos` endpoint.
    pub fn catalog() -> EndpointCatalog {
        catalog_with(vec![endpoint("contratos")])
    }

    pub fn catalog_with(endpoints: Vec<EndpointConfig>) -> EndpointCatalog {
        endpoints
            .into_iter()
            .fold(EndpointCatalog::new("1", date(2021, 1, 1)), |catalog, e| {
                catalog.with_endpoint(e)
            })
    }

    /// A pending single-day task without category code.
    pub fn task(endpoint: &str, day: NaiveDate) -> Task {
        Task::new(endpoint, day, day, None, "fp")
    }

    /// A response body for one page of a listing.
    ///
    /// Bodies differ per page and per query so distinct pages never dedup by accident.
    pub fn listing_body(
        query: &[(String, String)],
        page: u32,
        total_pages: u32,
        records: usize,
    ) -> Vec<u8> {
        let tag: Vec<String> = query
            .iter()
            .filter(|(k, _)| k != "pagina")
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        let data: Vec<_> = (0..records)
            .map(|i| json!({ "pagina": page, "item": i, "consulta": tag.join("&") }))
            .collect();
        json!({
            "data": data,
            "totalRegistros": total_pages as usize * records,
            "totalPaginas": total_pages,
        })
        .to_string()
        .into_bytes()
    }
}
