//! Configuration: the endpoint catalogue and run settings.

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::NaiveDate;
use dotenvy::dotenv;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{HarvestError, Result};
use crate::pipeline::retry::RetryPolicy;

/// How an endpoint's date parameters slice time into tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskWindow {
    /// One task per calendar day (start and end parameter both set to the day).
    #[default]
    Daily,
    /// One task per month bucket, clipped to the requested range.
    Monthly,
}

/// Static description of one upstream endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub name: String,
    pub path: String,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_start_param")]
    pub start_param: String,
    #[serde(default = "default_end_param")]
    pub end_param: String,
    #[serde(default)]
    pub window: TaskWindow,
    /// Parameter name for endpoints that must iterate category codes explicitly.
    #[serde(default)]
    pub category_param: Option<String>,
    #[serde(default)]
    pub category_codes: Vec<String>,
    /// Upper bound on `totalPaginas` accepted from discovery.
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
}

fn default_page_size() -> u32 {
    50
}

fn default_max_pages() -> u32 {
    10_000
}

fn default_start_param() -> String {
    "dataInicial".to_string()
}

fn default_end_param() -> String {
    "dataFinal".to_string()
}

impl EndpointConfig {
    pub fn new(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            page_size: default_page_size(),
            start_param: default_start_param(),
            end_param: default_end_param(),
            window: TaskWindow::Daily,
            category_param: None,
            category_codes: Vec::new(),
            max_pages: default_max_pages(),
        }
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_max_pages(mut self, max_pages: u32) -> Self {
        self.max_pages = max_pages;
        self
    }

    pub fn with_date_params(mut self, start: impl Into<String>, end: impl Into<String>) -> Self {
        self.start_param = start.into();
        self.end_param = end.into();
        self
    }

    pub fn with_window(mut self, window: TaskWindow) -> Self {
        self.window = window;
        self
    }

    pub fn with_categories(mut self, param: impl Into<String>, codes: Vec<String>) -> Self {
        self.category_param = Some(param.into());
        self.category_codes = codes;
        self
    }

    /// Category codes to iterate, or a single empty modality.
    pub fn modalities(&self) -> Vec<Option<String>> {
        if self.category_param.is_some() && !self.category_codes.is_empty() {
            self.category_codes.iter().cloned().map(Some).collect()
        } else {
            vec![None]
        }
    }
}

/// The versioned endpoint catalogue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointCatalog {
    /// Bumped whenever endpoint definitions change; part of the plan fingerprint.
    pub version: String,
    /// Backfill start when no explicit start date is given.
    pub earliest_date: NaiveDate,
    pub endpoints: Vec<EndpointConfig>,
}

impl EndpointCatalog {
    pub fn new(version: impl Into<String>, earliest_date: NaiveDate) -> Self {
        Self {
            version: version.into(),
            earliest_date,
            endpoints: Vec::new(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: EndpointConfig) -> Self {
        self.endpoints.push(endpoint);
        self
    }

    /// Load a catalogue from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            HarvestError::Config(format!("cannot read catalog {}: {e}", path.display()))
        })?;
        let catalog: Self = serde_json::from_str(&raw)?;
        catalog.validate()?;
        Ok(catalog)
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for endpoint in &self.endpoints {
            if !seen.insert(endpoint.name.as_str()) {
                return Err(HarvestError::Config(format!(
                    "duplicate endpoint in catalog: {}",
                    endpoint.name
                )));
            }
            if endpoint.page_size == 0 || endpoint.max_pages == 0 {
                return Err(HarvestError::Config(format!(
                    "endpoint {} needs a non-zero page_size and max_pages",
                    endpoint.name
                )));
            }
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&EndpointConfig> {
        self.endpoints.iter().find(|e| e.name == name)
    }

    pub fn names(&self) -> Vec<String> {
        self.endpoints.iter().map(|e| e.name.clone()).collect()
    }
}

/// Run settings.
#[derive(Debug, Clone)]
pub struct HarvestConfig {
    pub database_url: String,
    pub base_url: String,
    /// Deployment environment; part of the plan fingerprint.
    pub environment: String,
    pub catalog_path: Option<PathBuf>,
    /// Identity written on claims.
    pub worker_id: String,
    /// Upper bound on concurrent upstream requests (the global semaphore).
    pub max_concurrency: usize,
    /// Upper bound on tasks fetched concurrently.
    pub max_tasks_in_flight: usize,
    /// Optional request pacing on top of the concurrency bound.
    pub requests_per_second: Option<u32>,
    pub lease_duration: Duration,
    pub claim_batch: usize,
    /// Items per writer transaction.
    pub writer_batch: usize,
    /// Capacity of the writer queue.
    pub writer_capacity: usize,
    pub request_timeout: Duration,
    pub user_agent: String,
    pub retry: RetryPolicy,
    /// Fetch cycles a partial task gets before it is failed.
    pub max_task_cycles: u32,
    /// Fill missing range bounds from the catalogue.
    pub backfill: bool,
    /// Adopt open tasks from a stale plan instead of aborting.
    pub replan_stale: bool,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://harvest.db".to_string(),
            base_url: "http://localhost".to_string(),
            environment: "development".to_string(),
            catalog_path: None,
            worker_id: format!("worker-{}", Uuid::new_v4()),
            max_concurrency: 8,
            max_tasks_in_flight: 4,
            requests_per_second: None,
            lease_duration: Duration::from_secs(600),
            claim_batch: 16,
            writer_batch: 50,
            writer_capacity: 256,
            request_timeout: Duration::from_secs(30),
            user_agent: "HarvesterBot/1.0".to_string(),
            retry: RetryPolicy::default(),
            max_task_cycles: 3,
            backfill: false,
            replan_stale: false,
        }
    }
}

impl HarvestConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        let defaults = Self::default();
        Ok(Self {
            database_url: env::var("DATABASE_URL")
                .map_err(|_| HarvestError::Config("DATABASE_URL must be set".into()))?,
            base_url: env::var("HARVEST_BASE_URL")
                .map_err(|_| HarvestError::Config("HARVEST_BASE_URL must be set".into()))?,
            environment: env::var("HARVEST_ENV").unwrap_or(defaults.environment),
            catalog_path: env::var("HARVEST_CATALOG").ok().map(PathBuf::from),
            worker_id: env::var("HARVEST_WORKER_ID").unwrap_or(defaults.worker_id),
            max_concurrency: parse_var("HARVEST_MAX_CONCURRENCY", defaults.max_concurrency)?,
            max_tasks_in_flight: parse_var("HARVEST_MAX_TASKS", defaults.max_tasks_in_flight)?,
            requests_per_second: env::var("HARVEST_REQUESTS_PER_SECOND")
                .ok()
                .map(|v| {
                    v.parse().map_err(|_| {
                        HarvestError::Config("HARVEST_REQUESTS_PER_SECOND must be a number".into())
                    })
                })
                .transpose()?,
            lease_duration: Duration::from_secs(parse_var(
                "HARVEST_LEASE_SECS",
                defaults.lease_duration.as_secs(),
            )?),
            claim_batch: parse_var("HARVEST_CLAIM_BATCH", defaults.claim_batch)?,
            writer_batch: parse_var("HARVEST_WRITER_BATCH", defaults.writer_batch)?,
            writer_capacity: parse_var("HARVEST_WRITER_CAPACITY", defaults.writer_capacity)?,
            request_timeout: Duration::from_secs(parse_var(
                "HARVEST_TIMEOUT_SECS",
                defaults.request_timeout.as_secs(),
            )?),
            user_agent: env::var("HARVEST_USER_AGENT").unwrap_or(defaults.user_agent),
            retry: RetryPolicy {
                max_attempts: parse_var("HARVEST_MAX_ATTEMPTS", defaults.retry.max_attempts)?,
                ..defaults.retry
            },
            max_task_cycles: parse_var("HARVEST_MAX_TASK_CYCLES", defaults.max_task_cycles)?,
            backfill: false,
            replan_stale: false,
        })
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = url.into();
        self
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = environment.into();
        self
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn with_max_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = n;
        self
    }

    pub fn with_lease_duration(mut self, lease: Duration) -> Self {
        self.lease_duration = lease;
        self
    }

    pub fn with_writer_batch(mut self, batch: usize) -> Self {
        self.writer_batch = batch;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_max_task_cycles(mut self, cycles: u32) -> Self {
        self.max_task_cycles = cycles;
        self
    }

    pub fn backfill(mut self) -> Self {
        self.backfill = true;
        self
    }

    pub fn replan_stale(mut self) -> Self {
        self.replan_stale = true;
        self
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match env::var(name) {
        Ok(value) => value
            .parse()
            .map_err(|_| HarvestError::Config(format!("{name} must be a valid number"))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_json_defaults() {
        let raw = r#"{
            "version": "2024.1",
            "earliest_date": "2021-01-01",
            "endpoints": [
                {"name": "contratos", "path": "/v1/contratos"},
                {"name": "editais", "path": "/v1/editais", "window": "monthly",
                 "category_param": "codigoModalidade", "category_codes": ["6", "8"]}
            ]
        }"#;
        let catalog: EndpointCatalog = serde_json::from_str(raw).unwrap();
        catalog.validate().unwrap();

        let contratos = catalog.get("contratos").unwrap();
        assert_eq!(contratos.page_size, 50);
        assert_eq!(contratos.max_pages, 10_000);
        assert_eq!(contratos.start_param, "dataInicial");
        assert_eq!(contratos.modalities(), vec![None]);

        let editais = catalog.get("editais").unwrap();
        assert_eq!(editais.window, TaskWindow::Monthly);
        assert_eq!(
            editais.modalities(),
            vec![Some("6".to_string()), Some("8".to_string())]
        );
    }

    #[test]
    fn test_duplicate_endpoint_rejected() {
        let catalog = EndpointCatalog::new("1", NaiveDate::from_ymd_opt(2024, 1, 1).unwrap())
            .with_endpoint(EndpointConfig::new("a", "/a"))
            .with_endpoint(EndpointConfig::new("a", "/b"));
        assert!(catalog.validate().is_err());
    }

    #[test]
    fn test_default_config() {
        let config = HarvestConfig::default();
        assert!(config.worker_id.starts_with("worker-"));
        assert!(config.max_concurrency >= 1);
        assert!(!config.backfill);
    }
}
