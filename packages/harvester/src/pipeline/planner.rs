//! Task planning: gaps become deduplicated task rows under a fingerprinted plan.

use chrono::{NaiveDate, Utc};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::{PlanningError, Result};
use crate::stores::SqliteStore;
use crate::types::config::{EndpointCatalog, EndpointConfig, TaskWindow};
use crate::types::gap::{DateRange, Gap};
use crate::types::plan::Plan;
use crate::types::task::Task;

/// Result of one planning pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanOutcome {
    pub fingerprint: String,
    /// Tasks the gaps expanded into.
    pub planned: usize,
    /// Of those, tasks that did not exist before.
    pub created: usize,
}

/// Hash of the inputs that make persisted tasks valid.
pub fn plan_fingerprint(range: &DateRange, catalog_version: &str, environment: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(range.start.format("%Y-%m-%d").to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(range.end.format("%Y-%m-%d").to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(catalog_version.as_bytes());
    hasher.update(b"|");
    hasher.update(environment.as_bytes());
    hex::encode(hasher.finalize())
}

/// Work out the date range of a run.
///
/// Outside backfill mode both bounds are required. In backfill mode a missing
/// start is the catalogue's earliest date and a missing end is `today`.
pub fn resolve_range(
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
    backfill: bool,
    earliest: NaiveDate,
    today: NaiveDate,
) -> std::result::Result<DateRange, PlanningError> {
    let (start, end) = match (start, end, backfill) {
        (Some(start), Some(end), _) => (start, end),
        (start, end, true) => (start.unwrap_or(earliest), end.unwrap_or(today)),
        _ => return Err(PlanningError::NoDateRange),
    };
    DateRange::new(start, end)
}

/// Expand one gap into tasks for one endpoint.
pub fn expand_gap(endpoint: &EndpointConfig, gap: &Gap, fingerprint: &str) -> Vec<Task> {
    let windows: Vec<DateRange> = match endpoint.window {
        TaskWindow::Daily => gap.range().days().map(DateRange::day).collect(),
        TaskWindow::Monthly => gap
            .range()
            .months()
            .iter()
            .filter_map(|bucket| bucket.range().intersect(&gap.range()))
            .collect(),
    };

    let modalities = endpoint.modalities();
    let mut tasks = Vec::with_capacity(windows.len() * modalities.len());
    for window in windows {
        for code in &modalities {
            tasks.push(Task::new(
                endpoint.name.clone(),
                window.start,
                window.end,
                code.clone(),
                fingerprint,
            ));
        }
    }
    tasks
}

pub struct TaskPlanner<'a> {
    store: &'a SqliteStore,
    catalog: &'a EndpointCatalog,
    environment: &'a str,
}

impl<'a> TaskPlanner<'a> {
    pub fn new(store: &'a SqliteStore, catalog: &'a EndpointCatalog, environment: &'a str) -> Self {
        Self {
            store,
            catalog,
            environment,
        }
    }

    /// Fingerprint of `range` under the current catalogue and environment.
    pub fn fingerprint(&self, range: &DateRange) -> String {
        plan_fingerprint(range, &self.catalog.version, self.environment)
    }

    pub fn resolve_range(
        &self,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
        backfill: bool,
    ) -> std::result::Result<DateRange, PlanningError> {
        resolve_range(
            start,
            end,
            backfill,
            self.catalog.earliest_date,
            Utc::now().date_naive(),
        )
    }

    /// Persist the plan and create-if-absent one task per (date, category code) of every gap.
    pub async fn plan(&self, gaps: &[Gap], range: &DateRange) -> Result<PlanOutcome> {
        let fingerprint = self.fingerprint(range);
        self.store
            .insert_plan(&Plan {
                fingerprint: fingerprint.clone(),
                range: *range,
                catalog_version: self.catalog.version.clone(),
                environment: self.environment.to_string(),
                created_at: Utc::now(),
            })
            .await?;

        let mut tasks = Vec::new();
        for gap in gaps {
            let endpoint = self
                .catalog
                .get(&gap.endpoint)
                .ok_or_else(|| PlanningError::UnknownEndpoint(gap.endpoint.clone()))?;
            tasks.extend(expand_gap(endpoint, gap, &fingerprint));
        }

        let created = self.store.insert_tasks(&tasks).await?;
        info!(
            fingerprint = %fingerprint,
            gaps = gaps.len(),
            planned = tasks.len(),
            created,
            "Planned tasks"
        );

        Ok(PlanOutcome {
            fingerprint,
            planned: tasks.len(),
            created,
        })
    }

    /// Whether work stamped with `expected` is still valid under the current configuration.
    ///
    /// The persisted plan's range is re-fingerprinted with the current catalogue
    /// version and environment; an unknown fingerprint is never valid.
    pub async fn validate_fingerprint(&self, expected: &str) -> Result<bool> {
        let Some(plan) = self.store.get_plan(expected).await? else {
            return Ok(false);
        };
        Ok(self.fingerprint(&plan.range) == expected)
    }

    /// Re-stamp the open tasks of a stale plan onto `current`.
    pub async fn adopt(&self, stale: &str, current: &str) -> Result<u64> {
        let adopted = self.store.restamp_open_tasks(stale, current).await?;
        debug!(stale = %stale, current = %current, adopted, "Adopted open tasks from stale plan");
        Ok(adopted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fixtures;
    use std::collections::HashSet;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_resolve_range() {
        let earliest = date(2021, 1, 1);
        let today = date(2024, 6, 30);

        assert!(matches!(
            resolve_range(None, Some(today), false, earliest, today),
            Err(PlanningError::NoDateRange)
        ));
        assert_eq!(
            resolve_range(None, None, true, earliest, today).unwrap(),
            DateRange::new(earliest, today).unwrap()
        );
        assert_eq!(
            resolve_range(Some(date(2024, 1, 1)), None, true, earliest, today)
                .unwrap()
                .start,
            date(2024, 1, 1)
        );
        assert!(matches!(
            resolve_range(Some(today), Some(earliest), false, earliest, today),
            Err(PlanningError::InvertedRange { .. })
        ));
    }

    #[test]
    fn test_fingerprint_tracks_config() {
        let range = DateRange::day(date(2024, 1, 15));
        let a = plan_fingerprint(&range, "1", "prod");
        assert_eq!(a, plan_fingerprint(&range, "1", "prod"));
        assert_ne!(a, plan_fingerprint(&range, "2", "prod"));
        assert_ne!(a, plan_fingerprint(&range, "1", "staging"));
    }

    #[test]
    fn test_expand_daily_with_categories() {
        let endpoint = fixtures::endpoint("editais")
            .with_categories("codigoModalidade", vec!["6".into(), "8".into()]);
        let gap = Gap::new("editais", DateRange::new(date(2024, 1, 1), date(2024, 1, 3)).unwrap());

        let tasks = expand_gap(&endpoint, &gap, "fp");
        assert_eq!(tasks.len(), 6);
        let ids: HashSet<_> = tasks.iter().map(|t| t.task_id.clone()).collect();
        assert_eq!(ids.len(), 6);
    }

    #[test]
    fn test_expand_monthly_clips_to_gap() {
        let endpoint = fixtures::endpoint("atas").with_window(TaskWindow::Monthly);
        let gap = Gap::new("atas", DateRange::new(date(2024, 1, 10), date(2024, 1, 31)).unwrap());

        let tasks = expand_gap(&endpoint, &gap, "fp");
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].data_date, date(2024, 1, 10));
        assert_eq!(tasks[0].window_end, date(2024, 1, 31));
    }

    #[tokio::test]
    async fn test_validate_fingerprint() {
        let store = SqliteStore::in_memory().await.unwrap();
        let catalog = fixtures::catalog();
        let planner = TaskPlanner::new(&store, &catalog, "test");
        let range = DateRange::day(date(2024, 1, 15));

        let outcome = planner.plan(&[], &range).await.unwrap();
        assert!(planner.validate_fingerprint(&outcome.fingerprint).await.unwrap());
        assert!(!planner.validate_fingerprint("unknown").await.unwrap());

        let mut bumped = catalog.clone();
        bumped.version = "2".into();
        let planner = TaskPlanner::new(&store, &bumped, "test");
        assert!(!planner.validate_fingerprint(&outcome.fingerprint).await.unwrap());
    }

    #[tokio::test]
    async fn test_unknown_endpoint_is_planning_error() {
        let store = SqliteStore::in_memory().await.unwrap();
        let catalog = fixtures::catalog();
        let planner = TaskPlanner::new(&store, &catalog, "test");
        let range = DateRange::day(date(2024, 1, 15));

        let err = planner
            .plan(&[Gap::new("nope", range)], &range)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            crate::error::HarvestError::Planning(PlanningError::UnknownEndpoint(_))
        ));
    }
}
