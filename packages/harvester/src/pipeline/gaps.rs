//! Gap detection against the completion ledger.

use tracing::{debug, warn};

use crate::traits::ledger::CompletionLedger;
use crate::types::gap::{DateRange, Gap};

/// Finds (endpoint, month) buckets of a range that the ledger has not recorded as complete.
pub struct GapDetector<L> {
    ledger: L,
}

impl<L: CompletionLedger> GapDetector<L> {
    pub fn new(ledger: L) -> Self {
        Self { ledger }
    }

    /// Requested buckets minus completed buckets, clipped to `range`.
    ///
    /// A ledger that cannot be read makes every bucket of that endpoint a gap.
    pub async fn find_gaps(&self, endpoints: &[String], range: &DateRange) -> Vec<Gap> {
        let buckets = range.months();
        let mut gaps = Vec::new();

        for endpoint in endpoints {
            let completed = match self.ledger.completed_buckets(endpoint, range).await {
                Ok(completed) => completed,
                Err(e) => {
                    warn!(
                        endpoint = %endpoint,
                        error = %e,
                        "Completion ledger unavailable, treating whole range as missing"
                    );
                    Default::default()
                }
            };

            for bucket in &buckets {
                if completed.contains(bucket) {
                    continue;
                }
                if let Some(slice) = bucket.range().intersect(range) {
                    gaps.push(Gap::new(endpoint.clone(), slice));
                }
            }
        }

        debug!(gaps = gaps.len(), range = %range, "Gap detection finished");
        gaps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MemoryLedger, UnavailableLedger};
    use crate::types::gap::MonthBucket;
    use chrono::NaiveDate;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[tokio::test]
    async fn test_gaps_are_bucket_aligned_and_clipped() {
        let detector = GapDetector::new(MemoryLedger::new());
        let range = DateRange::new(date(2024, 1, 20), date(2024, 3, 10)).unwrap();

        let gaps = detector.find_gaps(&["e".to_string()], &range).await;

        assert_eq!(gaps.len(), 3);
        assert_eq!(gaps[0].range(), DateRange::new(date(2024, 1, 20), date(2024, 1, 31)).unwrap());
        assert_eq!(gaps[1].range(), MonthBucket::parse("2024-02").unwrap().range());
        assert_eq!(gaps[2].range(), DateRange::new(date(2024, 3, 1), date(2024, 3, 10)).unwrap());
    }

    #[tokio::test]
    async fn test_completed_buckets_are_skipped() {
        let ledger = MemoryLedger::new().with_complete("e", MonthBucket::parse("2024-02").unwrap());
        let detector = GapDetector::new(ledger);
        let range = DateRange::new(date(2024, 1, 1), date(2024, 2, 29)).unwrap();

        let gaps = detector
            .find_gaps(&["e".to_string(), "f".to_string()], &range)
            .await;

        let keys: Vec<(String, String)> = gaps
            .iter()
            .map(|g| (g.endpoint.clone(), g.bucket().key()))
            .collect();
        assert_eq!(
            keys,
            vec![
                ("e".to_string(), "2024-01".to_string()),
                ("f".to_string(), "2024-01".to_string()),
                ("f".to_string(), "2024-02".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_fully_complete_range_has_no_gaps() {
        let ledger = MemoryLedger::new().with_complete("e", MonthBucket::parse("2024-01").unwrap());
        let detector = GapDetector::new(ledger);
        let range = DateRange::day(date(2024, 1, 15));

        assert!(detector.find_gaps(&["e".to_string()], &range).await.is_empty());
        assert!(detector.find_gaps(&["e".to_string()], &range).await.is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_ledger_fails_closed() {
        let detector = GapDetector::new(UnavailableLedger);
        let range = DateRange::new(date(2024, 1, 1), date(2024, 2, 29)).unwrap();

        let gaps = detector.find_gaps(&["e".to_string()], &range).await;
        assert_eq!(gaps.len(), 2);
    }
}
