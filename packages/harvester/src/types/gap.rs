//! Date ranges, month buckets and gaps.

use std::fmt;

use chrono::{Datelike, Months, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::error::PlanningError;

/// Inclusive calendar date range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, PlanningError> {
        if start > end {
            return Err(PlanningError::InvertedRange { start, end });
        }
        Ok(Self { start, end })
    }

    /// A single-day range.
    pub fn day(date: NaiveDate) -> Self {
        Self {
            start: date,
            end: date,
        }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }

    pub fn intersect(&self, other: &DateRange) -> Option<DateRange> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        (start <= end).then_some(DateRange { start, end })
    }

    /// Every day in the range, in order.
    pub fn days(&self) -> impl Iterator<Item = NaiveDate> + '_ {
        self.start
            .iter_days()
            .take_while(move |day| *day <= self.end)
    }

    /// Month buckets overlapping the range, in order.
    pub fn months(&self) -> Vec<MonthBucket> {
        let mut buckets = Vec::new();
        let mut bucket = MonthBucket::of(self.start);
        let last = MonthBucket::of(self.end);
        while bucket <= last {
            buckets.push(bucket);
            bucket = bucket.next();
        }
        buckets
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..={}", self.start, self.end)
    }
}

/// Calendar month used as the completion-ledger time bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MonthBucket {
    pub year: i32,
    pub month: u32,
}

impl MonthBucket {
    pub fn of(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    pub fn first_day(&self) -> NaiveDate {
        NaiveDate::from_ymd_opt(self.year, self.month, 1).unwrap_or(NaiveDate::MIN)
    }

    pub fn last_day(&self) -> NaiveDate {
        self.first_day()
            .checked_add_months(Months::new(1))
            .and_then(|next| next.pred_opt())
            .unwrap_or(NaiveDate::MAX)
    }

    pub fn range(&self) -> DateRange {
        DateRange {
            start: self.first_day(),
            end: self.last_day(),
        }
    }

    pub fn next(&self) -> Self {
        if self.month == 12 {
            Self {
                year: self.year + 1,
                month: 1,
            }
        } else {
            Self {
                year: self.year,
                month: self.month + 1,
            }
        }
    }

    /// Ledger key, `YYYY-MM`.
    pub fn key(&self) -> String {
        format!("{:04}-{:02}", self.year, self.month)
    }

    pub fn parse(key: &str) -> Option<Self> {
        let (year, month) = key.split_once('-')?;
        let year = year.parse().ok()?;
        let month = month.parse().ok()?;
        (1..=12).contains(&month).then_some(Self { year, month })
    }
}

impl fmt::Display for MonthBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// A missing, bucket-aligned slice of time for one endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Gap {
    pub endpoint: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    /// Set when the gap is known to be page-level only.
    pub missing_pages: Option<Vec<u32>>,
}

impl Gap {
    pub fn new(endpoint: impl Into<String>, range: DateRange) -> Self {
        Self {
            endpoint: endpoint.into(),
            start_date: range.start,
            end_date: range.end,
            missing_pages: None,
        }
    }

    pub fn range(&self) -> DateRange {
        DateRange {
            start: self.start_date,
            end: self.end_date,
        }
    }

    pub fn bucket(&self) -> MonthBucket {
        MonthBucket::of(self.start_date)
    }
}
