//! Usage event and rollup data models

use std::iter::Sum;
use std::ops::{Add, AddAssign};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Token and request counters shared by raw events and rollup buckets
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageCounters {
    /// Total tokens as reported upstream
    pub total_tokens: i64,
    /// Prompt tokens
    pub input_tokens: i64,
    /// Completion tokens
    pub output_tokens: i64,
    /// Reasoning tokens
    pub reasoning_tokens: i64,
    /// Prompt tokens served from cache
    pub cached_tokens: i64,
    /// Number of requests
    pub total_requests: i64,
    /// Successful requests
    pub success_count: i64,
    /// Failed requests
    pub failure_count: i64,
}

impl UsageCounters {
    /// Counters for a single request
    pub fn single_request(failed: bool) -> Self {
        Self {
            total_requests: 1,
            success_count: i64::from(!failed),
            failure_count: i64::from(failed),
            ..Self::default()
        }
    }

    /// Whether every counter is zero
    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }
}

impl AddAssign for UsageCounters {
    fn add_assign(&mut self, rhs: Self) {
        self.total_tokens += rhs.total_tokens;
        self.input_tokens += rhs.input_tokens;
        self.output_tokens += rhs.output_tokens;
        self.reasoning_tokens += rhs.reasoning_tokens;
        self.cached_tokens += rhs.cached_tokens;
        self.total_requests += rhs.total_requests;
        self.success_count += rhs.success_count;
        self.failure_count += rhs.failure_count;
    }
}

impl Add for UsageCounters {
    type Output = Self;

    fn add(mut self, rhs: Self) -> Self {
        self += rhs;
        self
    }
}

impl Sum for UsageCounters {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::default(), Add::add)
    }
}

impl<'a> Sum<&'a UsageCounters> for UsageCounters {
    fn sum<I: Iterator<Item = &'a Self>>(iter: I) -> Self {
        iter.copied().sum()
    }
}

/// Uniqueness key of a raw usage event
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventKey {
    /// When the request happened
    pub occurred_at: DateTime<Utc>,
    /// Upstream API route (key)
    pub route: String,
    /// Model name
    pub model: String,
}

/// One normalized upstream usage record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageEvent {
    /// When the request happened
    pub occurred_at: DateTime<Utc>,
    /// Upstream API route (key)
    pub route: String,
    /// Model name
    pub model: String,
    /// Token and request counters
    #[serde(flatten)]
    pub counters: UsageCounters,
    /// Whether the request failed
    pub is_error: bool,
    /// Original upstream record
    pub raw: serde_json::Value,
}

impl UsageEvent {
    /// The `(occurredAt, route, model)` uniqueness key
    pub fn key(&self) -> EventKey {
        EventKey {
            occurred_at: self.occurred_at,
            route: self.route.clone(),
            model: self.model.clone(),
        }
    }
}

/// A parsed upstream report, stamped with the time it was pulled
#[derive(Debug, Clone, PartialEq)]
pub struct SyncBatch {
    /// Shared marker written to every row inserted by this batch
    pub synced_at: DateTime<Utc>,
    /// Candidate events
    pub events: Vec<UsageEvent>,
    /// Records dropped because their timestamp was missing or malformed
    pub rejected: usize,
}

impl SyncBatch {
    /// Number of candidate rows
    pub fn attempted(&self) -> u64 {
        self.events.len() as u64
    }
}

/// Result of committing a batch to the raw store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncOutcome {
    /// Rows that were actually new
    pub inserted: u64,
    /// Rows offered to the store
    pub attempted: u64,
}

impl SyncOutcome {
    /// Rows skipped because their key already existed
    pub fn skipped(&self) -> u64 {
        self.attempted.saturating_sub(self.inserted)
    }
}

/// Sync response returned to the caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// Always `ok` for a completed sync
    pub status: &'static str,
    /// Newly inserted rows
    pub inserted: u64,
    /// Candidate rows
    pub attempted: u64,
    /// Records dropped by the parser
    pub rejected: u64,
    /// Informational message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Bucket width used by rollups and time series
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Interval {
    /// One hour
    Hour,
    /// One civil day
    Day,
}

impl Interval {
    /// Width in seconds
    pub fn seconds(self) -> i64 {
        match self {
            Self::Hour => 3_600,
            Self::Day => 86_400,
        }
    }

    /// Parse `hour`/`day` (also accepts `hourly`/`daily`)
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "hour" | "hourly" => Some(Self::Hour),
            "day" | "daily" => Some(Self::Day),
            _ => None,
        }
    }

    /// Rollup table name for this width
    pub fn table(self) -> &'static str {
        match self {
            Self::Hour => "usage_hourly_agg",
            Self::Day => "usage_daily_agg",
        }
    }
}

impl std::fmt::Display for Interval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Hour => write!(f, "hour"),
            Self::Day => write!(f, "day"),
        }
    }
}

/// Key of an hourly or daily rollup bucket
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollupKey {
    /// Bucket start, aligned in the reference offset
    pub bucket_start: DateTime<Utc>,
    /// Upstream API route
    pub route: String,
    /// Model name
    pub model: String,
}

/// Counters to add to one rollup bucket
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RollupDelta {
    /// Target bucket
    pub key: RollupKey,
    /// Amount to add
    pub counters: UsageCounters,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_add() {
        let a = UsageCounters {
            total_tokens: 10,
            input_tokens: 6,
            output_tokens: 4,
            ..UsageCounters::single_request(false)
        };
        let b = UsageCounters::single_request(true);
        let sum = a + b;
        assert_eq!(sum.total_tokens, 10);
        assert_eq!(sum.total_requests, 2);
        assert_eq!(sum.success_count, 1);
        assert_eq!(sum.failure_count, 1);
        assert_eq!([a, b].iter().sum::<UsageCounters>(), sum);
    }

    #[test]
    fn test_interval_parse() {
        assert_eq!(Interval::parse("hour"), Some(Interval::Hour));
        assert_eq!(Interval::parse("Daily"), Some(Interval::Day));
        assert_eq!(Interval::parse("week"), None);
    }

    #[test]
    fn test_outcome_skipped() {
        let outcome = SyncOutcome {
            inserted: 3,
            attempted: 5,
        };
        assert_eq!(outcome.skipped(), 2);
    }
}
