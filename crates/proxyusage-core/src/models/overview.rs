//! Overview request and response models

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Default relative window, in days
pub const DEFAULT_DAYS: u32 = 14;
/// Largest relative window, in days
pub const MAX_DAYS: u32 = 90;
/// Default per-model page size
pub const DEFAULT_PAGE_SIZE: u32 = 10;
/// Smallest accepted page size
pub const MIN_PAGE_SIZE: u32 = 5;
/// Largest accepted page size
pub const MAX_PAGE_SIZE: u32 = 500;

/// Raw overview query as received from a client
///
/// Everything is kept as text so malformed values can be reported per field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverviewRequest {
    /// Relative window length in days
    pub days: Option<String>,
    /// Custom range start date
    pub start: Option<String>,
    /// Custom range end date
    pub end: Option<String>,
    /// Model filter
    pub model: Option<String>,
    /// Route filter
    pub route: Option<String>,
    /// 1-based page of the per-model list
    pub page: Option<String>,
    /// Per-model page size
    pub page_size: Option<String>,
    /// `1` forces rollups, `0` forces raw records
    pub preagg: Option<String>,
}

/// Which storage path the caller wants
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourcePreference {
    /// Let the planner decide
    #[default]
    Auto,
    /// Raw usage records only
    Raw,
    /// Rollup tables
    Rollup,
}

impl SourcePreference {
    /// Parse the `preagg` flag (`1`/`0`, `rollup`/`raw`, `auto`)
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "auto" => Some(Self::Auto),
            "1" | "true" | "rollup" | "agg" => Some(Self::Rollup),
            "0" | "false" | "raw" => Some(Self::Raw),
            _ => None,
        }
    }
}

/// Time window of an overview
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeRange {
    /// The last `days * 24h`, open ended
    Relative {
        /// Window length
        days: u32,
    },
    /// Whole local days from `start` to `end`, inclusive
    Custom {
        /// First local day
        start: NaiveDate,
        /// Last local day
        end: NaiveDate,
    },
}

impl TimeRange {
    /// Number of days covered (inclusive for custom ranges)
    pub fn days(&self) -> u32 {
        match self {
            Self::Relative { days } => *days,
            Self::Custom { start, end } => {
                let span = (*end - *start).num_days() + 1;
                u32::try_from(span.max(1)).unwrap_or(u32::MAX)
            }
        }
    }

    /// Whether this is an explicit start/end range
    pub fn is_custom(&self) -> bool {
        matches!(self, Self::Custom { .. })
    }
}

/// Validated, normalized overview parameters
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OverviewParams {
    /// Time window
    pub range: TimeRange,
    /// Model filter
    pub model: Option<String>,
    /// Route filter
    pub route: Option<String>,
    /// 1-based page
    pub page: u32,
    /// Page size
    pub page_size: u32,
    /// Forced storage path
    pub source: SourcePreference,
}

impl Default for OverviewParams {
    fn default() -> Self {
        Self {
            range: TimeRange::Relative { days: DEFAULT_DAYS },
            model: None,
            route: None,
            page: 1,
            page_size: DEFAULT_PAGE_SIZE,
            source: SourcePreference::Auto,
        }
    }
}

/// Clamp a relative window length
pub fn normalize_days(days: Option<i64>) -> u32 {
    days.map_or(DEFAULT_DAYS, |d| {
        u32::try_from(d.clamp(1, i64::from(MAX_DAYS))).unwrap_or(DEFAULT_DAYS)
    })
}

/// Clamp a page number
pub fn normalize_page(page: Option<i64>) -> u32 {
    page.map_or(1, |p| u32::try_from(p.clamp(1, i64::from(u32::MAX))).unwrap_or(1))
}

/// Clamp a page size
pub fn normalize_page_size(size: Option<i64>) -> u32 {
    size.map_or(DEFAULT_PAGE_SIZE, |s| {
        u32::try_from(s.clamp(i64::from(MIN_PAGE_SIZE), i64::from(MAX_PAGE_SIZE)))
            .unwrap_or(DEFAULT_PAGE_SIZE)
    })
}

/// Storage path that produced a result
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ServedFrom {
    /// Raw usage records
    #[default]
    Raw,
    /// Rollups, after a failed attempt fell back to raw records
    RawFallback,
    /// Daily rollups with hourly rollups for the hourly series
    DailyPlusHourly,
    /// Hourly rollups only
    HourlyOnly,
}

/// Full overview response
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OverviewResult {
    /// Totals, per-model list and series
    pub overview: UsageOverview,
    /// True when no request matched
    pub empty: bool,
    /// Days covered
    pub days: u32,
    /// Pagination metadata
    pub meta: OverviewMeta,
    /// Values available for the model/route filters
    pub filters: AvailableFilters,
    /// Storage path used; not part of the wire format
    #[serde(skip)]
    pub served_from: ServedFrom,
}

/// Totals and series of an overview
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageOverview {
    /// Requests over every matching model
    pub total_requests: i64,
    /// Tokens over every matching model
    pub total_tokens: i64,
    /// Input tokens
    pub total_input_tokens: i64,
    /// Output tokens
    pub total_output_tokens: i64,
    /// Reasoning tokens
    pub total_reasoning_tokens: i64,
    /// Cached input tokens
    pub total_cached_tokens: i64,
    /// Successful requests
    pub success_count: i64,
    /// Failed requests
    pub failure_count: i64,
    /// `success_count / total_requests`, or 1 with no requests
    pub success_rate: f64,
    /// Cost over every matching model, rounded to 4 decimals
    pub total_cost: f64,
    /// Matching models without a price entry
    pub unpriced_models: Vec<String>,
    /// Current page of the per-model breakdown
    pub models: Vec<ModelUsage>,
    /// Daily series
    pub by_day: Vec<DayPoint>,
    /// Hourly series
    pub by_hour: Vec<HourPoint>,
}

/// Usage of one model
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelUsage {
    /// Model name
    pub model: String,
    /// Requests
    pub requests: i64,
    /// Total tokens
    pub tokens: i64,
    /// Input tokens
    pub input_tokens: i64,
    /// Output tokens
    pub output_tokens: i64,
    /// Cached input tokens
    pub cached_tokens: i64,
    /// Estimated cost, rounded to 4 decimals
    pub cost: f64,
    /// False when no price entry matched, so `cost` is not meaningful
    pub priced: bool,
}

/// One day of the daily series
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DayPoint {
    /// Local date, `YYYY-MM-DD`
    pub label: String,
    /// Requests
    pub requests: i64,
    /// Total tokens
    pub tokens: i64,
    /// Rounded to 2 decimals
    pub cost: f64,
}

/// One hour of the hourly series
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HourPoint {
    /// Local `MM-DD HH`
    pub label: String,
    /// Bucket start
    pub timestamp: DateTime<Utc>,
    /// Requests
    pub requests: i64,
    /// Total tokens
    pub tokens: i64,
    /// Input tokens
    pub input_tokens: i64,
    /// Output tokens
    pub output_tokens: i64,
    /// Reasoning tokens
    pub reasoning_tokens: i64,
    /// Cached input tokens
    pub cached_tokens: i64,
}

/// Pagination metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OverviewMeta {
    /// Current page, 1-based
    pub page: u32,
    /// Models per page
    pub page_size: u32,
    /// Distinct models before pagination
    pub total_models: u64,
    /// `ceil(total_models / page_size)`, at least 1
    pub total_pages: u64,
}

impl OverviewMeta {
    /// Build pagination metadata
    pub fn new(page: u32, page_size: u32, total_models: u64) -> Self {
        let total_pages = total_models.div_ceil(u64::from(page_size.max(1))).max(1);
        Self {
            page,
            page_size,
            total_models,
            total_pages,
        }
    }
}

/// Filter values present in the base range
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AvailableFilters {
    /// Distinct model names, sorted
    pub models: Vec<String>,
    /// Distinct route names, sorted
    pub routes: Vec<String>,
}
