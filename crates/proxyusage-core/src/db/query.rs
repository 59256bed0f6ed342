//! Storage-independent description of grouped aggregations
//!
//! The planner picks a [`Source`], composes [`Predicate`]s and a [`GroupBy`];
//! each store evaluates the same query against whichever table was chosen.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::{Interval, UsageCounters};
use crate::rollup::BucketClock;

/// Table an aggregation reads from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    /// `usage_records`
    Raw,
    /// `usage_hourly_agg`
    Hourly,
    /// `usage_daily_agg`
    Daily,
}

impl Source {
    /// Whether this reads a rollup table
    pub fn is_rollup(self) -> bool {
        !matches!(self, Self::Raw)
    }

    /// Rollup table for a bucket width
    pub fn rollup(interval: Interval) -> Self {
        match interval {
            Interval::Hour => Self::Hourly,
            Interval::Day => Self::Daily,
        }
    }

    /// Table name
    pub fn table(self) -> &'static str {
        match self {
            Self::Raw => "usage_records",
            Self::Hourly => "usage_hourly_agg",
            Self::Daily => "usage_daily_agg",
        }
    }

    /// Time column of the table
    pub fn time_column(self) -> &'static str {
        match self {
            Self::Raw => "occurred_at",
            Self::Hourly => "bucket_start",
            Self::Daily => "day_start",
        }
    }
}

/// A filter applied uniformly to any source
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    /// Time column `>=`
    Since(DateTime<Utc>),
    /// Time column `<=`
    Until(DateTime<Utc>),
    /// Exact model
    ModelEq(String),
    /// Exact route
    RouteEq(String),
}

impl Predicate {
    /// Evaluate against one row's time, route and model
    pub fn matches(&self, time: DateTime<Utc>, route: &str, model: &str) -> bool {
        match self {
            Self::Since(since) => time >= *since,
            Self::Until(until) => time <= *until,
            Self::ModelEq(m) => model == m,
            Self::RouteEq(r) => route == r,
        }
    }
}

/// Grouping dimensions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct GroupBy {
    /// Bucket the time column to this width
    pub time: Option<Interval>,
    /// Group by model
    pub model: bool,
    /// Group by route
    pub route: bool,
}

impl GroupBy {
    /// A single totals row
    pub fn total() -> Self {
        Self::default()
    }

    /// One row per model
    pub fn model() -> Self {
        Self {
            model: true,
            ..Self::default()
        }
    }

    /// One row per route
    pub fn route() -> Self {
        Self {
            route: true,
            ..Self::default()
        }
    }

    /// One row per time bucket
    pub fn time(interval: Interval) -> Self {
        Self {
            time: Some(interval),
            ..Self::default()
        }
    }

    /// One row per time bucket and model
    pub fn time_model(interval: Interval) -> Self {
        Self {
            time: Some(interval),
            model: true,
            route: false,
        }
    }
}

/// Result ordering
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortOrder {
    /// Ascending by bucket, then model, then route
    #[default]
    Key,
    /// Most failures first, ties by key
    FailuresDesc,
}

/// A grouped aggregation over one source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateQuery {
    /// Table to read
    pub source: Source,
    /// Filters, combined with AND
    pub predicates: Vec<Predicate>,
    /// Grouping dimensions
    pub group_by: GroupBy,
    /// Row order
    pub order: SortOrder,
    /// Maximum rows
    pub limit: Option<usize>,
}

impl AggregateQuery {
    /// Query `source` with no filters, producing one totals row
    pub fn new(source: Source) -> Self {
        Self {
            source,
            predicates: Vec::new(),
            group_by: GroupBy::total(),
            order: SortOrder::Key,
            limit: None,
        }
    }

    /// Add filters
    #[must_use]
    pub fn filter(mut self, predicates: impl IntoIterator<Item = Predicate>) -> Self {
        self.predicates.extend(predicates);
        self
    }

    /// Set grouping
    #[must_use]
    pub fn group(mut self, group_by: GroupBy) -> Self {
        self.group_by = group_by;
        self
    }

    /// Set ordering
    #[must_use]
    pub fn order(mut self, order: SortOrder) -> Self {
        self.order = order;
        self
    }

    /// Limit the number of rows
    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// One aggregated row; dimensions not grouped on are `None`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateRow {
    /// Bucket start when grouped by time
    pub bucket: Option<DateTime<Utc>>,
    /// Model when grouped by model
    pub model: Option<String>,
    /// Route when grouped by route
    pub route: Option<String>,
    /// Summed counters
    pub counters: UsageCounters,
}

/// A row an in-process evaluator can aggregate
pub(crate) struct RowRef<'a> {
    pub time: DateTime<Utc>,
    pub route: &'a str,
    pub model: &'a str,
    pub counters: UsageCounters,
}

type GroupKey = (Option<DateTime<Utc>>, Option<String>, Option<String>);

/// Evaluate a query over in-memory rows
pub(crate) fn evaluate<'a>(
    query: &AggregateQuery,
    clock: &BucketClock,
    rows: impl Iterator<Item = RowRef<'a>>,
) -> Vec<AggregateRow> {
    let mut groups: BTreeMap<GroupKey, UsageCounters> = BTreeMap::new();
    let mut matched = false;

    for row in rows {
        if !query
            .predicates
            .iter()
            .all(|p| p.matches(row.time, row.route, row.model))
        {
            continue;
        }
        matched = true;
        let key = (
            query.group_by.time.map(|i| clock.truncate(row.time, i)),
            query.group_by.model.then(|| row.model.to_string()),
            query.group_by.route.then(|| row.route.to_string()),
        );
        *groups.entry(key).or_default() += row.counters;
    }

    // Ungrouped totals always yield exactly one row
    if !matched && query.group_by == GroupBy::total() {
        groups.insert((None, None, None), UsageCounters::default());
    }

    let mut out: Vec<AggregateRow> = groups
        .into_iter()
        .map(|((bucket, model, route), counters)| AggregateRow {
            bucket,
            model,
            route,
            counters,
        })
        .collect();

    if query.order == SortOrder::FailuresDesc {
        out.sort_by(|a, b| b.counters.failure_count.cmp(&a.counters.failure_count));
    }
    if let Some(limit) = query.limit {
        out.truncate(limit);
    }
    out
}
