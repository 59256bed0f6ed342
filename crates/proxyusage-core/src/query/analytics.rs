//! Rollup-backed analytics reports
//!
//! Every report reads the rollup table matching its bucket width and retries on
//! raw records when that read fails.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use tracing::warn;

use super::{non_blank, parse_int};
use crate::collector::{CostEstimator, TokenUsage};
use crate::db::{AggregateQuery, AggregateRow, GroupBy, Predicate, SortOrder, Source, UsageStore};
use crate::error::{Error, FieldError, Result};
use crate::models::{
    CostTrendPoint, ErrorPoint, FailureDimension, Interval, TokenBreakdownPoint, TopFailure,
};
use crate::rollup::BucketClock;

/// Longest accepted look-back, in hours
pub const MAX_HOURS: u32 = 90 * 24;
/// Largest top-failures list
pub const MAX_LIMIT: u32 = 100;

/// Raw analytics query string
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsRequest {
    /// Window in hours
    pub hours: Option<String>,
    /// `hour` or `day`
    pub interval: Option<String>,
    /// Exact model filter
    pub model: Option<String>,
    /// Exact route filter
    pub route: Option<String>,
    /// Top failures dimension, `model` or `route`
    pub group_by: Option<String>,
    /// Top failures row count
    pub limit: Option<String>,
}

fn hours(request: &AnalyticsRequest, default: u32, errors: &mut Vec<FieldError>) -> u32 {
    parse_int("hours", request.hours.as_deref(), errors).map_or(default, |h| {
        u32::try_from(h.clamp(1, i64::from(MAX_HOURS))).unwrap_or(default)
    })
}

fn interval(request: &AnalyticsRequest, default: Interval, errors: &mut Vec<FieldError>) -> Interval {
    match non_blank(request.interval.as_deref()) {
        None => default,
        Some(value) => Interval::parse(&value).unwrap_or_else(|| {
            errors.push(FieldError::new("interval", "expected hour or day"));
            default
        }),
    }
}

fn finish<T>(params: T, errors: Vec<FieldError>) -> Result<T> {
    if errors.is_empty() {
        Ok(params)
    } else {
        Err(Error::Validation(errors))
    }
}

/// Success/failure series parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorSeriesParams {
    /// Window in hours, 1..=2160
    pub hours: u32,
    /// Bucket width
    pub interval: Interval,
    /// Exact model filter
    pub model: Option<String>,
    /// Exact route filter
    pub route: Option<String>,
}

impl ErrorSeriesParams {
    /// Validate a request; defaults to 168 hours by day
    pub fn parse(request: &AnalyticsRequest) -> Result<Self> {
        let mut errors = Vec::new();
        let params = Self {
            hours: hours(request, 168, &mut errors),
            interval: interval(request, Interval::Day, &mut errors),
            model: non_blank(request.model.as_deref()),
            route: non_blank(request.route.as_deref()),
        };
        finish(params, errors)
    }
}

/// Top failures parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopFailureParams {
    /// Window in hours, 1..=2160
    pub hours: u32,
    /// Ranked dimension
    pub dimension: FailureDimension,
    /// Rows returned, 1..=100
    pub limit: u32,
}

impl TopFailureParams {
    /// Validate a request; defaults to 168 hours, by model, 10 rows
    pub fn parse(request: &AnalyticsRequest) -> Result<Self> {
        let mut errors = Vec::new();
        let dimension = match non_blank(request.group_by.as_deref()) {
            None => FailureDimension::Model,
            Some(value) => FailureDimension::parse(&value).unwrap_or_else(|| {
                errors.push(FieldError::new("groupBy", "expected model or route"));
                FailureDimension::Model
            }),
        };
        let limit = parse_int("limit", request.limit.as_deref(), &mut errors)
            .map_or(10, |l| u32::try_from(l.clamp(1, i64::from(MAX_LIMIT))).unwrap_or(10));
        let params = Self {
            hours: hours(request, 168, &mut errors),
            dimension,
            limit,
        };
        finish(params, errors)
    }
}

/// Token breakdown parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenBreakdownParams {
    /// Window in hours, 1..=2160
    pub hours: u32,
    /// Bucket width
    pub interval: Interval,
    /// Exact model filter
    pub model: Option<String>,
    /// Exact route filter
    pub route: Option<String>,
}

impl TokenBreakdownParams {
    /// Validate a request; defaults to 24 hours by hour
    pub fn parse(request: &AnalyticsRequest) -> Result<Self> {
        let mut errors = Vec::new();
        let params = Self {
            hours: hours(request, 24, &mut errors),
            interval: interval(request, Interval::Hour, &mut errors),
            model: non_blank(request.model.as_deref()),
            route: non_blank(request.route.as_deref()),
        };
        finish(params, errors)
    }
}

/// Cost trend parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CostTrendParams {
    /// Window in hours, 1..=2160
    pub hours: u32,
    /// Bucket width
    pub interval: Interval,
    /// Exact route filter
    pub route: Option<String>,
}

impl CostTrendParams {
    /// Validate a request; defaults to 168 hours by day
    pub fn parse(request: &AnalyticsRequest) -> Result<Self> {
        let mut errors = Vec::new();
        let params = Self {
            hours: hours(request, 168, &mut errors),
            interval: interval(request, Interval::Day, &mut errors),
            route: non_blank(request.route.as_deref()),
        };
        finish(params, errors)
    }
}

#[allow(clippy::cast_precision_loss)]
fn rate(part: i64, total: i64) -> f64 {
    if total > 0 {
        part as f64 / total as f64
    } else {
        0.0
    }
}

/// Runs analytics reports
pub struct AnalyticsService {
    store: Arc<dyn UsageStore>,
    clock: BucketClock,
    read_rollups: bool,
}

impl AnalyticsService {
    /// Create a service; with `read_rollups` false every report reads raw records
    pub fn new(store: Arc<dyn UsageStore>, clock: BucketClock, read_rollups: bool) -> Self {
        Self {
            store,
            clock,
            read_rollups,
        }
    }

    fn source(&self, interval: Interval) -> Source {
        if self.read_rollups {
            Source::rollup(interval)
        } else {
            Source::Raw
        }
    }

    fn window(
        &self,
        hours: u32,
        now: DateTime<Utc>,
        model: Option<&String>,
        route: Option<&String>,
    ) -> Vec<Predicate> {
        let mut predicates = vec![Predicate::Since(now - Duration::hours(i64::from(hours)))];
        predicates.extend(model.cloned().map(Predicate::ModelEq));
        predicates.extend(route.cloned().map(Predicate::RouteEq));
        predicates
    }

    async fn aggregate(&self, query: AggregateQuery) -> Result<Vec<AggregateRow>> {
        match self.store.aggregate(&query).await {
            Ok(rows) => Ok(rows),
            Err(e) if query.source.is_rollup() => {
                warn!(error = %e, table = query.source.table(), "Rollup query failed, falling back to raw records");
                metrics::counter!("proxyusage_overview_fallback_total").increment(1);
                let raw = AggregateQuery {
                    source: Source::Raw,
                    ..query
                };
                self.store.aggregate(&raw).await
            }
            Err(e) => Err(e),
        }
    }

    fn bucket_label(&self, row: &AggregateRow) -> String {
        row.bucket.map(|b| self.clock.render(b)).unwrap_or_default()
    }

    /// Success/failure counts per bucket
    pub async fn error_series(&self, params: &ErrorSeriesParams, now: DateTime<Utc>) -> Result<Vec<ErrorPoint>> {
        let query = AggregateQuery::new(self.source(params.interval))
            .filter(self.window(params.hours, now, params.model.as_ref(), params.route.as_ref()))
            .group(GroupBy::time(params.interval));

        Ok(self
            .aggregate(query)
            .await?
            .iter()
            .map(|row| {
                let c = &row.counters;
                ErrorPoint {
                    bucket: self.bucket_label(row),
                    success_count: c.success_count,
                    failure_count: c.failure_count,
                    total_requests: c.total_requests,
                    success_rate: rate(c.success_count, c.total_requests),
                    error_rate: rate(c.failure_count, c.total_requests),
                }
            })
            .collect())
    }

    /// Models or routes with the most failures, read from daily buckets
    pub async fn top_failures(&self, params: &TopFailureParams, now: DateTime<Utc>) -> Result<Vec<TopFailure>> {
        let group = match params.dimension {
            FailureDimension::Model => GroupBy::model(),
            FailureDimension::Route => GroupBy::route(),
        };
        let query = AggregateQuery::new(self.source(Interval::Day))
            .filter(self.window(params.hours, now, None, None))
            .group(group)
            .order(SortOrder::FailuresDesc)
            .limit(params.limit as usize);

        Ok(self
            .aggregate(query)
            .await?
            .into_iter()
            .map(|row| TopFailure {
                model: row.model,
                route: row.route,
                failure_count: row.counters.failure_count,
                total_requests: row.counters.total_requests,
                error_rate: rate(row.counters.failure_count, row.counters.total_requests),
            })
            .collect())
    }

    /// Token kinds per bucket
    pub async fn token_breakdown(
        &self,
        params: &TokenBreakdownParams,
        now: DateTime<Utc>,
    ) -> Result<Vec<TokenBreakdownPoint>> {
        let query = AggregateQuery::new(self.source(params.interval))
            .filter(self.window(params.hours, now, params.model.as_ref(), params.route.as_ref()))
            .group(GroupBy::time(params.interval));

        Ok(self
            .aggregate(query)
            .await?
            .iter()
            .map(|row| TokenBreakdownPoint {
                bucket: self.bucket_label(row),
                input_tokens: row.counters.input_tokens,
                output_tokens: row.counters.output_tokens,
                reasoning_tokens: row.counters.reasoning_tokens,
                cached_tokens: row.counters.cached_tokens,
                total_tokens: row.counters.total_tokens,
            })
            .collect())
    }

    /// Cost per model per bucket
    pub async fn cost_trend(&self, params: &CostTrendParams, now: DateTime<Utc>) -> Result<Vec<CostTrendPoint>> {
        let query = AggregateQuery::new(self.source(params.interval))
            .filter(self.window(params.hours, now, None, params.route.as_ref()))
            .group(GroupBy::time_model(params.interval));

        let (rows, prices) = tokio::try_join!(self.aggregate(query), self.store.list_prices())?;
        let estimator = CostEstimator::new(prices);

        Ok(rows
            .iter()
            .map(|row| {
                let model = row.model.clone().unwrap_or_default();
                let estimate = estimator.estimate(
                    TokenUsage {
                        input: row.counters.input_tokens,
                        cached: row.counters.cached_tokens,
                        output: row.counters.output_tokens,
                    },
                    &model,
                );
                CostTrendPoint {
                    bucket: self.bucket_label(row),
                    model,
                    cost: estimate.cost,
                    priced: estimate.priced,
                    tokens: row.counters.total_tokens,
                }
            })
            .collect())
    }
}
