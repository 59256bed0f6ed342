//! Query planning over raw records and rollups
//!
//! [`OverviewBuilder`] chooses a [`Strategy`], runs its aggregations
//! concurrently and assembles the overview. A failed rollup read is retried on
//! raw records with the same output shape.

pub mod analytics;
pub mod cache;
pub mod vitals;

pub use analytics::{
    AnalyticsRequest, AnalyticsService, CostTrendParams, ErrorSeriesParams, TokenBreakdownParams,
    TopFailureParams,
};
pub use cache::ResultCache;
pub use vitals::{
    SummaryGrouping, VitalsReporter, VitalsRequest, VitalsSummary, VitalsSummaryParams,
    VitalsTimeseriesParams,
};

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde_json::json;
use tracing::{debug, instrument, warn};

use crate::collector::{round_to, CostEstimator, TokenUsage};
use crate::db::{AggregateQuery, AggregateRow, GroupBy, Predicate, Source, UsageStore};
use crate::error::{Error, FieldError, Result};
use crate::models::{
    normalize_days, normalize_page, normalize_page_size, AvailableFilters, DayPoint, HourPoint,
    Interval, ModelUsage, OverviewMeta, OverviewParams, OverviewRequest, OverviewResult,
    ServedFrom, SourcePreference, TimeRange, UsageCounters, UsageOverview,
};
use crate::rollup::BucketClock;

/// Storage path of an overview
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Strategy {
    /// Raw usage records for everything
    Raw,
    /// Daily rollups for totals, models and days; hourly rollups for hours
    DailyPlusHourly,
    /// Hourly rollups for everything
    HourlyOnly,
}

impl Strategy {
    /// Rollup strategy for a time range
    pub fn for_range(range: &TimeRange) -> Self {
        if range.is_custom() {
            Self::DailyPlusHourly
        } else {
            Self::HourlyOnly
        }
    }

    /// Source of totals, per-model and daily aggregates
    pub fn aggregate_source(self) -> Source {
        match self {
            Self::Raw => Source::Raw,
            Self::DailyPlusHourly => Source::Daily,
            Self::HourlyOnly => Source::Hourly,
        }
    }

    /// Source of the hourly series
    pub fn hourly_source(self) -> Source {
        match self {
            Self::Raw => Source::Raw,
            Self::DailyPlusHourly | Self::HourlyOnly => Source::Hourly,
        }
    }

    fn served_from(self) -> ServedFrom {
        match self {
            Self::Raw => ServedFrom::Raw,
            Self::DailyPlusHourly => ServedFrom::DailyPlusHourly,
            Self::HourlyOnly => ServedFrom::HourlyOnly,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::DailyPlusHourly => "daily+hourly",
            Self::HourlyOnly => "hourly",
        }
    }
}

/// Parse an optional integer query parameter
pub(crate) fn parse_int(
    field: &str,
    value: Option<&str>,
    errors: &mut Vec<FieldError>,
) -> Option<i64> {
    let value = value.map(str::trim).filter(|v| !v.is_empty())?;
    match value.parse::<i64>() {
        Ok(n) => Some(n),
        Err(_) => {
            errors.push(FieldError::new(field, "expected an integer"));
            None
        }
    }
}

/// Parse an optional filter value, treating blanks as absent
pub(crate) fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Parse `YYYY-MM-DD` or an RFC 3339 timestamp into a local date
fn parse_date(value: &str, clock: &BucketClock) -> Option<NaiveDate> {
    let value = value.trim();
    NaiveDate::parse_from_str(value, "%Y-%m-%d").ok().or_else(|| {
        DateTime::parse_from_rfc3339(value)
            .ok()
            .map(|ts| clock.local_date(ts.with_timezone(&Utc)))
    })
}

/// Validate and normalize a raw overview request
pub fn normalize_request(request: &OverviewRequest, clock: &BucketClock) -> Result<OverviewParams> {
    let mut errors = Vec::new();

    let days = parse_int("days", request.days.as_deref(), &mut errors);
    let page = parse_int("page", request.page.as_deref(), &mut errors);
    let page_size = parse_int("pageSize", request.page_size.as_deref(), &mut errors);

    let source = match request.preagg.as_deref() {
        None => SourcePreference::Auto,
        Some(raw) => SourcePreference::parse(raw).unwrap_or_else(|| {
            errors.push(FieldError::new("preagg", "expected 1, 0, rollup, raw or auto"));
            SourcePreference::Auto
        }),
    };

    let start = non_blank(request.start.as_deref());
    let end = non_blank(request.end.as_deref());
    let mut range = TimeRange::Relative {
        days: normalize_days(days),
    };
    if let (Some(start), Some(end)) = (start, end) {
        let start_date = parse_date(&start, clock);
        let end_date = parse_date(&end, clock);
        if start_date.is_none() {
            errors.push(FieldError::new("start", "expected YYYY-MM-DD or RFC 3339"));
        }
        if end_date.is_none() {
            errors.push(FieldError::new("end", "expected YYYY-MM-DD or RFC 3339"));
        }
        if let (Some(start), Some(end)) = (start_date, end_date) {
            if end < start {
                errors.push(FieldError::new("end", "must not be before start"));
            }
            range = TimeRange::Custom { start, end };
        }
    }

    if !errors.is_empty() {
        return Err(Error::Validation(errors));
    }

    Ok(OverviewParams {
        range,
        model: non_blank(request.model.as_deref()),
        route: non_blank(request.route.as_deref()),
        page: normalize_page(page),
        page_size: normalize_page_size(page_size),
        source,
    })
}

/// Canonical cache key of an overview request and the path chosen for it
pub fn cache_key(params: &OverviewParams, strategy: Strategy) -> String {
    let range = match params.range {
        TimeRange::Relative { days } => json!({"days": days}),
        TimeRange::Custom { start, end } => json!({
            "start": start.format("%Y-%m-%d").to_string(),
            "end": end.format("%Y-%m-%d").to_string(),
        }),
    };
    json!({
        "range": range,
        "model": params.model,
        "route": params.route,
        "page": params.page,
        "pageSize": params.page_size,
        "source": params.source,
        "strategy": strategy.name(),
    })
    .to_string()
}

/// Builds usage overviews
pub struct OverviewBuilder {
    store: Arc<dyn UsageStore>,
    clock: BucketClock,
    read_rollups: bool,
    cache: Option<Arc<ResultCache<OverviewResult>>>,
}

impl OverviewBuilder {
    /// Create a builder; `read_rollups` makes rollups the default path
    pub fn new(store: Arc<dyn UsageStore>, clock: BucketClock, read_rollups: bool) -> Self {
        Self {
            store,
            clock,
            read_rollups,
            cache: None,
        }
    }

    /// Memoize results in `cache`
    #[must_use]
    pub fn with_cache(mut self, cache: Arc<ResultCache<OverviewResult>>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Path a request is planned on before any fallback
    pub fn plan(&self, params: &OverviewParams) -> Strategy {
        match params.source {
            SourcePreference::Raw => Strategy::Raw,
            SourcePreference::Rollup => Strategy::for_range(&params.range),
            SourcePreference::Auto if self.read_rollups => Strategy::for_range(&params.range),
            SourcePreference::Auto => Strategy::Raw,
        }
    }

    /// Build an overview as of `now`
    #[instrument(skip(self), fields(strategy = tracing::field::Empty))]
    pub async fn build(&self, params: &OverviewParams, now: DateTime<Utc>) -> Result<OverviewResult> {
        let strategy = self.plan(params);
        tracing::Span::current().record("strategy", strategy.name());

        let key = cache_key(params, strategy);
        if let Some(hit) = self.cache.as_ref().and_then(|c| c.get(&key)) {
            metrics::counter!("proxyusage_overview_cache_hits_total").increment(1);
            debug!("Overview served from cache");
            return Ok(hit);
        }

        let result = match strategy {
            Strategy::Raw => self.assemble(params, Strategy::Raw, now).await?,
            rollup => match self.assemble(params, rollup, now).await {
                Ok(result) => result,
                Err(e) => {
                    warn!(error = %e, strategy = rollup.name(), "Rollup query failed, falling back to raw records");
                    metrics::counter!("proxyusage_overview_fallback_total").increment(1);
                    let mut result = self.assemble(params, Strategy::Raw, now).await?;
                    result.served_from = ServedFrom::RawFallback;
                    result
                }
            },
        };

        if let Some(cache) = &self.cache {
            cache.insert(key, result.clone());
        }
        Ok(result)
    }

    async fn assemble(
        &self,
        params: &OverviewParams,
        strategy: Strategy,
        now: DateTime<Utc>,
    ) -> Result<OverviewResult> {
        let mut base = Vec::new();
        match params.range {
            TimeRange::Relative { days } => {
                base.push(Predicate::Since(now - Duration::days(i64::from(days))));
            }
            TimeRange::Custom { start, end } => {
                base.push(Predicate::Since(self.clock.day_start(start)));
                base.push(Predicate::Until(self.clock.day_end(end)));
            }
        }
        let mut filtered = base.clone();
        filtered.extend(params.model.clone().map(Predicate::ModelEq));
        filtered.extend(params.route.clone().map(Predicate::RouteEq));

        let source = strategy.aggregate_source();
        let query = |group: GroupBy, predicates: &[Predicate], from: Source| {
            AggregateQuery::new(from)
                .filter(predicates.iter().cloned())
                .group(group)
        };

        let totals_q = query(GroupBy::total(), &filtered, source);
        let models_q = query(GroupBy::model(), &filtered, source);
        let days_q = query(GroupBy::time_model(Interval::Day), &filtered, source);
        let hours_q = query(GroupBy::time(Interval::Hour), &filtered, strategy.hourly_source());
        let avail_models_q = query(GroupBy::model(), &base, source);
        let avail_routes_q = query(GroupBy::route(), &base, source);

        let (totals, models, day_models, hours, avail_models, avail_routes, prices) = tokio::try_join!(
            self.store.aggregate(&totals_q),
            self.store.aggregate(&models_q),
            self.store.aggregate(&days_q),
            self.store.aggregate(&hours_q),
            self.store.aggregate(&avail_models_q),
            self.store.aggregate(&avail_routes_q),
            self.store.list_prices(),
        )?;

        let estimator = CostEstimator::new(prices);
        let totals: UsageCounters = totals.iter().map(|r| r.counters).sum();

        // Every matching model prices the total; only the page is listed
        let mut total_cost = 0.0;
        let mut unpriced_models = Vec::new();
        let mut all_models = Vec::with_capacity(models.len());
        for row in &models {
            let model = row.model.clone().unwrap_or_default();
            let estimate = estimator.estimate(token_usage(&row.counters), &model);
            total_cost += estimate.cost;
            if !estimate.priced {
                unpriced_models.push(model.clone());
            }
            all_models.push(ModelUsage {
                model,
                requests: row.counters.total_requests,
                tokens: row.counters.total_tokens,
                input_tokens: row.counters.input_tokens,
                output_tokens: row.counters.output_tokens,
                cached_tokens: row.counters.cached_tokens,
                cost: estimate.cost,
                priced: estimate.priced,
            });
        }

        let total_models = all_models.len() as u64;
        let offset = (params.page as usize - 1).saturating_mul(params.page_size as usize);
        let page: Vec<ModelUsage> = all_models
            .into_iter()
            .skip(offset)
            .take(params.page_size as usize)
            .collect();

        let days = params.range.days();
        let by_day = self.day_series(&day_models, &estimator, days as usize);
        let by_hour = hours
            .iter()
            .filter_map(|row| {
                let ts = row.bucket?;
                Some(HourPoint {
                    label: self.clock.hour_label(ts),
                    timestamp: ts,
                    requests: row.counters.total_requests,
                    tokens: row.counters.total_tokens,
                    input_tokens: row.counters.input_tokens,
                    output_tokens: row.counters.output_tokens,
                    reasoning_tokens: row.counters.reasoning_tokens,
                    cached_tokens: row.counters.cached_tokens,
                })
            })
            .collect();

        #[allow(clippy::cast_precision_loss)]
        let success_rate = if totals.total_requests == 0 {
            1.0
        } else {
            totals.success_count as f64 / totals.total_requests as f64
        };

        let overview = UsageOverview {
            total_requests: totals.total_requests,
            total_tokens: totals.total_tokens,
            total_input_tokens: totals.input_tokens,
            total_output_tokens: totals.output_tokens,
            total_reasoning_tokens: totals.reasoning_tokens,
            total_cached_tokens: totals.cached_tokens,
            success_count: totals.success_count,
            failure_count: totals.failure_count,
            success_rate,
            total_cost: round_to(total_cost, 4),
            unpriced_models,
            models: page,
            by_day,
            by_hour,
        };

        Ok(OverviewResult {
            empty: overview.total_requests == 0,
            overview,
            days,
            meta: OverviewMeta::new(params.page, params.page_size, total_models),
            filters: AvailableFilters {
                models: dimension_values(&avail_models, |r| r.model.as_deref()),
                routes: dimension_values(&avail_routes, |r| r.route.as_deref()),
            },
            served_from: strategy.served_from(),
        })
    }

    /// Daily series from per-day, per-model rows; keeps the latest `limit` days
    fn day_series(&self, rows: &[AggregateRow], estimator: &CostEstimator, limit: usize) -> Vec<DayPoint> {
        let mut days: BTreeMap<DateTime<Utc>, (UsageCounters, f64)> = BTreeMap::new();
        for row in rows {
            let Some(bucket) = row.bucket else { continue };
            let model = row.model.as_deref().unwrap_or_default();
            let cost = estimator.estimate(token_usage(&row.counters), model).cost;
            let entry = days.entry(bucket).or_default();
            entry.0 += row.counters;
            entry.1 += cost;
        }

        let skip = days.len().saturating_sub(limit);
        days.into_iter()
            .skip(skip)
            .map(|(bucket, (counters, cost))| DayPoint {
                label: self.clock.day_label(bucket),
                requests: counters.total_requests,
                tokens: counters.total_tokens,
                cost: round_to(cost, 2),
            })
            .collect()
    }
}

fn token_usage(counters: &UsageCounters) -> TokenUsage {
    TokenUsage {
        input: counters.input_tokens,
        cached: counters.cached_tokens,
        output: counters.output_tokens,
    }
}

fn dimension_values(rows: &[AggregateRow], pick: impl Fn(&AggregateRow) -> Option<&str>) -> Vec<String> {
    rows.iter()
        .filter_map(|r| pick(r))
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryUsageStore;
    use crate::models::{ModelPrice, SyncBatch, UsageEvent};
    use crate::rollup::RollupReconciler;
    use chrono::FixedOffset;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::time::Duration as StdDuration;

    fn clock() -> BucketClock {
        BucketClock::new(FixedOffset::east_opt(8 * 3600).unwrap())
    }

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn event(at: &str, route: &str, model: &str, input: i64, output: i64, failed: bool) -> UsageEvent {
        UsageEvent {
            occurred_at: ts(at),
            route: route.to_string(),
            model: model.to_string(),
            counters: UsageCounters {
                input_tokens: input,
                output_tokens: output,
                total_tokens: input + output,
                ..UsageCounters::single_request(failed)
            },
            is_error: failed,
            raw: json!({}),
        }
    }

    const NOW: &str = "2024-03-10T12:00:00Z";

    async fn seeded_store() -> Arc<MemoryUsageStore> {
        let store = Arc::new(MemoryUsageStore::new(clock()));
        let mut events = Vec::new();
        for (i, model) in ["a-model", "b-model", "c-model", "d-model", "e-model", "f-model", "gpt-4o"]
            .iter()
            .enumerate()
        {
            events.push(event(
                &format!("2024-03-0{}T0{}:30:00Z", 3 + i % 5, i),
                if i % 2 == 0 { "/v1/chat" } else { "/v1/responses" },
                model,
                1_000_000,
                500_000,
                i == 3,
            ));
        }
        store
            .commit_sync(
                &SyncBatch {
                    synced_at: ts("2024-03-10T00:00:00Z"),
                    events,
                    rejected: 0,
                },
                Some(&RollupReconciler::new(clock())),
            )
            .await
            .unwrap();
        store
            .upsert_price(&ModelPrice::new("gpt-4o", 2.5, 1.25, 10.0))
            .await
            .unwrap();
        store
            .upsert_price(&ModelPrice::new("a-*", 1.0, 0.0, 2.0))
            .await
            .unwrap();
        store
    }

    fn params(source: SourcePreference, page_size: u32) -> OverviewParams {
        OverviewParams {
            page_size,
            source,
            ..OverviewParams::default()
        }
    }

    #[test]
    fn test_strategy_for_range() {
        assert_eq!(
            Strategy::for_range(&TimeRange::Relative { days: 7 }),
            Strategy::HourlyOnly
        );
        let custom = TimeRange::Custom {
            start: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            end: NaiveDate::from_ymd_opt(2024, 3, 2).unwrap(),
        };
        assert_eq!(Strategy::for_range(&custom), Strategy::DailyPlusHourly);
        assert_eq!(Strategy::DailyPlusHourly.aggregate_source(), Source::Daily);
        assert_eq!(Strategy::DailyPlusHourly.hourly_source(), Source::Hourly);
    }

    #[test]
    fn test_normalize_request_custom_range() {
        let request = OverviewRequest {
            start: Some("2024-03-01".into()),
            end: Some("2024-03-07T10:00:00Z".into()),
            page_size: Some("1000".into()),
            model: Some("  ".into()),
            preagg: Some("0".into()),
            ..OverviewRequest::default()
        };
        let params = normalize_request(&request, &clock()).unwrap();
        assert_eq!(
            params.range,
            TimeRange::Custom {
                start: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
                end: NaiveDate::from_ymd_opt(2024, 3, 7).unwrap(),
            }
        );
        assert_eq!(params.range.days(), 7);
        assert_eq!(params.page_size, 500);
        assert_eq!(params.model, None);
        assert_eq!(params.source, SourcePreference::Raw);
    }

    #[test]
    fn test_normalize_request_collects_field_errors() {
        let request = OverviewRequest {
            days: Some("abc".into()),
            start: Some("2024-03-05".into()),
            end: Some("2024-03-01".into()),
            preagg: Some("maybe".into()),
            ..OverviewRequest::default()
        };
        let Err(Error::Validation(errors)) = normalize_request(&request, &clock()) else {
            panic!("expected validation error");
        };
        let paths: Vec<_> = errors.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["days", "preagg", "end"]);
    }

    #[test]
    fn test_cache_key_distinguishes_strategy() {
        let p = OverviewParams::default();
        assert_ne!(cache_key(&p, Strategy::Raw), cache_key(&p, Strategy::HourlyOnly));
        assert_eq!(cache_key(&p, Strategy::Raw), cache_key(&p.clone(), Strategy::Raw));
    }

    #[test]
    fn test_cache_key_distinguishes_source_preference() {
        let auto = OverviewParams::default();
        let forced = OverviewParams {
            source: SourcePreference::Rollup,
            ..OverviewParams::default()
        };
        let strategy = Strategy::for_range(&auto.range);
        assert_ne!(cache_key(&auto, strategy), cache_key(&forced, strategy));
        assert!(cache_key(&forced, strategy).contains(r#""source":"rollup""#));
    }

    #[tokio::test]
    async fn test_totals_do_not_depend_on_page_size() {
        let store = seeded_store().await;
        let builder = OverviewBuilder::new(store, clock(), true);

        let small = builder.build(&params(SourcePreference::Auto, 5), ts(NOW)).await.unwrap();
        let large = builder.build(&params(SourcePreference::Auto, 500), ts(NOW)).await.unwrap();

        assert_eq!(small.overview.models.len(), 5);
        assert_eq!(large.overview.models.len(), 7);
        assert_eq!(small.overview.total_requests, large.overview.total_requests);
        assert_eq!(small.overview.total_cost, large.overview.total_cost);
        assert_eq!(small.meta.total_pages, 2);
        assert_eq!(large.meta.total_pages, 1);
        assert_eq!(small.served_from, ServedFrom::HourlyOnly);
    }

    #[tokio::test]
    async fn test_cost_and_unpriced_models() {
        let store = seeded_store().await;
        let builder = OverviewBuilder::new(store, clock(), true);
        let result = builder.build(&params(SourcePreference::Raw, 500), ts(NOW)).await.unwrap();

        // gpt-4o: 2.5 + 5.0; a-model: 1.0 + 1.0
        assert_eq!(result.overview.total_cost, 9.5);
        assert_eq!(
            result.overview.unpriced_models,
            vec!["b-model", "c-model", "d-model", "e-model", "f-model"]
        );
        let gpt = result.overview.models.iter().find(|m| m.model == "gpt-4o").unwrap();
        assert!(gpt.priced);
        assert_eq!(result.overview.failure_count, 1);
        assert!((result.overview.success_rate - 6.0 / 7.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_rollup_and_raw_paths_agree() {
        let store = seeded_store().await;
        let builder = OverviewBuilder::new(store, clock(), true);

        let raw = builder.build(&params(SourcePreference::Raw, 10), ts(NOW)).await.unwrap();
        let rollup = builder.build(&params(SourcePreference::Rollup, 10), ts(NOW)).await.unwrap();

        assert_eq!(raw.served_from, ServedFrom::Raw);
        assert_eq!(rollup.served_from, ServedFrom::HourlyOnly);
        assert_eq!(raw.overview, rollup.overview);
        assert_eq!(raw.filters, rollup.filters);
    }

    #[tokio::test]
    async fn test_custom_range_uses_daily_rollups() {
        let store = seeded_store().await;
        let builder = OverviewBuilder::new(store, clock(), true);
        let custom = OverviewParams {
            range: TimeRange::Custom {
                start: NaiveDate::from_ymd_opt(2024, 3, 3).unwrap(),
                end: NaiveDate::from_ymd_opt(2024, 3, 4).unwrap(),
            },
            ..OverviewParams::default()
        };

        let result = builder.build(&custom, ts(NOW)).await.unwrap();
        assert_eq!(result.served_from, ServedFrom::DailyPlusHourly);
        assert_eq!(result.days, 2);
        let labels: Vec<_> = result.overview.by_day.iter().map(|d| d.label.as_str()).collect();
        assert_eq!(labels, vec!["2024-03-03", "2024-03-04"]);
        assert_eq!(result.overview.total_requests, 4);
    }

    #[tokio::test]
    async fn test_failed_rollup_read_falls_back_transparently() {
        let store = seeded_store().await;
        let builder = OverviewBuilder::new(store.clone(), clock(), true);
        let expected = builder.build(&params(SourcePreference::Raw, 10), ts(NOW)).await.unwrap();

        store.set_rollup_reads_failing(true);
        let result = builder.build(&params(SourcePreference::Auto, 10), ts(NOW)).await.unwrap();

        assert_eq!(result.served_from, ServedFrom::RawFallback);
        assert_eq!(result.overview, expected.overview);
        assert_eq!(result.meta, expected.meta);
    }

    #[tokio::test]
    async fn test_empty_store_has_unit_success_rate() {
        let store = Arc::new(MemoryUsageStore::new(clock()));
        let builder = OverviewBuilder::new(store, clock(), true);
        let result = builder.build(&OverviewParams::default(), ts(NOW)).await.unwrap();

        assert!(result.empty);
        assert_eq!(result.overview.success_rate, 1.0);
        assert_eq!(result.meta.total_pages, 1);
        assert!(result.overview.models.is_empty());
    }

    #[tokio::test]
    async fn test_filters_ignore_model_filter() {
        let store = seeded_store().await;
        let builder = OverviewBuilder::new(store, clock(), false);
        let filtered = OverviewParams {
            model: Some("gpt-4o".into()),
            ..OverviewParams::default()
        };
        let result = builder.build(&filtered, ts(NOW)).await.unwrap();

        assert_eq!(result.overview.total_requests, 1);
        assert_eq!(result.filters.models.len(), 7);
        assert_eq!(result.filters.routes, vec!["/v1/chat", "/v1/responses"]);
    }

    #[tokio::test]
    async fn test_cached_result_is_reused() {
        let store = seeded_store().await;
        let cache = Arc::new(ResultCache::new(StdDuration::from_secs(30), 100));
        let builder = OverviewBuilder::new(store.clone(), clock(), true).with_cache(cache.clone());

        let first = builder.build(&OverviewParams::default(), ts(NOW)).await.unwrap();
        store.reset(crate::db::ResetScope::RawAndRollups).await.unwrap();
        let second = builder.build(&OverviewParams::default(), ts(NOW)).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(cache.len(), 1);
    }
}
