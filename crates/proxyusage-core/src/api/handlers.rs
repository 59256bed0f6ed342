//! API handlers for the HTTP REST API

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::auth::Authorizer;
use super::error::ApiError;
use crate::collector::{SyncService, UpstreamClient, VitalsIngestor};
use crate::config::{Config, Environment};
use crate::db::{ResetScope, UsageStore};
use crate::error::{Error, Result};
use crate::models::{ModelPrice, OverviewRequest, OverviewResult, SyncReport, VitalsIngestResult};
use crate::query::{
    normalize_request, AnalyticsRequest, AnalyticsService, CostTrendParams, ErrorSeriesParams,
    OverviewBuilder, ResultCache, TokenBreakdownParams, TopFailureParams, VitalsReporter,
    VitalsRequest, VitalsSummaryParams, VitalsTimeseriesParams,
};
use crate::rollup::{BucketClock, RollupReconciler};

/// Cache policy sent with overview responses
pub const OVERVIEW_CACHE_CONTROL: &str = "private, max-age=30, stale-while-revalidate=60";

/// Header that must accompany a reset
pub const CONFIRM_RESET_HEADER: &str = "x-confirm-reset";
/// Expected value of [`CONFIRM_RESET_HEADER`]
pub const CONFIRM_RESET_VALUE: &str = "yes-delete-all-data";

type ApiResult<T> = std::result::Result<T, ApiError>;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Storage backend
    pub store: Arc<dyn UsageStore>,
    /// Upstream pull
    pub sync: Arc<SyncService>,
    /// Overview planner and assembler
    pub overview: Arc<OverviewBuilder>,
    /// Overview result cache, cleared by price writes and resets
    pub overview_cache: Arc<ResultCache<OverviewResult>>,
    /// Rollup analytics reports
    pub analytics: Arc<AnalyticsService>,
    /// Beacon validation and sampling
    pub vitals: Arc<VitalsIngestor>,
    /// Vitals p75 reports
    pub vitals_reports: Arc<VitalsReporter>,
    /// Dashboard and cron authorization
    pub authorizer: Authorizer,
    /// Reference offset for bucket labels
    pub clock: BucketClock,
    /// Deployment environment
    pub environment: Environment,
    /// Prometheus handle, when a recorder is installed
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    /// Wire every service over `store` as configured
    pub fn new(config: &Config, store: Arc<dyn UsageStore>) -> Result<Self> {
        let clock = BucketClock::from_config(&config.rollup)?;
        let upstream = if config.upstream.base_url.trim().is_empty() {
            None
        } else {
            Some(UpstreamClient::new(&config.upstream)?)
        };
        let reconciler = config
            .rollup
            .write_enabled
            .then(|| RollupReconciler::new(clock));

        let overview_cache = Arc::new(ResultCache::from_config(&config.cache));
        let overview = OverviewBuilder::new(store.clone(), clock, config.rollup.read_enabled)
            .with_cache(overview_cache.clone());

        Ok(Self {
            sync: Arc::new(SyncService::new(store.clone(), upstream, reconciler)),
            overview: Arc::new(overview),
            overview_cache,
            analytics: Arc::new(AnalyticsService::new(
                store.clone(),
                clock,
                config.rollup.read_enabled,
            )),
            vitals: Arc::new(VitalsIngestor::new(store.clone(), config.vitals.clone())),
            vitals_reports: Arc::new(VitalsReporter::new(store.clone(), clock)),
            authorizer: Authorizer::new(&config.auth),
            clock,
            environment: config.environment,
            metrics: None,
            store,
        })
    }

    /// Serve `/metrics` from this recorder handle
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }
}

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    /// Always `ok` when the store answers
    pub status: String,
    /// Crate version
    pub version: String,
}

/// Health check endpoint
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let (code, status) = match state.store.health_check().await {
        Ok(()) => (StatusCode::OK, "ok"),
        Err(e) => {
            tracing::warn!(error = %e, "Health check failed");
            (StatusCode::SERVICE_UNAVAILABLE, "unavailable")
        }
    };
    (
        code,
        Json(HealthResponse {
            status: status.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }),
    )
}

/// Prometheus exposition
pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    match &state.metrics {
        Some(handle) => (StatusCode::OK, handle.render()),
        None => (StatusCode::NOT_FOUND, String::new()),
    }
}

/// Pull the upstream snapshot and commit it
pub async fn sync(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<Json<SyncReport>> {
    state.authorizer.check(&headers)?;
    Ok(Json(state.sync.sync_now().await?))
}

/// Usage overview
pub async fn overview(
    State(state): State<AppState>,
    Query(request): Query<OverviewRequest>,
) -> ApiResult<impl IntoResponse> {
    let params = normalize_request(&request, &state.clock)?;
    let result = state.overview.build(&params, Utc::now()).await?;
    Ok((
        [(header::CACHE_CONTROL, OVERVIEW_CACHE_CONTROL)],
        Json(result),
    ))
}

/// Price list response
#[derive(Serialize)]
pub struct PricesResponse {
    /// Every configured price
    pub prices: Vec<ModelPrice>,
}

/// List prices
pub async fn list_prices(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<Json<PricesResponse>> {
    state.authorizer.check(&headers)?;
    let prices = state.store.list_prices().await?;
    Ok(Json(PricesResponse { prices }))
}

/// Insert or replace a price
pub async fn upsert_price(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> ApiResult<Json<Value>> {
    state.authorizer.check(&headers)?;
    let price = ModelPrice::from_json(&body)?;
    state.store.upsert_price(&price).await?;
    state.overview_cache.clear();
    Ok(Json(json!({"ok": true})))
}

/// Price deletion request
#[derive(Debug, Deserialize)]
pub struct DeletePriceRequest {
    /// Exact model name or wildcard pattern
    pub model: String,
}

/// Delete a price
pub async fn delete_price(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<DeletePriceRequest>,
) -> ApiResult<Json<Value>> {
    state.authorizer.check(&headers)?;
    let model = body.model.trim();
    if model.is_empty() {
        return Err(Error::validation("model", "must not be empty").into());
    }
    let deleted = state.store.delete_price(model).await?;
    state.overview_cache.clear();
    Ok(Json(json!({"ok": true, "deleted": deleted})))
}

/// Reset options
#[derive(Debug, Default, Deserialize)]
pub struct ResetQuery {
    /// Also wipe both rollup tables
    #[serde(default)]
    pub rollups: bool,
}

/// Wipe raw usage records, optionally with rollups
pub async fn reset(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ResetQuery>,
) -> ApiResult<Json<Value>> {
    if state.environment.is_production() {
        return Err(Error::Forbidden("Reset is disabled in production".to_string()).into());
    }
    state.authorizer.check(&headers)?;

    let confirmed = headers
        .get(CONFIRM_RESET_HEADER)
        .and_then(|v| v.to_str().ok())
        == Some(CONFIRM_RESET_VALUE);
    if !confirmed {
        return Err(Error::validation(
            CONFIRM_RESET_HEADER,
            format!("header must be {CONFIRM_RESET_VALUE}"),
        )
        .into());
    }

    let scope = if query.rollups {
        ResetScope::RawAndRollups
    } else {
        ResetScope::RawOnly
    };
    let summary = state.store.reset(scope).await?;
    state.overview_cache.clear();
    tracing::warn!(raw = summary.raw_deleted, rollups = summary.rollups_deleted, "Usage data reset");

    Ok(Json(json!({"success": true, "deleted": summary})))
}

/// Ingest a web vitals beacon
pub async fn ingest_vitals(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> ApiResult<Json<VitalsIngestResult>> {
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok());
    Ok(Json(state.vitals.ingest(&body, user_agent, Utc::now()).await?))
}

/// p75 summary of web vitals
pub async fn vitals_summary(
    State(state): State<AppState>,
    Query(request): Query<VitalsRequest>,
) -> ApiResult<Json<Value>> {
    let params = VitalsSummaryParams::parse(&request)?;
    let data = state.vitals_reports.summary(&params, Utc::now()).await?;
    Ok(Json(json!({
        "data": data,
        "hours": params.hours,
        "groupBy": params.group_by,
    })))
}

/// p75 time series of web vitals
pub async fn vitals_timeseries(
    State(state): State<AppState>,
    Query(request): Query<VitalsRequest>,
) -> ApiResult<Json<Value>> {
    let params = VitalsTimeseriesParams::parse(&request)?;
    let data = state.vitals_reports.timeseries(&params, Utc::now()).await?;
    Ok(Json(json!({
        "data": data,
        "hours": params.hours,
        "interval": params.interval,
        "metrics": params.metrics,
    })))
}

/// Success/failure series
pub async fn error_timeseries(
    State(state): State<AppState>,
    Query(request): Query<AnalyticsRequest>,
) -> ApiResult<Json<Value>> {
    let params = ErrorSeriesParams::parse(&request)?;
    let data = state.analytics.error_series(&params, Utc::now()).await?;
    Ok(Json(json!({
        "data": data,
        "hours": params.hours,
        "interval": params.interval,
        "model": params.model,
        "route": params.route,
    })))
}

/// Models or routes ranked by failures
pub async fn top_failures(
    State(state): State<AppState>,
    Query(request): Query<AnalyticsRequest>,
) -> ApiResult<Json<Value>> {
    let params = TopFailureParams::parse(&request)?;
    let data = state.analytics.top_failures(&params, Utc::now()).await?;
    Ok(Json(json!({
        "data": data,
        "hours": params.hours,
        "groupBy": params.dimension,
        "limit": params.limit,
    })))
}

/// Token kinds per bucket
pub async fn token_breakdown(
    State(state): State<AppState>,
    Query(request): Query<AnalyticsRequest>,
) -> ApiResult<Json<Value>> {
    let params = TokenBreakdownParams::parse(&request)?;
    let data = state.analytics.token_breakdown(&params, Utc::now()).await?;
    Ok(Json(json!({
        "data": data,
        "hours": params.hours,
        "interval": params.interval,
        "model": params.model,
        "route": params.route,
    })))
}

/// Cost per model per bucket
pub async fn cost_trend(
    State(state): State<AppState>,
    Query(request): Query<AnalyticsRequest>,
) -> ApiResult<Json<Value>> {
    let params = CostTrendParams::parse(&request)?;
    let data = state.analytics.cost_trend(&params, Utc::now()).await?;
    Ok(Json(json!({
        "data": data,
        "hours": params.hours,
        "interval": params.interval,
        "route": params.route,
    })))
}
