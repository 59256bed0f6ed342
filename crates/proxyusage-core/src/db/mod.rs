//! Storage layer for ProxyUsage
//!
//! [`UsageStore`] is the only storage seam. [`PgUsageStore`] backs production
//! deployments; [`MemoryUsageStore`] has the same semantics in-process and is
//! used for `memory://` runs and the test-suite.

mod memory;
mod postgres;
pub mod query;

pub use memory::MemoryUsageStore;
pub use postgres::PgUsageStore;
pub use query::{AggregateQuery, AggregateRow, GroupBy, Predicate, SortOrder, Source};

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::config::Config;
use crate::error::Result;
use crate::models::{Interval, ModelPrice, SyncBatch, SyncOutcome, VitalName, VitalSample};
use crate::rollup::{BucketClock, RollupReconciler};

/// One bucket listed by a backfill dry run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewBucket {
    /// Bucket start
    pub bucket_start: DateTime<Utc>,
    /// Route
    pub route: String,
    /// Model
    pub model: String,
    /// Raw rows in the bucket
    pub record_count: i64,
}

/// Buckets a rebuild would write, newest first
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RollupPreview {
    /// Buckets in the range
    pub total_buckets: u64,
    /// Listed buckets, capped
    pub buckets: Vec<PreviewBucket>,
}

/// What an administrative reset wipes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetScope {
    /// Raw usage records only
    RawOnly,
    /// Raw usage records and both rollup tables
    RawAndRollups,
}

/// Rows removed by a reset
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetSummary {
    /// Raw usage records removed
    pub raw_deleted: u64,
    /// Rollup rows removed across both tables
    pub rollups_deleted: u64,
}

/// Vitals grouping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VitalsGrouping {
    /// Per metric name
    Name,
    /// Per pathname and metric name
    Page,
    /// Per time bucket and metric name
    Bucket(Interval),
}

/// p75 aggregation request over web vitals
#[derive(Debug, Clone, PartialEq)]
pub struct VitalsQuery {
    /// Lower bound on receive time
    pub since: DateTime<Utc>,
    /// Exact pathname filter
    pub pathname: Option<String>,
    /// Restrict to these metrics; all when empty
    pub names: Vec<VitalName>,
    /// Row grouping
    pub grouping: VitalsGrouping,
}

/// One p75 row
#[derive(Debug, Clone, PartialEq)]
pub struct VitalsAggregateRow {
    /// Metric name
    pub name: VitalName,
    /// Pathname when grouped by page
    pub pathname: Option<String>,
    /// Bucket start when grouped by time
    pub bucket: Option<DateTime<Utc>>,
    /// 75th percentile value
    pub p75: f64,
    /// Samples in the group
    pub count: u64,
}

/// Persistent storage for usage events, rollups, prices and vitals
#[async_trait]
pub trait UsageStore: Send + Sync {
    /// Insert-or-skip a batch of raw events and, with a reconciler, add the
    /// newly inserted rows to the rollups; all in one transaction
    async fn commit_sync(
        &self,
        batch: &SyncBatch,
        reconciler: Option<&RollupReconciler>,
    ) -> Result<SyncOutcome>;

    /// Run a grouped aggregation
    async fn aggregate(&self, query: &AggregateQuery) -> Result<Vec<AggregateRow>>;

    /// Every price entry, sorted by model
    async fn list_prices(&self) -> Result<Vec<ModelPrice>>;

    /// Insert or replace a price entry by model name
    async fn upsert_price(&self, price: &ModelPrice) -> Result<()>;

    /// Delete a price entry; returns whether it existed
    async fn delete_price(&self, model: &str) -> Result<bool>;

    /// Persist sampled vitals
    async fn insert_vitals(&self, samples: &[VitalSample]) -> Result<u64>;

    /// p75 of vitals values
    async fn vitals_p75(&self, query: &VitalsQuery) -> Result<Vec<VitalsAggregateRow>>;

    /// Time of the oldest raw event
    async fn earliest_event(&self) -> Result<Option<DateTime<Utc>>>;

    /// Buckets a rebuild of `[start, end)` would write
    async fn preview_rollups(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        interval: Interval,
        limit: usize,
    ) -> Result<RollupPreview>;

    /// Overwrite the buckets of `[start, end)` that still have raw rows;
    /// buckets with none left are untouched
    async fn rebuild_rollups(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        interval: Interval,
    ) -> Result<u64>;

    /// Wipe raw events (and optionally rollups)
    async fn reset(&self, scope: ResetScope) -> Result<ResetSummary>;

    /// Apply schema migrations
    async fn migrate(&self) -> Result<()>;

    /// Check connectivity
    async fn health_check(&self) -> Result<()>;
}

/// Open the store selected by `database.url`
pub async fn connect(config: &Config) -> Result<Arc<dyn UsageStore>> {
    let clock = BucketClock::from_config(&config.rollup)?;

    if config.database.is_memory() {
        info!("Using in-memory usage store");
        return Ok(Arc::new(MemoryUsageStore::new(clock)));
    }

    let store = PgUsageStore::connect(&config.database, clock).await?;
    Ok(Arc::new(store))
}
