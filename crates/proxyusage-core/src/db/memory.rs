//! In-process usage store
//!
//! Mirrors the Postgres store's semantics over mutex-guarded tables. A single
//! lock per call gives every operation the all-or-nothing behaviour of a
//! transaction. Switches let tests reproduce backend quirks and failures.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, info};

use super::query::{evaluate, RowRef};
use super::{
    AggregateQuery, AggregateRow, PreviewBucket, ResetScope, ResetSummary, RollupPreview,
    UsageStore, VitalsAggregateRow, VitalsGrouping, VitalsQuery,
};
use crate::error::{Error, Result};
use crate::models::{
    EventKey, Interval, ModelPrice, RollupKey, SyncBatch, SyncOutcome, UsageCounters, UsageEvent,
    VitalName, VitalSample,
};
use crate::rollup::{BucketClock, RollupReconciler};

struct StoredEvent {
    event: UsageEvent,
    synced_at: DateTime<Utc>,
}

#[derive(Clone, Copy)]
struct StoredBucket {
    counters: UsageCounters,
    #[allow(dead_code)]
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Default)]
struct Tables {
    raw: BTreeMap<EventKey, StoredEvent>,
    hourly: BTreeMap<RollupKey, StoredBucket>,
    daily: BTreeMap<RollupKey, StoredBucket>,
    prices: BTreeMap<String, ModelPrice>,
    vitals: Vec<VitalSample>,
}

impl Tables {
    fn rollup(&self, interval: Interval) -> &BTreeMap<RollupKey, StoredBucket> {
        match interval {
            Interval::Hour => &self.hourly,
            Interval::Day => &self.daily,
        }
    }

    fn rollup_mut(&mut self, interval: Interval) -> &mut BTreeMap<RollupKey, StoredBucket> {
        match interval {
            Interval::Hour => &mut self.hourly,
            Interval::Day => &mut self.daily,
        }
    }

    /// Raw rows grouped by bucket, with their record counts
    fn regroup(
        &self,
        clock: &BucketClock,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        interval: Interval,
    ) -> BTreeMap<RollupKey, (UsageCounters, i64)> {
        let mut groups: BTreeMap<RollupKey, (UsageCounters, i64)> = BTreeMap::new();
        for stored in self.raw.values() {
            let event = &stored.event;
            if event.occurred_at < start || event.occurred_at >= end {
                continue;
            }
            let key = RollupKey {
                bucket_start: clock.truncate(event.occurred_at, interval),
                route: event.route.clone(),
                model: event.model.clone(),
            };
            let entry = groups.entry(key).or_default();
            entry.0 += event.counters;
            entry.1 += 1;
        }
        groups
    }
}

/// In-memory [`UsageStore`]
pub struct MemoryUsageStore {
    clock: BucketClock,
    tables: Mutex<Tables>,
    reports_inserted_rows: AtomicBool,
    fail_rollup_reads: AtomicBool,
    fail_rollup_writes: AtomicBool,
}

impl MemoryUsageStore {
    /// Create an empty store
    pub fn new(clock: BucketClock) -> Self {
        Self {
            clock,
            tables: Mutex::new(Tables::default()),
            reports_inserted_rows: AtomicBool::new(true),
            fail_rollup_reads: AtomicBool::new(false),
            fail_rollup_writes: AtomicBool::new(false),
        }
    }

    /// When false, inserts report no rows back, like drivers that drop
    /// `RETURNING` output for `ON CONFLICT DO NOTHING`
    pub fn set_reports_inserted_rows(&self, enabled: bool) {
        self.reports_inserted_rows.store(enabled, Ordering::SeqCst);
    }

    /// Make every read of a rollup table fail
    pub fn set_rollup_reads_failing(&self, failing: bool) {
        self.fail_rollup_reads.store(failing, Ordering::SeqCst);
    }

    /// Make the rollup step of a sync fail, rolling back the whole batch
    pub fn set_rollup_writes_failing(&self, failing: bool) {
        self.fail_rollup_writes.store(failing, Ordering::SeqCst);
    }

    /// Number of raw events
    pub fn raw_count(&self) -> usize {
        self.tables.lock().raw.len()
    }

    /// Counters of every bucket of one rollup table
    pub fn rollup_snapshot(&self, interval: Interval) -> BTreeMap<RollupKey, UsageCounters> {
        self.tables
            .lock()
            .rollup(interval)
            .iter()
            .map(|(k, v)| (k.clone(), v.counters))
            .collect()
    }

    /// Last update time of a bucket
    pub fn bucket_updated_at(&self, interval: Interval, key: &RollupKey) -> Option<DateTime<Utc>> {
        self.tables.lock().rollup(interval).get(key).map(|b| b.updated_at)
    }

    /// Every stored vitals sample
    pub fn vitals_snapshot(&self) -> Vec<VitalSample> {
        self.tables.lock().vitals.clone()
    }
}

#[async_trait]
impl UsageStore for MemoryUsageStore {
    async fn commit_sync(
        &self,
        batch: &SyncBatch,
        reconciler: Option<&RollupReconciler>,
    ) -> Result<SyncOutcome> {
        let attempted = batch.attempted();
        let mut tables = self.tables.lock();

        let mut seen = HashSet::new();
        let mut inserted_keys = Vec::new();
        for event in &batch.events {
            let key = event.key();
            if tables.raw.contains_key(&key) || !seen.insert(key.clone()) {
                continue;
            }
            tables.raw.insert(
                key.clone(),
                StoredEvent {
                    event: event.clone(),
                    synced_at: batch.synced_at,
                },
            );
            inserted_keys.push(key);
        }

        let mut fresh: Vec<UsageEvent> = if self.reports_inserted_rows.load(Ordering::SeqCst) {
            inserted_keys
                .iter()
                .filter_map(|k| tables.raw.get(k).map(|s| s.event.clone()))
                .collect()
        } else {
            Vec::new()
        };

        if fresh.is_empty() && attempted > 0 {
            fresh = tables
                .raw
                .values()
                .filter(|s| s.synced_at == batch.synced_at)
                .map(|s| s.event.clone())
                .collect();
            if !fresh.is_empty() {
                info!(
                    attempted,
                    recovered = fresh.len(),
                    "Insert reported no rows, counted rows stamped with this sync instead"
                );
            }
        }

        if let Some(reconciler) = reconciler.filter(|_| !fresh.is_empty()) {
            if self.fail_rollup_writes.load(Ordering::SeqCst) {
                for key in &inserted_keys {
                    tables.raw.remove(key);
                }
                return Err(Error::transaction("rollup upsert failed"));
            }

            let plan = reconciler.plan(&fresh);
            let now = Utc::now();
            for interval in [Interval::Hour, Interval::Day] {
                let table = tables.rollup_mut(interval);
                for delta in plan.deltas(interval) {
                    table
                        .entry(delta.key.clone())
                        .and_modify(|b| {
                            b.counters += delta.counters;
                            b.updated_at = now;
                        })
                        .or_insert(StoredBucket {
                            counters: delta.counters,
                            created_at: now,
                            updated_at: now,
                        });
                }
            }
            debug!(
                hourly = plan.hourly.len(),
                daily = plan.daily.len(),
                "Reconciled rollup buckets"
            );
        }

        Ok(SyncOutcome {
            inserted: fresh.len() as u64,
            attempted,
        })
    }

    async fn aggregate(&self, query: &AggregateQuery) -> Result<Vec<AggregateRow>> {
        if query.source.is_rollup() && self.fail_rollup_reads.load(Ordering::SeqCst) {
            return Err(Error::rollup_query(format!(
                "relation \"{}\" is unavailable",
                query.source.table()
            )));
        }

        let tables = self.tables.lock();
        let rows = match query.source {
            super::Source::Raw => evaluate(
                query,
                &self.clock,
                tables.raw.values().map(|s| RowRef {
                    time: s.event.occurred_at,
                    route: &s.event.route,
                    model: &s.event.model,
                    counters: s.event.counters,
                }),
            ),
            super::Source::Hourly | super::Source::Daily => {
                let interval = if query.source == super::Source::Hourly {
                    Interval::Hour
                } else {
                    Interval::Day
                };
                evaluate(
                    query,
                    &self.clock,
                    tables.rollup(interval).iter().map(|(k, b)| RowRef {
                        time: k.bucket_start,
                        route: &k.route,
                        model: &k.model,
                        counters: b.counters,
                    }),
                )
            }
        };
        Ok(rows)
    }

    async fn list_prices(&self) -> Result<Vec<ModelPrice>> {
        Ok(self.tables.lock().prices.values().cloned().collect())
    }

    async fn upsert_price(&self, price: &ModelPrice) -> Result<()> {
        self.tables
            .lock()
            .prices
            .insert(price.model.clone(), price.clone());
        Ok(())
    }

    async fn delete_price(&self, model: &str) -> Result<bool> {
        Ok(self.tables.lock().prices.remove(model).is_some())
    }

    async fn insert_vitals(&self, samples: &[VitalSample]) -> Result<u64> {
        self.tables.lock().vitals.extend_from_slice(samples);
        Ok(samples.len() as u64)
    }

    async fn vitals_p75(&self, query: &VitalsQuery) -> Result<Vec<VitalsAggregateRow>> {
        type Key = (Option<DateTime<Utc>>, Option<String>, VitalName);
        let tables = self.tables.lock();
        let mut groups: BTreeMap<Key, Vec<f64>> = BTreeMap::new();

        for sample in &tables.vitals {
            if sample.created_at < query.since
                || (!query.names.is_empty() && !query.names.contains(&sample.name))
                || query
                    .pathname
                    .as_ref()
                    .is_some_and(|p| sample.pathname.as_ref() != Some(p))
            {
                continue;
            }
            let key = match query.grouping {
                VitalsGrouping::Name => (None, None, sample.name),
                VitalsGrouping::Page => (None, sample.pathname.clone(), sample.name),
                VitalsGrouping::Bucket(interval) => (
                    Some(self.clock.truncate(sample.created_at, interval)),
                    None,
                    sample.name,
                ),
            };
            groups.entry(key).or_default().push(sample.value);
        }

        Ok(groups
            .into_iter()
            .map(|((bucket, pathname, name), mut values)| VitalsAggregateRow {
                name,
                pathname,
                bucket,
                p75: percentile_cont(&mut values, 0.75),
                count: values.len() as u64,
            })
            .collect())
    }

    async fn earliest_event(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self.tables.lock().raw.keys().next().map(|k| k.occurred_at))
    }

    async fn preview_rollups(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        interval: Interval,
        limit: usize,
    ) -> Result<RollupPreview> {
        let groups = self.tables.lock().regroup(&self.clock, start, end, interval);
        let total_buckets = groups.len() as u64;
        let buckets = groups
            .into_iter()
            .rev()
            .take(limit)
            .map(|(key, (_, count))| PreviewBucket {
                bucket_start: key.bucket_start,
                route: key.route,
                model: key.model,
                record_count: count,
            })
            .collect();
        Ok(RollupPreview {
            total_buckets,
            buckets,
        })
    }

    async fn rebuild_rollups(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        interval: Interval,
    ) -> Result<u64> {
        let mut tables = self.tables.lock();
        let groups = tables.regroup(&self.clock, start, end, interval);
        let now = Utc::now();

        // Buckets with no raw rows left are kept as they are
        let table = tables.rollup_mut(interval);
        let written = groups.len() as u64;
        for (key, (counters, _)) in groups {
            table
                .entry(key)
                .and_modify(|bucket| {
                    bucket.counters = counters;
                    bucket.updated_at = now;
                })
                .or_insert(StoredBucket {
                    counters,
                    created_at: now,
                    updated_at: now,
                });
        }
        Ok(written)
    }

    async fn reset(&self, scope: ResetScope) -> Result<ResetSummary> {
        let mut tables = self.tables.lock();
        let raw_deleted = tables.raw.len() as u64;
        tables.raw.clear();

        let mut rollups_deleted = 0;
        if scope == ResetScope::RawAndRollups {
            rollups_deleted = (tables.hourly.len() + tables.daily.len()) as u64;
            tables.hourly.clear();
            tables.daily.clear();
        }

        Ok(ResetSummary {
            raw_deleted,
            rollups_deleted,
        })
    }

    async fn migrate(&self) -> Result<()> {
        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

/// Continuous percentile with linear interpolation, as Postgres computes it
fn percentile_cont(values: &mut [f64], fraction: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(f64::total_cmp);

    #[allow(clippy::cast_precision_loss)]
    let position = fraction * (values.len() - 1) as f64;
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let (lower, upper) = (position.floor() as usize, position.ceil() as usize);
    let weight = position - position.floor();
    values[lower] + (values[upper] - values[lower]) * weight
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::FixedOffset;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn clock() -> BucketClock {
        BucketClock::new(FixedOffset::east_opt(8 * 3600).unwrap())
    }

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn event(at: &str, route: &str, model: &str, tokens: i64) -> UsageEvent {
        UsageEvent {
            occurred_at: ts(at),
            route: route.to_string(),
            model: model.to_string(),
            counters: UsageCounters {
                total_tokens: tokens,
                input_tokens: tokens,
                ..UsageCounters::single_request(false)
            },
            is_error: false,
            raw: json!({}),
        }
    }

    fn batch(synced_at: &str, events: Vec<UsageEvent>) -> SyncBatch {
        SyncBatch {
            synced_at: ts(synced_at),
            events,
            rejected: 0,
        }
    }

    #[tokio::test]
    async fn test_resync_inserts_nothing_and_leaves_rollups_alone() {
        let store = MemoryUsageStore::new(clock());
        let reconciler = RollupReconciler::new(clock());
        let events = vec![
            event("2024-01-01T01:00:00Z", "r", "m", 10),
            event("2024-01-01T01:10:00Z", "r", "m", 20),
        ];

        let first = store
            .commit_sync(&batch("2024-01-01T02:00:00Z", events.clone()), Some(&reconciler))
            .await
            .unwrap();
        let rollups = store.rollup_snapshot(Interval::Hour);

        let second = store
            .commit_sync(&batch("2024-01-01T03:00:00Z", events), Some(&reconciler))
            .await
            .unwrap();

        assert_eq!(first, SyncOutcome { inserted: 2, attempted: 2 });
        assert_eq!(second, SyncOutcome { inserted: 0, attempted: 2 });
        assert_eq!(store.rollup_snapshot(Interval::Hour), rollups);
        assert_eq!(store.raw_count(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_keys_within_one_batch_insert_once() {
        let store = MemoryUsageStore::new(clock());
        let events = vec![
            event("2024-01-01T01:00:00Z", "r", "m", 10),
            event("2024-01-01T01:00:00Z", "r", "m", 99),
        ];
        let outcome = store
            .commit_sync(&batch("2024-01-01T02:00:00Z", events), None)
            .await
            .unwrap();
        assert_eq!(outcome.inserted, 1);
        assert_eq!(outcome.skipped(), 1);
    }

    #[tokio::test]
    async fn test_counting_fallback_when_inserts_are_not_reported() {
        let store = MemoryUsageStore::new(clock());
        store.set_reports_inserted_rows(false);
        let reconciler = RollupReconciler::new(clock());

        store
            .commit_sync(
                &batch("2024-01-01T02:00:00Z", vec![event("2024-01-01T01:00:00Z", "r", "m", 1)]),
                Some(&reconciler),
            )
            .await
            .unwrap();

        let outcome = store
            .commit_sync(
                &batch(
                    "2024-01-01T03:00:00Z",
                    vec![
                        event("2024-01-01T01:00:00Z", "r", "m", 1),
                        event("2024-01-01T01:30:00Z", "r", "m", 5),
                    ],
                ),
                Some(&reconciler),
            )
            .await
            .unwrap();

        assert_eq!(outcome, SyncOutcome { inserted: 1, attempted: 2 });
        let hourly = store.rollup_snapshot(Interval::Hour);
        let bucket = hourly.values().next().unwrap();
        assert_eq!(bucket.total_tokens, 6);
        assert_eq!(bucket.total_requests, 2);
    }

    #[tokio::test]
    async fn test_failed_rollup_write_rolls_back_raw_rows() {
        let store = MemoryUsageStore::new(clock());
        store.set_rollup_writes_failing(true);
        let reconciler = RollupReconciler::new(clock());

        let err = store
            .commit_sync(
                &batch("2024-01-01T02:00:00Z", vec![event("2024-01-01T01:00:00Z", "r", "m", 1)]),
                Some(&reconciler),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Transaction(_)));
        assert_eq!(store.raw_count(), 0);
        assert!(store.rollup_snapshot(Interval::Hour).is_empty());

        // Nothing was half-committed, so a retry after recovery inserts the row
        store.set_rollup_writes_failing(false);
        let outcome = store
            .commit_sync(
                &batch("2024-01-01T02:05:00Z", vec![event("2024-01-01T01:00:00Z", "r", "m", 1)]),
                Some(&reconciler),
            )
            .await
            .unwrap();
        assert_eq!(outcome.inserted, 1);
    }

    #[tokio::test]
    async fn test_additive_upsert_refreshes_updated_at() {
        let store = MemoryUsageStore::new(clock());
        let reconciler = RollupReconciler::new(clock());
        store
            .commit_sync(
                &batch("2024-01-01T02:00:00Z", vec![event("2024-01-01T01:00:00Z", "r", "m", 1)]),
                Some(&reconciler),
            )
            .await
            .unwrap();
        let key = store
            .rollup_snapshot(Interval::Hour)
            .into_keys()
            .next()
            .unwrap();
        let first_update = store.bucket_updated_at(Interval::Hour, &key).unwrap();

        store
            .commit_sync(
                &batch("2024-01-01T02:10:00Z", vec![event("2024-01-01T01:20:00Z", "r", "m", 2)]),
                Some(&reconciler),
            )
            .await
            .unwrap();

        assert_eq!(store.rollup_snapshot(Interval::Hour)[&key].total_tokens, 3);
        assert!(store.bucket_updated_at(Interval::Hour, &key).unwrap() >= first_update);
    }

    #[tokio::test]
    async fn test_rollup_reads_can_fail() {
        let store = MemoryUsageStore::new(clock());
        store.set_rollup_reads_failing(true);
        let err = store
            .aggregate(&AggregateQuery::new(super::super::Source::Daily))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RollupQuery(_)));
        assert!(store
            .aggregate(&AggregateQuery::new(super::super::Source::Raw))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_prices_sorted_and_replaced() {
        let store = MemoryUsageStore::new(clock());
        store.upsert_price(&ModelPrice::new("z", 1.0, 0.0, 1.0)).await.unwrap();
        store.upsert_price(&ModelPrice::new("a", 1.0, 0.0, 1.0)).await.unwrap();
        store.upsert_price(&ModelPrice::new("a", 2.0, 0.0, 2.0)).await.unwrap();

        let prices = store.list_prices().await.unwrap();
        assert_eq!(prices.len(), 2);
        assert_eq!(prices[0], ModelPrice::new("a", 2.0, 0.0, 2.0));
        assert!(store.delete_price("z").await.unwrap());
        assert!(!store.delete_price("z").await.unwrap());
    }

    #[tokio::test]
    async fn test_reset_scopes() {
        let store = MemoryUsageStore::new(clock());
        let reconciler = RollupReconciler::new(clock());
        store
            .commit_sync(
                &batch("2024-01-01T02:00:00Z", vec![event("2024-01-01T01:00:00Z", "r", "m", 1)]),
                Some(&reconciler),
            )
            .await
            .unwrap();

        let summary = store.reset(ResetScope::RawOnly).await.unwrap();
        assert_eq!(summary, ResetSummary { raw_deleted: 1, rollups_deleted: 0 });
        assert_eq!(store.rollup_snapshot(Interval::Day).len(), 1);

        let summary = store.reset(ResetScope::RawAndRollups).await.unwrap();
        assert_eq!(summary.rollups_deleted, 2);
        assert!(store.rollup_snapshot(Interval::Day).is_empty());
    }

    #[test]
    fn test_percentile_cont() {
        assert_eq!(percentile_cont(&mut [], 0.75), 0.0);
        assert_eq!(percentile_cont(&mut [5.0], 0.75), 5.0);
        // position 0.75 * 3 = 2.25 -> 3 + 0.25 * (4 - 3)
        assert_eq!(percentile_cont(&mut [4.0, 1.0, 3.0, 2.0], 0.75), 3.25);
    }
}
