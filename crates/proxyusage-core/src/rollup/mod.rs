//! Incremental hourly/daily rollups
//!
//! Every bucket boundary is computed in one fixed UTC offset so the hourly
//! and daily tables stay consistent projections of the same raw rows.
//! The reconciler only ever sees rows that a sync newly inserted; the store
//! applies its deltas with an atomic add-in-place upsert inside the same
//! transaction as the raw insert.

pub mod backfill;

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, TimeZone, Utc};

use crate::config::RollupConfig;
use crate::error::Result;
use crate::models::{Interval, RollupDelta, RollupKey, UsageCounters, UsageEvent};

pub use backfill::{BackfillOptions, BackfillReport, Backfiller, IntervalReport};

/// Truncates timestamps to hour/day buckets in a fixed UTC offset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketClock {
    offset: FixedOffset,
}

impl BucketClock {
    /// Create a clock for an offset
    pub fn new(offset: FixedOffset) -> Self {
        Self { offset }
    }

    /// Create a clock from rollup configuration
    pub fn from_config(config: &RollupConfig) -> Result<Self> {
        Ok(Self::new(config.offset()?))
    }

    /// The reference offset
    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    /// Offset in seconds east of UTC
    pub fn offset_seconds(&self) -> i64 {
        i64::from(self.offset.local_minus_utc())
    }

    /// Start of the bucket containing `ts`
    pub fn truncate(&self, ts: DateTime<Utc>, interval: Interval) -> DateTime<Utc> {
        let local_secs = ts.timestamp() + self.offset_seconds();
        let into_bucket = local_secs.rem_euclid(interval.seconds());
        ts - Duration::seconds(into_bucket)
            - Duration::nanoseconds(i64::from(ts.timestamp_subsec_nanos()))
    }

    /// Civil date of `ts` in the reference offset
    pub fn local_date(&self, ts: DateTime<Utc>) -> NaiveDate {
        ts.with_timezone(&self.offset).date_naive()
    }

    /// First instant of a local day
    pub fn day_start(&self, date: NaiveDate) -> DateTime<Utc> {
        let midnight = date.and_time(chrono::NaiveTime::default());
        Utc.from_utc_datetime(&(midnight - Duration::seconds(self.offset_seconds())))
    }

    /// Last millisecond of a local day
    pub fn day_end(&self, date: NaiveDate) -> DateTime<Utc> {
        self.day_start(date) + Duration::days(1) - Duration::milliseconds(1)
    }

    /// `YYYY-MM-DD` label of the local day containing `ts`
    pub fn day_label(&self, ts: DateTime<Utc>) -> String {
        ts.with_timezone(&self.offset).format("%Y-%m-%d").to_string()
    }

    /// `MM-DD HH` label of the local hour containing `ts`
    pub fn hour_label(&self, ts: DateTime<Utc>) -> String {
        ts.with_timezone(&self.offset).format("%m-%d %H").to_string()
    }

    /// RFC 3339 rendering of `ts` in the reference offset
    pub fn render(&self, ts: DateTime<Utc>) -> String {
        ts.with_timezone(&self.offset).to_rfc3339()
    }
}

/// Deltas produced from one batch of newly inserted events
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RollupPlan {
    /// Hourly bucket deltas, sorted by key
    pub hourly: Vec<RollupDelta>,
    /// Daily bucket deltas, sorted by key
    pub daily: Vec<RollupDelta>,
}

impl RollupPlan {
    /// Whether there is nothing to apply
    pub fn is_empty(&self) -> bool {
        self.hourly.is_empty() && self.daily.is_empty()
    }

    /// Deltas for one table
    pub fn deltas(&self, interval: Interval) -> &[RollupDelta] {
        match interval {
            Interval::Hour => &self.hourly,
            Interval::Day => &self.daily,
        }
    }
}

/// Groups newly inserted raw events into per-bucket deltas
#[derive(Debug, Clone, Copy)]
pub struct RollupReconciler {
    clock: BucketClock,
}

impl RollupReconciler {
    /// Create a reconciler
    pub fn new(clock: BucketClock) -> Self {
        Self { clock }
    }

    /// Clock used for bucket boundaries
    pub fn clock(&self) -> &BucketClock {
        &self.clock
    }

    /// Sum counters per `(bucket, route, model)`
    ///
    /// The result is ordered by key so concurrent writers lock buckets in the
    /// same order.
    pub fn deltas(&self, events: &[UsageEvent], interval: Interval) -> Vec<RollupDelta> {
        let mut groups: BTreeMap<RollupKey, UsageCounters> = BTreeMap::new();
        for event in events {
            let key = RollupKey {
                bucket_start: self.clock.truncate(event.occurred_at, interval),
                route: event.route.clone(),
                model: event.model.clone(),
            };
            *groups.entry(key).or_default() += event.counters;
        }

        groups
            .into_iter()
            .map(|(key, counters)| RollupDelta { key, counters })
            .collect()
    }

    /// Hourly and daily deltas for a batch
    pub fn plan(&self, events: &[UsageEvent]) -> RollupPlan {
        RollupPlan {
            hourly: self.deltas(events, Interval::Hour),
            daily: self.deltas(events, Interval::Day),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use serde_json::json;

    fn shanghai() -> BucketClock {
        BucketClock::new(FixedOffset::east_opt(8 * 3600).unwrap())
    }

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn event(at: DateTime<Utc>, route: &str, model: &str, tokens: i64, failed: bool) -> UsageEvent {
        UsageEvent {
            occurred_at: at,
            route: route.to_string(),
            model: model.to_string(),
            counters: UsageCounters {
                total_tokens: tokens,
                input_tokens: tokens / 2,
                output_tokens: tokens - tokens / 2,
                ..UsageCounters::single_request(failed)
            },
            is_error: failed,
            raw: json!({}),
        }
    }

    fn apply(table: &mut BTreeMap<RollupKey, UsageCounters>, deltas: &[RollupDelta]) {
        for delta in deltas {
            *table.entry(delta.key.clone()).or_default() += delta.counters;
        }
    }

    #[test]
    fn test_truncate_uses_reference_offset() {
        let clock = shanghai();
        // 00:30 on Jan 2 in +08:00
        let at = ts("2024-01-01T16:30:15.250Z");
        assert_eq!(clock.truncate(at, Interval::Hour), ts("2024-01-01T16:00:00Z"));
        assert_eq!(clock.truncate(at, Interval::Day), ts("2024-01-01T16:00:00Z"));
        assert_eq!(clock.day_label(at), "2024-01-02");
        assert_eq!(clock.hour_label(at), "01-02 00");

        // 23:59 on Jan 1 in +08:00
        let before = ts("2024-01-01T15:59:00Z");
        assert_eq!(clock.truncate(before, Interval::Day), ts("2023-12-31T16:00:00Z"));
    }

    #[test]
    fn test_truncate_negative_offset() {
        let clock = BucketClock::new(FixedOffset::west_opt(5 * 3600 + 30 * 60).unwrap());
        let at = ts("2024-06-01T03:10:00Z");
        assert_eq!(clock.truncate(at, Interval::Hour), ts("2024-06-01T02:30:00Z"));
        assert_eq!(clock.truncate(at, Interval::Day), ts("2024-05-31T05:30:00Z"));
    }

    #[test]
    fn test_day_bounds() {
        let clock = shanghai();
        let date = NaiveDate::from_ymd_opt(2024, 3, 10).unwrap();
        assert_eq!(clock.day_start(date), ts("2024-03-09T16:00:00Z"));
        assert_eq!(clock.day_end(date), ts("2024-03-10T15:59:59.999Z"));
        assert_eq!(clock.local_date(clock.day_end(date)), date);
    }

    #[test]
    fn test_deltas_group_by_bucket_route_model() {
        let reconciler = RollupReconciler::new(shanghai());
        let events = vec![
            event(ts("2024-01-01T01:05:00Z"), "r1", "m1", 100, false),
            event(ts("2024-01-01T01:55:00Z"), "r1", "m1", 50, true),
            event(ts("2024-01-01T01:10:00Z"), "r2", "m1", 10, false),
            event(ts("2024-01-01T02:00:00Z"), "r1", "m1", 5, false),
        ];

        let plan = reconciler.plan(&events);
        assert_eq!(plan.hourly.len(), 3);
        assert_eq!(plan.daily.len(), 2);

        let first = &plan.hourly[0];
        assert_eq!(first.key.bucket_start, ts("2024-01-01T01:00:00Z"));
        assert_eq!(first.key.route, "r1");
        assert_eq!(first.counters.total_tokens, 150);
        assert_eq!(first.counters.total_requests, 2);
        assert_eq!(first.counters.failure_count, 1);

        let daily_r1 = plan
            .daily
            .iter()
            .find(|d| d.key.route == "r1")
            .unwrap();
        assert_eq!(daily_r1.counters.total_tokens, 155);
        assert_eq!(daily_r1.counters.total_requests, 3);
    }

    #[test]
    fn test_empty_batch_has_empty_plan() {
        let reconciler = RollupReconciler::new(shanghai());
        assert!(reconciler.plan(&[]).is_empty());
    }

    fn arb_event() -> impl Strategy<Value = UsageEvent> {
        (
            0i64..(14 * 86_400),
            prop::sample::select(vec!["claude", "openai"]),
            prop::sample::select(vec!["gpt-4o", "gemini-2.5-pro", "claude-sonnet-4"]),
            0i64..100_000,
            any::<bool>(),
        )
            .prop_map(|(secs, route, model, tokens, failed)| {
                event(
                    ts("2024-01-01T00:00:00Z") + Duration::seconds(secs),
                    route,
                    model,
                    tokens,
                    failed,
                )
            })
    }

    proptest! {
        #[test]
        fn prop_split_batches_are_additive(
            events in prop::collection::vec(arb_event(), 0..60),
            split in 0usize..60,
        ) {
            let reconciler = RollupReconciler::new(shanghai());
            let split = split.min(events.len());
            let (first, second) = events.split_at(split);

            for interval in [Interval::Hour, Interval::Day] {
                let mut whole = BTreeMap::new();
                apply(&mut whole, &reconciler.deltas(&events, interval));

                let mut forward = BTreeMap::new();
                apply(&mut forward, &reconciler.deltas(first, interval));
                apply(&mut forward, &reconciler.deltas(second, interval));

                let mut reverse = BTreeMap::new();
                apply(&mut reverse, &reconciler.deltas(second, interval));
                apply(&mut reverse, &reconciler.deltas(first, interval));

                prop_assert_eq!(&whole, &forward);
                prop_assert_eq!(&whole, &reverse);
            }
        }

        #[test]
        fn prop_hourly_rolls_up_to_daily(events in prop::collection::vec(arb_event(), 0..60)) {
            let reconciler = RollupReconciler::new(shanghai());
            let clock = *reconciler.clock();
            let plan = reconciler.plan(&events);

            let mut from_hourly: BTreeMap<RollupKey, UsageCounters> = BTreeMap::new();
            for delta in &plan.hourly {
                let key = RollupKey {
                    bucket_start: clock.truncate(delta.key.bucket_start, Interval::Day),
                    ..delta.key.clone()
                };
                *from_hourly.entry(key).or_default() += delta.counters;
            }

            let daily: BTreeMap<_, _> = plan
                .daily
                .iter()
                .map(|d| (d.key.clone(), d.counters))
                .collect();
            prop_assert_eq!(from_hourly, daily);
        }
    }
}
