//! Offline rollup rebuild over a historical date range
//!
//! A non-dry run overwrites the buckets of the range from raw rows, so running
//! it twice gives the same tables.

use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Serialize;
use tracing::{info, instrument};

use super::BucketClock;
use crate::db::{RollupPreview, UsageStore};
use crate::error::{Error, Result};
use crate::models::Interval;

/// Buckets shown by a dry run
pub const PREVIEW_LIMIT: usize = 10;

/// Backfill request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackfillOptions {
    /// First local day; defaults to the day of the earliest raw event
    pub from: Option<NaiveDate>,
    /// Last local day; defaults to today
    pub to: Option<NaiveDate>,
    /// Tables to rebuild
    pub intervals: Vec<Interval>,
    /// Preview only
    pub dry_run: bool,
}

impl Default for BackfillOptions {
    fn default() -> Self {
        Self {
            from: None,
            to: None,
            intervals: vec![Interval::Hour, Interval::Day],
            dry_run: false,
        }
    }
}

/// Parse `hourly`, `daily` or `both`
pub fn parse_granularity(value: &str) -> Result<Vec<Interval>> {
    match value.trim().to_ascii_lowercase().as_str() {
        "both" => Ok(vec![Interval::Hour, Interval::Day]),
        other => Interval::parse(other)
            .map(|i| vec![i])
            .ok_or_else(|| Error::validation("granularity", "expected hourly, daily or both")),
    }
}

/// Outcome for one rollup table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntervalReport {
    /// Rollup table
    pub interval: Interval,
    /// Dry run preview
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview: Option<RollupPreview>,
    /// Buckets written by a real run
    pub buckets_written: u64,
}

/// Outcome of a backfill
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackfillReport {
    /// First local day rebuilt; `None` when there was nothing to rebuild
    pub from: Option<NaiveDate>,
    /// Last local day rebuilt
    pub to: Option<NaiveDate>,
    /// Whether only a preview ran
    pub dry_run: bool,
    /// One report per selected table
    pub intervals: Vec<IntervalReport>,
}

/// Rebuilds rollups from raw rows
pub struct Backfiller {
    store: Arc<dyn UsageStore>,
    clock: BucketClock,
}

impl Backfiller {
    /// Create a backfiller
    pub fn new(store: Arc<dyn UsageStore>, clock: BucketClock) -> Self {
        Self { store, clock }
    }

    /// Run a backfill; `now` decides the default end day
    #[instrument(skip(self), fields(dry_run = options.dry_run))]
    pub async fn run(&self, options: &BackfillOptions, now: DateTime<Utc>) -> Result<BackfillReport> {
        if options.intervals.is_empty() {
            return Err(Error::validation("granularity", "no rollup table selected"));
        }

        let from = match options.from {
            Some(from) => Some(from),
            None => self
                .store
                .earliest_event()
                .await?
                .map(|ts| self.clock.local_date(ts)),
        };
        let Some(from) = from else {
            info!("No raw usage records, nothing to backfill");
            return Ok(BackfillReport {
                from: None,
                to: options.to,
                dry_run: options.dry_run,
                intervals: Vec::new(),
            });
        };
        let to = options.to.unwrap_or_else(|| self.clock.local_date(now));
        if to < from {
            return Err(Error::validation("to", "must not be before from"));
        }

        let (start, end) = self.bounds(from, to);
        let mut reports = Vec::with_capacity(options.intervals.len());
        for &interval in &options.intervals {
            let report = if options.dry_run {
                let preview = self
                    .store
                    .preview_rollups(start, end, interval, PREVIEW_LIMIT)
                    .await?;
                info!(%interval, buckets = preview.total_buckets, "Backfill preview");
                IntervalReport {
                    interval,
                    preview: Some(preview),
                    buckets_written: 0,
                }
            } else {
                let written = self.store.rebuild_rollups(start, end, interval).await?;
                info!(%interval, written, "Rebuilt rollup buckets");
                IntervalReport {
                    interval,
                    preview: None,
                    buckets_written: written,
                }
            };
            reports.push(report);
        }

        Ok(BackfillReport {
            from: Some(from),
            to: Some(to),
            dry_run: options.dry_run,
            intervals: reports,
        })
    }

    /// `[start of from, start of the day after to)`
    fn bounds(&self, from: NaiveDate, to: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
        let start = self.clock.day_start(from);
        let end = self.clock.day_start(to) + Duration::days(1);
        (start, end)
    }
}
