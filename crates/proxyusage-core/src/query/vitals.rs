//! Web vitals p75 reports

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::{non_blank, parse_int};
use crate::db::{UsageStore, VitalsGrouping, VitalsQuery};
use crate::error::{Error, FieldError, Result};
use crate::models::{Interval, VitalName, VitalSummary, VitalsByPage, VitalsTimeseriesPoint};
use crate::rollup::BucketClock;

/// Label for samples without a pathname
pub const UNKNOWN_PAGE: &str = "(unknown)";

const MAX_HOURS: i64 = 90 * 24;

/// Raw vitals query string
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VitalsRequest {
    /// Window in hours
    pub hours: Option<String>,
    /// Exact pathname filter
    pub pathname: Option<String>,
    /// `global` or `page`
    pub group_by: Option<String>,
    /// `hour` or `day`
    pub interval: Option<String>,
    /// Comma separated metric names
    pub metrics: Option<String>,
}

fn hours(request: &VitalsRequest, errors: &mut Vec<FieldError>) -> u32 {
    parse_int("hours", request.hours.as_deref(), errors)
        .map_or(24, |h| u32::try_from(h.clamp(1, MAX_HOURS)).unwrap_or(24))
}

/// Summary layout
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SummaryGrouping {
    /// One row per metric
    #[default]
    Global,
    /// Metrics nested under each pathname
    Page,
}

/// Summary parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VitalsSummaryParams {
    /// Window in hours, 1..=2160
    pub hours: u32,
    /// Output layout
    pub group_by: SummaryGrouping,
    /// Exact pathname filter
    pub pathname: Option<String>,
}

impl VitalsSummaryParams {
    /// Validate a request; defaults to the last 24 hours, global
    pub fn parse(request: &VitalsRequest) -> Result<Self> {
        let mut errors = Vec::new();
        let group_by = match non_blank(request.group_by.as_deref()).as_deref() {
            None | Some("global") => SummaryGrouping::Global,
            Some("page") => SummaryGrouping::Page,
            Some(_) => {
                errors.push(FieldError::new("groupBy", "expected global or page"));
                SummaryGrouping::Global
            }
        };
        let params = Self {
            hours: hours(request, &mut errors),
            group_by,
            pathname: non_blank(request.pathname.as_deref()),
        };
        if errors.is_empty() {
            Ok(params)
        } else {
            Err(Error::Validation(errors))
        }
    }
}

/// Time series parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VitalsTimeseriesParams {
    /// Window in hours, 1..=2160
    pub hours: u32,
    /// Bucket width
    pub interval: Interval,
    /// Exact pathname filter
    pub pathname: Option<String>,
    /// Metrics to chart, in request order
    pub metrics: Vec<VitalName>,
}

impl VitalsTimeseriesParams {
    /// Metrics charted when none are requested
    pub const DEFAULT_METRICS: [VitalName; 3] = [VitalName::Lcp, VitalName::Cls, VitalName::Inp];

    /// Validate a request; defaults to LCP, CLS and INP hourly over 24 hours
    pub fn parse(request: &VitalsRequest) -> Result<Self> {
        let mut errors = Vec::new();
        let interval = match non_blank(request.interval.as_deref()) {
            None => Interval::Hour,
            Some(value) => Interval::parse(&value).unwrap_or_else(|| {
                errors.push(FieldError::new("interval", "expected hour or day"));
                Interval::Hour
            }),
        };

        let mut metrics = Vec::new();
        for name in request
            .metrics
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|n| !n.is_empty())
        {
            match VitalName::parse(&name.to_ascii_uppercase()) {
                Some(metric) if !metrics.contains(&metric) => metrics.push(metric),
                Some(_) => {}
                None => errors.push(FieldError::new("metrics", format!("unknown metric {name}"))),
            }
        }
        if metrics.is_empty() {
            metrics = Self::DEFAULT_METRICS.to_vec();
        }

        let params = Self {
            hours: hours(request, &mut errors),
            interval,
            pathname: non_blank(request.pathname.as_deref()),
            metrics,
        };
        if errors.is_empty() {
            Ok(params)
        } else {
            Err(Error::Validation(errors))
        }
    }
}

/// Summary rows in the requested layout
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum VitalsSummary {
    /// One row per metric
    Global(Vec<VitalSummary>),
    /// One entry per page, in first-seen order
    Page(Vec<VitalsByPage>),
}

/// Reads p75 aggregates of stored vitals
pub struct VitalsReporter {
    store: Arc<dyn UsageStore>,
    clock: BucketClock,
}

impl VitalsReporter {
    /// Create a reporter
    pub fn new(store: Arc<dyn UsageStore>, clock: BucketClock) -> Self {
        Self { store, clock }
    }

    /// p75 per metric, globally or per page
    pub async fn summary(&self, params: &VitalsSummaryParams, now: DateTime<Utc>) -> Result<VitalsSummary> {
        let grouping = match params.group_by {
            SummaryGrouping::Global => VitalsGrouping::Name,
            SummaryGrouping::Page => VitalsGrouping::Page,
        };
        let rows = self
            .store
            .vitals_p75(&VitalsQuery {
                since: now - Duration::hours(i64::from(params.hours)),
                pathname: params.pathname.clone(),
                names: Vec::new(),
                grouping,
            })
            .await?;

        let summarize = |name: VitalName, p75: f64, count: u64| VitalSummary {
            name,
            p75,
            count,
            rating: name.rate(p75),
        };

        match params.group_by {
            SummaryGrouping::Global => Ok(VitalsSummary::Global(
                rows.into_iter()
                    .map(|r| summarize(r.name, r.p75, r.count))
                    .collect(),
            )),
            SummaryGrouping::Page => {
                let mut pages: Vec<VitalsByPage> = Vec::new();
                for row in rows {
                    let pathname = row.pathname.unwrap_or_else(|| UNKNOWN_PAGE.to_string());
                    let summary = summarize(row.name, row.p75, row.count);
                    match pages.iter_mut().find(|p| p.pathname == pathname) {
                        Some(page) => page.metrics.push(summary),
                        None => pages.push(VitalsByPage {
                            pathname,
                            metrics: vec![summary],
                        }),
                    }
                }
                Ok(VitalsSummary::Page(pages))
            }
        }
    }

    /// p75 per metric per bucket, oldest bucket first
    pub async fn timeseries(
        &self,
        params: &VitalsTimeseriesParams,
        now: DateTime<Utc>,
    ) -> Result<Vec<VitalsTimeseriesPoint>> {
        let rows = self
            .store
            .vitals_p75(&VitalsQuery {
                since: now - Duration::hours(i64::from(params.hours)),
                pathname: params.pathname.clone(),
                names: params.metrics.clone(),
                grouping: VitalsGrouping::Bucket(params.interval),
            })
            .await?;

        Ok(rows
            .into_iter()
            .filter_map(|row| {
                Some(VitalsTimeseriesPoint {
                    bucket: self.clock.render(row.bucket?),
                    name: row.name,
                    p75: row.p75,
                    count: row.count,
                })
            })
            .collect())
    }
}
