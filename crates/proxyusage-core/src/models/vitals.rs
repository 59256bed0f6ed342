//! Web vitals models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, FieldError, Result};

/// Maximum metrics accepted in one beacon
pub const MAX_BEACON_METRICS: usize = 50;

/// Core web vital metric names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum VitalName {
    /// Cumulative Layout Shift
    Cls,
    /// First Contentful Paint
    Fcp,
    /// First Input Delay
    Fid,
    /// Interaction to Next Paint
    Inp,
    /// Largest Contentful Paint
    Lcp,
    /// Time to First Byte
    Ttfb,
}

impl VitalName {
    /// Every known metric
    pub const ALL: [Self; 6] = [Self::Cls, Self::Fcp, Self::Fid, Self::Inp, Self::Lcp, Self::Ttfb];

    /// Wire name
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cls => "CLS",
            Self::Fcp => "FCP",
            Self::Fid => "FID",
            Self::Inp => "INP",
            Self::Lcp => "LCP",
            Self::Ttfb => "TTFB",
        }
    }

    /// Parse an exact wire name
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|n| n.as_str() == value)
    }

    /// `(good, poor)` thresholds, if the metric is rated
    pub fn thresholds(self) -> Option<(f64, f64)> {
        match self {
            Self::Lcp => Some((2500.0, 4000.0)),
            Self::Cls => Some((0.1, 0.25)),
            Self::Inp => Some((200.0, 500.0)),
            Self::Fcp => Some((1800.0, 3000.0)),
            Self::Ttfb => Some((800.0, 1800.0)),
            Self::Fid => None,
        }
    }

    /// Rate a p75 value
    pub fn rate(self, value: f64) -> VitalRating {
        match self.thresholds() {
            None => VitalRating::Good,
            Some((good, _)) if value <= good => VitalRating::Good,
            Some((_, poor)) if value <= poor => VitalRating::NeedsImprovement,
            Some(_) => VitalRating::Poor,
        }
    }
}

impl std::fmt::Display for VitalName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rating bucket of a metric value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VitalRating {
    /// At or below the good threshold
    Good,
    /// Between the two thresholds
    NeedsImprovement,
    /// Above the poor threshold
    Poor,
}

impl VitalRating {
    /// Wire name
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Good => "good",
            Self::NeedsImprovement => "needs-improvement",
            Self::Poor => "poor",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "good" => Some(Self::Good),
            "needs-improvement" => Some(Self::NeedsImprovement),
            "poor" => Some(Self::Poor),
            _ => None,
        }
    }
}

/// One validated metric from a client beacon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VitalMetric {
    /// Metric name
    pub name: VitalName,
    /// Client generated metric id
    pub id: String,
    /// Metric value
    pub value: f64,
    /// Change since the last report
    pub delta: f64,
    /// Rating reported by the client
    pub rating: Option<VitalRating>,
    /// Navigation type reported by the client
    pub navigation_type: Option<String>,
    /// Page URL
    pub url: Option<String>,
    /// Page pathname
    pub pathname: Option<String>,
    /// Client timestamp, epoch milliseconds
    pub ts: Option<i64>,
    /// Client application version
    pub app_version: Option<String>,
}

impl VitalMetric {
    /// Shorthand for tests and fixtures
    pub fn new(name: VitalName, id: impl Into<String>, value: f64) -> Self {
        Self {
            name,
            id: id.into(),
            value,
            delta: value,
            rating: None,
            navigation_type: None,
            url: None,
            pathname: None,
            ts: None,
            app_version: None,
        }
    }
}

/// Validate a `{metrics: [...]}` beacon body
pub fn parse_beacon(body: &Value, max_batch: usize) -> Result<Vec<VitalMetric>> {
    let Some(metrics) = body.get("metrics").and_then(Value::as_array) else {
        return Err(Error::validation("metrics", "required array"));
    };
    if metrics.is_empty() {
        return Err(Error::validation("metrics", "must contain at least 1 item"));
    }
    if metrics.len() > max_batch {
        return Err(Error::validation(
            "metrics",
            format!("must contain at most {max_batch} items"),
        ));
    }

    let mut errors = Vec::new();
    let mut parsed = Vec::with_capacity(metrics.len());
    for (i, item) in metrics.iter().enumerate() {
        let prefix = format!("metrics.{i}");
        match item.as_object() {
            Some(obj) => {
                if let Some(metric) = parse_metric(obj, &prefix, &mut errors) {
                    parsed.push(metric);
                }
            }
            None => errors.push(FieldError::new(prefix, "expected object")),
        }
    }

    if errors.is_empty() {
        Ok(parsed)
    } else {
        Err(Error::Validation(errors))
    }
}

fn parse_metric(obj: &Map<String, Value>, prefix: &str, errors: &mut Vec<FieldError>) -> Option<VitalMetric> {
    let before = errors.len();
    let path = |field: &str| format!("{prefix}.{field}");

    let name = match obj.get("name").and_then(Value::as_str).map(VitalName::parse) {
        Some(Some(name)) => Some(name),
        _ => {
            errors.push(FieldError::new(
                path("name"),
                "expected one of CLS, FCP, FID, INP, LCP, TTFB",
            ));
            None
        }
    };

    let id = match obj.get("id").and_then(Value::as_str) {
        Some(id) if (1..=128).contains(&id.chars().count()) => Some(id.to_string()),
        _ => {
            errors.push(FieldError::new(path("id"), "expected string of 1 to 128 characters"));
            None
        }
    };

    let mut finite = |field: &str| match obj.get(field).and_then(Value::as_f64) {
        Some(n) if n.is_finite() => Some(n),
        _ => {
            errors.push(FieldError::new(path(field), "expected finite number"));
            None
        }
    };
    let value = finite("value");
    let delta = finite("delta");

    let rating = match obj.get("rating") {
        None | Some(Value::Null) => None,
        Some(v) => match v.as_str().and_then(VitalRating::parse) {
            Some(r) => Some(r),
            None => {
                errors.push(FieldError::new(
                    path("rating"),
                    "expected good, needs-improvement or poor",
                ));
                None
            }
        },
    };

    let navigation_type = optional_string(obj, "navigationType", 32, prefix, errors);
    let url = optional_string(obj, "url", 2048, prefix, errors);
    let pathname = optional_string(obj, "pathname", 512, prefix, errors);
    let app_version = optional_string(obj, "appVersion", 32, prefix, errors);

    let ts = match obj.get("ts") {
        None | Some(Value::Null) => None,
        Some(v) => match v.as_i64() {
            Some(n) if n > 0 => Some(n),
            _ => {
                errors.push(FieldError::new(path("ts"), "expected positive integer"));
                None
            }
        },
    };

    if errors.len() != before {
        return None;
    }

    Some(VitalMetric {
        name: name?,
        id: id?,
        value: value?,
        delta: delta?,
        rating,
        navigation_type,
        url,
        pathname,
        ts,
        app_version,
    })
}

fn optional_string(
    obj: &Map<String, Value>,
    field: &str,
    max: usize,
    prefix: &str,
    errors: &mut Vec<FieldError>,
) -> Option<String> {
    match obj.get(field) {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) if s.chars().count() <= max => Some(s.clone()),
        Some(_) => {
            errors.push(FieldError::new(
                format!("{prefix}.{field}"),
                format!("expected string of at most {max} characters"),
            ));
            None
        }
    }
}

/// A sampled metric as persisted
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VitalSample {
    /// Metric name
    pub name: VitalName,
    /// Client generated metric id
    pub metric_id: String,
    /// Metric value
    pub value: f64,
    /// Change since the last report
    pub delta: f64,
    /// Rating reported by the client
    pub rating: Option<VitalRating>,
    /// Navigation type reported by the client
    pub navigation_type: Option<String>,
    /// Page URL, truncated
    pub url: Option<String>,
    /// Page pathname, truncated
    pub pathname: Option<String>,
    /// Request user agent, truncated
    pub user_agent: Option<String>,
    /// Client timestamp, epoch milliseconds
    pub client_ts: Option<i64>,
    /// Client application version
    pub app_version: Option<String>,
    /// Server receive time
    pub created_at: DateTime<Utc>,
}

/// Ingestion response
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VitalsIngestResult {
    /// Always true on success
    pub ok: bool,
    /// Metrics stored
    pub accepted: u64,
    /// Metrics dropped by sampling
    pub sampled_out: u64,
}

/// p75 over a window, per metric
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VitalSummary {
    /// Metric name
    pub name: VitalName,
    /// 75th percentile value
    pub p75: f64,
    /// Samples in the window
    pub count: u64,
    /// Rating of the p75 value
    pub rating: VitalRating,
}

/// Per-page p75 summaries
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VitalsByPage {
    /// Page pathname, or `(unknown)`
    pub pathname: String,
    /// Summaries for the page
    pub metrics: Vec<VitalSummary>,
}

/// One point of the p75 time series
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VitalsTimeseriesPoint {
    /// Bucket start in the reference offset, RFC 3339
    pub bucket: String,
    /// Metric name
    pub name: VitalName,
    /// 75th percentile value
    pub p75: f64,
    /// Samples in the bucket
    pub count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    #[rstest]
    #[case(VitalName::Lcp, 2500.0, VitalRating::Good)]
    #[case(VitalName::Lcp, 3000.0, VitalRating::NeedsImprovement)]
    #[case(VitalName::Lcp, 4000.1, VitalRating::Poor)]
    #[case(VitalName::Cls, 0.05, VitalRating::Good)]
    #[case(VitalName::Cls, 0.3, VitalRating::Poor)]
    #[case(VitalName::Fid, 9999.0, VitalRating::Good)]
    fn test_rating(#[case] name: VitalName, #[case] value: f64, #[case] expected: VitalRating) {
        assert_eq!(name.rate(value), expected);
    }

    #[test]
    fn test_parse_beacon() {
        let metrics = parse_beacon(
            &json!({"metrics": [
                {"name": "LCP", "id": "v3-1", "value": 1200.5, "delta": 1200.5, "rating": "good", "pathname": "/dashboard", "ts": 1_700_000_000_000_i64},
                {"name": "CLS", "id": "v3-2", "value": 0.02, "delta": 0.01}
            ]}),
            MAX_BEACON_METRICS,
        )
        .unwrap();

        assert_eq!(metrics.len(), 2);
        assert_eq!(metrics[0].name, VitalName::Lcp);
        assert_eq!(metrics[0].rating, Some(VitalRating::Good));
        assert_eq!(metrics[0].pathname.as_deref(), Some("/dashboard"));
        assert_eq!(metrics[1].ts, None);
    }

    #[test]
    fn test_parse_beacon_field_paths() {
        let err = parse_beacon(
            &json!({"metrics": [
                {"name": "LCP", "id": "ok", "value": 1.0, "delta": 1.0},
                {"name": "TTI", "id": "", "value": 1.0, "delta": "x", "ts": -5}
            ]}),
            MAX_BEACON_METRICS,
        )
        .unwrap_err();

        let Error::Validation(fields) = err else {
            panic!("expected validation error");
        };
        let paths: Vec<_> = fields.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(
            paths,
            vec!["metrics.1.name", "metrics.1.id", "metrics.1.delta", "metrics.1.ts"]
        );
    }

    #[test]
    fn test_parse_beacon_batch_limits() {
        assert!(parse_beacon(&json!({"metrics": []}), MAX_BEACON_METRICS).is_err());

        let many: Vec<_> = (0..51)
            .map(|i| json!({"name": "LCP", "id": format!("m{i}"), "value": 1.0, "delta": 1.0}))
            .collect();
        assert!(parse_beacon(&json!({ "metrics": many }), MAX_BEACON_METRICS).is_err());
    }
}
