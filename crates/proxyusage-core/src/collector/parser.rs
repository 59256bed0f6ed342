//! Upstream usage payload parser
//!
//! Accepts the proxy's nested report
//! (`{usage: {apis: {<route>: {models: {<model>: {details: [...]}}}}}}`, the
//! `usage` wrapper being optional) as well as a flat list of records
//! (top-level array or `{records: [...]}`). Records without a usable
//! timestamp are dropped and counted; anything else missing defaults to 0.

use chrono::{DateTime, NaiveDateTime, SubsecRound, TimeZone, Utc};
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{Error, Result};
use crate::models::{SyncBatch, UsageCounters, UsageEvent};

/// Route/model used when a flat record does not name one
pub const UNKNOWN: &str = "unknown";

/// Parse an upstream report into a batch stamped with `synced_at`
pub fn parse_usage_payload(payload: &Value, synced_at: DateTime<Utc>) -> Result<SyncBatch> {
    let mut batch = SyncBatch {
        // Postgres keeps microseconds; the counting fallback compares on equality
        synced_at: synced_at.trunc_subsecs(6),
        events: Vec::new(),
        rejected: 0,
    };

    match payload {
        Value::Array(records) => parse_flat(records, &mut batch),
        Value::Object(obj) => {
            if let Some(records) = obj.get("records") {
                let records = records
                    .as_array()
                    .ok_or_else(|| Error::payload_format("`records` is not an array"))?;
                parse_flat(records, &mut batch);
            } else {
                let apis = obj
                    .get("usage")
                    .and_then(|u| u.get("apis"))
                    .or_else(|| obj.get("apis"))
                    .ok_or_else(|| Error::payload_format("missing `usage.apis`"))?;
                let apis = apis
                    .as_object()
                    .ok_or_else(|| Error::payload_format("`apis` is not an object"))?;
                parse_nested(apis, &mut batch);
            }
        }
        other => {
            return Err(Error::payload_format(format!(
                "expected object or array, got {}",
                json_kind(other)
            )))
        }
    }

    if batch.rejected > 0 {
        debug!(rejected = batch.rejected, "Dropped usage records without a valid timestamp");
    }
    Ok(batch)
}

fn parse_nested(apis: &Map<String, Value>, batch: &mut SyncBatch) {
    for (route, api) in apis {
        let Some(models) = api.get("models").and_then(Value::as_object) else {
            continue;
        };
        for (model, usage) in models {
            let Some(details) = usage.get("details").and_then(Value::as_array) else {
                continue;
            };
            for detail in details {
                match detail_event(route, model, detail) {
                    Some(event) => batch.events.push(event),
                    None => batch.rejected += 1,
                }
            }
        }
    }
}

fn detail_event(route: &str, model: &str, detail: &Value) -> Option<UsageEvent> {
    let occurred_at = detail.get("timestamp").and_then(parse_timestamp)?;
    let failed = detail.get("failed").is_some_and(truthy);
    let tokens = detail.get("tokens").unwrap_or(detail);

    Some(UsageEvent {
        occurred_at,
        route: route.to_string(),
        model: model.to_string(),
        counters: token_counters(tokens) + UsageCounters::single_request(failed),
        is_error: failed,
        raw: detail.clone(),
    })
}

fn parse_flat(records: &[Value], batch: &mut SyncBatch) {
    for record in records {
        match flat_event(record) {
            Some(event) => batch.events.push(event),
            None => batch.rejected += 1,
        }
    }
}

fn flat_event(record: &Value) -> Option<UsageEvent> {
    let obj = record.as_object()?;
    let occurred_at = ["timestamp", "occurredAt", "occurred_at"]
        .iter()
        .find_map(|k| obj.get(*k))
        .and_then(parse_timestamp)?;

    let route = ["route", "api"]
        .iter()
        .find_map(|k| obj.get(*k).and_then(Value::as_str))
        .filter(|s| !s.is_empty())
        .unwrap_or(UNKNOWN);
    let model = obj
        .get("model")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .unwrap_or(UNKNOWN);

    let failed = ["failed", "isError", "is_error"]
        .iter()
        .find_map(|k| obj.get(*k))
        .is_some_and(truthy);

    let mut counters = token_counters(obj.get("tokens").unwrap_or(record));
    let requests = first_count(obj, &["totalRequests", "total_requests"]);
    match requests {
        Some(total) => {
            let failures = first_count(obj, &["failureCount", "failure_count"])
                .unwrap_or(if failed { total } else { 0 })
                .min(total);
            counters.total_requests = total;
            counters.failure_count = failures;
            counters.success_count = first_count(obj, &["successCount", "success_count"])
                .unwrap_or(total - failures);
        }
        None => counters += UsageCounters::single_request(failed),
    }

    Some(UsageEvent {
        occurred_at,
        route: route.to_string(),
        model: model.to_string(),
        is_error: failed || counters.failure_count > 0,
        counters,
        raw: record.clone(),
    })
}

/// Token counters from an object using snake_case or camelCase names
fn token_counters(tokens: &Value) -> UsageCounters {
    let Some(obj) = tokens.as_object() else {
        return UsageCounters::default();
    };

    let input = first_count(obj, &["input_tokens", "inputTokens"]).unwrap_or(0);
    let output = first_count(obj, &["output_tokens", "outputTokens"]).unwrap_or(0);
    let reasoning = first_count(obj, &["reasoning_tokens", "reasoningTokens"]).unwrap_or(0);
    let cached = first_count(obj, &["cached_tokens", "cachedTokens"]).unwrap_or(0);
    let total = first_count(obj, &["total_tokens", "totalTokens"])
        .unwrap_or(input + output + reasoning);

    UsageCounters {
        total_tokens: total,
        input_tokens: input,
        output_tokens: output,
        reasoning_tokens: reasoning,
        cached_tokens: cached,
        ..UsageCounters::default()
    }
}

fn first_count(obj: &Map<String, Value>, keys: &[&str]) -> Option<i64> {
    keys.iter().find_map(|k| obj.get(*k)).map(to_count)
}

/// Non-negative integer from a JSON number or numeric string; anything else is 0
#[allow(clippy::cast_possible_truncation)]
fn to_count(value: &Value) -> i64 {
    let n = match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f.trunc() as i64)),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()).map(|f| f.trunc() as i64),
        _ => None,
    };
    n.unwrap_or(0).max(0)
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => matches!(s.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes"),
        _ => false,
    }
}

/// RFC 3339 text, naive UTC text, or epoch seconds/milliseconds
#[allow(clippy::cast_possible_truncation)]
fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    let ts = match value {
        Value::String(s) => {
            let s = s.trim();
            DateTime::parse_from_rfc3339(s)
                .map(|d| d.with_timezone(&Utc))
                .ok()
                .or_else(|| {
                    [
                        "%Y-%m-%dT%H:%M:%S%.f",
                        "%Y-%m-%d %H:%M:%S%.f",
                        "%Y-%m-%dT%H:%M:%S",
                        "%Y-%m-%d %H:%M:%S",
                    ]
                        .iter()
                        .find_map(|f| NaiveDateTime::parse_from_str(s, f).ok())
                        .map(|naive| Utc.from_utc_datetime(&naive))
                })
        }
        Value::Number(n) => {
            let n = n.as_f64().filter(|f| f.is_finite() && *f > 0.0)?;
            // Values past ~5138 AD in seconds are read as milliseconds
            let millis = if n < 1e11 { n * 1000.0 } else { n };
            Utc.timestamp_millis_opt(millis as i64).single()
        }
        _ => None,
    }?;
    Some(ts.trunc_subsecs(6))
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn pulled_at() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-05-01T12:00:00.123456789Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_nested_report() {
        let payload = json!({
            "failed_requests": 1,
            "usage": {
                "total_requests": 3,
                "apis": {
                    "sk-route-a": {
                        "models": {
                            "gpt-4o": {
                                "details": [
                                    {
                                        "timestamp": "2024-05-01T10:00:00.5+08:00",
                                        "source": "openai",
                                        "tokens": {
                                            "input_tokens": 120,
                                            "output_tokens": 30,
                                            "reasoning_tokens": 0,
                                            "cached_tokens": 20,
                                            "total_tokens": 150
                                        },
                                        "failed": false
                                    },
                                    {
                                        "timestamp": "2024-05-01T10:01:00Z",
                                        "tokens": {"input_tokens": 5},
                                        "failed": true
                                    }
                                ]
                            }
                        }
                    },
                    "sk-route-b": {
                        "models": {
                            "claude-sonnet-4": {
                                "details": [{"timestamp": "not a date", "tokens": {}}]
                            }
                        }
                    }
                }
            }
        });

        let batch = parse_usage_payload(&payload, pulled_at()).unwrap();
        assert_eq!(batch.events.len(), 2);
        assert_eq!(batch.rejected, 1);
        assert_eq!(batch.synced_at.timestamp_subsec_nanos(), 123_456_000);

        let first = &batch.events[0];
        assert_eq!(first.route, "sk-route-a");
        assert_eq!(first.model, "gpt-4o");
        assert_eq!(first.occurred_at.to_rfc3339(), "2024-05-01T02:00:00.500+00:00");
        assert_eq!(
            first.counters,
            UsageCounters {
                total_tokens: 150,
                input_tokens: 120,
                output_tokens: 30,
                reasoning_tokens: 0,
                cached_tokens: 20,
                total_requests: 1,
                success_count: 1,
                failure_count: 0,
            }
        );
        assert!(!first.is_error);

        let second = &batch.events[1];
        assert!(second.is_error);
        assert_eq!(second.counters.total_tokens, 5);
        assert_eq!(second.counters.failure_count, 1);
        assert_eq!(second.counters.success_count, 0);
    }

    #[test]
    fn test_flat_records() {
        let payload = json!([
            {
                "occurredAt": 1_714_557_600_000_i64,
                "route": "r1",
                "model": "gpt-4o",
                "inputTokens": "42",
                "outputTokens": -7,
                "totalRequests": 3,
                "failureCount": 1
            },
            {"timestamp": 1_714_557_600, "api": "r2", "model": "m", "tokens": {"total_tokens": 9.9}},
            {"model": "no-time"},
            "garbage"
        ]);

        let batch = parse_usage_payload(&payload, pulled_at()).unwrap();
        assert_eq!(batch.events.len(), 2);
        assert_eq!(batch.rejected, 2);

        let first = &batch.events[0];
        assert_eq!(first.counters.input_tokens, 42);
        assert_eq!(first.counters.output_tokens, 0);
        assert_eq!(first.counters.total_tokens, 42);
        assert_eq!(first.counters.total_requests, 3);
        assert_eq!(first.counters.success_count, 2);
        assert_eq!(first.counters.failure_count, 1);
        assert!(first.is_error);

        let second = &batch.events[1];
        assert_eq!(second.route, "r2");
        assert_eq!(second.occurred_at, first.occurred_at);
        assert_eq!(second.counters.total_tokens, 9);
        assert_eq!(second.counters.total_requests, 1);
    }

    #[test]
    fn test_records_wrapper_and_bare_apis() {
        let wrapped = json!({"records": [{"timestamp": "2024-05-01 08:00:00", "model": "m"}]});
        let batch = parse_usage_payload(&wrapped, pulled_at()).unwrap();
        assert_eq!(batch.events[0].route, UNKNOWN);

        let bare = json!({"apis": {}});
        assert!(parse_usage_payload(&bare, pulled_at()).unwrap().events.is_empty());
    }

    #[rstest::rstest]
    #[case(json!("usage"))]
    #[case(json!(42))]
    #[case(json!(null))]
    #[case(json!({"something": "else"}))]
    #[case(json!({"usage": {"apis": []}}))]
    #[case(json!({"records": {}}))]
    fn test_unrecognized_shapes(#[case] payload: Value) {
        assert!(matches!(
            parse_usage_payload(&payload, pulled_at()),
            Err(Error::PayloadFormat(_))
        ));
    }
}
