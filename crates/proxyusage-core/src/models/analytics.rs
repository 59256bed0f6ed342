//! Rollup analytics models

use serde::{Deserialize, Serialize};

/// Success/failure counts for one bucket
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPoint {
    /// Bucket start in the reference offset, RFC 3339
    pub bucket: String,
    /// Successful requests
    pub success_count: i64,
    /// Failed requests
    pub failure_count: i64,
    /// All requests
    pub total_requests: i64,
    /// 0 when the bucket has no requests
    pub success_rate: f64,
    /// 0 when the bucket has no requests
    pub error_rate: f64,
}

/// Dimension used to rank failures
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureDimension {
    /// Group by model
    #[default]
    Model,
    /// Group by route
    Route,
}

impl FailureDimension {
    /// Parse `model`/`route`
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "model" => Some(Self::Model),
            "route" => Some(Self::Route),
            _ => None,
        }
    }
}

/// A model or route ranked by failures
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TopFailure {
    /// Model name when ranked by model
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Route name when ranked by route
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route: Option<String>,
    /// Failed requests
    pub failure_count: i64,
    /// All requests
    pub total_requests: i64,
    /// `failure_count / total_requests`
    pub error_rate: f64,
}

/// Token kinds for one bucket
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenBreakdownPoint {
    /// Bucket start in the reference offset, RFC 3339
    pub bucket: String,
    /// Input tokens
    pub input_tokens: i64,
    /// Output tokens
    pub output_tokens: i64,
    /// Reasoning tokens
    pub reasoning_tokens: i64,
    /// Cached input tokens
    pub cached_tokens: i64,
    /// Total tokens
    pub total_tokens: i64,
}

/// Cost of one model in one bucket
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CostTrendPoint {
    /// Bucket start in the reference offset, RFC 3339
    pub bucket: String,
    /// Model name
    pub model: String,
    /// Estimated cost
    pub cost: f64,
    /// False when no price entry matched
    pub priced: bool,
    /// Total tokens
    pub tokens: i64,
}
