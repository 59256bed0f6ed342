//! Cost estimator for LLM usage
//!
//! Applies the configured price table (per million tokens) to token counts.
//! Model keys ending in `*` match by prefix; the longest matching prefix wins.

use std::collections::HashMap;

use serde::Serialize;

use crate::models::ModelPrice;

/// Token counts that are priced
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    /// Prompt tokens
    pub input: i64,
    /// Cached prompt tokens
    pub cached: i64,
    /// Completion tokens
    pub output: i64,
}

/// Result of pricing one model's usage
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CostEstimate {
    /// Monetary cost; 0 when unpriced
    pub cost: f64,
    /// Whether a price entry matched
    pub priced: bool,
}

/// Cost estimator over a price table
#[derive(Debug, Clone, Default)]
pub struct CostEstimator {
    exact: HashMap<String, ModelPrice>,
    /// `(prefix, price)`, longest prefix first
    wildcards: Vec<(String, ModelPrice)>,
}

impl CostEstimator {
    /// Build an estimator from price rows
    pub fn new(prices: impl IntoIterator<Item = ModelPrice>) -> Self {
        let mut exact = HashMap::new();
        let mut wildcards = Vec::new();

        for price in prices {
            match price.model.strip_suffix('*') {
                Some(prefix) => wildcards.push((prefix.to_string(), price)),
                None => {
                    exact.insert(price.model.clone(), price);
                }
            }
        }
        wildcards.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(&b.0)));

        Self { exact, wildcards }
    }

    /// Estimate the cost of `tokens` for `model`
    ///
    /// An unknown model costs 0 with `priced == false`; never an error.
    pub fn estimate(&self, tokens: TokenUsage, model: &str) -> CostEstimate {
        let Some(price) = self.find_pricing(model) else {
            tracing::debug!("No price configured for model: {}", model);
            return CostEstimate::default();
        };

        #[allow(clippy::cast_precision_loss)]
        let cost = tokens.input as f64 / 1_000_000.0 * price.input_price_per_1m
            + tokens.cached as f64 / 1_000_000.0 * price.cached_input_price_per_1m
            + tokens.output as f64 / 1_000_000.0 * price.output_price_per_1m;

        CostEstimate { cost, priced: true }
    }

    /// Find pricing for a model: exact entry first, then longest wildcard prefix
    pub fn find_pricing(&self, model: &str) -> Option<&ModelPrice> {
        if let Some(price) = self.exact.get(model) {
            return Some(price);
        }

        self.wildcards
            .iter()
            .find(|(prefix, _)| model.starts_with(prefix.as_str()))
            .map(|(_, price)| price)
    }

    /// Whether any price is configured
    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.wildcards.is_empty()
    }
}

/// Round to `places` decimals
pub fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}
