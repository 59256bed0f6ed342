//! Web vitals ingestion with deterministic sampling

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;

use crate::config::VitalsConfig;
use crate::db::UsageStore;
use crate::error::Result;
use crate::models::{parse_beacon, VitalMetric, VitalSample, VitalsIngestResult};

const MAX_URL: usize = 1024;
const MAX_PATHNAME: usize = 256;
const MAX_USER_AGENT: usize = 512;
const MAX_APP_VERSION: usize = 32;

/// 32-bit string hash, `h = h * 31 + c` over UTF-16 code units with wrap-around
pub fn sample_hash(value: &str) -> i32 {
    value.encode_utf16().fold(0i32, |hash, unit| {
        (hash << 5).wrapping_sub(hash).wrapping_add(i32::from(unit))
    })
}

/// Whether a metric id falls inside the sample
///
/// The same id always gets the same answer for a given rate.
pub fn should_sample(metric_id: &str, rate: f64) -> bool {
    if rate >= 1.0 {
        return true;
    }
    if rate <= 0.0 {
        return false;
    }
    let bucket = i64::from(sample_hash(metric_id)).abs() % 100;
    #[allow(clippy::cast_precision_loss)]
    let bucket = bucket as f64;
    bucket < rate * 100.0
}

fn truncate(value: Option<&str>, max_chars: usize) -> Option<String> {
    value
        .filter(|v| !v.is_empty())
        .map(|v| v.chars().take(max_chars).collect())
}

/// Validates, samples and stores vitals beacons
pub struct VitalsIngestor {
    store: Arc<dyn UsageStore>,
    config: VitalsConfig,
}

impl VitalsIngestor {
    /// Create an ingestor writing to `store`
    pub fn new(store: Arc<dyn UsageStore>, config: VitalsConfig) -> Self {
        Self { store, config }
    }

    /// Ingest one beacon body
    pub async fn ingest(
        &self,
        body: &Value,
        user_agent: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<VitalsIngestResult> {
        let metrics = parse_beacon(body, self.config.max_batch)?;

        let mut samples = Vec::with_capacity(metrics.len());
        let mut sampled_out = 0u64;
        for metric in metrics {
            let rate = self.config.rate_for(metric.name.as_str());
            if should_sample(&metric.id, rate) {
                samples.push(to_sample(metric, user_agent, now));
            } else {
                sampled_out += 1;
            }
        }

        if !samples.is_empty() {
            self.store.insert_vitals(&samples).await?;
        }

        let accepted = samples.len() as u64;
        metrics::counter!("proxyusage_vitals_accepted_total").increment(accepted);
        metrics::counter!("proxyusage_vitals_sampled_out_total").increment(sampled_out);
        debug!(accepted, sampled_out, "Ingested vitals beacon");

        Ok(VitalsIngestResult {
            ok: true,
            accepted,
            sampled_out,
        })
    }
}

fn to_sample(metric: VitalMetric, user_agent: Option<&str>, now: DateTime<Utc>) -> VitalSample {
    VitalSample {
        name: metric.name,
        metric_id: metric.id,
        value: metric.value,
        delta: metric.delta,
        rating: metric.rating,
        navigation_type: metric.navigation_type,
        url: truncate(metric.url.as_deref(), MAX_URL),
        pathname: truncate(metric.pathname.as_deref(), MAX_PATHNAME),
        user_agent: truncate(user_agent, MAX_USER_AGENT),
        client_ts: metric.ts,
        app_version: truncate(metric.app_version.as_deref(), MAX_APP_VERSION),
        created_at: now,
    }
}
