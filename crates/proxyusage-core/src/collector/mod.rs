//! Collector module - usage ingestion
//!
//! The collector pulls usage snapshots from the upstream proxy, parses them
//! into raw events, and commits them together with the rollup deltas of the
//! newly inserted rows.

mod cost;
mod parser;
mod upstream;
mod vitals;

pub use cost::{round_to, CostEstimate, CostEstimator, TokenUsage};
pub use parser::{parse_usage_payload, UNKNOWN};
pub use upstream::UpstreamClient;
pub use vitals::{sample_hash, should_sample, VitalsIngestor};

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{info, instrument};

use crate::db::UsageStore;
use crate::error::Result;
use crate::models::SyncReport;
use crate::rollup::RollupReconciler;

/// Runs sync cycles against a store
pub struct SyncService {
    store: Arc<dyn UsageStore>,
    upstream: Option<UpstreamClient>,
    reconciler: Option<RollupReconciler>,
}

impl SyncService {
    /// Create a sync service; without a reconciler only raw events are written
    pub fn new(
        store: Arc<dyn UsageStore>,
        upstream: Option<UpstreamClient>,
        reconciler: Option<RollupReconciler>,
    ) -> Self {
        Self {
            store,
            upstream,
            reconciler,
        }
    }

    /// Pull the upstream snapshot and commit it
    pub async fn sync_now(&self) -> Result<SyncReport> {
        let Some(upstream) = &self.upstream else {
            return Err(crate::error::Error::config("upstream.base_url is not configured"));
        };
        let pulled_at = Utc::now();
        let payload = upstream.fetch_usage().await?;
        self.sync_payload(&payload, pulled_at).await
    }

    /// Commit an already fetched payload, stamping rows with `synced_at`
    #[instrument(skip_all)]
    pub async fn sync_payload(&self, payload: &Value, synced_at: DateTime<Utc>) -> Result<SyncReport> {
        let batch = parse_usage_payload(payload, synced_at)?;
        metrics::counter!("proxyusage_sync_runs_total").increment(1);

        if batch.events.is_empty() {
            info!(rejected = batch.rejected, "Sync found no usage data");
            return Ok(SyncReport {
                status: "ok",
                inserted: 0,
                attempted: 0,
                rejected: batch.rejected as u64,
                message: Some("No usage data".to_string()),
            });
        }

        let outcome = self
            .store
            .commit_sync(&batch, self.reconciler.as_ref())
            .await?;

        metrics::counter!("proxyusage_sync_inserted_total").increment(outcome.inserted);
        metrics::counter!("proxyusage_sync_skipped_total").increment(outcome.skipped());
        info!(
            inserted = outcome.inserted,
            attempted = outcome.attempted,
            rejected = batch.rejected,
            "Sync committed"
        );

        Ok(SyncReport {
            status: "ok",
            inserted: outcome.inserted,
            attempted: outcome.attempted,
            rejected: batch.rejected as u64,
            message: None,
        })
    }
}
