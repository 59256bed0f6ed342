//! # ProxyUsage
//!
//! Usage and cost analytics for LLM API proxies.
//!
//! ProxyUsage pulls per-request usage from an upstream proxy, stores it
//! idempotently and keeps hourly/daily rollups in step with the raw records,
//! so dashboards can be answered from small aggregate tables.
//!
//! ## Architecture
//!
//! - **Collector**: upstream pull, payload parsing, cost estimation, vitals sampling
//! - **Rollup**: fixed-offset bucket clock, additive reconciliation, backfill
//! - **Storage**: PostgreSQL via sqlx, or an in-process store
//! - **Query**: raw/rollup planner, overview assembly, analytics, result cache
//! - **API**: REST API for dashboards and cron callers
//!
//! ## Quick Start
//!
//! ```bash
//! # Apply migrations and start the API
//! proxyusage db migrate
//! proxyusage serve
//!
//! # Pull usage once
//! proxyusage sync
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

pub mod api;
pub mod collector;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod query;
pub mod rollup;

pub use config::Config;
pub use error::{Error, Result};

/// Re-exports for convenience
pub mod prelude {
    pub use crate::collector::{CostEstimator, SyncService, UpstreamClient, VitalsIngestor};
    pub use crate::config::Config;
    pub use crate::db::{MemoryUsageStore, PgUsageStore, UsageStore};
    pub use crate::error::{Error, Result};
    pub use crate::models::*;
    pub use crate::query::{AnalyticsService, OverviewBuilder, ResultCache, VitalsReporter};
    pub use crate::rollup::{Backfiller, BucketClock, RollupReconciler};
}
