//! PostgreSQL usage store

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, QueryBuilder, Row};
use tracing::{debug, info, instrument};

use super::query::{AggregateQuery, AggregateRow, Predicate, SortOrder, Source};
use super::{
    PreviewBucket, ResetScope, ResetSummary, RollupPreview, UsageStore, VitalsAggregateRow,
    VitalsGrouping, VitalsQuery,
};
use crate::config::DatabaseConfig;
use crate::error::{Error, Result};
use crate::models::{
    Interval, ModelPrice, RollupDelta, SyncBatch, SyncOutcome, UsageCounters, UsageEvent,
    VitalName, VitalSample,
};
use crate::rollup::{BucketClock, RollupReconciler};

/// Rows per multi-row INSERT; keeps bind parameters well under the protocol limit
const INSERT_CHUNK: usize = 500;

const COUNTER_COLUMNS: [&str; 8] = [
    "total_tokens",
    "input_tokens",
    "output_tokens",
    "reasoning_tokens",
    "cached_tokens",
    "total_requests",
    "success_count",
    "failure_count",
];

const EVENT_COLUMNS: &str = "occurred_at, route, model, total_tokens, input_tokens, \
     output_tokens, reasoning_tokens, cached_tokens, total_requests, success_count, \
     failure_count, is_error, raw";

/// Usage store over a Postgres pool
#[derive(Clone)]
pub struct PgUsageStore {
    pool: PgPool,
    clock: BucketClock,
}

impl PgUsageStore {
    /// Connect a pool
    pub async fn connect(config: &DatabaseConfig, clock: BucketClock) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await?;

        info!(
            max_connections = config.max_connections,
            "Connected to PostgreSQL"
        );
        Ok(Self { pool, clock })
    }

    /// Wrap an existing pool
    pub fn from_pool(pool: PgPool, clock: BucketClock) -> Self {
        Self { pool, clock }
    }

    /// Get the underlying pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// SQL truncating `column` to a bucket in the reference timezone
    fn bucket_expr(&self, column: &str, interval: Interval) -> String {
        bucket_sql(column, interval, self.clock.offset_seconds())
    }
}

/// Bucket truncation in SQL; `to_timestamp(floor((epoch + off) / w) * w - off)`
fn bucket_sql(column: &str, interval: Interval, offset_seconds: i64) -> String {
    let width = interval.seconds();
    format!(
        "to_timestamp(floor((extract(epoch from {column}) + ({offset_seconds})) / {width}) * {width} - ({offset_seconds}))"
    )
}

fn counters_from_row(row: &PgRow) -> std::result::Result<UsageCounters, sqlx::Error> {
    Ok(UsageCounters {
        total_tokens: row.try_get("total_tokens")?,
        input_tokens: row.try_get("input_tokens")?,
        output_tokens: row.try_get("output_tokens")?,
        reasoning_tokens: row.try_get("reasoning_tokens")?,
        cached_tokens: row.try_get("cached_tokens")?,
        total_requests: row.try_get("total_requests")?,
        success_count: row.try_get("success_count")?,
        failure_count: row.try_get("failure_count")?,
    })
}

fn row_to_event(row: &PgRow) -> std::result::Result<UsageEvent, sqlx::Error> {
    Ok(UsageEvent {
        occurred_at: row.try_get("occurred_at")?,
        route: row.try_get("route")?,
        model: row.try_get("model")?,
        counters: counters_from_row(row)?,
        is_error: row.try_get("is_error")?,
        raw: row.try_get("raw")?,
    })
}

fn push_predicates(qb: &mut QueryBuilder<'_, Postgres>, column: &str, predicates: &[Predicate]) {
    qb.push(" WHERE 1=1");
    for predicate in predicates {
        match predicate {
            Predicate::Since(ts) => {
                qb.push(format!(" AND {column} >= ")).push_bind(*ts);
            }
            Predicate::Until(ts) => {
                qb.push(format!(" AND {column} <= ")).push_bind(*ts);
            }
            Predicate::ModelEq(model) => {
                qb.push(" AND model = ").push_bind(model.clone());
            }
            Predicate::RouteEq(route) => {
                qb.push(" AND route = ").push_bind(route.clone());
            }
        }
    }
}

/// Additive upsert of rollup deltas; `ON CONFLICT` adds to existing counters
async fn upsert_deltas(
    conn: &mut sqlx::PgConnection,
    interval: Interval,
    deltas: &[RollupDelta],
) -> std::result::Result<(), sqlx::Error> {
    let table = interval.table();
    let time_column = Source::rollup(interval).time_column();

    for chunk in deltas.chunks(INSERT_CHUNK) {
        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "INSERT INTO {table} ({time_column}, route, model, {}) ",
            COUNTER_COLUMNS.join(", ")
        ));
        qb.push_values(chunk, |mut b, delta| {
            let c = &delta.counters;
            b.push_bind(delta.key.bucket_start)
                .push_bind(delta.key.route.clone())
                .push_bind(delta.key.model.clone())
                .push_bind(c.total_tokens)
                .push_bind(c.input_tokens)
                .push_bind(c.output_tokens)
                .push_bind(c.reasoning_tokens)
                .push_bind(c.cached_tokens)
                .push_bind(c.total_requests)
                .push_bind(c.success_count)
                .push_bind(c.failure_count);
        });

        let updates: Vec<String> = COUNTER_COLUMNS
            .iter()
            .map(|col| format!("{col} = {table}.{col} + EXCLUDED.{col}"))
            .collect();
        qb.push(format!(
            " ON CONFLICT ({time_column}, route, model) DO UPDATE SET {}, updated_at = NOW()",
            updates.join(", ")
        ));

        qb.build().execute(&mut *conn).await?;
    }
    Ok(())
}

#[async_trait]
impl UsageStore for PgUsageStore {
    #[instrument(skip_all, fields(attempted = batch.events.len()))]
    async fn commit_sync(
        &self,
        batch: &SyncBatch,
        reconciler: Option<&RollupReconciler>,
    ) -> Result<SyncOutcome> {
        let attempted = batch.attempted();
        let mut tx = self.pool.begin().await.map_err(Error::transaction)?;
        let mut fresh: Vec<UsageEvent> = Vec::new();

        for chunk in batch.events.chunks(INSERT_CHUNK) {
            let mut qb = QueryBuilder::<Postgres>::new(
                "INSERT INTO usage_records (occurred_at, synced_at, route, model, total_tokens, \
                 input_tokens, output_tokens, reasoning_tokens, cached_tokens, total_requests, \
                 success_count, failure_count, is_error, raw) ",
            );
            qb.push_values(chunk, |mut b, event| {
                let c = &event.counters;
                b.push_bind(event.occurred_at)
                    .push_bind(batch.synced_at)
                    .push_bind(event.route.clone())
                    .push_bind(event.model.clone())
                    .push_bind(c.total_tokens)
                    .push_bind(c.input_tokens)
                    .push_bind(c.output_tokens)
                    .push_bind(c.reasoning_tokens)
                    .push_bind(c.cached_tokens)
                    .push_bind(c.total_requests)
                    .push_bind(c.success_count)
                    .push_bind(c.failure_count)
                    .push_bind(event.is_error)
                    .push_bind(event.raw.clone());
            });
            qb.push(format!(
                " ON CONFLICT (occurred_at, route, model) DO NOTHING RETURNING {EVENT_COLUMNS}"
            ));

            let rows = qb
                .build()
                .fetch_all(&mut *tx)
                .await
                .map_err(Error::transaction)?;
            for row in &rows {
                fresh.push(row_to_event(row).map_err(Error::transaction)?);
            }
        }

        if fresh.is_empty() && attempted > 0 {
            let rows = sqlx::query(&format!(
                "SELECT {EVENT_COLUMNS} FROM usage_records WHERE synced_at = $1"
            ))
            .bind(batch.synced_at)
            .fetch_all(&mut *tx)
            .await
            .map_err(Error::transaction)?;

            for row in &rows {
                fresh.push(row_to_event(row).map_err(Error::transaction)?);
            }
            if !fresh.is_empty() {
                info!(
                    attempted,
                    recovered = fresh.len(),
                    "Insert reported no rows, counted rows stamped with this sync instead"
                );
            }
        }

        if let Some(reconciler) = reconciler.filter(|_| !fresh.is_empty()) {
            let plan = reconciler.plan(&fresh);
            for interval in [Interval::Hour, Interval::Day] {
                upsert_deltas(&mut tx, interval, plan.deltas(interval))
                    .await
                    .map_err(Error::transaction)?;
            }
            debug!(
                hourly = plan.hourly.len(),
                daily = plan.daily.len(),
                "Reconciled rollup buckets"
            );
        }

        tx.commit().await.map_err(Error::transaction)?;

        Ok(SyncOutcome {
            inserted: fresh.len() as u64,
            attempted,
        })
    }

    #[instrument(skip_all, fields(source = query.source.table()))]
    async fn aggregate(&self, query: &AggregateQuery) -> Result<Vec<AggregateRow>> {
        let time_column = query.source.time_column();
        let group = query.group_by;
        let mut grouped = Vec::new();

        let mut qb = QueryBuilder::<Postgres>::new("SELECT ");
        match group.time {
            Some(interval) => {
                // Rollup buckets are already aligned; re-truncating is a no-op for
                // the matching width and coarsens hourly rows into days.
                qb.push(self.bucket_expr(time_column, interval));
                grouped.push("bucket");
            }
            None => {
                qb.push("NULL::timestamptz");
            }
        }
        qb.push(" AS bucket, ");
        if group.model {
            qb.push("model");
            grouped.push("model");
        } else {
            qb.push("NULL::text AS model");
        }
        qb.push(", ");
        if group.route {
            qb.push("route");
            grouped.push("route");
        } else {
            qb.push("NULL::text AS route");
        }
        for col in COUNTER_COLUMNS {
            qb.push(format!(", COALESCE(SUM({col}), 0)::BIGINT AS {col}"));
        }
        qb.push(format!(" FROM {}", query.source.table()));
        push_predicates(&mut qb, time_column, &query.predicates);

        if !grouped.is_empty() {
            qb.push(format!(" GROUP BY {}", grouped.join(", ")));
        }

        let mut order: Vec<String> = Vec::new();
        if query.order == SortOrder::FailuresDesc {
            order.push("failure_count DESC".to_string());
        }
        order.extend(grouped.iter().map(|dim| match *dim {
            "bucket" => "bucket".to_string(),
            other => format!("{other} COLLATE \"C\""),
        }));
        if !order.is_empty() {
            qb.push(format!(" ORDER BY {}", order.join(", ")));
        }
        if let Some(limit) = query.limit {
            qb.push(" LIMIT ").push_bind(i64::try_from(limit).unwrap_or(i64::MAX));
        }

        let rows = qb.build().fetch_all(&self.pool).await.map_err(|e| {
            if query.source.is_rollup() {
                Error::rollup_query(e)
            } else {
                Error::Database(e)
            }
        })?;

        rows.iter()
            .map(|row| {
                Ok(AggregateRow {
                    bucket: row.try_get("bucket")?,
                    model: row.try_get("model")?,
                    route: row.try_get("route")?,
                    counters: counters_from_row(row)?,
                })
            })
            .collect()
    }

    async fn list_prices(&self) -> Result<Vec<ModelPrice>> {
        let rows = sqlx::query(
            r#"
            SELECT model, input_price_per_1m, cached_input_price_per_1m, output_price_per_1m
            FROM model_prices
            ORDER BY model
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(ModelPrice::new(
                    row.try_get::<String, _>("model")?,
                    row.try_get("input_price_per_1m")?,
                    row.try_get("cached_input_price_per_1m")?,
                    row.try_get("output_price_per_1m")?,
                ))
            })
            .collect()
    }

    #[instrument(skip(self), fields(model = %price.model))]
    async fn upsert_price(&self, price: &ModelPrice) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO model_prices (model, input_price_per_1m, cached_input_price_per_1m, output_price_per_1m)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (model) DO UPDATE SET
                input_price_per_1m = EXCLUDED.input_price_per_1m,
                cached_input_price_per_1m = EXCLUDED.cached_input_price_per_1m,
                output_price_per_1m = EXCLUDED.output_price_per_1m
            "#,
        )
        .bind(&price.model)
        .bind(price.input_price_per_1m)
        .bind(price.cached_input_price_per_1m)
        .bind(price.output_price_per_1m)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_price(&self, model: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM model_prices WHERE model = $1")
            .bind(model)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip_all, fields(count = samples.len()))]
    async fn insert_vitals(&self, samples: &[VitalSample]) -> Result<u64> {
        let mut inserted = 0;
        for chunk in samples.chunks(INSERT_CHUNK) {
            let mut qb = QueryBuilder::<Postgres>::new(
                "INSERT INTO web_vitals (name, metric_id, value, delta, rating, navigation_type, \
                 url, pathname, user_agent, client_ts, app_version, created_at) ",
            );
            qb.push_values(chunk, |mut b, s| {
                b.push_bind(s.name.as_str())
                    .push_bind(s.metric_id.clone())
                    .push_bind(s.value)
                    .push_bind(s.delta)
                    .push_bind(s.rating.map(|r| r.as_str()))
                    .push_bind(s.navigation_type.clone())
                    .push_bind(s.url.clone())
                    .push_bind(s.pathname.clone())
                    .push_bind(s.user_agent.clone())
                    .push_bind(s.client_ts)
                    .push_bind(s.app_version.clone())
                    .push_bind(s.created_at);
            });
            inserted += qb.build().execute(&self.pool).await?.rows_affected();
        }
        Ok(inserted)
    }

    async fn vitals_p75(&self, query: &VitalsQuery) -> Result<Vec<VitalsAggregateRow>> {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT name, ");
        let (grouped, order) = match query.grouping {
            VitalsGrouping::Name => {
                qb.push("NULL::text AS pathname, NULL::timestamptz AS bucket");
                ("name", "name")
            }
            VitalsGrouping::Page => {
                qb.push("pathname, NULL::timestamptz AS bucket");
                ("pathname, name", "pathname COLLATE \"C\" NULLS LAST, name")
            }
            VitalsGrouping::Bucket(interval) => {
                qb.push(format!(
                    "NULL::text AS pathname, {} AS bucket",
                    self.bucket_expr("created_at", interval)
                ));
                ("bucket, name", "bucket, name")
            }
        };
        qb.push(
            ", percentile_cont(0.75) WITHIN GROUP (ORDER BY value) AS p75, COUNT(*) AS count \
             FROM web_vitals WHERE created_at >= ",
        )
        .push_bind(query.since);
        if let Some(pathname) = &query.pathname {
            qb.push(" AND pathname = ").push_bind(pathname.clone());
        }
        if !query.names.is_empty() {
            let names: Vec<String> = query.names.iter().map(|n| n.as_str().to_string()).collect();
            qb.push(" AND name = ANY(").push_bind(names).push(")");
        }
        qb.push(format!(" GROUP BY {grouped} ORDER BY {order}"));

        let rows = qb.build().fetch_all(&self.pool).await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let raw_name: String = row.try_get("name")?;
            let Some(name) = VitalName::parse(&raw_name) else {
                debug!(name = %raw_name, "Skipping unknown vitals metric");
                continue;
            };
            let count: i64 = row.try_get("count")?;
            out.push(VitalsAggregateRow {
                name,
                pathname: row.try_get("pathname")?,
                bucket: row.try_get("bucket")?,
                p75: row.try_get("p75")?,
                count: u64::try_from(count).unwrap_or(0),
            });
        }
        Ok(out)
    }

    async fn earliest_event(&self) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query("SELECT MIN(occurred_at) AS earliest FROM usage_records")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("earliest")?)
    }

    #[instrument(skip(self))]
    async fn preview_rollups(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        interval: Interval,
        limit: usize,
    ) -> Result<RollupPreview> {
        let bucket = self.bucket_expr("occurred_at", interval);
        let grouped = format!(
            "SELECT {bucket} AS bucket_start, route, model, COUNT(*) AS record_count \
             FROM usage_records WHERE occurred_at >= $1 AND occurred_at < $2 \
             GROUP BY 1, 2, 3"
        );

        let total: i64 = sqlx::query(&format!("SELECT COUNT(*) AS total FROM ({grouped}) b"))
            .bind(start)
            .bind(end)
            .fetch_one(&self.pool)
            .await?
            .try_get("total")?;

        let rows = sqlx::query(&format!(
            "{grouped} ORDER BY 1 DESC, route COLLATE \"C\" DESC, model COLLATE \"C\" DESC LIMIT $3"
        ))
        .bind(start)
        .bind(end)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        let buckets = rows
            .iter()
            .map(|row| {
                Ok(PreviewBucket {
                    bucket_start: row.try_get("bucket_start")?,
                    route: row.try_get("route")?,
                    model: row.try_get("model")?,
                    record_count: row.try_get("record_count")?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(RollupPreview {
            total_buckets: u64::try_from(total).unwrap_or(0),
            buckets,
        })
    }

    #[instrument(skip(self))]
    async fn rebuild_rollups(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        interval: Interval,
    ) -> Result<u64> {
        let table = interval.table();
        let time_column = Source::rollup(interval).time_column();
        let bucket = self.bucket_expr("occurred_at", interval);
        let columns = COUNTER_COLUMNS.join(", ");
        let sums: Vec<String> = COUNTER_COLUMNS
            .iter()
            .map(|col| format!("COALESCE(SUM({col}), 0)::BIGINT"))
            .collect();

        let overwrites: Vec<String> = COUNTER_COLUMNS
            .iter()
            .map(|col| format!("{col} = EXCLUDED.{col}"))
            .collect();

        // Buckets with no raw rows left are kept as they are
        let written = sqlx::query(&format!(
            "INSERT INTO {table} ({time_column}, route, model, {columns}, created_at, updated_at) \
             SELECT {bucket}, route, model, {}, NOW(), NOW() \
             FROM usage_records WHERE occurred_at >= $1 AND occurred_at < $2 \
             GROUP BY 1, 2, 3 \
             ON CONFLICT ({time_column}, route, model) DO UPDATE SET {}, updated_at = NOW()",
            sums.join(", "),
            overwrites.join(", ")
        ))
        .bind(start)
        .bind(end)
        .execute(&self.pool)
        .await
        .map_err(Error::transaction)?
        .rows_affected();

        info!(table, written, "Rebuilt rollup buckets");
        Ok(written)
    }

    #[instrument(skip(self))]
    async fn reset(&self, scope: ResetScope) -> Result<ResetSummary> {
        let mut tx = self.pool.begin().await.map_err(Error::transaction)?;

        let raw_deleted = sqlx::query("DELETE FROM usage_records")
            .execute(&mut *tx)
            .await
            .map_err(Error::transaction)?
            .rows_affected();

        let mut rollups_deleted = 0;
        if scope == ResetScope::RawAndRollups {
            for interval in [Interval::Hour, Interval::Day] {
                rollups_deleted += sqlx::query(&format!("DELETE FROM {}", interval.table()))
                    .execute(&mut *tx)
                    .await
                    .map_err(Error::transaction)?
                    .rows_affected();
            }
        }

        tx.commit().await.map_err(Error::transaction)?;
        Ok(ResetSummary {
            raw_deleted,
            rollups_deleted,
        })
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_sql_shifts_by_offset() {
        assert_eq!(
            bucket_sql("occurred_at", Interval::Hour, 28_800),
            "to_timestamp(floor((extract(epoch from occurred_at) + (28800)) / 3600) * 3600 - (28800))"
        );
    }

    #[test]
    fn test_bucket_sql_negative_offset() {
        let sql = bucket_sql("day_start", Interval::Day, -18_000);
        assert!(sql.contains("+ (-18000)) / 86400) * 86400 - (-18000))"));
    }
}
