use super::{PointWriter, ResultRow, ResultValue, SeriesPoint, SeriesQuery, WindowQuery};
use crate::aggregation::Statistic;
use crate::error::{QueryError, WriteError};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, StreamExt};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{Column, PgPool, Postgres, QueryBuilder, Row, TypeInfo};
use std::collections::BTreeMap;

// Six binds per row keeps a full chunk well under the 65535 parameter limit.
const INSERT_CHUNK_ROWS: usize = 1_000;

pub async fn build_pool(database_url: &str, max_connections: u32) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;
    Ok(pool)
}

pub async fn ensure_schema(pool: &PgPool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS points (
            bucket text NOT NULL,
            series text NOT NULL,
            field text NOT NULL,
            tags jsonb NOT NULL DEFAULT '{}'::jsonb,
            ts timestamptz NOT NULL,
            value double precision NOT NULL,
            PRIMARY KEY (bucket, series, field, tags, ts)
        )
        "#,
    )
    .execute(pool)
    .await
    .context("create points table")?;
    sqlx::query("CREATE INDEX IF NOT EXISTS points_bucket_series_ts_idx ON points (bucket, series, ts)")
        .execute(pool)
        .await
        .context("create points index")?;
    Ok(())
}

/// Upserts every field of every point into `bucket`, returning the number of rows touched.
pub async fn insert_points(
    pool: &PgPool,
    bucket: &str,
    points: &[SeriesPoint],
) -> Result<u64, WriteError> {
    // A single statement must not upsert the same key twice; the last write wins.
    let mut rows: BTreeMap<(&str, &str, &BTreeMap<String, String>, DateTime<Utc>), f64> =
        BTreeMap::new();
    for point in points {
        for (field, value) in &point.fields {
            if !value.is_finite() {
                return Err(WriteError::Rejected(format!(
                    "non-finite {field} for {} at {}",
                    point.series, point.timestamp
                )));
            }
            rows.insert(
                (point.series.as_str(), field.as_str(), &point.tags, point.timestamp),
                *value,
            );
        }
    }
    if rows.is_empty() {
        return Ok(0);
    }

    let rows: Vec<_> = rows.into_iter().collect();
    let mut written = 0u64;
    for chunk in rows.chunks(INSERT_CHUNK_ROWS) {
        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new("INSERT INTO points (bucket, series, field, tags, ts, value) ");
        builder.push_values(chunk.iter(), |mut b, ((series, field, tags, ts), value)| {
            b.push_bind(bucket)
                .push_bind(*series)
                .push_bind(*field)
                .push_bind(Json(*tags))
                .push_bind(*ts)
                .push_bind(*value);
        });
        builder.push(
            " ON CONFLICT (bucket, series, field, tags, ts) DO UPDATE SET value = EXCLUDED.value",
        );
        let result = builder.build().execute(pool).await?;
        written += result.rows_affected();
    }
    Ok(written)
}

#[derive(Clone)]
pub struct PgPointWriter {
    pool: PgPool,
    bucket: String,
}

impl PgPointWriter {
    pub fn new(pool: PgPool, bucket: impl Into<String>) -> Self {
        Self {
            pool,
            bucket: bucket.into(),
        }
    }
}

#[async_trait]
impl PointWriter for PgPointWriter {
    async fn write(&self, point: SeriesPoint) -> Result<(), WriteError> {
        insert_points(&self.pool, &self.bucket, std::slice::from_ref(&point)).await?;
        Ok(())
    }

    async fn write_batch(&self, points: Vec<SeriesPoint>) -> Result<u64, WriteError> {
        insert_points(&self.pool, &self.bucket, &points).await
    }
}

// $1 bucket, $2 series, $3 start, $4 group-by tag keys, $5 window seconds, $6 stop.
macro_rules! window_sql {
    ($aggregate:literal) => {
        concat!(
            "WITH windowed AS (",
            " SELECT ts, value,",
            " ARRAY(SELECT tags ->> g.key FROM unnest($4::text[]) WITH ORDINALITY AS g(key, ord)",
            " ORDER BY g.ord) AS group_key,",
            " date_bin(make_interval(secs => $5::float8), ts, TIMESTAMPTZ '1970-01-01 00:00:00+00')",
            " + make_interval(secs => $5::float8) AS window_end",
            " FROM points",
            " WHERE bucket = $1 AND series = $2 AND field = 'value'",
            " AND ts >= $3 AND ts < $6 AND tags ?& $4::text[]",
            ")",
            " SELECT group_key, window_end, ",
            $aggregate,
            " AS value FROM windowed",
            " GROUP BY group_key, window_end",
            " ORDER BY group_key, window_end"
        )
    };
}

fn statement_for(statistic: Statistic) -> &'static str {
    match statistic {
        Statistic::Mean => window_sql!("avg(value)"),
        Statistic::Min => window_sql!("min(value)"),
        Statistic::Max => window_sql!("max(value)"),
        Statistic::Sum => window_sql!("sum(value)"),
        Statistic::Count => window_sql!("count(*)"),
        Statistic::Median => window_sql!("percentile_cont(0.5) WITHIN GROUP (ORDER BY value)"),
        Statistic::Stddev => window_sql!("stddev_samp(value)"),
        Statistic::Spread => window_sql!("max(value) - min(value)"),
        Statistic::First => window_sql!("(array_agg(value ORDER BY ts ASC))[1]"),
        Statistic::Last => window_sql!("(array_agg(value ORDER BY ts DESC))[1]"),
    }
}

fn decode_value(row: &PgRow) -> ResultValue {
    if let Ok(value) = row.try_get::<Option<f64>, _>("value") {
        return value.map(ResultValue::Float).unwrap_or(ResultValue::Null);
    }
    if let Ok(value) = row.try_get::<Option<i64>, _>("value") {
        return value.map(ResultValue::Integer).unwrap_or(ResultValue::Null);
    }
    let found = row
        .try_column("value")
        .map(|column| column.type_info().name().to_string())
        .unwrap_or_else(|_| "missing".to_string());
    ResultValue::Other(found)
}

fn decode_row(statistic: Statistic, group_by: &[String], row: &PgRow) -> Result<ResultRow, QueryError> {
    let group_key: Vec<String> = row.try_get("group_key")?;
    let time: DateTime<Utc> = row.try_get("window_end")?;
    Ok(ResultRow {
        result: statistic.as_str().to_string(),
        value: decode_value(row),
        time,
        tags: group_by.iter().cloned().zip(group_key).collect(),
    })
}

#[derive(Clone)]
pub struct PgSeriesQuery {
    pool: PgPool,
}

impl PgSeriesQuery {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl SeriesQuery for PgSeriesQuery {
    fn query<'a>(&'a self, request: &WindowQuery) -> BoxStream<'a, Result<ResultRow, QueryError>> {
        let statistic = request.statistic;
        let group_by = request.group_by.clone();
        sqlx::query(statement_for(statistic))
            .bind(request.bucket.clone())
            .bind(request.measurement.clone())
            .bind(request.start)
            .bind(request.group_by.clone())
            .bind(request.every.as_secs_f64())
            .bind(request.stop)
            .fetch(&self.pool)
            .map(move |row| -> Result<ResultRow, QueryError> {
                let row = row?;
                decode_row(statistic, &group_by, &row)
            })
            .boxed()
    }
}
