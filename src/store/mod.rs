use crate::aggregation::Statistic;
use crate::error::{QueryError, WriteError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use std::collections::BTreeMap;
use std::time::Duration;

pub mod memory;
pub mod postgres;

pub const TAG_SENSOR_ID: &str = "sensorId";
pub const TAG_LOCATION: &str = "location";
pub const TAG_TYPE: &str = "type";
pub const FIELD_VALUE: &str = "value";

#[derive(Debug, Clone, PartialEq)]
pub struct SeriesPoint {
    pub series: String,
    pub tags: BTreeMap<String, String>,
    pub fields: BTreeMap<String, f64>,
    pub timestamp: DateTime<Utc>,
}

impl SeriesPoint {
    pub fn new(series: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            series: series.into(),
            tags: BTreeMap::new(),
            fields: BTreeMap::new(),
            timestamp,
        }
    }

    /// Empty tag values are dropped; the store treats them as absent.
    pub fn tag(mut self, key: &str, value: &str) -> Self {
        if !value.is_empty() {
            self.tags.insert(key.to_string(), value.to_string());
        }
        self
    }

    pub fn field(mut self, key: &str, value: f64) -> Self {
        self.fields.insert(key.to_string(), value);
        self
    }

    pub fn value(&self) -> Option<f64> {
        self.fields.get(FIELD_VALUE).copied()
    }
}

/// Durable append of points into one bucket of the time-series store.
#[async_trait]
pub trait PointWriter: Send + Sync {
    async fn write(&self, point: SeriesPoint) -> Result<(), WriteError>;

    async fn write_batch(&self, points: Vec<SeriesPoint>) -> Result<u64, WriteError> {
        let mut written = 0u64;
        for point in points {
            self.write(point).await?;
            written += 1;
        }
        Ok(written)
    }
}

/// One windowed aggregation over a bucket: points with `start <= ts < stop`,
/// grouped by `group_by` tags and by epoch-aligned windows of length `every`.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowQuery {
    pub bucket: String,
    pub measurement: String,
    pub start: DateTime<Utc>,
    pub stop: DateTime<Utc>,
    pub every: Duration,
    pub group_by: Vec<String>,
    pub statistic: Statistic,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResultValue {
    Float(f64),
    Integer(i64),
    Null,
    Other(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResultRow {
    pub result: String,
    pub value: ResultValue,
    pub time: DateTime<Utc>,
    pub tags: BTreeMap<String, String>,
}

impl ResultRow {
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }
}

pub trait SeriesQuery: Send + Sync {
    /// Rows are produced lazily; an `Err` item ends the result set.
    fn query<'a>(&'a self, request: &WindowQuery) -> BoxStream<'a, Result<ResultRow, QueryError>>;
}
