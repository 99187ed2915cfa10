use super::{
    PointWriter, ResultRow, ResultValue, SeriesPoint, SeriesQuery, WindowQuery, FIELD_VALUE,
};
use crate::aggregation::{window_end, Statistic};
use crate::error::{QueryError, WriteError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

type RejectFn = Arc<dyn Fn(&SeriesPoint) -> bool + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub struct StoredPoint {
    pub bucket: String,
    pub point: SeriesPoint,
}

#[derive(Default)]
struct Inner {
    points: Vec<StoredPoint>,
    reject: Option<RejectFn>,
    failing: BTreeSet<Statistic>,
}

/// Process-local store holding every bucket in one vector. Points with the same
/// bucket, series, tags and timestamp are merged, like the Postgres upsert.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn writer(&self, bucket: impl Into<String>) -> MemoryPointWriter {
        MemoryPointWriter {
            store: self.clone(),
            bucket: bucket.into(),
        }
    }

    /// Subsequent writes of points matching `predicate` fail with [`WriteError::Rejected`].
    pub fn reject_writes_when<F>(&self, predicate: F)
    where
        F: Fn(&SeriesPoint) -> bool + Send + Sync + 'static,
    {
        self.lock().reject = Some(Arc::new(predicate));
    }

    /// Subsequent queries for `statistic` fail before yielding any row.
    pub fn fail_statistic(&self, statistic: Statistic) {
        self.lock().failing.insert(statistic);
    }

    pub fn points(&self) -> Vec<StoredPoint> {
        self.lock().points.clone()
    }

    pub fn points_in(&self, bucket: &str) -> Vec<SeriesPoint> {
        self.lock()
            .points
            .iter()
            .filter(|stored| stored.bucket == bucket)
            .map(|stored| stored.point.clone())
            .collect()
    }

    fn insert(&self, bucket: &str, point: SeriesPoint) -> Result<(), WriteError> {
        let mut inner = self.lock();
        if let Some(reject) = inner.reject.as_ref() {
            if reject(&point) {
                return Err(WriteError::Rejected(format!(
                    "{} at {}",
                    point.series, point.timestamp
                )));
            }
        }

        let existing = inner.points.iter_mut().find(|stored| {
            stored.bucket == bucket
                && stored.point.series == point.series
                && stored.point.tags == point.tags
                && stored.point.timestamp == point.timestamp
        });
        match existing {
            Some(stored) => stored.point.fields.extend(point.fields),
            None => inner.points.push(StoredPoint {
                bucket: bucket.to_string(),
                point,
            }),
        }
        Ok(())
    }

    fn evaluate(&self, request: &WindowQuery) -> Result<Vec<ResultRow>, QueryError> {
        let inner = self.lock();
        if inner.failing.contains(&request.statistic) {
            return Err(QueryError::Rejected(format!(
                "{} unavailable for {}",
                request.statistic, request.measurement
            )));
        }
        if request.every.is_zero() {
            return Err(QueryError::InvalidRequest("window length is zero".to_string()));
        }

        let mut groups: BTreeMap<(Vec<String>, DateTime<Utc>), Vec<(DateTime<Utc>, f64)>> =
            BTreeMap::new();
        for stored in &inner.points {
            let point = &stored.point;
            if stored.bucket != request.bucket
                || point.series != request.measurement
                || point.timestamp < request.start
                || point.timestamp >= request.stop
            {
                continue;
            }
            let Some(value) = point.fields.get(FIELD_VALUE).copied() else {
                continue;
            };
            let key: Option<Vec<String>> = request
                .group_by
                .iter()
                .map(|tag| point.tags.get(tag).cloned())
                .collect();
            let Some(key) = key else {
                continue;
            };
            groups
                .entry((key, window_end(point.timestamp, request.every)))
                .or_default()
                .push((point.timestamp, value));
        }

        let rows = groups
            .into_iter()
            .map(|((key, time), mut samples)| {
                samples.sort_by_key(|(ts, _)| *ts);
                ResultRow {
                    result: request.statistic.as_str().to_string(),
                    value: request.statistic.apply(&samples).unwrap_or(ResultValue::Null),
                    time,
                    tags: request.group_by.iter().cloned().zip(key).collect(),
                }
            })
            .collect();
        Ok(rows)
    }
}

impl SeriesQuery for MemoryStore {
    fn query<'a>(&'a self, request: &WindowQuery) -> BoxStream<'a, Result<ResultRow, QueryError>> {
        match self.evaluate(request) {
            Ok(rows) => stream::iter(rows.into_iter().map(Ok)).boxed(),
            Err(err) => stream::once(async move { Err(err) }).boxed(),
        }
    }
}

#[derive(Clone)]
pub struct MemoryPointWriter {
    store: MemoryStore,
    bucket: String,
}

#[async_trait]
impl PointWriter for MemoryPointWriter {
    async fn write(&self, point: SeriesPoint) -> Result<(), WriteError> {
        self.store.insert(&self.bucket, point)
    }
}
