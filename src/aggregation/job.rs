use super::scheduler::ScheduledJob;
use super::{parse_interval, Statistic};
use crate::config::DomainConfig;
use crate::error::{ConfigError, RowDecodeError};
use crate::store::{
    PointWriter, ResultRow, ResultValue, SeriesPoint, SeriesQuery, WindowQuery, FIELD_VALUE,
    TAG_LOCATION, TAG_SENSOR_ID, TAG_TYPE,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Idle,
    Running,
    Stopped,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub written: u64,
    pub skipped_rows: u64,
    pub failed_writes: u64,
    pub failed_statistics: Vec<Statistic>,
}

/// One query result row, normalised and ready to be written as a derived point.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatedRecord {
    pub statistic: Statistic,
    pub sensor_id: String,
    pub location: String,
    pub value: f64,
    pub window_end: DateTime<Utc>,
}

impl AggregatedRecord {
    pub fn from_row(statistic: Statistic, row: &ResultRow) -> Result<Self, RowDecodeError> {
        let value = match &row.value {
            ResultValue::Float(value) => *value,
            ResultValue::Integer(value) => *value as f64,
            ResultValue::Null => {
                return Err(RowDecodeError::UnsupportedValue {
                    statistic: statistic.to_string(),
                    found: "null".to_string(),
                })
            }
            ResultValue::Other(found) => {
                return Err(RowDecodeError::UnsupportedValue {
                    statistic: statistic.to_string(),
                    found: found.clone(),
                })
            }
        };
        let tag = |key: &str| {
            row.tag(key)
                .map(str::to_string)
                .ok_or_else(|| RowDecodeError::MissingTag(key.to_string()))
        };
        Ok(Self {
            statistic,
            sensor_id: tag(TAG_SENSOR_ID)?,
            location: tag(TAG_LOCATION)?,
            value,
            window_end: row.time,
        })
    }

    pub fn into_point(self, domain: &str) -> SeriesPoint {
        SeriesPoint::new(derived_series(domain), self.window_end)
            .tag(TAG_SENSOR_ID, &self.sensor_id)
            .tag(TAG_LOCATION, &self.location)
            .tag(TAG_TYPE, self.statistic.as_str())
            .field(FIELD_VALUE, self.value)
    }
}

pub fn derived_series(domain: &str) -> String {
    format!("{domain}_aggregated")
}

pub struct AggregationJob {
    domain: String,
    statistics: Vec<Statistic>,
    interval: String,
    source_bucket: String,
    query: Arc<dyn SeriesQuery>,
    writer: Arc<dyn PointWriter>,
    state: watch::Sender<JobState>,
    cycles: AtomicU64,
}

impl AggregationJob {
    pub fn new(
        domain: impl Into<String>,
        statistics: Vec<Statistic>,
        interval: impl Into<String>,
        source_bucket: impl Into<String>,
        query: Arc<dyn SeriesQuery>,
        writer: Arc<dyn PointWriter>,
    ) -> Self {
        let (state, _) = watch::channel(JobState::Idle);
        Self {
            domain: domain.into(),
            statistics,
            interval: interval.into(),
            source_bucket: source_bucket.into(),
            query,
            writer,
            state,
            cycles: AtomicU64::new(0),
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn state(&self) -> JobState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<JobState> {
        self.state.subscribe()
    }

    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    /// Aggregates the trailing `window` ending at `now` for every configured statistic.
    pub async fn run_cycle(&self, window: Duration, now: DateTime<Utc>) -> CycleReport {
        let mut report = CycleReport::default();
        let Some(start) = chrono::Duration::from_std(window)
            .ok()
            .and_then(|span| now.checked_sub_signed(span))
        else {
            tracing::warn!(
                domain = %self.domain,
                window_ms = window.as_millis() as u64,
                "aggregation window reaches past the earliest representable time; cycle skipped"
            );
            report.failed_statistics = self.statistics.clone();
            return report;
        };
        let group_by = vec![TAG_SENSOR_ID.to_string(), TAG_LOCATION.to_string()];

        for &statistic in &self.statistics {
            let request = WindowQuery {
                bucket: self.source_bucket.clone(),
                measurement: self.domain.clone(),
                start,
                stop: now,
                every: window,
                group_by: group_by.clone(),
                statistic,
            };

            let mut rows = self.query.query(&request);
            while let Some(row) = rows.next().await {
                let row = match row {
                    Ok(row) => row,
                    Err(err) => {
                        tracing::warn!(
                            domain = %self.domain,
                            statistic = %statistic,
                            error = %err,
                            "aggregation query failed; skipping statistic this cycle"
                        );
                        report.failed_statistics.push(statistic);
                        break;
                    }
                };

                let record = match AggregatedRecord::from_row(statistic, &row) {
                    Ok(record) => record,
                    Err(err) => {
                        tracing::warn!(
                            domain = %self.domain,
                            statistic = %statistic,
                            error = %err,
                            "skipping aggregation row"
                        );
                        report.skipped_rows += 1;
                        continue;
                    }
                };

                let sensor_id = record.sensor_id.clone();
                match self.writer.write(record.into_point(&self.domain)).await {
                    Ok(()) => report.written += 1,
                    Err(err) => {
                        tracing::warn!(
                            domain = %self.domain,
                            statistic = %statistic,
                            sensor_id = %sensor_id,
                            error = %err,
                            "failed to write aggregated point"
                        );
                        report.failed_writes += 1;
                    }
                }
            }
        }

        report
    }
}

#[async_trait]
impl ScheduledJob for AggregationJob {
    fn name(&self) -> &str {
        &self.domain
    }

    async fn run(&self, cancel: CancellationToken) -> Result<(), ConfigError> {
        let window = match parse_interval(&self.interval) {
            Ok(window) => window,
            Err(err) => {
                tracing::error!(
                    domain = %self.domain,
                    interval = %self.interval,
                    error = %err,
                    "invalid aggregation interval; job disabled"
                );
                self.state.send_replace(JobState::Stopped);
                return Err(err);
            }
        };

        let mut ticker = tokio::time::interval(window);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::info!(
            domain = %self.domain,
            interval = %self.interval,
            statistics = self.statistics.len(),
            "aggregation job started"
        );

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.state.send_replace(JobState::Running);
                    let span = tracing::info_span!("aggregation_cycle", domain = %self.domain);
                    let report = self.run_cycle(window, Utc::now()).instrument(span).await;
                    self.cycles.fetch_add(1, Ordering::Relaxed);
                    tracing::info!(
                        domain = %self.domain,
                        written = report.written,
                        skipped_rows = report.skipped_rows,
                        failed_writes = report.failed_writes,
                        failed_statistics = report.failed_statistics.len(),
                        "aggregation cycle finished"
                    );
                    self.state.send_replace(JobState::Idle);
                }
            }
        }

        self.state.send_replace(JobState::Stopped);
        Ok(())
    }

    async fn shutdown(&self) {
        self.state.send_replace(JobState::Stopped);
        tracing::info!(domain = %self.domain, cycles = self.cycles(), "aggregation job stopped");
    }
}

/// One job per configured domain, all reading from `source_bucket`.
pub fn build_jobs(
    domains: &[DomainConfig],
    source_bucket: &str,
    query: Arc<dyn SeriesQuery>,
    writer: Arc<dyn PointWriter>,
) -> Vec<Arc<AggregationJob>> {
    domains
        .iter()
        .map(|domain| {
            Arc::new(AggregationJob::new(
                domain.name.clone(),
                domain.statistics.clone(),
                domain.interval.clone(),
                source_bucket,
                query.clone(),
                writer.clone(),
            ))
        })
        .collect()
}
