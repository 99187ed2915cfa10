use crate::error::ConfigError;
use crate::store::ResultValue;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

mod job;
mod scheduler;

pub use job::{build_jobs, AggregatedRecord, AggregationJob, CycleReport, JobState};
pub use scheduler::{AggregationScheduler, ScheduledJob};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Statistic {
    Mean,
    Min,
    Max,
    Sum,
    Count,
    Median,
    Stddev,
    Spread,
    First,
    Last,
}

impl Statistic {
    pub const ALL: [Statistic; 10] = [
        Statistic::Mean,
        Statistic::Min,
        Statistic::Max,
        Statistic::Sum,
        Statistic::Count,
        Statistic::Median,
        Statistic::Stddev,
        Statistic::Spread,
        Statistic::First,
        Statistic::Last,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Statistic::Mean => "mean",
            Statistic::Min => "min",
            Statistic::Max => "max",
            Statistic::Sum => "sum",
            Statistic::Count => "count",
            Statistic::Median => "median",
            Statistic::Stddev => "stddev",
            Statistic::Spread => "spread",
            Statistic::First => "first",
            Statistic::Last => "last",
        }
    }

    /// Reduces one window of `(timestamp, value)` samples, ordered by timestamp.
    /// `count` yields an integer; `stddev` needs at least two samples.
    pub fn apply(self, samples: &[(DateTime<Utc>, f64)]) -> Option<ResultValue> {
        if samples.is_empty() {
            return None;
        }
        let values = || samples.iter().map(|(_, value)| *value);
        let len = samples.len() as f64;

        let value = match self {
            Statistic::Count => return Some(ResultValue::Integer(samples.len() as i64)),
            Statistic::Mean => values().sum::<f64>() / len,
            Statistic::Min => values().fold(f64::INFINITY, f64::min),
            Statistic::Max => values().fold(f64::NEG_INFINITY, f64::max),
            Statistic::Sum => values().sum(),
            Statistic::Median => {
                let mut sorted: Vec<f64> = values().collect();
                sorted.sort_by(|a, b| a.total_cmp(b));
                let mid = sorted.len() / 2;
                if sorted.len() % 2 == 0 {
                    (sorted[mid - 1] + sorted[mid]) / 2.0
                } else {
                    sorted[mid]
                }
            }
            Statistic::Stddev => {
                if samples.len() < 2 {
                    return None;
                }
                let mean = values().sum::<f64>() / len;
                let variance =
                    values().map(|value| (value - mean).powi(2)).sum::<f64>() / (len - 1.0);
                variance.sqrt()
            }
            Statistic::Spread => {
                let min = values().fold(f64::INFINITY, f64::min);
                let max = values().fold(f64::NEG_INFINITY, f64::max);
                max - min
            }
            Statistic::First => samples[0].1,
            Statistic::Last => samples[samples.len() - 1].1,
        };
        Some(ResultValue::Float(value))
    }
}

impl fmt::Display for Statistic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Statistic {
    type Err = ConfigError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim().to_ascii_lowercase();
        let normalized = match normalized.as_str() {
            "avg" | "average" => "mean",
            other => other,
        };
        Statistic::ALL
            .into_iter()
            .find(|statistic| statistic.as_str() == normalized)
            .ok_or_else(|| ConfigError::UnknownStatistic(raw.trim().to_string()))
    }
}

const MIN_INTERVAL: Duration = Duration::from_millis(1);
const MAX_INTERVAL: Duration = Duration::from_secs(3_650 * 86_400);

/// Parses durations such as `30m`, `1h30m`, `15s`, `250ms` or `1.5h`.
pub fn parse_interval(raw: &str) -> Result<Duration, ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidInterval {
        raw: raw.to_string(),
        reason: reason.to_string(),
    };

    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(invalid("empty"));
    }
    if trimmed.starts_with('-') {
        return Err(ConfigError::NonPositiveInterval(raw.to_string()));
    }

    let mut rest = trimmed.strip_prefix('+').unwrap_or(trimmed);
    let mut total_seconds = 0.0f64;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if number_len == 0 {
            return Err(invalid("expected a number"));
        }
        let number: f64 = rest[..number_len]
            .parse()
            .map_err(|_| invalid("malformed number"))?;
        rest = &rest[number_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let scale = match &rest[..unit_len] {
            "ms" => 0.001,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3_600.0,
            "d" => 86_400.0,
            "w" => 604_800.0,
            "" => return Err(invalid("missing unit")),
            _ => return Err(invalid("unknown unit")),
        };
        total_seconds += number * scale;
        rest = &rest[unit_len..];
    }

    if !total_seconds.is_finite() || total_seconds <= 0.0 {
        return Err(ConfigError::NonPositiveInterval(raw.to_string()));
    }
    let interval = Duration::try_from_secs_f64(total_seconds).map_err(|_| invalid("out of range"))?;
    // Windows are computed in whole milliseconds.
    if interval < MIN_INTERVAL {
        return Err(invalid("shorter than 1ms"));
    }
    if interval > MAX_INTERVAL || chrono::Duration::from_std(interval).is_err() {
        return Err(invalid("longer than 3650d"));
    }
    Ok(interval)
}

fn align_down(ts: DateTime<Utc>, every_ms: i64) -> DateTime<Utc> {
    let bucket_ms = ts.timestamp_millis().div_euclid(every_ms) * every_ms;
    Utc.timestamp_millis_opt(bucket_ms).single().unwrap_or(ts)
}

/// End of the epoch-aligned window of length `every` that contains `ts`.
pub fn window_end(ts: DateTime<Utc>, every: Duration) -> DateTime<Utc> {
    let every_ms = i64::try_from(every.as_millis()).unwrap_or(i64::MAX).max(1);
    chrono::Duration::try_milliseconds(every_ms)
        .and_then(|every| align_down(ts, every_ms).checked_add_signed(every))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
