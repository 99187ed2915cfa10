use thiserror::Error;

/// An inbound payload that could not be turned into a [`crate::telemetry::SensorReading`].
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed payload: {0}")]
    Malformed(#[from] simd_json::Error),

    #[error("invalid timestamp {raw:?}: {source}")]
    Timestamp {
        raw: String,
        #[source]
        source: chrono::ParseError,
    },
}

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("write queue closed")]
    QueueClosed,

    #[error("point rejected: {0}")]
    Rejected(String),
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("invalid query: {0}")]
    InvalidRequest(String),

    #[error("query rejected: {0}")]
    Rejected(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid interval {raw:?}: {reason}")]
    InvalidInterval { raw: String, reason: String },

    #[error("interval {0:?} must be positive")]
    NonPositiveInterval(String),

    #[error("unknown statistic {0:?}")]
    UnknownStatistic(String),
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("alert state io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("alert state is not valid JSON: {0}")]
    Format(#[from] serde_json::Error),

    #[error("alert state unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("failed to encode alert: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("failed to publish alert: {0}")]
    Publish(#[from] rumqttc::ClientError),

    #[error("notifier unavailable: {0}")]
    Unavailable(String),
}

/// A single aggregation result row that cannot become a derived point.
#[derive(Debug, Error, PartialEq)]
pub enum RowDecodeError {
    #[error("unsupported value representation {found} for {statistic}")]
    UnsupportedValue { statistic: String, found: String },

    #[error("result row is missing tag {0:?}")]
    MissingTag(String),
}
