pub mod aggregation;
pub mod alert;
pub mod config;
pub mod error;
pub mod ingest;
pub mod mqtt;
pub mod pipeline;
pub mod store;
pub mod telemetry;
