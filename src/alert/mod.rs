use crate::error::NotifyError;
use crate::telemetry::SensorReading;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

pub mod debounce;

pub use debounce::{
    AlertDebouncer, AlertState, AlertStateStore, FileAlertStateStore, MemoryAlertStateStore,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AlertMessage {
    pub subject: String,
    pub message: String,
}

impl AlertMessage {
    pub fn threshold_exceeded(reading: &SensorReading, unit: &str) -> Self {
        let label = title_case(&reading.domain);
        Self {
            subject: format!("High {label} Alert: {:.2}{unit}", reading.value),
            message: format!(
                "Warning: High {} detected!\n\n\
                 Sensor ID: {}\n\
                 Location: {}\n\
                 {label}: {:.2}{unit}\n\
                 Time: {}\n\n\
                 Please check the system as soon as possible.",
                reading.domain,
                reading.sensor_id,
                reading.location,
                reading.value,
                format_time(reading.timestamp),
            ),
        }
    }

    /// Startup probe proving the alert channel is wired end to end.
    pub fn system_check(reading: &SensorReading, unit: &str) -> Self {
        let label = title_case(&reading.domain);
        Self {
            subject: format!("[TEST] {label} Alert System Check"),
            message: format!(
                "This is a test email to verify the {} alert system is working correctly.\n\n\
                 Test Details:\n\
                 Sensor ID: {}\n\
                 Location: {}\n\
                 {label}: {:.2}{unit}\n\
                 Time: {}\n\n\
                 If you are receiving this email, the alert system is properly configured.",
                reading.domain,
                reading.sensor_id,
                reading.location,
                reading.value,
                format_time(reading.timestamp),
            ),
        }
    }
}

fn format_time(ts: DateTime<Utc>) -> String {
    ts.format("%a, %d %b %Y %H:%M:%S UTC").to_string()
}

fn title_case(domain: &str) -> String {
    let mut chars = domain.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Hands a formatted alert to the downstream delivery channel.
#[async_trait]
pub trait AlertNotifier: Send + Sync {
    async fn notify(&self, alert: &AlertMessage) -> Result<(), NotifyError>;
}

/// Keeps every alert in memory instead of delivering it.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<AlertMessage>>,
    failing: AtomicBool,
    yield_before_send: AtomicBool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    /// Suspends once inside `notify`, letting concurrent callers interleave.
    pub fn set_yield_before_send(&self, enabled: bool) {
        self.yield_before_send.store(enabled, Ordering::Relaxed);
    }

    pub fn sent(&self) -> Vec<AlertMessage> {
        self.sent
            .lock()
            .map(|sent| sent.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl AlertNotifier for RecordingNotifier {
    async fn notify(&self, alert: &AlertMessage) -> Result<(), NotifyError> {
        if self.yield_before_send.load(Ordering::Relaxed) {
            tokio::task::yield_now().await;
        }
        if self.failing.load(Ordering::Relaxed) {
            return Err(NotifyError::Unavailable("recording notifier set to fail".to_string()));
        }
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(alert.clone());
        }
        Ok(())
    }
}
