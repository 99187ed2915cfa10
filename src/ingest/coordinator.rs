use crate::alert::{AlertDebouncer, AlertMessage, AlertNotifier};
use crate::config::DomainConfig;
use crate::error::NotifyError;
use crate::store::{PointWriter, SeriesPoint, FIELD_VALUE, TAG_LOCATION, TAG_SENSOR_ID};
use crate::telemetry::{self, SensorReading};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub struct AlertRule {
    pub threshold: f64,
    pub unit: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertDecision {
    /// The domain has no threshold configured.
    NoRule,
    BelowThreshold,
    Suppressed,
    Sent,
    NotifyFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Dropped,
    Processed { stored: bool, alert: AlertDecision },
}

pub fn reading_point(reading: &SensorReading) -> SeriesPoint {
    SeriesPoint::new(reading.domain.as_str(), reading.timestamp)
        .tag(TAG_SENSOR_ID, &reading.sensor_id)
        .tag(TAG_LOCATION, &reading.location)
        .field(FIELD_VALUE, reading.value)
}

#[derive(Clone)]
pub struct IngestionCoordinator {
    writer: Arc<dyn PointWriter>,
    debouncer: AlertDebouncer,
    notifier: Arc<dyn AlertNotifier>,
    rules: Arc<HashMap<String, AlertRule>>,
}

impl IngestionCoordinator {
    pub fn new(
        writer: Arc<dyn PointWriter>,
        debouncer: AlertDebouncer,
        notifier: Arc<dyn AlertNotifier>,
        rules: HashMap<String, AlertRule>,
    ) -> Self {
        Self {
            writer,
            debouncer,
            notifier,
            rules: Arc::new(rules),
        }
    }

    /// Alert rules for every domain that carries a threshold.
    pub fn rules_from_domains(domains: &[DomainConfig]) -> HashMap<String, AlertRule> {
        domains
            .iter()
            .filter_map(|domain| {
                domain.alert_threshold.map(|threshold| {
                    (
                        domain.name.clone(),
                        AlertRule {
                            threshold,
                            unit: domain.unit.clone(),
                        },
                    )
                })
            })
            .collect()
    }

    pub fn alerting_domains(&self) -> Vec<String> {
        let mut domains: Vec<String> = self.rules.keys().cloned().collect();
        domains.sort();
        domains
    }

    /// Decodes one bus payload and runs it through storage and alerting.
    pub async fn handle(&self, payload: &mut [u8], now: DateTime<Utc>) -> IngestOutcome {
        let reading = match telemetry::decode(payload) {
            Ok(reading) => reading,
            Err(err) => {
                tracing::warn!(error = %err, "dropping undecodable sensor payload");
                return IngestOutcome::Dropped;
            }
        };
        let (stored, alert) = self.process(reading, now).await;
        IngestOutcome::Processed { stored, alert }
    }

    pub async fn process(&self, reading: SensorReading, now: DateTime<Utc>) -> (bool, AlertDecision) {
        let stored = match self.writer.write(reading_point(&reading)).await {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(
                    domain = %reading.domain,
                    sensor_id = %reading.sensor_id,
                    error = %err,
                    "failed to store sensor reading"
                );
                false
            }
        };
        tracing::trace!(
            domain = %reading.domain,
            sensor_id = %reading.sensor_id,
            value = reading.value,
            "reading processed"
        );

        let alert = self.check_alert(&reading, now).await;
        (stored, alert)
    }

    async fn check_alert(&self, reading: &SensorReading, now: DateTime<Utc>) -> AlertDecision {
        let Some(rule) = self.rules.get(&reading.domain) else {
            return AlertDecision::NoRule;
        };
        if reading.value <= rule.threshold {
            return AlertDecision::BelowThreshold;
        }
        if !self.debouncer.should_send(now).await {
            return AlertDecision::Suppressed;
        }

        let alert = AlertMessage::threshold_exceeded(reading, &rule.unit);
        match self.notifier.notify(&alert).await {
            Ok(()) => {
                tracing::info!(
                    domain = %reading.domain,
                    sensor_id = %reading.sensor_id,
                    value = reading.value,
                    threshold = rule.threshold,
                    "alert sent"
                );
                self.debouncer.record_sent(now).await;
                AlertDecision::Sent
            }
            Err(err) => {
                tracing::warn!(
                    domain = %reading.domain,
                    sensor_id = %reading.sensor_id,
                    error = %err,
                    "failed to send alert"
                );
                AlertDecision::NotifyFailed
            }
        }
    }

    /// Sends a synthetic test alert for `domain`. Bypasses the debouncer and records nothing.
    pub async fn send_system_check(&self, domain: &str, now: DateTime<Utc>) -> Result<(), NotifyError> {
        let rule = self
            .rules
            .get(domain)
            .ok_or_else(|| NotifyError::Unavailable(format!("no alert rule for {domain}")))?;
        let reading = SensorReading {
            domain: domain.to_string(),
            sensor_id: "test_sensor".to_string(),
            location: "Test Location".to_string(),
            value: rule.threshold + 5.0,
            timestamp: now,
        };
        self.notifier
            .notify(&AlertMessage::system_check(&reading, &rule.unit))
            .await?;
        tracing::info!(domain, "test alert sent");
        Ok(())
    }
}
