use super::{AlertDecision, AlertRule, IngestOutcome, IngestionCoordinator};
use crate::alert::{AlertDebouncer, AlertState, MemoryAlertStateStore, RecordingNotifier};
use crate::config::DomainConfig;
use crate::store::memory::MemoryStore;
use crate::store::{TAG_LOCATION, TAG_SENSOR_ID};
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};
use tracing_subscriber::fmt::MakeWriter;

const RAW: &str = "sensor_data";

struct Harness {
    store: MemoryStore,
    state: Arc<MemoryAlertStateStore>,
    notifier: Arc<RecordingNotifier>,
    coordinator: IngestionCoordinator,
}

fn harness() -> Harness {
    let store = MemoryStore::new();
    let state = Arc::new(MemoryAlertStateStore::new());
    let notifier = Arc::new(RecordingNotifier::new());
    let rules = HashMap::from([(
        "temperature".to_string(),
        AlertRule {
            threshold: 30.0,
            unit: "°C".to_string(),
        },
    )]);
    let coordinator = IngestionCoordinator::new(
        Arc::new(store.writer(RAW)),
        AlertDebouncer::daily(state.clone()),
        notifier.clone(),
        rules,
    );
    Harness {
        store,
        state,
        notifier,
        coordinator,
    }
}

/// Collects formatted log lines so tests can assert on them.
#[derive(Clone, Default)]
struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl LogBuffer {
    fn lines_containing(&self, needle: &str) -> usize {
        let bytes = self.0.lock().unwrap().clone();
        String::from_utf8_lossy(&bytes)
            .lines()
            .filter(|line| line.contains(needle))
            .count()
    }
}

impl io::Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogBuffer {
    type Writer = LogBuffer;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

fn processing_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 11, 8, 30, 2).unwrap()
}

fn payload(domain: &str, value: f64) -> Vec<u8> {
    format!(
        r#"{{"sensorType":"{domain}","sensorId":"s1","location":"room1","value":{value},"unit":"C","timestamp":"2026-01-11T08:30:00Z"}}"#
    )
    .into_bytes()
}

#[tokio::test]
async fn hot_reading_is_stored_and_alerted_once() {
    let h = harness();
    let now = processing_time();

    let outcome = h.coordinator.handle(&mut payload("temperature", 35.0), now).await;

    assert_eq!(
        outcome,
        IngestOutcome::Processed {
            stored: true,
            alert: AlertDecision::Sent
        }
    );
    let stored = h.store.points_in(RAW);
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].series, "temperature");
    assert_eq!(stored[0].value(), Some(35.0));
    assert_eq!(stored[0].tags[TAG_SENSOR_ID], "s1");
    assert_eq!(stored[0].tags[TAG_LOCATION], "room1");

    let sent = h.notifier.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].subject, "High Temperature Alert: 35.00°C");
    assert!(sent[0].message.contains("Sensor ID: s1"));
    assert!(sent[0].message.contains("Location: room1"));
    assert_eq!(
        h.state.snapshot().await,
        Some(AlertState {
            last_alert_time: now
        })
    );
}

#[tokio::test]
async fn repeat_within_a_day_is_stored_but_not_alerted() {
    let h = harness();
    let now = processing_time();
    h.coordinator.handle(&mut payload("temperature", 35.0), now).await;

    let later = now + ChronoDuration::hours(1);
    let outcome = h.coordinator.handle(&mut payload("temperature", 35.0), later).await;

    assert_eq!(
        outcome,
        IngestOutcome::Processed {
            stored: true,
            alert: AlertDecision::Suppressed
        }
    );
    // Same series key and timestamp: the second write lands on the first point.
    assert_eq!(h.store.points_in(RAW).len(), 1);
    assert_eq!(h.notifier.sent().len(), 1);
    assert_eq!(
        h.state.snapshot().await.map(|state| state.last_alert_time),
        Some(now)
    );

    let next_day = now + ChronoDuration::hours(24);
    let outcome = h.coordinator.handle(&mut payload("temperature", 31.0), next_day).await;
    assert!(matches!(
        outcome,
        IngestOutcome::Processed {
            alert: AlertDecision::Sent,
            ..
        }
    ));
    assert_eq!(h.notifier.sent().len(), 2);
}

#[tokio::test]
async fn values_at_or_below_threshold_never_alert() {
    let h = harness();
    for value in [30.0, 29.99, -5.0, 0.0] {
        let outcome = h
            .coordinator
            .handle(&mut payload("temperature", value), processing_time())
            .await;
        assert_eq!(
            outcome,
            IngestOutcome::Processed {
                stored: true,
                alert: AlertDecision::BelowThreshold
            }
        );
    }
    assert!(h.notifier.sent().is_empty());
}

#[tokio::test]
async fn below_threshold_ignores_failing_state_store() {
    let h = harness();
    h.state.set_fail_load(true);
    h.coordinator
        .handle(&mut payload("temperature", 12.0), processing_time())
        .await;
    assert!(h.notifier.sent().is_empty());
}

#[tokio::test]
async fn domains_without_threshold_are_only_stored() {
    let h = harness();
    let outcome = h
        .coordinator
        .handle(&mut payload("humidity", 99.0), processing_time())
        .await;
    assert_eq!(
        outcome,
        IngestOutcome::Processed {
            stored: true,
            alert: AlertDecision::NoRule
        }
    );
    assert_eq!(h.store.points_in(RAW).len(), 1);
    assert!(h.notifier.sent().is_empty());
}

#[tokio::test]
async fn malformed_payload_is_dropped() {
    let h = harness();
    let mut missing_value =
        br#"{"sensorType":"temperature","sensorId":"s1","location":"room1","timestamp":"2026-01-11T08:30:00Z"}"#
            .to_vec();

    let logs = LogBuffer::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(logs.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::WARN)
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let outcome = h.coordinator.handle(&mut missing_value, processing_time()).await;

    assert_eq!(outcome, IngestOutcome::Dropped);
    assert_eq!(logs.lines_containing("dropping undecodable sensor payload"), 1);
    assert!(h.store.points().is_empty());
    assert!(h.notifier.sent().is_empty());
    assert_eq!(h.state.snapshot().await, None);
}

#[tokio::test]
async fn storage_failure_does_not_block_alerting() {
    let h = harness();
    h.store.reject_writes_when(|_| true);

    let outcome = h
        .coordinator
        .handle(&mut payload("temperature", 40.0), processing_time())
        .await;

    assert_eq!(
        outcome,
        IngestOutcome::Processed {
            stored: false,
            alert: AlertDecision::Sent
        }
    );
    assert_eq!(h.notifier.sent().len(), 1);
}

#[tokio::test]
async fn failed_notification_does_not_record_a_send() {
    let h = harness();
    h.notifier.set_failing(true);

    let outcome = h
        .coordinator
        .handle(&mut payload("temperature", 40.0), processing_time())
        .await;
    assert!(matches!(
        outcome,
        IngestOutcome::Processed {
            alert: AlertDecision::NotifyFailed,
            ..
        }
    ));
    assert_eq!(
        h.state.snapshot().await,
        Some(AlertState::default()),
        "state is read but never advanced"
    );

    h.notifier.set_failing(false);
    let outcome = h
        .coordinator
        .handle(&mut payload("temperature", 40.0), processing_time())
        .await;
    assert!(matches!(
        outcome,
        IngestOutcome::Processed {
            alert: AlertDecision::Sent,
            ..
        }
    ));
}

#[tokio::test]
async fn unreadable_alert_state_still_alerts() {
    let h = harness();
    h.state.set_fail_load(true);
    let now = processing_time();

    h.coordinator.handle(&mut payload("temperature", 40.0), now).await;
    h.coordinator
        .handle(&mut payload("temperature", 41.0), now + ChronoDuration::minutes(1))
        .await;

    assert_eq!(h.notifier.sent().len(), 2);
}

#[tokio::test]
async fn concurrent_eligible_readings_may_both_alert() {
    let h = harness();
    h.notifier.set_yield_before_send(true);
    let now = processing_time();
    let mut first = payload("temperature", 35.0);
    let mut second = payload("temperature", 36.0);

    let (a, b) = tokio::join!(
        h.coordinator.handle(&mut first, now),
        h.coordinator.handle(&mut second, now),
    );

    assert!(matches!(
        a,
        IngestOutcome::Processed {
            alert: AlertDecision::Sent,
            ..
        }
    ));
    assert!(matches!(
        b,
        IngestOutcome::Processed {
            alert: AlertDecision::Sent,
            ..
        }
    ));
    assert_eq!(h.notifier.sent().len(), 2);
}

#[tokio::test]
async fn system_check_bypasses_debouncer() {
    let h = harness();
    let now = processing_time();
    h.coordinator.handle(&mut payload("temperature", 35.0), now).await;

    h.coordinator
        .send_system_check("temperature", now)
        .await
        .unwrap();
    assert!(h.coordinator.send_system_check("humidity", now).await.is_err());

    let sent = h.notifier.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[1].subject, "[TEST] Temperature Alert System Check");
    assert!(sent[1].message.contains("Temperature: 35.00°C"));
    assert_eq!(
        h.state.snapshot().await.map(|state| state.last_alert_time),
        Some(now)
    );
}

#[test]
fn rules_come_from_domains_with_thresholds() {
    let mut temperature = DomainConfig::new("temperature", Vec::new(), "30m");
    temperature.alert_threshold = Some(30.0);
    temperature.unit = "°C".to_string();
    let humidity = DomainConfig::new("humidity", Vec::new(), "30m");

    let rules = IngestionCoordinator::rules_from_domains(&[temperature, humidity]);

    assert_eq!(rules.len(), 1);
    assert_eq!(
        rules["temperature"],
        AlertRule {
            threshold: 30.0,
            unit: "°C".to_string()
        }
    );
}
