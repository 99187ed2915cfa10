use crate::alert::{AlertMessage, AlertNotifier};
use crate::config::Config;
use crate::error::NotifyError;
use crate::ingest::{IngestOutcome, IngestionCoordinator};
use crate::pipeline::IngestStats;
use async_trait::async_trait;
use chrono::Utc;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, Outgoing, QoS};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;

pub fn mqtt_options(config: &Config, client_suffix: Option<&str>) -> MqttOptions {
    let client_id = match client_suffix {
        Some(suffix) => format!("{}-{suffix}", config.mqtt_client_id),
        None => config.mqtt_client_id.clone(),
    };
    let mut mqttoptions = MqttOptions::new(client_id, config.mqtt_host.clone(), config.mqtt_port);
    mqttoptions.set_keep_alive(config.mqtt_keepalive());
    if let Some(username) = &config.mqtt_username {
        mqttoptions.set_credentials(
            username.clone(),
            config.mqtt_password.clone().unwrap_or_default(),
        );
    }
    mqttoptions
}

pub fn subscription_filter(topic_prefix: &str) -> String {
    format!("{}/#", topic_prefix.trim_end_matches('/'))
}

/// Splits `<prefix>/<domain>/<sensorId>` into its domain and sensor parts.
pub fn parse_topic<'a>(topic_prefix: &str, topic: &'a str) -> Option<(&'a str, &'a str)> {
    let rest = topic
        .strip_prefix(topic_prefix.trim_end_matches('/'))?
        .strip_prefix('/')?;
    let (domain, sensor_id) = rest.split_once('/')?;
    if domain.is_empty() || sensor_id.is_empty() || sensor_id.contains('/') {
        return None;
    }
    Some((domain, sensor_id))
}

/// Feeds every sensor publish into the coordinator until `cancel` fires.
/// The wildcard subscription is re-issued after each (re)connect.
pub async fn run_listener(
    topic_prefix: String,
    client: AsyncClient,
    mut eventloop: EventLoop,
    coordinator: IngestionCoordinator,
    stats: Arc<IngestStats>,
    cancel: CancellationToken,
) {
    let filter = subscription_filter(&topic_prefix);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    match client.subscribe(filter.clone(), QoS::AtLeastOnce).await {
                        Ok(_) => {
                            tracing::info!(topic=%filter, "subscribed to sensor feed");
                            stats.set_bus_connected(true);
                        }
                        Err(err) => {
                            tracing::warn!(error=%err, topic=%filter, "failed to subscribe to sensor feed");
                            stats.set_bus_connected(false);
                        }
                    }
                }
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    let mut payload = publish.payload.to_vec();
                    let outcome = coordinator.handle(&mut payload, Utc::now()).await;
                    if outcome == IngestOutcome::Dropped {
                        match parse_topic(&topic_prefix, &publish.topic) {
                            Some((domain, sensor_id)) => {
                                tracing::debug!(domain, sensor_id, "dropped payload");
                            }
                            None => tracing::debug!(topic=%publish.topic, "dropped payload"),
                        }
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    stats.set_bus_connected(false);
                    tracing::warn!(error=%err, "MQTT connection dropped; reconnecting");
                    sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }
    stats.set_bus_connected(false);
    tracing::info!("sensor feed listener stopped");
}

/// Publishes alerts as JSON on a dedicated MQTT client.
#[derive(Clone)]
pub struct MqttAlertNotifier {
    client: AsyncClient,
    topic: String,
}

impl MqttAlertNotifier {
    /// Connects the alert client and drives its event loop until a disconnect
    /// goes out or `cancel` fires.
    pub fn spawn(config: &Config, cancel: CancellationToken) -> (Self, JoinHandle<()>) {
        let (client, mut eventloop) = AsyncClient::new(mqtt_options(config, Some("alerts")), 16);
        let driver = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    event = eventloop.poll() => match event {
                        Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
                        Ok(_) => {}
                        Err(err) => {
                            if cancel.is_cancelled() {
                                break;
                            }
                            tracing::warn!(error=%err, "alert MQTT connection dropped; reconnecting");
                            sleep(Duration::from_secs(1)).await;
                        }
                    },
                    _ = cancel.cancelled() => break,
                }
            }
        });
        (
            Self {
                client,
                topic: config.alert_topic.clone(),
            },
            driver,
        )
    }

    pub async fn disconnect(&self) {
        if let Err(err) = self.client.disconnect().await {
            tracing::debug!(error=%err, "alert client already disconnected");
        }
    }
}

#[async_trait]
impl AlertNotifier for MqttAlertNotifier {
    async fn notify(&self, alert: &AlertMessage) -> Result<(), NotifyError> {
        let payload = serde_json::to_vec(alert)?;
        self.client
            .publish(self.topic.clone(), QoS::AtLeastOnce, false, payload)
            .await?;
        Ok(())
    }
}
