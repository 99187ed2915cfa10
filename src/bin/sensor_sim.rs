use anyhow::Result;
use chrono::{DateTime, Timelike, Utc};
use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rumqttc::{AsyncClient, MqttOptions, QoS};
use serde::Serialize;
use std::f64::consts::PI;
use std::time::Duration;
use telemetry_pipeline::telemetry::SensorReading;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Parser)]
#[command(about = "Publish synthetic temperature, humidity and electricity readings to MQTT.")]
struct Args {
    #[arg(long, env = "PIPELINE_MQTT_HOST", default_value = "127.0.0.1")]
    mqtt_host: String,

    #[arg(long, env = "PIPELINE_MQTT_PORT", default_value_t = 1883)]
    mqtt_port: u16,

    #[arg(long, env = "PIPELINE_MQTT_TOPIC_PREFIX", default_value = "sensors")]
    topic_prefix: String,

    /// RNG seed for deterministic noise (random when omitted).
    #[arg(long)]
    seed: Option<u64>,

    /// Divide every sensor interval by this factor.
    #[arg(long, default_value_t = 1)]
    speedup: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Pattern {
    Temperature,
    Humidity,
    Electricity,
}

#[derive(Debug, Clone)]
struct SimSensor {
    sensor_id: &'static str,
    location: &'static str,
    pattern: Pattern,
    min_value: f64,
    max_value: f64,
    interval: Duration,
}

impl SimSensor {
    const fn new(
        sensor_id: &'static str,
        location: &'static str,
        pattern: Pattern,
        min_value: f64,
        max_value: f64,
        interval_secs: u64,
    ) -> Self {
        Self {
            sensor_id,
            location,
            pattern,
            min_value,
            max_value,
            interval: Duration::from_secs(interval_secs),
        }
    }

    fn domain(&self) -> &'static str {
        match self.pattern {
            Pattern::Temperature => "temperature",
            Pattern::Humidity => "humidity",
            Pattern::Electricity => "electricity",
        }
    }

    fn unit(&self) -> &'static str {
        match self.pattern {
            Pattern::Temperature => "°C",
            Pattern::Humidity => "%",
            Pattern::Electricity => "kW",
        }
    }

    /// `noise` is a uniform sample in [-1, 1], scaled per pattern.
    fn value_at(&self, at: DateTime<Utc>, noise: f64) -> f64 {
        let span = self.max_value - self.min_value;
        match self.pattern {
            Pattern::Temperature => {
                let swing = 0.5 * (1.0 + span) * (0.5 + 0.5 * day_phase(at).sin());
                round_to(self.min_value + swing + noise * 0.5, 2)
            }
            Pattern::Humidity => {
                // Humidity runs opposite to temperature: highest overnight.
                let swing = 0.5 * span * (0.5 - 0.5 * day_phase(at).sin());
                let value = self.min_value + swing + noise * 2.0;
                round_to(value.clamp(self.min_value, self.max_value), 2)
            }
            Pattern::Electricity => {
                let base = self.min_value + span * usage_factor(at.hour());
                let value = base + noise * 0.1 * base;
                round_to(value.clamp(self.min_value, self.max_value), 3)
            }
        }
    }

    fn reading(&self, at: DateTime<Utc>, noise: f64) -> SensorReading {
        SensorReading {
            domain: self.domain().to_string(),
            sensor_id: self.sensor_id.to_string(),
            location: self.location.to_string(),
            value: self.value_at(at, noise),
            timestamp: at,
        }
    }
}

const SENSORS: [SimSensor; 10] = [
    SimSensor::new("temp_001", "Living Room", Pattern::Temperature, 18.0, 26.0, 5),
    SimSensor::new("temp_002", "Kitchen", Pattern::Temperature, 19.0, 28.0, 5),
    SimSensor::new("temp_003", "Bedroom", Pattern::Temperature, 16.0, 24.0, 5),
    SimSensor::new("temp_004", "Outside", Pattern::Temperature, 5.0, 35.0, 5),
    SimSensor::new("hum_001", "Living Room", Pattern::Humidity, 40.0, 60.0, 7),
    SimSensor::new("hum_002", "Kitchen", Pattern::Humidity, 45.0, 70.0, 7),
    SimSensor::new("hum_003", "Bathroom", Pattern::Humidity, 50.0, 85.0, 7),
    SimSensor::new("elec_001", "Main Panel", Pattern::Electricity, 0.5, 8.0, 10),
    SimSensor::new("elec_002", "Kitchen", Pattern::Electricity, 0.1, 3.0, 10),
    SimSensor::new("elec_003", "Living Room", Pattern::Electricity, 0.05, 2.0, 10),
];

/// Position in the UTC day as an angle, shifted so midnight is the trough.
fn day_phase(at: DateTime<Utc>) -> f64 {
    let day_fraction = f64::from(at.num_seconds_from_midnight()) / 86_400.0;
    2.0 * PI * day_fraction - PI / 2.0
}

fn usage_factor(hour: u32) -> f64 {
    match hour {
        7..=8 => 0.7,
        17..=21 => 0.9,
        22..=23 | 0..=5 => 0.3,
        _ => 0.5,
    }
}

fn round_to(value: f64, places: i32) -> f64 {
    let scale = 10f64.powi(places);
    (value * scale).round() / scale
}

#[derive(Serialize)]
struct Payload<'a> {
    #[serde(flatten)]
    reading: &'a SensorReading,
    unit: &'a str,
}

fn encode(sensor: &SimSensor, reading: &SensorReading) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(&Payload {
        reading,
        unit: sensor.unit(),
    })?)
}

async fn run_sensor(
    sensor: SimSensor,
    client: AsyncClient,
    topic_prefix: String,
    mut rng: StdRng,
    speedup: u32,
    cancel: CancellationToken,
) {
    let topic = format!("{topic_prefix}/{}/{}", sensor.domain(), sensor.sensor_id);
    let mut ticker = tokio::time::interval(sensor.interval / speedup.max(1));
    tracing::info!(sensor_id = sensor.sensor_id, location = sensor.location, "starting simulated sensor");

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let reading = sensor.reading(Utc::now(), rng.gen_range(-1.0..=1.0));
                let payload = match encode(&sensor, &reading) {
                    Ok(payload) => payload,
                    Err(err) => {
                        tracing::warn!(sensor_id = sensor.sensor_id, error=%err, "failed to encode reading");
                        continue;
                    }
                };
                match client.publish(topic.clone(), QoS::AtLeastOnce, false, payload).await {
                    Ok(()) => tracing::debug!(topic=%topic, value = reading.value, "published reading"),
                    Err(err) => {
                        tracing::warn!(topic=%topic, error=%err, "publish failed");
                        break;
                    }
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();
    let args = Args::parse();

    let mut options = MqttOptions::new(
        format!("sensor-sim-{}", std::process::id()),
        args.mqtt_host.clone(),
        args.mqtt_port,
    );
    options.set_keep_alive(Duration::from_secs(30));
    let (client, mut eventloop) = AsyncClient::new(options, 64);

    let cancel = CancellationToken::new();
    let driver_cancel = cancel.clone();
    let driver = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = driver_cancel.cancelled() => break,
                event = eventloop.poll() => {
                    if let Err(err) = event {
                        tracing::warn!(error=%err, "MQTT connection dropped; reconnecting");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
    });

    let mut tasks = Vec::with_capacity(SENSORS.len());
    for (index, sensor) in SENSORS.iter().enumerate() {
        let rng = match args.seed {
            Some(seed) => StdRng::seed_from_u64(seed ^ index as u64),
            None => StdRng::from_entropy(),
        };
        tasks.push(tokio::spawn(run_sensor(
            sensor.clone(),
            client.clone(),
            args.topic_prefix.clone(),
            rng,
            args.speedup,
            cancel.child_token(),
        )));
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("sensor simulation stopped");
    cancel.cancel();
    for task in tasks {
        let _ = task.await;
    }
    let _ = driver.await;
    Ok(())
}
