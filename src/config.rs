use crate::aggregation::Statistic;
use anyhow::{Context, Result};
use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_DOMAINS: [&str; 3] = ["temperature", "humidity", "electricity"];
const DEFAULT_STATISTICS: [Statistic; 3] = [Statistic::Mean, Statistic::Min, Statistic::Max];
const DEFAULT_AGGREGATION_INTERVAL: &str = "30m";
const DEFAULT_TEMPERATURE_THRESHOLD: f64 = 30.0;

pub fn default_unit(domain: &str) -> &'static str {
    match domain {
        "temperature" => "°C",
        "humidity" => "%",
        "electricity" => "kW",
        _ => "",
    }
}

fn setup_config_path() -> Option<PathBuf> {
    env::var("PIPELINE_SETUP_CONFIG_PATH")
        .ok()
        .map(|path| path.trim().to_string())
        .filter(|path| !path.is_empty())
        .map(PathBuf::from)
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SetupDomain {
    pub name: String,
    #[serde(default)]
    pub statistics: Option<Vec<String>>,
    #[serde(default)]
    pub interval: Option<String>,
    #[serde(default)]
    pub alert_threshold: Option<f64>,
    #[serde(default)]
    pub unit: Option<String>,
}

/// Values from the optional JSON setup file. They only apply where the
/// matching environment variable is unset.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SetupConfigOverrides {
    #[serde(default)]
    pub database_url: Option<String>,
    #[serde(default)]
    pub mqtt_host: Option<String>,
    #[serde(default)]
    pub mqtt_port: Option<u16>,
    #[serde(default)]
    pub mqtt_username: Option<String>,
    #[serde(default)]
    pub mqtt_password: Option<String>,
    #[serde(default)]
    pub mqtt_topic_prefix: Option<String>,
    #[serde(default)]
    pub alert_topic: Option<String>,
    #[serde(default)]
    pub batch_size: Option<usize>,
    #[serde(default)]
    pub flush_interval_ms: Option<u64>,
    #[serde(default)]
    pub max_queue: Option<usize>,
    #[serde(default)]
    pub alert_state_file: Option<String>,
    #[serde(default)]
    pub aggregation_interval: Option<String>,
    #[serde(default)]
    pub domains: Option<Vec<SetupDomain>>,
}

impl SetupConfigOverrides {
    fn domain(&self, name: &str) -> Option<&SetupDomain> {
        self.domains
            .as_ref()?
            .iter()
            .find(|domain| domain.name.trim().eq_ignore_ascii_case(name))
    }
}

fn load_setup_config_overrides() -> Option<SetupConfigOverrides> {
    let path = setup_config_path()?;
    if !path.exists() {
        return None;
    }
    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "failed to read setup config; using env defaults"
            );
            return None;
        }
    };
    let mut bytes = contents.into_bytes();
    match simd_json::serde::from_slice(&mut bytes) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "failed to parse setup config; using env defaults"
            );
            None
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DomainConfig {
    pub name: String,
    pub statistics: Vec<Statistic>,
    /// Kept raw; the aggregation job parses it when it starts.
    pub interval: String,
    pub alert_threshold: Option<f64>,
    pub unit: String,
}

impl DomainConfig {
    pub fn new(name: impl Into<String>, statistics: Vec<Statistic>, interval: impl Into<String>) -> Self {
        let name = name.into();
        let unit = default_unit(&name).to_string();
        Self {
            name,
            statistics,
            interval: interval.into(),
            alert_threshold: None,
            unit,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub db_pool_size: u32,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_topic_prefix: String,
    pub mqtt_keepalive_secs: u64,
    pub mqtt_client_id: String,
    pub alert_topic: String,
    pub source_bucket: String,
    pub target_bucket: String,
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    pub max_queue: usize,
    pub alert_state_file: PathBuf,
    pub alert_suppression: chrono::Duration,
    pub send_test_alert: bool,
    pub domains: Vec<DomainConfig>,
    pub otlp_endpoint: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();
        let setup_overrides = load_setup_config_overrides();
        Self::from_lookup(|key| env::var(key).ok(), setup_overrides.as_ref())
    }

    pub fn from_lookup<F>(lookup: F, overrides: Option<&SetupConfigOverrides>) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let number = |key: &str| var(key).and_then(|v| v.parse::<u64>().ok());
        let setup = |pick: fn(&SetupConfigOverrides) -> Option<&String>| {
            overrides
                .and_then(pick)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let database_url = var("PIPELINE_DATABASE_URL")
            .or_else(|| var("DATABASE_URL"))
            .or_else(|| setup(|ov| ov.database_url.as_ref()))
            .context("PIPELINE_DATABASE_URL or DATABASE_URL is required (or present as database_url in the setup config)")?;
        let database_url = normalize_database_url(database_url);

        let mqtt_host = var("PIPELINE_MQTT_HOST")
            .or_else(|| setup(|ov| ov.mqtt_host.as_ref()))
            .unwrap_or_else(|| "127.0.0.1".to_string());
        let mqtt_port = var("PIPELINE_MQTT_PORT")
            .and_then(|v| v.parse::<u16>().ok())
            .or_else(|| overrides.and_then(|ov| ov.mqtt_port).filter(|v| *v != 0))
            .unwrap_or(1883);
        let mqtt_username =
            var("PIPELINE_MQTT_USERNAME").or_else(|| setup(|ov| ov.mqtt_username.as_ref()));
        let mqtt_password =
            var("PIPELINE_MQTT_PASSWORD").or_else(|| setup(|ov| ov.mqtt_password.as_ref()));
        let mqtt_topic_prefix = var("PIPELINE_MQTT_TOPIC_PREFIX")
            .or_else(|| setup(|ov| ov.mqtt_topic_prefix.as_ref()))
            .unwrap_or_else(|| "sensors".to_string());
        let mqtt_keepalive_secs = number("PIPELINE_MQTT_KEEPALIVE_SECS").unwrap_or(30);
        let mqtt_client_id = var("PIPELINE_MQTT_CLIENT_ID")
            .unwrap_or_else(|| format!("telemetry-pipeline-{}", std::process::id()));
        let alert_topic = var("PIPELINE_ALERT_TOPIC")
            .or_else(|| setup(|ov| ov.alert_topic.as_ref()))
            .unwrap_or_else(|| "emails".to_string());

        let source_bucket =
            var("PIPELINE_SOURCE_BUCKET").unwrap_or_else(|| "sensor_data".to_string());
        let target_bucket =
            var("PIPELINE_TARGET_BUCKET").unwrap_or_else(|| "aggregated_data".to_string());

        let batch_size = var("PIPELINE_BATCH_SIZE")
            .and_then(|v| v.parse::<usize>().ok())
            .or_else(|| overrides.and_then(|ov| ov.batch_size).filter(|v| *v != 0))
            .unwrap_or(500);
        let flush_interval_ms = number("PIPELINE_FLUSH_INTERVAL_MS")
            .or_else(|| overrides.and_then(|ov| ov.flush_interval_ms).filter(|v| *v != 0))
            .unwrap_or(750);
        let max_queue = var("PIPELINE_MAX_QUEUE")
            .and_then(|v| v.parse::<usize>().ok())
            .or_else(|| overrides.and_then(|ov| ov.max_queue).filter(|v| *v != 0))
            .unwrap_or(batch_size.saturating_mul(10));
        let db_pool_size = var("PIPELINE_DB_POOL_SIZE")
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(10);

        let alert_state_file = var("PIPELINE_ALERT_STATE_FILE")
            .or_else(|| var("ALERT_STATE_FILE"))
            .or_else(|| setup(|ov| ov.alert_state_file.as_ref()))
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/app/data/alert_state.json"));
        let alert_suppress_hours = number("PIPELINE_ALERT_SUPPRESS_HOURS")
            .filter(|v| *v != 0)
            .unwrap_or(24);
        let alert_suppression = i64::try_from(alert_suppress_hours)
            .ok()
            .and_then(chrono::Duration::try_hours)
            .with_context(|| {
                format!("PIPELINE_ALERT_SUPPRESS_HOURS={alert_suppress_hours} is out of range")
            })?;
        let send_test_alert = var("PIPELINE_SEND_TEST_ALERT")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        let aggregation_interval = var("PIPELINE_AGGREGATION_INTERVAL")
            .or_else(|| var("AGGREGATION_INTERVAL"))
            .or_else(|| setup(|ov| ov.aggregation_interval.as_ref()))
            .unwrap_or_else(|| DEFAULT_AGGREGATION_INTERVAL.to_string());

        let domain_names: Vec<String> = match var("PIPELINE_DOMAINS") {
            Some(raw) => split_list(&raw),
            None => match overrides.and_then(|ov| ov.domains.as_ref()) {
                Some(domains) => domains
                    .iter()
                    .map(|domain| domain.name.trim().to_ascii_lowercase())
                    .filter(|name| !name.is_empty())
                    .collect(),
                None => DEFAULT_DOMAINS.iter().map(|name| name.to_string()).collect(),
            },
        };

        let mut domains: Vec<DomainConfig> = Vec::with_capacity(domain_names.len());
        for name in domain_names {
            if domains.iter().any(|domain| domain.name == name) {
                continue;
            }
            let key = domain_env_key(&name);
            let setup_domain = overrides.and_then(|ov| ov.domain(&name));

            let statistic_names = match var(format!("PIPELINE_{key}_STATISTICS").as_str()) {
                Some(raw) => Some(split_list(&raw)),
                None => setup_domain.and_then(|domain| domain.statistics.clone()),
            };
            let statistics = match statistic_names {
                Some(names) => parse_statistics(&names)
                    .with_context(|| format!("invalid statistics for domain {name}"))?,
                None => DEFAULT_STATISTICS.to_vec(),
            };

            let interval = var(format!("PIPELINE_{key}_INTERVAL").as_str())
                .or_else(|| setup_domain.and_then(|domain| domain.interval.clone()))
                .unwrap_or_else(|| aggregation_interval.clone());

            let alert_threshold = match var(format!("PIPELINE_{key}_ALERT_THRESHOLD").as_str()) {
                Some(raw) if raw.eq_ignore_ascii_case("off") => None,
                Some(raw) => Some(raw.parse::<f64>().with_context(|| {
                    format!("PIPELINE_{key}_ALERT_THRESHOLD must be a number or \"off\"")
                })?),
                None => setup_domain
                    .and_then(|domain| domain.alert_threshold)
                    .or_else(|| {
                        (name == "temperature").then(|| {
                            var("TEMP_ALERT_THRESHOLD")
                                .and_then(|v| v.parse::<f64>().ok())
                                .unwrap_or(DEFAULT_TEMPERATURE_THRESHOLD)
                        })
                    }),
            };

            let unit = var(format!("PIPELINE_{key}_UNIT").as_str())
                .or_else(|| setup_domain.and_then(|domain| domain.unit.clone()))
                .unwrap_or_else(|| default_unit(&name).to_string());

            domains.push(DomainConfig {
                name,
                statistics,
                interval,
                alert_threshold,
                unit,
            });
        }

        let otlp_endpoint = var("OTEL_EXPORTER_OTLP_ENDPOINT");

        Ok(Self {
            database_url,
            db_pool_size,
            mqtt_host,
            mqtt_port,
            mqtt_username,
            mqtt_password,
            mqtt_topic_prefix,
            mqtt_keepalive_secs,
            mqtt_client_id,
            alert_topic,
            source_bucket,
            target_bucket,
            batch_size,
            flush_interval_ms,
            max_queue,
            alert_state_file,
            alert_suppression,
            send_test_alert,
            domains,
            otlp_endpoint,
        })
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn mqtt_keepalive(&self) -> Duration {
        Duration::from_secs(self.mqtt_keepalive_secs)
    }

    pub fn alert_suppression(&self) -> chrono::Duration {
        self.alert_suppression
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|item| item.trim().to_ascii_lowercase())
        .filter(|item| !item.is_empty())
        .collect()
}

fn domain_env_key(domain: &str) -> String {
    domain
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

fn parse_statistics(names: &[String]) -> Result<Vec<Statistic>> {
    let mut statistics = Vec::with_capacity(names.len());
    for name in names {
        let statistic = Statistic::from_str(name)?;
        if !statistics.contains(&statistic) {
            statistics.push(statistic);
        }
    }
    anyhow::ensure!(!statistics.is_empty(), "at least one statistic is required");
    Ok(statistics)
}

fn normalize_database_url(url: String) -> String {
    if let Some(stripped) = url.strip_prefix("postgresql+psycopg://") {
        return format!("postgresql://{stripped}");
    }
    if let Some(stripped) = url.strip_prefix("postgresql+asyncpg://") {
        return format!("postgresql://{stripped}");
    }
    url
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)], overrides: Option<&SetupConfigOverrides>) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned(), overrides)
    }

    #[test]
    fn defaults_cover_three_domains() {
        let config = config(&[("DATABASE_URL", "postgres://localhost/telemetry")], None).unwrap();

        assert_eq!(config.mqtt_host, "127.0.0.1");
        assert_eq!(config.mqtt_port, 1883);
        assert_eq!(config.mqtt_topic_prefix, "sensors");
        assert_eq!(config.alert_topic, "emails");
        assert_eq!(config.source_bucket, "sensor_data");
        assert_eq!(config.target_bucket, "aggregated_data");
        assert_eq!(config.max_queue, 5_000);
        assert_eq!(config.alert_state_file, PathBuf::from("/app/data/alert_state.json"));
        assert_eq!(config.alert_suppression(), chrono::Duration::hours(24));
        assert!(!config.send_test_alert);

        let names: Vec<&str> = config.domains.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, DEFAULT_DOMAINS.to_vec());
        let temperature = &config.domains[0];
        assert_eq!(temperature.alert_threshold, Some(30.0));
        assert_eq!(temperature.unit, "°C");
        assert_eq!(temperature.interval, "30m");
        assert_eq!(temperature.statistics, DEFAULT_STATISTICS.to_vec());
        assert_eq!(config.domains[1].alert_threshold, None);
        assert_eq!(config.domains[2].unit, "kW");
    }

    #[test]
    fn database_url_is_required() {
        let err = config(&[], None).unwrap_err();
        assert!(err.to_string().contains("DATABASE_URL"));
    }

    #[test]
    fn per_domain_settings_override_globals() {
        let config = config(
            &[
                ("PIPELINE_DATABASE_URL", "postgresql+asyncpg://db/telemetry"),
                ("PIPELINE_DOMAINS", "temperature, Humidity,temperature"),
                ("PIPELINE_AGGREGATION_INTERVAL", "1h"),
                ("PIPELINE_HUMIDITY_STATISTICS", "mean,max,count,max"),
                ("PIPELINE_HUMIDITY_INTERVAL", "15m"),
                ("PIPELINE_HUMIDITY_ALERT_THRESHOLD", "85"),
                ("TEMP_ALERT_THRESHOLD", "28.5"),
            ],
            None,
        )
        .unwrap();

        assert_eq!(config.database_url, "postgresql://db/telemetry");
        assert_eq!(config.domains.len(), 2);
        assert_eq!(config.domains[0].interval, "1h");
        assert_eq!(config.domains[0].alert_threshold, Some(28.5));
        let humidity = &config.domains[1];
        assert_eq!(humidity.name, "humidity");
        assert_eq!(
            humidity.statistics,
            vec![Statistic::Mean, Statistic::Max, Statistic::Count]
        );
        assert_eq!(humidity.interval, "15m");
        assert_eq!(humidity.alert_threshold, Some(85.0));
        assert_eq!(humidity.unit, "%");
    }

    #[test]
    fn threshold_can_be_disabled() {
        let config = config(
            &[
                ("DATABASE_URL", "postgres://db"),
                ("PIPELINE_TEMPERATURE_ALERT_THRESHOLD", "off"),
            ],
            None,
        )
        .unwrap();
        assert_eq!(config.domains[0].alert_threshold, None);
    }

    #[test]
    fn unknown_statistic_is_rejected() {
        let err = config(
            &[
                ("DATABASE_URL", "postgres://db"),
                ("PIPELINE_ELECTRICITY_STATISTICS", "mean,p95"),
            ],
            None,
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("p95"));
    }

    #[test]
    fn suppression_hours_out_of_range_is_rejected() {
        let err = config(
            &[
                ("DATABASE_URL", "postgres://db"),
                ("PIPELINE_ALERT_SUPPRESS_HOURS", "18446744073709551615"),
            ],
            None,
        )
        .unwrap_err();
        assert!(err.to_string().contains("PIPELINE_ALERT_SUPPRESS_HOURS"));

        let config = config(
            &[
                ("DATABASE_URL", "postgres://db"),
                ("PIPELINE_ALERT_SUPPRESS_HOURS", "6"),
            ],
            None,
        )
        .unwrap();
        assert_eq!(config.alert_suppression(), chrono::Duration::hours(6));
    }

    #[test]
    fn invalid_interval_is_left_for_the_job() {
        let config = config(
            &[
                ("DATABASE_URL", "postgres://db"),
                ("PIPELINE_HUMIDITY_INTERVAL", "soon"),
            ],
            None,
        )
        .unwrap();
        assert_eq!(config.domains[1].interval, "soon");
    }

    #[test]
    fn setup_file_fills_only_unset_values() {
        let mut raw = br#"{
            "database_url": "postgres://setup/telemetry",
            "mqtt_host": "broker.local",
            "mqtt_port": 8883,
            "batch_size": 50,
            "aggregation_interval": "10m",
            "domains": [
                {"name": "temperature", "statistics": ["median"], "alert_threshold": 26.0},
                {"name": "pressure", "unit": "hPa", "interval": "5m"}
            ]
        }"#
        .to_vec();
        let overrides: SetupConfigOverrides = simd_json::serde::from_slice(&mut raw).unwrap();

        let config = config(&[("PIPELINE_MQTT_HOST", "env-broker")], Some(&overrides)).unwrap();

        assert_eq!(config.database_url, "postgres://setup/telemetry");
        assert_eq!(config.mqtt_host, "env-broker");
        assert_eq!(config.mqtt_port, 8883);
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.max_queue, 500);
        assert_eq!(config.domains.len(), 2);
        assert_eq!(config.domains[0].statistics, vec![Statistic::Median]);
        assert_eq!(config.domains[0].alert_threshold, Some(26.0));
        assert_eq!(config.domains[0].interval, "10m");
        assert_eq!(config.domains[1].name, "pressure");
        assert_eq!(config.domains[1].unit, "hPa");
        assert_eq!(config.domains[1].interval, "5m");
        assert_eq!(config.domains[1].alert_threshold, None);
    }

    #[test]
    fn domain_env_keys_are_upper_snake() {
        assert_eq!(domain_env_key("temperature"), "TEMPERATURE");
        assert_eq!(domain_env_key("air-quality"), "AIR_QUALITY");
    }
}
