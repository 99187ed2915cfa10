use anyhow::{Context, Result};
use chrono::Utc;
use futures::future;
use rumqttc::AsyncClient;
use std::sync::Arc;
use std::time::Duration;
use telemetry_pipeline::aggregation::{build_jobs, AggregationScheduler, ScheduledJob};
use telemetry_pipeline::alert::{AlertDebouncer, FileAlertStateStore};
use telemetry_pipeline::config::Config;
use telemetry_pipeline::ingest::IngestionCoordinator;
use telemetry_pipeline::mqtt::{self, MqttAlertNotifier};
use telemetry_pipeline::pipeline::{spawn_worker, BatchCommand, IngestStats, PipelineHandle};
use telemetry_pipeline::store::postgres::{build_pool, ensure_schema, PgPointWriter, PgSeriesQuery};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const TEST_ALERT_DELAY: Duration = Duration::from_secs(5);

fn init_tracing(config: &Config) -> Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{runtime::Tokio, trace::Config as OTelTraceConfig, Resource};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,telemetry_pipeline=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true);

    if let Some(endpoint) = &config.otlp_endpoint {
        let endpoint = normalize_otlp_http_endpoint(endpoint);
        let exporter = opentelemetry_otlp::new_exporter()
            .http()
            .with_endpoint(endpoint);
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(exporter)
            .with_trace_config(OTelTraceConfig::default().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "telemetry-pipeline"),
            ])))
            .install_batch(Tokio)?;

        let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(otel_layer)
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;
    }

    Ok(())
}

fn normalize_otlp_http_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    if trimmed.contains("/v1/traces") {
        return trimmed.to_string();
    }
    format!("{}/v1/traces", trimmed.trim_end_matches('/'))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!(error=%err, "failed to listen for ctrl-c");
            future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                tracing::warn!(error=%err, "failed to listen for SIGTERM");
                future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config)?;

    let pool = build_pool(&config.database_url, config.db_pool_size)
        .await
        .context("connect to database")?;
    ensure_schema(&pool).await?;

    let cancel = CancellationToken::new();
    let stats = Arc::new(IngestStats::new());
    let (tx, rx) = mpsc::channel::<BatchCommand>(config.max_queue.max(1));
    let pipeline = PipelineHandle::new(tx, stats.clone());
    let worker_handle = spawn_worker(
        Arc::new(PgPointWriter::new(pool.clone(), config.source_bucket.clone())),
        rx,
        stats.clone(),
        config.batch_size,
        config.flush_interval(),
    );

    let notifier_cancel = CancellationToken::new();
    let (notifier, notifier_handle) = MqttAlertNotifier::spawn(&config, notifier_cancel.clone());
    let debouncer = AlertDebouncer::new(
        Arc::new(FileAlertStateStore::new(config.alert_state_file.clone())),
        config.alert_suppression(),
    );
    let coordinator = IngestionCoordinator::new(
        Arc::new(pipeline.clone()),
        debouncer,
        Arc::new(notifier.clone()),
        IngestionCoordinator::rules_from_domains(&config.domains),
    );

    let test_alert_handle = if config.send_test_alert {
        let coordinator = coordinator.clone();
        let cancel = cancel.child_token();
        Some(tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(TEST_ALERT_DELAY) => {
                    for domain in coordinator.alerting_domains() {
                        if let Err(err) = coordinator.send_system_check(&domain, Utc::now()).await {
                            tracing::warn!(domain=%domain, error=%err, "failed to send test alert");
                        }
                    }
                }
            }
        }))
    } else {
        None
    };

    let jobs = build_jobs(
        &config.domains,
        &config.source_bucket,
        Arc::new(PgSeriesQuery::new(pool.clone())),
        Arc::new(PgPointWriter::new(pool.clone(), config.target_bucket.clone())),
    );
    let mut scheduler = AggregationScheduler::new(cancel.child_token());
    scheduler.start(
        jobs.into_iter()
            .map(|job| job as Arc<dyn ScheduledJob>)
            .collect(),
    );

    let (client, eventloop) = AsyncClient::new(mqtt::mqtt_options(&config, None), 32);
    let listener_handle = tokio::spawn(mqtt::run_listener(
        config.mqtt_topic_prefix.clone(),
        client,
        eventloop,
        coordinator.clone(),
        stats.clone(),
        cancel.child_token(),
    ));

    shutdown_signal().await;
    tracing::info!("shutdown signal received");

    cancel.cancel();
    if let Err(err) = listener_handle.await {
        tracing::warn!(error=%err, "MQTT listener task failed");
    }
    if let Some(handle) = test_alert_handle {
        let _ = handle.await;
    }
    scheduler.stop_all().await;

    drop(coordinator);
    drop(pipeline);
    if let Err(err) = worker_handle.await {
        tracing::warn!(error=%err, "point pipeline task failed");
    }

    notifier.disconnect().await;
    notifier_cancel.cancel();
    let _ = notifier_handle.await;

    pool.close().await;
    tracing::info!(
        dropped_points = stats.dropped_points.load(std::sync::atomic::Ordering::Relaxed),
        "telemetry pipeline stopped"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::normalize_otlp_http_endpoint;

    #[test]
    fn otlp_endpoint_gets_traces_path() {
        assert_eq!(
            normalize_otlp_http_endpoint("http://collector:4318/"),
            "http://collector:4318/v1/traces"
        );
        assert_eq!(
            normalize_otlp_http_endpoint("http://collector:4318/v1/traces"),
            "http://collector:4318/v1/traces"
        );
        assert_eq!(normalize_otlp_http_endpoint("  "), "");
    }
}
