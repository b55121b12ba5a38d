use anyhow::Result;
use chrono::Duration as ChronoDuration;
use ro_ingestor::alarms::AlarmSink;
use ro_ingestor::config::Config;
use ro_ingestor::diagnosis::Diagnostics;
use ro_ingestor::ingest::TelemetryIngestor;
use ro_ingestor::mqtt;
use ro_ingestor::pipeline::{IngestStats, SnapshotWriter, WriterSettings};
use ro_ingestor::presence::PresenceTracker;
use ro_ingestor::store::{build_pool, PgStore, Store};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn init_tracing(config: &Config) -> Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{runtime::Tokio, trace::Config as OTelTraceConfig, Resource};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,ro_ingestor=info".into());
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
                KeyValue::new("service.name", "ro-ingestor"),
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
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
                return;
            }
            Err(err) => tracing::warn!(error = %err, "failed to install SIGTERM handler"),
        }
    }
    let _ = tokio::signal::ctrl_c().await;
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config)?;

    let pool = build_pool(&config.database_url, config.db_pool_size).await?;
    let store: Arc<dyn Store> = Arc::new(PgStore::new(pool));
    let alarms = Arc::new(AlarmSink::new(store.clone(), config.alarm_cooldown()));
    let diagnostics = Arc::new(Diagnostics::new(store.clone(), alarms.clone()));
    let stats = Arc::new(IngestStats::new());
    let writer = Arc::new(SnapshotWriter::new(
        store.clone(),
        diagnostics,
        stats,
        WriterSettings {
            min_interval: ChronoDuration::from_std(config.min_write_interval())
                .unwrap_or_else(|_| ChronoDuration::seconds(5)),
            batch_size: config.batch_size.max(1),
            flush_interval: config.flush_interval(),
            max_buffered_rows: config.max_buffered_rows.max(1),
        },
    ));
    let presence = Arc::new(PresenceTracker::new(
        store,
        alarms.clone(),
        config.presence_touch_interval(),
        config.offline_after(),
    ));
    let ingestor = TelemetryIngestor::new(&config.topic_root, presence.clone(), writer.clone(), alarms);

    tracing::info!(
        root = %config.topic_root,
        broker = %config.mqtt_host,
        batch_size = config.batch_size,
        offline_after_s = config.offline_after_seconds,
        "ro-ingestor starting"
    );

    let cancel = CancellationToken::new();
    let flusher = writer.spawn_flusher();
    let watchdog = presence.spawn_watchdog(config.watchdog_interval(), cancel.clone());
    let mut listener = {
        let config = config.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { mqtt::run_listener(config, ingestor, cancel).await })
    };

    let listener_done = tokio::select! {
        res = &mut listener => {
            match res {
                Ok(Ok(())) => tracing::warn!("MQTT listener exited"),
                Ok(Err(err)) => tracing::error!(error = %err, "MQTT listener failed"),
                Err(err) => tracing::error!(error = %err, "MQTT task panicked"),
            }
            true
        }
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received");
            false
        }
    };

    cancel.cancel();
    if !listener_done {
        if let Err(err) = listener.await {
            tracing::warn!(error = %err, "MQTT task failed");
        }
    }
    if let Err(err) = watchdog.await {
        tracing::warn!(error = %err, "offline watchdog task failed");
    }
    // The listener has stopped enqueueing, so this drain sees every buffered row.
    if let Err(err) = flusher.shutdown().await {
        tracing::error!(error = %err, "telemetry flusher task failed");
    }
    tracing::info!("ro-ingestor stopped");

    Ok(())
}
