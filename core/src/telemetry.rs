use crate::config::{LogFormat, TelemetryConfig};
use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

pub fn init(config: &TelemetryConfig) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let fmt_layer = match config.log_format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .pretty()
            .with_target(false)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();

    if config.metrics_enabled {
        let addr: SocketAddr = ([0, 0, 0, 0], config.metrics_port).into();
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()?;

        describe_metrics();

        tracing::info!(
            port = config.metrics_port,
            "Metrics endpoint started at http://0.0.0.0:{}/metrics",
            config.metrics_port
        );
    }

    Ok(())
}

fn describe_metrics() {
    describe_counter!(
        "fleet_sync_cycles_total",
        "Poll cycles by record kind and outcome"
    );
    describe_counter!(
        "fleet_sync_records_total",
        "Fetched records by kind and persistence result"
    );
    describe_counter!(
        "fleet_sync_cursor_resets_total",
        "Cursors replaced by a default-lookback cursor, by reason"
    );
    describe_counter!(
        "fleet_sync_cursor_saves_total",
        "Cursor writes to the database backend"
    );
    describe_gauge!(
        "fleet_sync_cursor_age_seconds",
        Unit::Seconds,
        "Age of the cursor used for the latest request"
    );
    describe_histogram!(
        "fleet_sync_fetch_duration_ms",
        Unit::Milliseconds,
        "Latency of one vendor API page request"
    );
}

pub fn shutdown() {
    tracing::info!("Shutting down telemetry");
}

#[macro_export]
macro_rules! record_metric {
    (counter, $name:expr, $value:expr, $($label:tt = $label_value:expr),*) => {
        metrics::counter!($name, $($label => $label_value),*).increment($value);
    };
    (gauge, $name:expr, $value:expr, $($label:tt = $label_value:expr),*) => {
        metrics::gauge!($name, $($label => $label_value),*).set($value as f64);
    };
    (histogram, $name:expr, $value:expr, $($label:tt = $label_value:expr),*) => {
        metrics::histogram!($name, $($label => $label_value),*).record($value);
    };
}
