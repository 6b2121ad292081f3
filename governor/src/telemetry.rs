//! Logging, error reporting and metrics export for the binary.

use crate::config::{LoggingConfig, MetricsConfig};
use metrics_exporter_statsd::StatsdBuilder;
use shared::metrics_defs::{MetricDef, describe_all};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(thiserror::Error, Debug)]
pub enum TelemetryError {
    #[error("could not build statsd exporter: {0}")]
    Statsd(#[from] metrics_exporter_statsd::StatsdError),
    #[error("a metrics recorder is already installed")]
    RecorderInstalled,
    #[error("could not install log subscriber: {0}")]
    Subscriber(#[from] tracing_subscriber::util::TryInitError),
}

/// Every metric emitted anywhere in the workspace.
pub fn all_metrics() -> Vec<MetricDef> {
    [
        shared::metrics_defs::ALL_METRICS,
        counters::metrics_defs::ALL_METRICS,
        quota::metrics_defs::ALL_METRICS,
        promotion::metrics_defs::ALL_METRICS,
    ]
    .concat()
}

/// Keeps the Sentry client alive; events are flushed when dropped.
pub struct TelemetryGuard {
    _sentry: Option<sentry::ClientInitGuard>,
}

/// Installs the log subscriber, the optional Sentry layer and the optional statsd exporter.
pub fn init(
    logging: Option<&LoggingConfig>,
    metrics: Option<&MetricsConfig>,
) -> Result<TelemetryGuard, TelemetryError> {
    let default_logging = LoggingConfig::default();
    let logging = logging.unwrap_or(&default_logging);

    let sentry = logging.sentry_dsn.as_deref().map(|dsn| {
        sentry::init((
            dsn,
            sentry::ClientOptions {
                release: sentry::release_name!(),
                ..Default::default()
            },
        ))
    });
    let sentry_layer = sentry
        .as_ref()
        .map(|_| sentry::integrations::tracing::layer());

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(sentry_layer)
        .try_init()?;

    if let Some(statsd) = metrics {
        let recorder = StatsdBuilder::from(statsd.statsd_host.clone(), statsd.statsd_port)
            .build(Some(&statsd.prefix))?;
        metrics::set_global_recorder(recorder).map_err(|_| TelemetryError::RecorderInstalled)?;
        describe_all(&all_metrics());
        tracing::info!(
            host = %statsd.statsd_host,
            port = statsd.statsd_port,
            "statsd exporter installed"
        );
    }

    Ok(TelemetryGuard { _sentry: sentry })
}
