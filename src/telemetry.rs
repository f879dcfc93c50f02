use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};
use crate::error::AppError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), AppError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    // Logs go to stderr; stdout carries command output.
    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_writer(std::io::stderr)
            .with_target(true)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| AppError::telemetry(format!("failed to install tracing subscriber: {err}")))
}

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "tagcache_query_total",
            Unit::Count,
            "Total number of cache lookups, labelled by hit or miss."
        );
        describe_counter!(
            "tagcache_set_total",
            Unit::Count,
            "Total number of cache entries stored."
        );
        describe_counter!(
            "tagcache_invalidate_total",
            Unit::Count,
            "Total number of invalidations, labelled by key, dependency or all."
        );
        describe_counter!(
            "tagcache_backend_error_total",
            Unit::Count,
            "Total number of failed memcache server calls."
        );
        describe_histogram!(
            "tagcache_backend_ms",
            Unit::Milliseconds,
            "Latency of memcache server calls."
        );
        describe_histogram!(
            "tagcache_dispatch_ms",
            Unit::Milliseconds,
            "Time spent dispatching one batch of invalidation events."
        );
        describe_gauge!(
            "tagcache_event_queue_len",
            Unit::Count,
            "Pending invalidation events after the last drain."
        );
    });
}
