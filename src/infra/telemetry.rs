use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};
use crate::render::METRIC_COORDINATION_DEFECT;

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

/// Register descriptions for every metric the crate emits. Safe to call repeatedly.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "render_cache_hit_total",
            Unit::Count,
            "Requests answered from the page cache."
        );
        describe_counter!(
            "render_cache_miss_total",
            Unit::Count,
            "Cacheable requests that had to be rendered."
        );
        describe_counter!(
            "render_cache_bypass_total",
            Unit::Count,
            "Requests the key policy sent straight to the renderer."
        );
        describe_counter!(
            "render_cache_redirect_total",
            Unit::Count,
            "Cacheable requests whose render redirected."
        );
        describe_counter!(
            "render_cache_store_error_total",
            Unit::Count,
            "Failed cache store reads and writes."
        );
        describe_counter!(
            "render_cache_write_total",
            Unit::Count,
            "Background cache writes by outcome."
        );
        describe_counter!(
            METRIC_COORDINATION_DEFECT,
            Unit::Count,
            "Checkpoint signals that could not be matched to their request."
        );
        describe_counter!(
            "render_cache_evict_total",
            Unit::Count,
            "Memory store evictions due to capacity."
        );
        describe_gauge!(
            "render_cache_slots_in_use",
            Unit::Count,
            "Coordination slots currently checked out."
        );
        describe_histogram!(
            "render_cache_render_ms",
            Unit::Milliseconds,
            "Full render latency for cache misses in milliseconds."
        );
    });
}
