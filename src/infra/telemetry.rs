use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
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
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_gauge!(
            "almanac_sync_entries",
            Unit::Count,
            "Current number of cached entries."
        );
        describe_gauge!(
            "almanac_sync_subscriptions",
            Unit::Count,
            "Current number of active subscriptions."
        );
        describe_counter!(
            "almanac_sync_query_hit_total",
            Unit::Count,
            "Queries answered from a fresh cache entry."
        );
        describe_counter!(
            "almanac_sync_query_miss_total",
            Unit::Count,
            "Queries that started a fetch."
        );
        describe_counter!(
            "almanac_sync_query_dedup_total",
            Unit::Count,
            "Queries that joined a fetch already in flight."
        );
        describe_counter!(
            "almanac_sync_query_superseded_total",
            Unit::Count,
            "Fetch results discarded because a newer fetch settled first."
        );
        describe_histogram!(
            "almanac_sync_fetch_ms",
            Unit::Milliseconds,
            "Fetch latency in milliseconds, labelled by outcome."
        );
        describe_counter!(
            "almanac_sync_invalidated_total",
            Unit::Count,
            "Entries marked stale by invalidation."
        );
        describe_counter!(
            "almanac_sync_evicted_total",
            Unit::Count,
            "Entries removed from the cache, labelled by reason."
        );
        describe_counter!(
            "almanac_sync_mutation_total",
            Unit::Count,
            "Finished mutations, labelled by outcome."
        );
        describe_histogram!(
            "almanac_sync_mutation_ms",
            Unit::Milliseconds,
            "Mutation latency in milliseconds, labelled by outcome."
        );
        describe_counter!(
            "almanac_sync_rollback_overlap_total",
            Unit::Count,
            "Optimistic entries of a later mutation overwritten by a rollback."
        );
        describe_counter!(
            "almanac_sync_auth_expired_total",
            Unit::Count,
            "Unauthorized responses that ended the session."
        );
        describe_counter!(
            "almanac_sync_lock_poison_recovered_total",
            Unit::Count,
            "Poisoned locks recovered, labelled by lock kind."
        );
        describe_counter!(
            "almanac_http_retry_total",
            Unit::Count,
            "HTTP requests retried, labelled by error kind."
        );
    });
}
