//! Pipeline metrics recorded through the `metrics` facade.
//!
//! Recording is always safe: until [`init_metrics`] installs the Prometheus
//! recorder, every call is a no-op.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Once;
use std::time::Duration;

use tracing::{info, warn};

use crate::error::{PipelineError, Result};

/// Every metric the pipeline emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricName {
    PublishTotal,
    DeliveriesTotal,
    HandlerDuration,
    HandlerRetries,
    DeadLettered,
    DiscoveryArtistsSearched,
    DiscoveryBreakerTrips,
    VenuesCreated,
    ConcertsInserted,
    EnrichmentOutcomes,
    NotificationsSent,
}

impl MetricName {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricName::PublishTotal => "pipeline_publish_total",
            MetricName::DeliveriesTotal => "pipeline_deliveries_total",
            MetricName::HandlerDuration => "pipeline_handler_duration_seconds",
            MetricName::HandlerRetries => "pipeline_handler_retries_total",
            MetricName::DeadLettered => "pipeline_dead_lettered_total",
            MetricName::DiscoveryArtistsSearched => "pipeline_discovery_artists_searched_total",
            MetricName::DiscoveryBreakerTrips => "pipeline_discovery_breaker_trips_total",
            MetricName::VenuesCreated => "pipeline_venues_created_total",
            MetricName::ConcertsInserted => "pipeline_concerts_inserted_total",
            MetricName::EnrichmentOutcomes => "pipeline_enrichment_outcomes_total",
            MetricName::NotificationsSent => "pipeline_notifications_sent_total",
        }
    }
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

static INIT: Once = Once::new();

/// Install the Prometheus recorder with a scrape endpoint on `listen`.
///
/// Only the first call does anything. Must run inside a tokio runtime.
pub fn init_metrics(listen: SocketAddr) -> Result<()> {
    let mut outcome = Ok(());
    INIT.call_once(|| {
        outcome = metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(listen)
            .install()
            .map_err(|e| PipelineError::Config(format!("failed to install Prometheus recorder: {e}")));
        match &outcome {
            Ok(()) => info!("Prometheus metrics listening on {}", listen),
            Err(e) => warn!("Metrics disabled: {}", e),
        }
    });
    outcome
}

fn outcome_label(ok: bool) -> &'static str {
    if ok {
        "ok"
    } else {
        "error"
    }
}

pub fn record_publish(topic: &str, ok: bool) {
    ::metrics::counter!(
        MetricName::PublishTotal.as_str(),
        "topic" => topic.to_string(),
        "outcome" => outcome_label(ok)
    )
    .increment(1);
}

/// How a delivery was settled by the router: `acked`, `nacked`,
/// `dead_lettered` or `skipped`.
pub fn record_delivery(handler: &str, settlement: &'static str, elapsed: Duration) {
    ::metrics::counter!(
        MetricName::DeliveriesTotal.as_str(),
        "handler" => handler.to_string(),
        "settlement" => settlement
    )
    .increment(1);
    ::metrics::histogram!(MetricName::HandlerDuration.as_str(), "handler" => handler.to_string())
        .record(elapsed.as_secs_f64());
}

pub fn record_retry(handler: &str) {
    ::metrics::counter!(MetricName::HandlerRetries.as_str(), "handler" => handler.to_string()).increment(1);
}

pub fn record_dead_letter(handler: &str) {
    ::metrics::counter!(MetricName::DeadLettered.as_str(), "handler" => handler.to_string()).increment(1);
}

pub mod discovery {
    use super::{outcome_label, MetricName};

    pub fn artist_searched(ok: bool) {
        ::metrics::counter!(MetricName::DiscoveryArtistsSearched.as_str(), "outcome" => outcome_label(ok))
            .increment(1);
    }

    pub fn breaker_tripped() {
        ::metrics::counter!(MetricName::DiscoveryBreakerTrips.as_str()).increment(1);
    }
}

pub mod creation {
    use super::MetricName;

    pub fn venues_created(count: usize) {
        ::metrics::counter!(MetricName::VenuesCreated.as_str()).increment(count as u64);
    }

    pub fn concerts_inserted(count: usize) {
        ::metrics::counter!(MetricName::ConcertsInserted.as_str()).increment(count as u64);
    }
}

pub mod enrichment {
    use super::MetricName;

    /// `status` is the venue's enrichment status after the attempt, or `error`.
    pub fn outcome(status: &'static str) {
        ::metrics::counter!(MetricName::EnrichmentOutcomes.as_str(), "status" => status).increment(1);
    }
}

pub mod notification {
    use super::{outcome_label, MetricName};

    pub fn dispatched(ok: bool) {
        ::metrics::counter!(MetricName::NotificationsSent.as_str(), "outcome" => outcome_label(ok)).increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_names_share_the_pipeline_prefix() {
        for name in [
            MetricName::PublishTotal,
            MetricName::HandlerDuration,
            MetricName::EnrichmentOutcomes,
        ] {
            assert!(name.as_str().starts_with("pipeline_"));
            assert_eq!(name.to_string(), name.as_str());
        }
    }

    #[test]
    fn recording_without_a_recorder_is_a_no_op() {
        record_publish("gigs.concert.created.v1", true);
        record_delivery("create-concerts", "acked", Duration::from_millis(3));
        discovery::breaker_tripped();
    }
}
