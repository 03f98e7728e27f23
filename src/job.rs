//! The periodic job: discovery for every followed artist, then an
//! enrichment sweep over venues still awaiting a place match.

use chrono::{Duration as ChronoDuration, NaiveDate};
use tracing::info;

use crate::context::Ctx;
use crate::discovery::{DiscoveryOrchestrator, DiscoveryReport};
use crate::enrichment::{SweepReport, VenueEnricher};
use crate::error::Result;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct JobReport {
    pub discovery: DiscoveryReport,
    pub sweep: SweepReport,
}

impl JobReport {
    /// A breaker abort still counts as a completed run.
    pub fn discovery_aborted(&self) -> bool {
        self.discovery.aborted
    }
}

/// Date floor for discovery: `today` shifted by the configured offset.
pub fn discovery_start(today: NaiveDate, offset_days: i64) -> NaiveDate {
    today
        .checked_add_signed(ChronoDuration::days(offset_days))
        .unwrap_or(today)
}

/// Run discovery from `from`, then sweep. The sweep runs even when discovery
/// was cut short by the circuit breaker.
pub async fn run_job(
    ctx: &Ctx,
    discovery: &DiscoveryOrchestrator,
    enricher: &VenueEnricher,
    from: NaiveDate,
    retry_failed: bool,
) -> Result<JobReport> {
    let discovery = discovery.run(ctx, from).await?;
    let sweep = enricher.sweep(ctx, retry_failed).await?;
    let report = JobReport { discovery, sweep };
    info!(
        artists_searched = report.discovery.artists_searched,
        events_published = report.discovery.events_published,
        discovery_aborted = report.discovery_aborted(),
        venues_enriched = report.sweep.enriched,
        venues_failed = report.sweep.failed,
        "Job finished"
    );
    Ok(report)
}
