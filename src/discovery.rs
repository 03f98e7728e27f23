//! Discovery: search every followed artist and publish what was found.

use async_trait::async_trait;
use chrono::NaiveDate;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::constants::DEFAULT_BREAKER_THRESHOLD;
use crate::context::Ctx;
use crate::domain::{Artist, ScrapedConcert};
use crate::envelope::ConcertDiscovered;
use crate::error::{PipelineError, Result};
use crate::observability;
use crate::storage::Storage;
use crate::transport::EventPublisher;

/// External search for an artist's upcoming concerts.
///
/// Near-duplicate scraped records are the searcher's problem; callers take
/// the result as-is.
#[async_trait]
pub trait ConcertSearcher: Send + Sync {
    async fn search(
        &self,
        ctx: &Ctx,
        artist: &Artist,
        official_site: Option<&str>,
        from: NaiveDate,
    ) -> Result<Vec<ScrapedConcert>>;
}

/// Trips after `threshold` consecutive failures; any success resets it.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    threshold: u32,
    consecutive_failures: u32,
}

impl CircuitBreaker {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            consecutive_failures: 0,
        }
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
    }

    /// Returns true when this failure opens the breaker.
    pub fn record_failure(&mut self) -> bool {
        self.consecutive_failures += 1;
        self.is_open()
    }

    pub fn is_open(&self) -> bool {
        self.consecutive_failures >= self.threshold
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(DEFAULT_BREAKER_THRESHOLD)
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DiscoveryReport {
    pub artists_total: usize,
    pub artists_searched: usize,
    pub events_published: usize,
    pub concerts_found: usize,
    pub failed_artists: Vec<String>,
    /// The breaker opened and the remaining artists were not searched
    pub aborted: bool,
}

pub struct DiscoveryOrchestrator {
    storage: Arc<dyn Storage>,
    searcher: Arc<dyn ConcertSearcher>,
    publisher: EventPublisher,
    breaker_threshold: u32,
}

impl DiscoveryOrchestrator {
    pub fn new(storage: Arc<dyn Storage>, searcher: Arc<dyn ConcertSearcher>, publisher: EventPublisher) -> Self {
        Self {
            storage,
            searcher,
            publisher,
            breaker_threshold: DEFAULT_BREAKER_THRESHOLD,
        }
    }

    pub fn with_breaker_threshold(mut self, threshold: u32) -> Self {
        self.breaker_threshold = threshold;
        self
    }

    /// Search each followed artist in listing order, publishing one
    /// `ConcertDiscovered` per artist with results.
    ///
    /// Per-artist failures are isolated. An open breaker ends the run early
    /// but still returns `Ok`, with `aborted` set.
    pub async fn run(&self, ctx: &Ctx, from: NaiveDate) -> Result<DiscoveryReport> {
        let artists = ctx.run(self.storage.list_followed_artists()).await?;
        let mut report = DiscoveryReport {
            artists_total: artists.len(),
            ..Default::default()
        };
        let mut breaker = CircuitBreaker::new(self.breaker_threshold);
        info!("Starting discovery for {} followed artists from {}", artists.len(), from);

        for artist in &artists {
            ctx.check()?;
            report.artists_searched += 1;

            let outcome = match self.discover_one(ctx, artist, from).await {
                Ok(published) => {
                    observability::discovery::artist_searched(true);
                    if let Some(count) = published {
                        report.events_published += 1;
                        report.concerts_found += count;
                    }
                    breaker.record_success();
                    continue;
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => e,
            };

            observability::discovery::artist_searched(false);
            report.failed_artists.push(artist.id.clone());
            error!(
                artist_id = %artist.id,
                artist_name = %artist.name,
                consecutive_failures = breaker.consecutive_failures() + 1,
                error = %outcome,
                "Discovery failed for artist"
            );
            if breaker.record_failure() {
                observability::discovery::breaker_tripped();
                warn!(
                    "Circuit breaker open after {} consecutive failures; skipping {} remaining artists",
                    breaker.consecutive_failures(),
                    report.artists_total - report.artists_searched
                );
                report.aborted = true;
                break;
            }
        }

        info!(
            searched = report.artists_searched,
            published = report.events_published,
            concerts = report.concerts_found,
            failed = report.failed_artists.len(),
            aborted = report.aborted,
            "Discovery run finished"
        );
        Ok(report)
    }

    /// Returns the number of concerts published, or `None` when nothing was found.
    async fn discover_one(&self, ctx: &Ctx, artist: &Artist, from: NaiveDate) -> Result<Option<usize>> {
        let concerts = ctx
            .run(self.searcher.search(ctx, artist, artist.official_site.as_deref(), from))
            .await
            .map_err(|e| match e {
                PipelineError::Search { .. } | PipelineError::Cancelled => e,
                other => PipelineError::Search {
                    artist: artist.id.clone(),
                    message: other.to_string(),
                },
            })?;

        if concerts.is_empty() {
            debug!(artist_id = %artist.id, "No upcoming concerts found");
            return Ok(None);
        }

        let count = concerts.len();
        let payload = ConcertDiscovered {
            artist_id: artist.id.clone(),
            artist_name: artist.name.clone(),
            concerts,
        };
        self.publisher.publish(ctx, &payload).await?;
        info!(artist_id = %artist.id, artist_name = %artist.name, concerts = count, "Published discovered concerts");
        Ok(Some(count))
    }
}
