//! Venue enrichment through an ordered chain of place-search collaborators.
//!
//! The first configured member of the chain is the identity source: only its
//! match may set a venue's canonical name and external place id outright.
//! Later members fill in what is still missing and never overwrite.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::context::Ctx;
use crate::domain::{EnrichmentStatus, Venue};
use crate::envelope::{Envelope, VenueCreated};
use crate::error::{PipelineError, Result};
use crate::observability;
use crate::router::EventHandler;
use crate::storage::Storage;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaceMatch {
    pub place_id: String,
    pub canonical_name: String,
    pub admin_area: Option<String>,
}

#[async_trait]
pub trait PlaceSearcher: Send + Sync {
    fn name(&self) -> &str;

    /// Unconfigured searchers are left out of the chain entirely.
    fn is_configured(&self) -> bool {
        true
    }

    /// `Ok(None)` means not found, which is not an error.
    async fn search_place(&self, ctx: &Ctx, name: &str, admin_area: Option<&str>) -> Result<Option<PlaceMatch>>;
}

pub struct PlaceSearchChain {
    members: Vec<Arc<dyn PlaceSearcher>>,
}

/// What the chain found for one venue.
#[derive(Debug, Default)]
struct ChainResult {
    matched: bool,
    last_error: Option<PipelineError>,
}

impl PlaceSearchChain {
    pub fn new(searchers: Vec<Arc<dyn PlaceSearcher>>) -> Self {
        let members: Vec<_> = searchers
            .into_iter()
            .filter(|s| {
                if !s.is_configured() {
                    debug!("Place searcher {} is not configured; skipping", s.name());
                }
                s.is_configured()
            })
            .collect();
        Self { members }
    }

    pub fn identity_source(&self) -> Option<&str> {
        self.members.first().map(|s| s.name())
    }

    pub fn member_names(&self) -> Vec<&str> {
        self.members.iter().map(|s| s.name()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Apply matches to `venue` in chain order.
    async fn apply(&self, ctx: &Ctx, venue: &mut Venue) -> Result<ChainResult> {
        let mut result = ChainResult::default();
        let query_name = venue.name.clone();

        for (position, searcher) in self.members.iter().enumerate() {
            ctx.check()?;
            let found = ctx
                .run(searcher.search_place(ctx, &query_name, venue.admin_area.as_deref()))
                .await;
            let place = match found {
                Ok(Some(place)) => place,
                Ok(None) => {
                    debug!(venue = %query_name, searcher = searcher.name(), "Place not found");
                    continue;
                }
                Err(e) if e.is_cancelled() => return Err(e),
                // identity errors end the chain before any fallback runs
                Err(e) if position == 0 => {
                    warn!(venue = %query_name, searcher = searcher.name(), error = %e, "Identity place search failed");
                    return Err(e);
                }
                Err(e) => {
                    warn!(venue = %query_name, searcher = searcher.name(), error = %e, "Place search failed");
                    result.last_error = Some(e);
                    continue;
                }
            };

            result.matched = true;
            if position == 0 {
                venue.external_place_id = Some(place.place_id);
                venue.name = place.canonical_name;
            } else if venue.external_place_id.is_none() {
                venue.external_place_id = Some(place.place_id);
            }
            if venue.admin_area.is_none() {
                venue.admin_area = place.admin_area;
            }
            debug!(
                venue = %query_name,
                searcher = searcher.name(),
                identity = position == 0,
                "Place matched"
            );

            if venue.external_place_id.is_some() && venue.admin_area.is_some() {
                break;
            }
        }
        Ok(result)
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub examined: usize,
    pub enriched: usize,
    pub failed: usize,
    pub errors: usize,
}

pub struct VenueEnricher {
    storage: Arc<dyn Storage>,
    chain: PlaceSearchChain,
}

impl VenueEnricher {
    pub fn new(storage: Arc<dyn Storage>, chain: PlaceSearchChain) -> Self {
        if chain.is_empty() {
            warn!("No place searchers configured; venues will stay pending");
        } else {
            info!(
                "Venue enrichment chain: {:?} (identity source: {})",
                chain.member_names(),
                chain.identity_source().unwrap_or("none")
            );
        }
        Self { storage, chain }
    }

    /// Enrich one venue by id. An already enriched venue is left alone.
    pub async fn enrich_venue(&self, ctx: &Ctx, venue_id: Uuid) -> Result<EnrichmentStatus> {
        let venue = ctx
            .run(self.storage.get_venue(venue_id))
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("venue {venue_id}")))?;
        if venue.enrichment_status == EnrichmentStatus::Enriched {
            debug!(venue_id = %venue_id, "Venue already enriched");
            return Ok(EnrichmentStatus::Enriched);
        }
        self.enrich(ctx, venue).await
    }

    /// Run the chain on `venue` and persist the outcome.
    ///
    /// No match and no errors marks the venue Failed. No match with a
    /// collaborator error leaves it untouched and returns the error, as does
    /// any error from the identity source.
    pub async fn enrich(&self, ctx: &Ctx, mut venue: Venue) -> Result<EnrichmentStatus> {
        if self.chain.is_empty() {
            return Ok(venue.enrichment_status);
        }

        let result = match self.chain.apply(ctx, &mut venue).await {
            Ok(result) => result,
            Err(e) => {
                observability::enrichment::outcome("error");
                return Err(e);
            }
        };
        venue.enrichment_status = if result.matched {
            EnrichmentStatus::Enriched
        } else if let Some(e) = result.last_error {
            observability::enrichment::outcome("error");
            return Err(e);
        } else {
            EnrichmentStatus::Failed
        };

        ctx.run(self.storage.update_venue_enrichment(&venue)).await?;
        observability::enrichment::outcome(venue.enrichment_status.as_str());
        info!(
            venue_id = %venue.id,
            venue = %venue.name,
            status = venue.enrichment_status.as_str(),
            place_id = venue.external_place_id.as_deref().unwrap_or("-"),
            "Venue enrichment finished"
        );
        Ok(venue.enrichment_status)
    }

    /// Enrich every Pending venue, plus Failed ones when `retry_failed` is set.
    /// Per-venue errors are logged and counted; the sweep carries on.
    pub async fn sweep(&self, ctx: &Ctx, retry_failed: bool) -> Result<SweepReport> {
        let statuses: &[EnrichmentStatus] = if retry_failed {
            &[EnrichmentStatus::Pending, EnrichmentStatus::Failed]
        } else {
            &[EnrichmentStatus::Pending]
        };
        let venues = ctx.run(self.storage.list_venues_by_status(statuses)).await?;
        let mut report = SweepReport::default();
        info!("Sweeping {} venues awaiting enrichment", venues.len());

        for venue in venues {
            ctx.check()?;
            report.examined += 1;
            let (id, name) = (venue.id, venue.name.clone());
            match self.enrich(ctx, venue).await {
                Ok(EnrichmentStatus::Enriched) => report.enriched += 1,
                Ok(EnrichmentStatus::Failed) => report.failed += 1,
                Ok(EnrichmentStatus::Pending) => {}
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    report.errors += 1;
                    warn!(venue_id = %id, venue = %name, error = %e, "Venue enrichment errored; continuing sweep");
                }
            }
        }

        info!(
            examined = report.examined,
            enriched = report.enriched,
            failed = report.failed,
            errors = report.errors,
            "Enrichment sweep finished"
        );
        Ok(report)
    }
}

#[async_trait]
impl EventHandler for VenueEnricher {
    async fn handle(&self, ctx: &Ctx, envelope: &Envelope) -> Result<()> {
        let created: VenueCreated = envelope.decode()?;
        self.enrich_venue(ctx, created.venue_id).await.map(|_| ())
    }
}
