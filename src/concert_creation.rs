//! Concert creation: turn one discovered batch into venues and concerts.
//!
//! Venue resolution is the consistency core of the pipeline. Within a batch a
//! listed venue name is resolved once and reused; across batches the store is
//! consulted before anything is created. Both together make a full-batch
//! retry safe, so any resolution failure aborts the whole envelope.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::context::Ctx;
use crate::domain::{Concert, Venue};
use crate::envelope::{ConcertCreated, ConcertDiscovered, Envelope, VenueCreated};
use crate::error::{PipelineError, Result};
use crate::observability;
use crate::router::EventHandler;
use crate::storage::Storage;
use crate::transport::EventPublisher;

/// Two-tier venue lookup scoped to one unit of work: the batch-local map of
/// venues minted by this batch, then the durable store.
pub struct VenueResolver<'a> {
    storage: &'a dyn Storage,
    minted: HashMap<String, Venue>,
    minted_order: Vec<Uuid>,
}

impl<'a> VenueResolver<'a> {
    pub fn new(storage: &'a dyn Storage) -> Self {
        Self {
            storage,
            minted: HashMap::new(),
            minted_order: Vec::new(),
        }
    }

    /// Venue id for `listed_name`, creating a Pending venue if none exists.
    pub async fn resolve(&mut self, ctx: &Ctx, listed_name: &str, admin_area: Option<&str>) -> Result<Uuid> {
        if let Some(venue) = self.minted.get(listed_name) {
            return Ok(venue.id);
        }

        if let Some(existing) = ctx.run(self.storage.get_venue_by_name(listed_name)).await? {
            debug!(venue = %listed_name, venue_id = %existing.id, "Reusing stored venue");
            return Ok(existing.id);
        }

        let venue = Venue::new_pending(listed_name, admin_area.map(str::to_string));
        match ctx.run(self.storage.create_venue(&venue)).await {
            Ok(()) => {}
            Err(PipelineError::Conflict(_)) => {
                // another batch created it between our lookup and insert
                return match ctx.run(self.storage.get_venue_by_name(listed_name)).await? {
                    Some(existing) => Ok(existing.id),
                    None => Err(PipelineError::store(format!(
                        "venue '{listed_name}' conflicted on create but cannot be found"
                    ))),
                };
            }
            Err(e) => return Err(e),
        }

        info!(venue = %listed_name, venue_id = %venue.id, "Created pending venue");
        let id = venue.id;
        self.minted_order.push(id);
        self.minted.insert(listed_name.to_string(), venue);
        Ok(id)
    }

    /// Venues created by this resolver, in creation order, each once.
    pub fn into_minted(self) -> Vec<Venue> {
        let mut by_id: HashMap<Uuid, Venue> = self.minted.into_values().map(|v| (v.id, v)).collect();
        self.minted_order
            .into_iter()
            .filter_map(|id| by_id.remove(&id))
            .collect()
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CreationOutcome {
    pub concerts_built: usize,
    pub concerts_inserted: usize,
    pub venues_created: usize,
    pub events_published: usize,
    pub publish_failures: usize,
}

pub struct ConcertCreator {
    storage: Arc<dyn Storage>,
    publisher: EventPublisher,
}

impl ConcertCreator {
    pub fn new(storage: Arc<dyn Storage>, publisher: EventPublisher) -> Self {
        Self { storage, publisher }
    }

    /// Resolve, persist, then announce one discovered batch.
    ///
    /// Resolution and persistence errors are returned for redelivery. Publish
    /// errors after persistence are logged and counted, never returned.
    pub async fn process(&self, ctx: &Ctx, batch: &ConcertDiscovered) -> Result<CreationOutcome> {
        let mut outcome = CreationOutcome::default();
        if batch.concerts.is_empty() {
            debug!(artist_id = %batch.artist_id, "Empty discovery batch; nothing to create");
            return Ok(outcome);
        }

        let mut resolver = VenueResolver::new(self.storage.as_ref());
        let mut concerts = Vec::with_capacity(batch.concerts.len());
        for scraped in &batch.concerts {
            let venue_id = resolver
                .resolve(ctx, &scraped.listed_venue_name, scraped.admin_area.as_deref())
                .await
                .map_err(|e| {
                    error!(
                        artist_id = %batch.artist_id,
                        artist_name = %batch.artist_name,
                        venue = %scraped.listed_venue_name,
                        error = %e,
                        "Venue resolution failed; aborting batch"
                    );
                    e
                })?;
            concerts.push(Concert::from_scraped(&batch.artist_id, venue_id, scraped));
        }
        let minted = resolver.into_minted();
        outcome.concerts_built = concerts.len();
        outcome.venues_created = minted.len();
        observability::creation::venues_created(minted.len());

        outcome.concerts_inserted = ctx.run(self.storage.create_concerts_idempotent(&concerts)).await?;
        observability::creation::concerts_inserted(outcome.concerts_inserted);
        info!(
            artist_id = %batch.artist_id,
            built = outcome.concerts_built,
            inserted = outcome.concerts_inserted,
            venues_created = outcome.venues_created,
            "Persisted discovered concerts"
        );

        let created = ConcertCreated {
            artist_id: batch.artist_id.clone(),
            artist_name: batch.artist_name.clone(),
            concert_count: concerts.len(),
        };
        self.publish_effect(ctx, &created, &mut outcome, &batch.artist_id).await?;

        let mut announced = HashSet::new();
        for venue in minted {
            if !announced.insert(venue.id) {
                continue;
            }
            let event = VenueCreated {
                venue_id: venue.id,
                name: venue.name.clone(),
                admin_area: venue.admin_area.clone(),
            };
            self.publish_effect(ctx, &event, &mut outcome, &batch.artist_id).await?;
        }

        Ok(outcome)
    }

    /// Publish failures are counted and logged. Only cancellation is returned.
    async fn publish_effect<P: crate::envelope::EventPayload>(
        &self,
        ctx: &Ctx,
        payload: &P,
        outcome: &mut CreationOutcome,
        artist_id: &str,
    ) -> Result<()> {
        match self.publisher.publish(ctx, payload).await {
            Ok(_) => outcome.events_published += 1,
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => {
                outcome.publish_failures += 1;
                warn!(
                    artist_id = %artist_id,
                    event_type = %self.publisher.factory().topic(P::KIND),
                    error = %e,
                    "Follow-up event lost after persistence; the enrichment sweep covers venues"
                );
            }
        }
        Ok(())
    }
}

#[async_trait]
impl EventHandler for ConcertCreator {
    async fn handle(&self, ctx: &Ctx, envelope: &Envelope) -> Result<()> {
        let batch: ConcertDiscovered = envelope.decode()?;
        self.process(ctx, &batch).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::*;
    use crate::envelope::EnvelopeFactory;
    use crate::storage::InMemoryStorage;
    use crate::transport::{InMemoryTransport, Transport};
    use chrono::NaiveDate;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn scraped(title: &str, venue: &str) -> ScrapedConcert {
        ScrapedConcert {
            title: title.to_string(),
            listed_venue_name: venue.to_string(),
            admin_area: Some("Tokyo".to_string()),
            local_date: NaiveDate::from_ymd_opt(2026, 11, 3).unwrap(),
            start_time: None,
            open_time: None,
            source_url: "https://example.com/tour".to_string(),
        }
    }

    fn batch(concerts: Vec<ScrapedConcert>) -> ConcertDiscovered {
        ConcertDiscovered {
            artist_id: "A".to_string(),
            artist_name: "Artist A".to_string(),
            concerts,
        }
    }

    fn creator(storage: Arc<dyn Storage>, transport: &InMemoryTransport) -> ConcertCreator {
        let publisher = EventPublisher::new(Arc::new(transport.clone()), EnvelopeFactory::new("gigs", "creation-test"));
        ConcertCreator::new(storage, publisher)
    }

    #[tokio::test]
    async fn same_listed_venue_in_one_batch_creates_one_venue() {
        let storage = Arc::new(InMemoryStorage::new());
        let transport = InMemoryTransport::default();
        let creator = creator(storage.clone(), &transport);

        let outcome = creator
            .process(&Ctx::background(), &batch(vec![scraped("T", "Zepp X"), scraped("U", "Zepp X")]))
            .await
            .unwrap();

        let venues = storage.all_venues().await;
        let concerts = storage.all_concerts().await;
        assert_eq!(venues.len(), 1);
        assert_eq!(concerts.len(), 2);
        assert!(concerts.iter().all(|c| c.venue_id == venues[0].id));
        assert_eq!(outcome.venues_created, 1);
        assert_eq!(transport.published("gigs.venue.created.v1").len(), 1);
    }

    #[tokio::test]
    async fn stored_venue_is_reused_and_not_announced() {
        let storage = Arc::new(InMemoryStorage::new());
        let existing = Venue::new_pending("Zepp X", None);
        storage.create_venue(&existing).await.unwrap();
        let transport = InMemoryTransport::default();
        let creator = creator(storage.clone(), &transport);

        let outcome = creator
            .process(&Ctx::background(), &batch(vec![scraped("T", "Zepp X")]))
            .await
            .unwrap();

        assert_eq!(outcome.venues_created, 0);
        assert_eq!(storage.all_venues().await, vec![existing.clone()]);
        assert_eq!(storage.all_concerts().await[0].venue_id, existing.id);
        assert!(transport.published("gigs.venue.created.v1").is_empty());
        assert_eq!(transport.published("gigs.concert.created.v1").len(), 1);
    }

    #[tokio::test]
    async fn redelivered_batch_leaves_the_same_concerts() {
        let storage = Arc::new(InMemoryStorage::new());
        let transport = InMemoryTransport::default();
        let creator = creator(storage.clone(), &transport);
        let discovered = batch(vec![scraped("T", "Zepp X"), scraped("U", "Club Y")]);

        let first = creator.process(&Ctx::background(), &discovered).await.unwrap();
        let concerts_after_first = storage.all_concerts().await;
        let second = creator.process(&Ctx::background(), &discovered).await.unwrap();

        assert_eq!(first.concerts_inserted, 2);
        assert_eq!(second.concerts_inserted, 0);
        assert_eq!(second.venues_created, 0);
        assert_eq!(storage.all_concerts().await, concerts_after_first);
        assert_eq!(storage.all_venues().await.len(), 2);
    }

    #[tokio::test]
    async fn publish_failure_after_persistence_is_not_fatal() {
        let storage = Arc::new(InMemoryStorage::new());
        let transport = InMemoryTransport::default();
        transport.close().await.unwrap();
        let creator = creator(storage.clone(), &transport);

        let outcome = creator
            .process(&Ctx::background(), &batch(vec![scraped("T", "Zepp X")]))
            .await
            .unwrap();

        assert_eq!(outcome.concerts_inserted, 1);
        assert_eq!(outcome.publish_failures, 2);
        assert_eq!(outcome.events_published, 0);
    }

    /// Cancels the caller's scope on the first publish and never completes.
    struct CancellingTransport {
        ctx: Ctx,
    }

    #[async_trait]
    impl Transport for CancellingTransport {
        async fn publish(&self, _topic: &str, _envelope: &Envelope) -> Result<()> {
            self.ctx.cancel();
            std::future::pending().await
        }
        async fn subscribe(&self, _topic: &str, _consumer_group: &str) -> Result<crate::transport::Subscription> {
            Err(PipelineError::transport("not supported"))
        }
        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn cancellation_during_publish_is_returned() {
        let storage = Arc::new(InMemoryStorage::new());
        let ctx = Ctx::background();
        let publisher = EventPublisher::new(
            Arc::new(CancellingTransport { ctx: ctx.clone() }),
            EnvelopeFactory::new("gigs", "creation-test"),
        );
        let creator = ConcertCreator::new(storage.clone(), publisher);

        let err = creator
            .process(&ctx, &batch(vec![scraped("T", "Zepp X")]))
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
        // persisted before the publish; a redelivery finds it
        assert_eq!(storage.all_concerts().await.len(), 1);
    }

    #[tokio::test]
    async fn empty_batch_publishes_nothing() {
        let storage = Arc::new(InMemoryStorage::new());
        let transport = InMemoryTransport::default();
        let creator = creator(storage.clone(), &transport);

        let outcome = creator.process(&Ctx::background(), &batch(Vec::new())).await.unwrap();

        assert_eq!(outcome, CreationOutcome::default());
        assert!(transport.published("gigs.concert.created.v1").is_empty());
    }

    /// Fails venue lookups for one listed name while `broken` is set.
    struct FlakyLookup {
        inner: InMemoryStorage,
        broken_name: &'static str,
        broken: AtomicBool,
    }

    #[async_trait]
    impl Storage for FlakyLookup {
        async fn get_venue_by_name(&self, name: &str) -> Result<Option<Venue>> {
            if name == self.broken_name && self.broken.load(Ordering::SeqCst) {
                return Err(PipelineError::store("connection reset"));
            }
            self.inner.get_venue_by_name(name).await
        }
        async fn get_venue(&self, venue_id: Uuid) -> Result<Option<Venue>> {
            self.inner.get_venue(venue_id).await
        }
        async fn create_venue(&self, venue: &Venue) -> Result<()> {
            self.inner.create_venue(venue).await
        }
        async fn list_venues_by_status(&self, statuses: &[EnrichmentStatus]) -> Result<Vec<Venue>> {
            self.inner.list_venues_by_status(statuses).await
        }
        async fn update_venue_enrichment(&self, venue: &Venue) -> Result<()> {
            self.inner.update_venue_enrichment(venue).await
        }
        async fn create_concerts_idempotent(&self, concerts: &[Concert]) -> Result<usize> {
            self.inner.create_concerts_idempotent(concerts).await
        }
        async fn list_upcoming_concerts(&self, artist_id: &str, from: NaiveDate) -> Result<Vec<Concert>> {
            self.inner.list_upcoming_concerts(artist_id, from).await
        }
        async fn create_artist(&self, artist: &Artist) -> Result<()> {
            self.inner.create_artist(artist).await
        }
        async fn get_artist(&self, artist_id: &str) -> Result<Option<Artist>> {
            self.inner.get_artist(artist_id).await
        }
        async fn backfill_artist_mbid(&self, artist_id: &str, mbid: &str) -> Result<()> {
            self.inner.backfill_artist_mbid(artist_id, mbid).await
        }
        async fn follow_artist(&self, follow: &FollowedArtist) -> Result<()> {
            self.inner.follow_artist(follow).await
        }
        async fn list_followed_artists(&self) -> Result<Vec<Artist>> {
            self.inner.list_followed_artists().await
        }
        async fn list_followers(&self, artist_id: &str) -> Result<Vec<FollowedArtist>> {
            self.inner.list_followers(artist_id).await
        }
    }

    #[tokio::test]
    async fn lookup_error_aborts_the_batch_and_retry_is_safe() {
        let storage = Arc::new(FlakyLookup {
            inner: InMemoryStorage::new(),
            broken_name: "Club Y",
            broken: AtomicBool::new(true),
        });
        let transport = InMemoryTransport::default();
        let creator = creator(storage.clone(), &transport);
        let discovered = batch(vec![scraped("T", "Zepp X"), scraped("U", "Club Y")]);

        let err = creator.process(&Ctx::background(), &discovered).await.unwrap_err();
        assert!(matches!(err, PipelineError::Store { .. }));
        assert!(storage.inner.all_concerts().await.is_empty());
        assert!(transport.published("gigs.concert.created.v1").is_empty());

        // the venue minted before the failure is found, not duplicated, on retry
        storage.broken.store(false, Ordering::SeqCst);
        let outcome = creator.process(&Ctx::background(), &discovered).await.unwrap();
        assert_eq!(outcome.concerts_inserted, 2);
        assert_eq!(outcome.venues_created, 1);
        assert_eq!(storage.inner.all_venues().await.len(), 2);
    }

    #[tokio::test]
    async fn handler_rejects_envelopes_of_another_kind() {
        let storage = Arc::new(InMemoryStorage::new());
        let transport = InMemoryTransport::default();
        let creator = creator(storage, &transport);
        let envelope = EnvelopeFactory::new("gigs", "t")
            .wrap(&ConcertCreated {
                artist_id: "A".to_string(),
                artist_name: "Artist A".to_string(),
                concert_count: 1,
            })
            .unwrap();

        let err = creator.handle(&Ctx::background(), &envelope).await.unwrap_err();
        assert!(matches!(err, PipelineError::UnexpectedEvent { .. }));
    }
}
