use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::context::Ctx;
use crate::domain::{Artist, Concert, FollowedArtist};
use crate::envelope::{ConcertCreated, Envelope};
use crate::error::{PipelineError, Result};
use crate::observability;
use crate::router::EventHandler;
use crate::storage::Storage;

/// Push delivery to an artist's followers. Implementations must tolerate
/// being called again for the same artist and concerts.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(
        &self,
        ctx: &Ctx,
        artist: &Artist,
        concerts: &[Concert],
        followers: &[FollowedArtist],
    ) -> Result<()>;
}

/// Tells an artist's followers about newly created concerts.
pub struct NotificationFanout {
    storage: Arc<dyn Storage>,
    notifier: Arc<dyn Notifier>,
    reference_date: Option<NaiveDate>,
}

impl NotificationFanout {
    pub fn new(storage: Arc<dyn Storage>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            storage,
            notifier,
            reference_date: None,
        }
    }

    /// Pin "today" for the upcoming-concert query instead of the UTC date.
    pub fn with_reference_date(mut self, date: NaiveDate) -> Self {
        self.reference_date = Some(date);
        self
    }

    /// Returns how many followers were notified. Every error is returned so
    /// the envelope is retried.
    pub async fn process(&self, ctx: &Ctx, created: &ConcertCreated) -> Result<usize> {
        let artist = ctx
            .run(self.storage.get_artist(&created.artist_id))
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("artist {}", created.artist_id)))?;

        let from = self.reference_date.unwrap_or_else(|| Utc::now().date_naive());
        let concerts = ctx.run(self.storage.list_upcoming_concerts(&artist.id, from)).await?;
        if concerts.is_empty() {
            debug!(artist_id = %artist.id, "No upcoming concerts; nothing to notify");
            return Ok(0);
        }

        let followers = ctx.run(self.storage.list_followers(&artist.id)).await?;
        if followers.is_empty() {
            debug!(artist_id = %artist.id, "Artist has no followers");
            return Ok(0);
        }

        match ctx.run(self.notifier.notify(ctx, &artist, &concerts, &followers)).await {
            Ok(()) => {
                observability::notification::dispatched(true);
                info!(
                    artist_id = %artist.id,
                    artist_name = %artist.name,
                    followers = followers.len(),
                    concerts = concerts.len(),
                    "Notified followers"
                );
                Ok(followers.len())
            }
            Err(e) => {
                observability::notification::dispatched(false);
                error!(artist_id = %artist.id, artist_name = %artist.name, error = %e, "Notification dispatch failed");
                Err(e)
            }
        }
    }
}

#[async_trait]
impl EventHandler for NotificationFanout {
    async fn handle(&self, ctx: &Ctx, envelope: &Envelope) -> Result<()> {
        let created: ConcertCreated = envelope.decode()?;
        self.process(ctx, &created).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{PassionLevel, Venue};
    use crate::storage::InMemoryStorage;
    use std::sync::Mutex;
    use uuid::Uuid;

    #[derive(Default)]
    struct RecordingNotifier {
        sent: Mutex<Vec<(String, usize, usize)>>,
        fail: bool,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(
            &self,
            _ctx: &Ctx,
            artist: &Artist,
            concerts: &[Concert],
            followers: &[FollowedArtist],
        ) -> Result<()> {
            if self.fail {
                return Err(PipelineError::Notify("push service unavailable".to_string()));
            }
            self.sent
                .lock()
                .unwrap()
                .push((artist.id.clone(), concerts.len(), followers.len()));
            Ok(())
        }
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 11, d).unwrap()
    }

    async fn seeded_storage() -> Arc<InMemoryStorage> {
        let storage = Arc::new(InMemoryStorage::new());
        storage.create_artist(&Artist::new("A", "Artist A")).await.unwrap();
        for user in ["u1", "u2"] {
            storage
                .follow_artist(&FollowedArtist {
                    user_id: user.to_string(),
                    artist_id: "A".to_string(),
                    passion: PassionLevel::KeepAnEye,
                })
                .await
                .unwrap();
        }
        let venue = Venue::new_pending("Zepp X", None);
        storage.create_venue(&venue).await.unwrap();
        let concerts: Vec<Concert> = [(1, "Past"), (10, "Soon"), (20, "Later")]
            .into_iter()
            .map(|(d, title)| Concert {
                id: Uuid::new_v4(),
                artist_id: "A".to_string(),
                venue_id: venue.id,
                title: title.to_string(),
                listed_venue_name: "Zepp X".to_string(),
                local_date: day(d),
                start_time: None,
                open_time: None,
                source_url: "https://example.com".to_string(),
            })
            .collect();
        storage.create_concerts_idempotent(&concerts).await.unwrap();
        storage
    }

    fn created(artist_id: &str) -> ConcertCreated {
        ConcertCreated {
            artist_id: artist_id.to_string(),
            artist_name: "Artist A".to_string(),
            concert_count: 3,
        }
    }

    #[tokio::test]
    async fn notifies_all_followers_about_upcoming_concerts() {
        let storage = seeded_storage().await;
        let notifier = Arc::new(RecordingNotifier::default());
        let fanout = NotificationFanout::new(storage, notifier.clone()).with_reference_date(day(5));

        let notified = fanout.process(&Ctx::background(), &created("A")).await.unwrap();

        assert_eq!(notified, 2);
        assert_eq!(*notifier.sent.lock().unwrap(), vec![("A".to_string(), 2, 2)]);
    }

    #[tokio::test]
    async fn unknown_artist_is_an_error() {
        let storage = seeded_storage().await;
        let fanout = NotificationFanout::new(storage, Arc::new(RecordingNotifier::default()));

        let err = fanout.process(&Ctx::background(), &created("missing")).await.unwrap_err();
        assert!(matches!(err, PipelineError::NotFound(_)));
    }

    #[tokio::test]
    async fn dispatch_errors_are_returned_for_retry() {
        let storage = seeded_storage().await;
        let notifier = Arc::new(RecordingNotifier {
            fail: true,
            ..Default::default()
        });
        let fanout = NotificationFanout::new(storage, notifier).with_reference_date(day(5));

        let err = fanout.process(&Ctx::background(), &created("A")).await.unwrap_err();
        assert!(matches!(err, PipelineError::Notify(_)));
    }

    #[tokio::test]
    async fn nothing_upcoming_sends_nothing() {
        let storage = seeded_storage().await;
        let notifier = Arc::new(RecordingNotifier::default());
        let fanout = NotificationFanout::new(storage, notifier.clone()).with_reference_date(day(25));

        assert_eq!(fanout.process(&Ctx::background(), &created("A")).await.unwrap(), 0);
        assert!(notifier.sent.lock().unwrap().is_empty());
    }
}
