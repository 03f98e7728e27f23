use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use super::Storage;
use crate::domain::*;
use crate::error::{PipelineError, Result};

/// In-memory storage implementation for development/testing.
///
/// Enforces the same uniqueness rules as the SQLite store.
pub struct InMemoryStorage {
    venues: Mutex<Vec<Venue>>,
    concerts: Mutex<Vec<Concert>>,
    artists: Mutex<HashMap<String, Artist>>,
    follows: Mutex<Vec<FollowedArtist>>,
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self {
            venues: Mutex::new(Vec::new()),
            concerts: Mutex::new(Vec::new()),
            artists: Mutex::new(HashMap::new()),
            follows: Mutex::new(Vec::new()),
        }
    }

    pub async fn all_venues(&self) -> Vec<Venue> {
        self.venues.lock().await.clone()
    }

    pub async fn all_concerts(&self) -> Vec<Concert> {
        self.concerts.lock().await.clone()
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn get_venue_by_name(&self, name: &str) -> Result<Option<Venue>> {
        let venues = self.venues.lock().await;
        // listed name first, then canonical; both in creation order
        Ok(venues
            .iter()
            .find(|v| v.raw_name == name)
            .or_else(|| venues.iter().find(|v| v.answers_to(name)))
            .cloned())
    }

    async fn get_venue(&self, venue_id: Uuid) -> Result<Option<Venue>> {
        let venues = self.venues.lock().await;
        Ok(venues.iter().find(|v| v.id == venue_id).cloned())
    }

    async fn create_venue(&self, venue: &Venue) -> Result<()> {
        let mut venues = self.venues.lock().await;
        if venues.iter().any(|v| v.raw_name == venue.raw_name || v.id == venue.id) {
            return Err(PipelineError::Conflict(format!("venue '{}'", venue.raw_name)));
        }
        venues.push(venue.clone());
        debug!("Created venue: {} with id {}", venue.name, venue.id);
        Ok(())
    }

    async fn list_venues_by_status(&self, statuses: &[EnrichmentStatus]) -> Result<Vec<Venue>> {
        let venues = self.venues.lock().await;
        Ok(venues
            .iter()
            .filter(|v| statuses.contains(&v.enrichment_status))
            .cloned()
            .collect())
    }

    async fn update_venue_enrichment(&self, venue: &Venue) -> Result<()> {
        let mut venues = self.venues.lock().await;
        let existing = venues
            .iter_mut()
            .find(|v| v.id == venue.id)
            .ok_or_else(|| PipelineError::NotFound(format!("venue {}", venue.id)))?;
        existing.name = venue.name.clone();
        existing.admin_area = venue.admin_area.clone();
        existing.external_place_id = venue.external_place_id.clone();
        existing.enrichment_status = venue.enrichment_status;
        debug!("Updated venue {} to {}", venue.id, venue.enrichment_status.as_str());
        Ok(())
    }

    async fn create_concerts_idempotent(&self, concerts: &[Concert]) -> Result<usize> {
        let mut stored = self.concerts.lock().await;
        let mut inserted = 0;
        for concert in concerts {
            if stored.iter().any(|c| c.natural_key() == concert.natural_key()) {
                continue;
            }
            stored.push(concert.clone());
            inserted += 1;
        }
        debug!("Inserted {} of {} concerts", inserted, concerts.len());
        Ok(inserted)
    }

    async fn list_upcoming_concerts(&self, artist_id: &str, from: NaiveDate) -> Result<Vec<Concert>> {
        let stored = self.concerts.lock().await;
        let mut upcoming: Vec<Concert> = stored
            .iter()
            .filter(|c| c.artist_id == artist_id && c.local_date >= from)
            .cloned()
            .collect();
        upcoming.sort_by(|a, b| a.local_date.cmp(&b.local_date));
        Ok(upcoming)
    }

    async fn create_artist(&self, artist: &Artist) -> Result<()> {
        let mut artists = self.artists.lock().await;
        if artists.contains_key(&artist.id) {
            return Err(PipelineError::Conflict(format!("artist '{}'", artist.id)));
        }
        artists.insert(artist.id.clone(), artist.clone());
        Ok(())
    }

    async fn get_artist(&self, artist_id: &str) -> Result<Option<Artist>> {
        Ok(self.artists.lock().await.get(artist_id).cloned())
    }

    async fn backfill_artist_mbid(&self, artist_id: &str, mbid: &str) -> Result<()> {
        let mut artists = self.artists.lock().await;
        let artist = artists
            .get_mut(artist_id)
            .ok_or_else(|| PipelineError::NotFound(format!("artist {artist_id}")))?;
        if artist.mbid.is_none() {
            artist.mbid = Some(mbid.to_string());
        }
        Ok(())
    }

    async fn follow_artist(&self, follow: &FollowedArtist) -> Result<()> {
        let mut follows = self.follows.lock().await;
        match follows
            .iter_mut()
            .find(|f| f.user_id == follow.user_id && f.artist_id == follow.artist_id)
        {
            Some(existing) => existing.passion = follow.passion,
            None => follows.push(follow.clone()),
        }
        Ok(())
    }

    async fn list_followed_artists(&self) -> Result<Vec<Artist>> {
        let follows = self.follows.lock().await;
        let artists = self.artists.lock().await;
        let mut seen = Vec::<&str>::new();
        let mut listed = Vec::new();
        for follow in follows.iter() {
            if seen.contains(&follow.artist_id.as_str()) {
                continue;
            }
            seen.push(&follow.artist_id);
            if let Some(artist) = artists.get(&follow.artist_id) {
                listed.push(artist.clone());
            }
        }
        Ok(listed)
    }

    async fn list_followers(&self, artist_id: &str) -> Result<Vec<FollowedArtist>> {
        let follows = self.follows.lock().await;
        Ok(follows.iter().filter(|f| f.artist_id == artist_id).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 11, day).unwrap()
    }

    fn concert(venue_id: Uuid, title: &str, day: u32) -> Concert {
        Concert {
            id: Uuid::new_v4(),
            artist_id: "A".to_string(),
            venue_id,
            title: title.to_string(),
            listed_venue_name: "Zepp X".to_string(),
            local_date: date(day),
            start_time: None,
            open_time: None,
            source_url: "https://example.com".to_string(),
        }
    }

    #[tokio::test]
    async fn concert_insert_skips_natural_key_collisions() {
        let storage = InMemoryStorage::new();
        let venue = Uuid::new_v4();

        let first = storage
            .create_concerts_idempotent(&[concert(venue, "T", 3), concert(venue, "T", 4)])
            .await
            .unwrap();
        // fresh ids, same natural key
        let second = storage
            .create_concerts_idempotent(&[concert(venue, "T", 3), concert(venue, "U", 3)])
            .await
            .unwrap();

        assert_eq!(first, 2);
        assert_eq!(second, 1);
        assert_eq!(storage.all_concerts().await.len(), 3);
    }

    #[tokio::test]
    async fn duplicate_listed_name_is_a_conflict() {
        let storage = InMemoryStorage::new();
        storage.create_venue(&Venue::new_pending("Zepp X", None)).await.unwrap();
        let err = storage.create_venue(&Venue::new_pending("Zepp X", None)).await.unwrap_err();
        assert!(matches!(err, PipelineError::Conflict(_)));
    }

    #[tokio::test]
    async fn listed_name_hit_wins_over_renamed_venue() {
        let storage = InMemoryStorage::new();
        let mut bay = Venue::new_pending("Zepp Tokyo Bay", None);
        storage.create_venue(&bay).await.unwrap();
        let divercity = Venue::new_pending("Zepp DiverCity", None);
        storage.create_venue(&divercity).await.unwrap();
        bay.name = "Zepp DiverCity".to_string();
        storage.update_venue_enrichment(&bay).await.unwrap();

        let found = storage.get_venue_by_name("Zepp DiverCity").await.unwrap().unwrap();
        assert_eq!(found.id, divercity.id);
        let by_listed = storage.get_venue_by_name("Zepp Tokyo Bay").await.unwrap().unwrap();
        assert_eq!(by_listed.id, bay.id);
    }

    #[tokio::test]
    async fn followed_artists_are_listed_once_in_follow_order() {
        let storage = InMemoryStorage::new();
        for (id, name) in [("b", "Band B"), ("a", "Band A")] {
            storage.create_artist(&Artist::new(id, name)).await.unwrap();
        }
        for (user, artist) in [("u1", "b"), ("u2", "a"), ("u2", "b")] {
            storage
                .follow_artist(&FollowedArtist {
                    user_id: user.to_string(),
                    artist_id: artist.to_string(),
                    passion: PassionLevel::MustGo,
                })
                .await
                .unwrap();
        }

        let ids: Vec<String> = storage
            .list_followed_artists()
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.id)
            .collect();
        assert_eq!(ids, vec!["b", "a"]);
        assert_eq!(storage.list_followers("b").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn mbid_backfill_never_overwrites() {
        let storage = InMemoryStorage::new();
        storage.create_artist(&Artist::new("a", "Band A")).await.unwrap();
        storage.backfill_artist_mbid("a", "mbid-1").await.unwrap();
        storage.backfill_artist_mbid("a", "mbid-2").await.unwrap();
        let artist = storage.get_artist("a").await.unwrap().unwrap();
        assert_eq!(artist.mbid.as_deref(), Some("mbid-1"));
    }
}
