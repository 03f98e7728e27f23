//! Persistent store for artists, follows, venues and concerts.
//!
//! Cross-batch consistency lives here, not in handlers: venues are unique by
//! their listed (raw) name and concerts by artist + venue + date + title.

pub mod in_memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::NaiveDate;
use uuid::Uuid;

use crate::domain::*;
use crate::error::Result;

pub use in_memory::InMemoryStorage;
pub use sqlite::SqliteStorage;

#[async_trait]
pub trait Storage: Send + Sync {
    // Venue operations

    /// Exact match on the canonical or the originally listed name.
    async fn get_venue_by_name(&self, name: &str) -> Result<Option<Venue>>;
    async fn get_venue(&self, venue_id: Uuid) -> Result<Option<Venue>>;
    /// Fails with `Conflict` if a venue already claims `venue.raw_name`.
    async fn create_venue(&self, venue: &Venue) -> Result<()>;
    async fn list_venues_by_status(&self, statuses: &[EnrichmentStatus]) -> Result<Vec<Venue>>;
    /// Persist name, admin area, place id and status produced by enrichment.
    async fn update_venue_enrichment(&self, venue: &Venue) -> Result<()>;

    // Concert operations

    /// Insert all concerts in one operation, skipping natural-key collisions.
    /// Returns how many rows were actually inserted.
    async fn create_concerts_idempotent(&self, concerts: &[Concert]) -> Result<usize>;
    async fn list_upcoming_concerts(&self, artist_id: &str, from: NaiveDate) -> Result<Vec<Concert>>;

    // Artist operations

    async fn create_artist(&self, artist: &Artist) -> Result<()>;
    async fn get_artist(&self, artist_id: &str) -> Result<Option<Artist>>;
    /// Set the catalog id on an artist that does not have one yet.
    async fn backfill_artist_mbid(&self, artist_id: &str, mbid: &str) -> Result<()>;
    async fn follow_artist(&self, follow: &FollowedArtist) -> Result<()>;
    /// Artists followed by at least one user, in first-followed order.
    async fn list_followed_artists(&self) -> Result<Vec<Artist>>;
    async fn list_followers(&self, artist_id: &str) -> Result<Vec<FollowedArtist>>;
}
