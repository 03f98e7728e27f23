use std::sync::Arc;
use tempfile::tempdir;

use concert_pipeline::domain::{EnrichmentStatus, Venue};
use concert_pipeline::storage::{InMemoryStorage, SqliteStorage, Storage};

/// Two venues, the first later renamed to the second's listed name.
/// The listed name keeps resolving to the venue it was listed under.
async fn lookup_after_rename(storage: Arc<dyn Storage>) {
    let mut bay = Venue::new_pending("Zepp Tokyo Bay", None);
    storage.create_venue(&bay).await.unwrap();
    let divercity = Venue::new_pending("Zepp DiverCity", None);
    storage.create_venue(&divercity).await.unwrap();

    bay.name = "Zepp DiverCity".to_string();
    bay.enrichment_status = EnrichmentStatus::Enriched;
    storage.update_venue_enrichment(&bay).await.unwrap();

    let found = storage.get_venue_by_name("Zepp DiverCity").await.unwrap().unwrap();
    assert_eq!(found.id, divercity.id);
    assert_eq!(found.raw_name, "Zepp DiverCity");

    let by_listed = storage.get_venue_by_name("Zepp Tokyo Bay").await.unwrap().unwrap();
    assert_eq!(by_listed.id, bay.id);
    assert_eq!(by_listed.name, "Zepp DiverCity");
}

/// Canonical-name matches only: the earliest created venue wins.
async fn canonical_lookup_prefers_earliest(storage: Arc<dyn Storage>) {
    let mut first = Venue::new_pending("Zepp X", None);
    storage.create_venue(&first).await.unwrap();
    let mut second = Venue::new_pending("ZEPP X HALL", None);
    storage.create_venue(&second).await.unwrap();

    for venue in [&mut first, &mut second] {
        venue.name = "Zepp Haneda".to_string();
        storage.update_venue_enrichment(venue).await.unwrap();
    }

    let found = storage.get_venue_by_name("Zepp Haneda").await.unwrap().unwrap();
    assert_eq!(found.id, first.id);
}

#[tokio::test]
async fn venue_lookup_after_rename_in_memory() {
    lookup_after_rename(Arc::new(InMemoryStorage::new())).await;
}

#[tokio::test]
async fn venue_lookup_after_rename_on_sqlite() {
    let dir = tempdir().unwrap();
    lookup_after_rename(Arc::new(SqliteStorage::open_at_root(dir.path()).unwrap())).await;
}

#[tokio::test]
async fn canonical_lookup_in_memory() {
    canonical_lookup_prefers_earliest(Arc::new(InMemoryStorage::new())).await;
}

#[tokio::test]
async fn canonical_lookup_on_sqlite() {
    let dir = tempdir().unwrap();
    canonical_lookup_prefers_earliest(Arc::new(SqliteStorage::open_at_root(dir.path()).unwrap())).await;
}
