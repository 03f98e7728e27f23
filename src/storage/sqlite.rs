use async_trait::async_trait;
use chrono::{NaiveDate, NaiveTime, Utc};
use rusqlite::{params, params_from_iter, OptionalExtension, Row};
use std::path::Path;
use tracing::{debug, info};
use uuid::Uuid;

use super::Storage;
use crate::db::Database;
use crate::domain::*;
use crate::error::{PipelineError, Result};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS artists (
    id             TEXT PRIMARY KEY,
    name           TEXT NOT NULL,
    mbid           TEXT,
    official_site  TEXT
);
CREATE TABLE IF NOT EXISTS follows (
    seq        INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id    TEXT NOT NULL,
    artist_id  TEXT NOT NULL REFERENCES artists (id),
    passion    TEXT NOT NULL,
    UNIQUE (user_id, artist_id)
);
CREATE TABLE IF NOT EXISTS venues (
    id                 TEXT PRIMARY KEY,
    name               TEXT NOT NULL,
    raw_name           TEXT NOT NULL UNIQUE,
    admin_area         TEXT,
    enrichment_status  TEXT NOT NULL,
    external_place_id  TEXT,
    created_at         INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_venues_name ON venues (name);
CREATE INDEX IF NOT EXISTS idx_venues_status ON venues (enrichment_status);
CREATE TABLE IF NOT EXISTS concerts (
    id                 TEXT PRIMARY KEY,
    artist_id          TEXT NOT NULL,
    venue_id           TEXT NOT NULL REFERENCES venues (id),
    title              TEXT NOT NULL,
    listed_venue_name  TEXT NOT NULL,
    local_date         TEXT NOT NULL,
    start_time         TEXT,
    open_time          TEXT,
    source_url         TEXT NOT NULL,
    UNIQUE (artist_id, venue_id, local_date, title)
);
CREATE INDEX IF NOT EXISTS idx_concerts_artist_date ON concerts (artist_id, local_date);
"#;

const DATE_FORMAT: &str = "%Y-%m-%d";
const TIME_FORMAT: &str = "%H:%M:%S";

const VENUE_COLUMNS: &str = "id, name, raw_name, admin_area, enrichment_status, external_place_id";
const ARTIST_COLUMNS: &str = "id, name, mbid, official_site";

/// Row store on a local SQLite file, with the uniqueness rules as table constraints.
#[derive(Clone)]
pub struct SqliteStorage {
    db: Database,
}

impl SqliteStorage {
    pub fn open_at_root<P: AsRef<Path>>(data_root: P) -> Result<Self> {
        Self::open(&data_root.as_ref().join("store").join("pipeline.db"))
    }

    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::open(path, SCHEMA)?;
        info!("SQLite storage ready at {}", path.display());
        Ok(Self { db })
    }

    pub fn database(&self) -> &Database {
        &self.db
    }
}

fn conversion_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, message.into())
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(err, rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation)
}

fn parse_uuid(idx: usize, raw: String) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(&raw).map_err(|e| conversion_error(idx, format!("bad uuid '{raw}': {e}")))
}

fn parse_time(idx: usize, raw: Option<String>) -> rusqlite::Result<Option<NaiveTime>> {
    raw.map(|t| {
        NaiveTime::parse_from_str(&t, TIME_FORMAT)
            .map_err(|e| conversion_error(idx, format!("bad time '{t}': {e}")))
    })
    .transpose()
}

fn venue_from_row(row: &Row<'_>) -> rusqlite::Result<Venue> {
    let status: String = row.get(4)?;
    Ok(Venue {
        id: parse_uuid(0, row.get(0)?)?,
        name: row.get(1)?,
        raw_name: row.get(2)?,
        admin_area: row.get(3)?,
        enrichment_status: EnrichmentStatus::parse(&status)
            .ok_or_else(|| conversion_error(4, format!("unknown status '{status}'")))?,
        external_place_id: row.get(5)?,
    })
}

fn artist_from_row(row: &Row<'_>) -> rusqlite::Result<Artist> {
    Ok(Artist {
        id: row.get(0)?,
        name: row.get(1)?,
        mbid: row.get(2)?,
        official_site: row.get(3)?,
    })
}

fn concert_from_row(row: &Row<'_>) -> rusqlite::Result<Concert> {
    let date: String = row.get(5)?;
    Ok(Concert {
        id: parse_uuid(0, row.get(0)?)?,
        artist_id: row.get(1)?,
        venue_id: parse_uuid(2, row.get(2)?)?,
        title: row.get(3)?,
        listed_venue_name: row.get(4)?,
        local_date: NaiveDate::parse_from_str(&date, DATE_FORMAT)
            .map_err(|e| conversion_error(5, format!("bad date '{date}': {e}")))?,
        start_time: parse_time(6, row.get(6)?)?,
        open_time: parse_time(7, row.get(7)?)?,
        source_url: row.get(8)?,
    })
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn get_venue_by_name(&self, name: &str) -> Result<Option<Venue>> {
        let name = name.to_string();
        self.db
            .call(move |conn| {
                // a listed-name hit wins over a canonical-name hit
                let sql = format!(
                    "SELECT {VENUE_COLUMNS} FROM venues WHERE raw_name = ?1 OR name = ?1
                     ORDER BY CASE WHEN raw_name = ?1 THEN 0 ELSE 1 END, created_at, rowid LIMIT 1"
                );
                Ok(conn.query_row(&sql, params![name], venue_from_row).optional()?)
            })
            .await
    }

    async fn get_venue(&self, venue_id: Uuid) -> Result<Option<Venue>> {
        self.db
            .call(move |conn| {
                let sql = format!("SELECT {VENUE_COLUMNS} FROM venues WHERE id = ?1");
                Ok(conn
                    .query_row(&sql, params![venue_id.to_string()], venue_from_row)
                    .optional()?)
            })
            .await
    }

    async fn create_venue(&self, venue: &Venue) -> Result<()> {
        let venue = venue.clone();
        self.db
            .call(move |conn| {
                let res = conn.execute(
                    "INSERT INTO venues (id, name, raw_name, admin_area, enrichment_status, external_place_id, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        venue.id.to_string(),
                        venue.name,
                        venue.raw_name,
                        venue.admin_area,
                        venue.enrichment_status.as_str(),
                        venue.external_place_id,
                        Utc::now().timestamp_millis(),
                    ],
                );
                match res {
                    Ok(_) => {
                        debug!("Created venue: {} with id {}", venue.name, venue.id);
                        Ok(())
                    }
                    Err(e) if is_constraint_violation(&e) => {
                        Err(PipelineError::Conflict(format!("venue '{}'", venue.raw_name)))
                    }
                    Err(e) => Err(e.into()),
                }
            })
            .await
    }

    async fn list_venues_by_status(&self, statuses: &[EnrichmentStatus]) -> Result<Vec<Venue>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let statuses: Vec<&'static str> = statuses.iter().map(|s| s.as_str()).collect();
        self.db
            .call(move |conn| {
                let placeholders = vec!["?"; statuses.len()].join(", ");
                let sql = format!(
                    "SELECT {VENUE_COLUMNS} FROM venues WHERE enrichment_status IN ({placeholders})
                     ORDER BY created_at, rowid"
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(params_from_iter(statuses.iter()), venue_from_row)?;
                let mut venues = Vec::new();
                for row in rows {
                    venues.push(row?);
                }
                Ok(venues)
            })
            .await
    }

    async fn update_venue_enrichment(&self, venue: &Venue) -> Result<()> {
        let venue = venue.clone();
        self.db
            .call(move |conn| {
                let changed = conn.execute(
                    "UPDATE venues SET name = ?2, admin_area = ?3, external_place_id = ?4, enrichment_status = ?5
                     WHERE id = ?1",
                    params![
                        venue.id.to_string(),
                        venue.name,
                        venue.admin_area,
                        venue.external_place_id,
                        venue.enrichment_status.as_str(),
                    ],
                )?;
                if changed == 0 {
                    return Err(PipelineError::NotFound(format!("venue {}", venue.id)));
                }
                Ok(())
            })
            .await
    }

    async fn create_concerts_idempotent(&self, concerts: &[Concert]) -> Result<usize> {
        let concerts = concerts.to_vec();
        self.db
            .call(move |conn| {
                let tx = conn.transaction()?;
                let mut inserted = 0;
                {
                    let mut stmt = tx.prepare(
                        "INSERT OR IGNORE INTO concerts
                         (id, artist_id, venue_id, title, listed_venue_name, local_date, start_time, open_time, source_url)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    )?;
                    for c in &concerts {
                        inserted += stmt.execute(params![
                            c.id.to_string(),
                            c.artist_id,
                            c.venue_id.to_string(),
                            c.title,
                            c.listed_venue_name,
                            c.local_date.format(DATE_FORMAT).to_string(),
                            c.start_time.map(|t| t.format(TIME_FORMAT).to_string()),
                            c.open_time.map(|t| t.format(TIME_FORMAT).to_string()),
                            c.source_url,
                        ])?;
                    }
                }
                tx.commit()?;
                debug!("Inserted {} of {} concerts", inserted, concerts.len());
                Ok(inserted)
            })
            .await
    }

    async fn list_upcoming_concerts(&self, artist_id: &str, from: NaiveDate) -> Result<Vec<Concert>> {
        let artist_id = artist_id.to_string();
        let from = from.format(DATE_FORMAT).to_string();
        self.db
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, artist_id, venue_id, title, listed_venue_name, local_date, start_time, open_time, source_url
                     FROM concerts WHERE artist_id = ?1 AND local_date >= ?2 ORDER BY local_date, title",
                )?;
                let rows = stmt.query_map(params![artist_id, from], concert_from_row)?;
                let mut concerts = Vec::new();
                for row in rows {
                    concerts.push(row?);
                }
                Ok(concerts)
            })
            .await
    }

    async fn create_artist(&self, artist: &Artist) -> Result<()> {
        let artist = artist.clone();
        self.db
            .call(move |conn| {
                let res = conn.execute(
                    "INSERT INTO artists (id, name, mbid, official_site) VALUES (?1, ?2, ?3, ?4)",
                    params![artist.id, artist.name, artist.mbid, artist.official_site],
                );
                match res {
                    Ok(_) => Ok(()),
                    Err(e) if is_constraint_violation(&e) => {
                        Err(PipelineError::Conflict(format!("artist '{}'", artist.id)))
                    }
                    Err(e) => Err(e.into()),
                }
            })
            .await
    }

    async fn get_artist(&self, artist_id: &str) -> Result<Option<Artist>> {
        let artist_id = artist_id.to_string();
        self.db
            .call(move |conn| {
                let sql = format!("SELECT {ARTIST_COLUMNS} FROM artists WHERE id = ?1");
                Ok(conn.query_row(&sql, params![artist_id], artist_from_row).optional()?)
            })
            .await
    }

    async fn backfill_artist_mbid(&self, artist_id: &str, mbid: &str) -> Result<()> {
        let artist_id = artist_id.to_string();
        let mbid = mbid.to_string();
        self.db
            .call(move |conn| {
                let changed = conn.execute(
                    "UPDATE artists SET mbid = ?2 WHERE id = ?1 AND mbid IS NULL",
                    params![artist_id, mbid],
                )?;
                if changed == 0 {
                    let exists: Option<i64> = conn
                        .query_row("SELECT 1 FROM artists WHERE id = ?1", params![artist_id], |row| row.get(0))
                        .optional()?;
                    if exists.is_none() {
                        return Err(PipelineError::NotFound(format!("artist {artist_id}")));
                    }
                }
                Ok(())
            })
            .await
    }

    async fn follow_artist(&self, follow: &FollowedArtist) -> Result<()> {
        let follow = follow.clone();
        self.db
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO follows (user_id, artist_id, passion) VALUES (?1, ?2, ?3)
                     ON CONFLICT(user_id, artist_id) DO UPDATE SET passion = excluded.passion",
                    params![follow.user_id, follow.artist_id, follow.passion.as_str()],
                )?;
                Ok(())
            })
            .await
    }

    async fn list_followed_artists(&self) -> Result<Vec<Artist>> {
        self.db
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT a.id, a.name, a.mbid, a.official_site FROM artists a
                     JOIN (SELECT artist_id, MIN(seq) AS first_seq FROM follows GROUP BY artist_id) f
                       ON f.artist_id = a.id
                     ORDER BY f.first_seq",
                )?;
                let rows = stmt.query_map([], artist_from_row)?;
                let mut artists = Vec::new();
                for row in rows {
                    artists.push(row?);
                }
                Ok(artists)
            })
            .await
    }

    async fn list_followers(&self, artist_id: &str) -> Result<Vec<FollowedArtist>> {
        let artist_id = artist_id.to_string();
        self.db
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT user_id, artist_id, passion FROM follows WHERE artist_id = ?1 ORDER BY seq",
                )?;
                let rows = stmt.query_map(params![artist_id], |row| {
                    let passion: String = row.get(2)?;
                    Ok(FollowedArtist {
                        user_id: row.get(0)?,
                        artist_id: row.get(1)?,
                        passion: PassionLevel::parse(&passion)
                            .ok_or_else(|| conversion_error(2, format!("unknown passion '{passion}'")))?,
                    })
                })?;
                let mut followers = Vec::new();
                for row in rows {
                    followers.push(row?);
                }
                Ok(followers)
            })
            .await
    }
}
