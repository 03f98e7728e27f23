use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An artist users can follow. Only `mbid` is ever written after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artist {
    pub id: String,
    pub name: String,
    pub mbid: Option<String>,
    /// Official site handed to the search collaborator as a hint
    pub official_site: Option<String>,
}

impl Artist {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            mbid: None,
            official_site: None,
        }
    }
}

/// A concert as listed by the search collaborator. Untrusted and never stored as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapedConcert {
    pub title: String,
    pub listed_venue_name: String,
    #[serde(default)]
    pub admin_area: Option<String>,
    pub local_date: NaiveDate,
    #[serde(default)]
    pub start_time: Option<NaiveTime>,
    #[serde(default)]
    pub open_time: Option<NaiveTime>,
    pub source_url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrichmentStatus {
    Pending,
    Enriched,
    Failed,
}

impl EnrichmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnrichmentStatus::Pending => "pending",
            EnrichmentStatus::Enriched => "enriched",
            EnrichmentStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(EnrichmentStatus::Pending),
            "enriched" => Some(EnrichmentStatus::Enriched),
            "failed" => Some(EnrichmentStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Venue {
    pub id: Uuid,
    /// Canonical name; starts as the listed name and may be replaced by enrichment
    pub name: String,
    /// The listed name that first produced this venue
    pub raw_name: String,
    pub admin_area: Option<String>,
    pub enrichment_status: EnrichmentStatus,
    pub external_place_id: Option<String>,
}

impl Venue {
    /// A fresh, unenriched venue minted from a listed name.
    pub fn new_pending(listed_name: &str, admin_area: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: listed_name.to_string(),
            raw_name: listed_name.to_string(),
            admin_area,
            enrichment_status: EnrichmentStatus::Pending,
            external_place_id: None,
        }
    }

    /// True if `name` is either the canonical or the originally listed name.
    pub fn answers_to(&self, name: &str) -> bool {
        self.name == name || self.raw_name == name
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Concert {
    pub id: Uuid,
    pub artist_id: String,
    pub venue_id: Uuid,
    pub title: String,
    pub listed_venue_name: String,
    pub local_date: NaiveDate,
    pub start_time: Option<NaiveTime>,
    pub open_time: Option<NaiveTime>,
    pub source_url: String,
}

impl Concert {
    pub fn from_scraped(artist_id: &str, venue_id: Uuid, scraped: &ScrapedConcert) -> Self {
        Self {
            id: Uuid::new_v4(),
            artist_id: artist_id.to_string(),
            venue_id,
            title: scraped.title.clone(),
            listed_venue_name: scraped.listed_venue_name.clone(),
            local_date: scraped.local_date,
            start_time: scraped.start_time,
            open_time: scraped.open_time,
            source_url: scraped.source_url.clone(),
        }
    }

    /// Natural key used for idempotent inserts: artist + venue + date + title.
    pub fn natural_key(&self) -> (&str, Uuid, NaiveDate, &str) {
        (&self.artist_id, self.venue_id, self.local_date, &self.title)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PassionLevel {
    MustGo,
    LocalOnly,
    KeepAnEye,
}

impl PassionLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            PassionLevel::MustGo => "must_go",
            PassionLevel::LocalOnly => "local_only",
            PassionLevel::KeepAnEye => "keep_an_eye",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "must_go" => Some(PassionLevel::MustGo),
            "local_only" => Some(PassionLevel::LocalOnly),
            "keep_an_eye" => Some(PassionLevel::KeepAnEye),
            _ => None,
        }
    }
}

/// A user following an artist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FollowedArtist {
    pub user_id: String,
    pub artist_id: String,
    pub passion: PassionLevel,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_pending_venue_uses_listed_name_for_both_names() {
        let venue = Venue::new_pending("Zepp X", Some("Tokyo".to_string()));
        assert_eq!(venue.name, "Zepp X");
        assert_eq!(venue.raw_name, "Zepp X");
        assert_eq!(venue.enrichment_status, EnrichmentStatus::Pending);
        assert!(venue.external_place_id.is_none());
    }

    #[test]
    fn renamed_venue_still_answers_to_listed_name() {
        let mut venue = Venue::new_pending("Zepp X", None);
        venue.name = "Zepp X Tokyo".to_string();
        assert!(venue.answers_to("Zepp X"));
        assert!(venue.answers_to("Zepp X Tokyo"));
        assert!(!venue.answers_to("zepp x"));
    }

    #[test]
    fn status_round_trips_through_storage_form() {
        for status in [EnrichmentStatus::Pending, EnrichmentStatus::Enriched, EnrichmentStatus::Failed] {
            assert_eq!(EnrichmentStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(EnrichmentStatus::parse("unknown"), None);
    }
}
