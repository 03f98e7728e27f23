use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::ScrapedConcert;
use crate::error::{PipelineError, Result};

pub const CONTENT_TYPE_JSON: &str = "application/json";

/// The three events flowing through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ConcertDiscovered,
    ConcertCreated,
    VenueCreated,
}

impl EventKind {
    pub const ALL: [EventKind; 3] = [
        EventKind::ConcertDiscovered,
        EventKind::ConcertCreated,
        EventKind::VenueCreated,
    ];

    /// Type name without the namespace prefix, version included.
    pub fn suffix(&self) -> &'static str {
        match self {
            EventKind::ConcertDiscovered => "concert.discovered.v1",
            EventKind::ConcertCreated => "concert.created.v1",
            EventKind::VenueCreated => "venue.created.v1",
        }
    }

    /// Full wire type, e.g. `gigs.concert.created.v1`.
    pub fn type_name(&self, namespace: &str) -> String {
        format!("{}.{}", namespace, self.suffix())
    }

    /// Resolve a wire type regardless of namespace.
    pub fn from_type_name(type_name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| {
            type_name
                .strip_suffix(kind.suffix())
                .is_some_and(|prefix| prefix.is_empty() || prefix.ends_with('.'))
        })
    }
}

/// Versioned wrapper around every published event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub event_type: String,
    pub source: String,
    pub time: DateTime<Utc>,
    pub content_type: String,
    pub payload: serde_json::Value,
}

impl Envelope {
    pub fn kind(&self) -> Option<EventKind> {
        EventKind::from_type_name(&self.event_type)
    }

    /// Decode the payload, refusing envelopes of another kind.
    pub fn decode<P: EventPayload>(&self) -> Result<P> {
        if self.kind() != Some(P::KIND) {
            return Err(PipelineError::UnexpectedEvent {
                expected: P::KIND.suffix().to_string(),
                actual: self.event_type.clone(),
            });
        }
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

pub fn poison_topic(namespace: &str) -> String {
    format!("{namespace}.poison")
}

/// A payload type bound to exactly one event kind.
pub trait EventPayload: Serialize + DeserializeOwned + Send + Sync {
    const KIND: EventKind;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConcertDiscovered {
    pub artist_id: String,
    pub artist_name: String,
    pub concerts: Vec<ScrapedConcert>,
}

impl EventPayload for ConcertDiscovered {
    const KIND: EventKind = EventKind::ConcertDiscovered;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConcertCreated {
    pub artist_id: String,
    pub artist_name: String,
    pub concert_count: usize,
}

impl EventPayload for ConcertCreated {
    const KIND: EventKind = EventKind::ConcertCreated;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VenueCreated {
    pub venue_id: Uuid,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_area: Option<String>,
}

impl EventPayload for VenueCreated {
    const KIND: EventKind = EventKind::VenueCreated;
}

/// Stamps payloads into envelopes for one namespace and producer.
#[derive(Debug, Clone)]
pub struct EnvelopeFactory {
    namespace: String,
    source: String,
}

impl EnvelopeFactory {
    pub fn new(namespace: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            source: source.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Topic an event kind is published on. Topics share the wire type name.
    pub fn topic(&self, kind: EventKind) -> String {
        kind.type_name(&self.namespace)
    }

    /// Dead-letter topic for this namespace.
    pub fn poison_topic(&self) -> String {
        poison_topic(&self.namespace)
    }

    pub fn wrap<P: EventPayload>(&self, payload: &P) -> Result<Envelope> {
        Ok(Envelope {
            id: Uuid::new_v4(),
            event_type: P::KIND.type_name(&self.namespace),
            source: self.source.clone(),
            time: Utc::now(),
            content_type: CONTENT_TYPE_JSON.to_string(),
            payload: serde_json::to_value(payload)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn factory() -> EnvelopeFactory {
        EnvelopeFactory::new("gigs", "test")
    }

    #[test]
    fn wrap_stamps_namespaced_type_and_fresh_id() {
        let payload = ConcertCreated {
            artist_id: "A".to_string(),
            artist_name: "Artist A".to_string(),
            concert_count: 2,
        };
        let first = factory().wrap(&payload).unwrap();
        let second = factory().wrap(&payload).unwrap();

        assert_eq!(first.event_type, "gigs.concert.created.v1");
        assert_eq!(first.content_type, CONTENT_TYPE_JSON);
        assert_eq!(first.source, "test");
        assert_ne!(first.id, second.id);
        assert_eq!(first.kind(), Some(EventKind::ConcertCreated));
    }

    #[test]
    fn wire_form_uses_type_key_and_rfc3339_time() {
        let env = factory()
            .wrap(&VenueCreated {
                venue_id: Uuid::new_v4(),
                name: "Zepp X".to_string(),
                admin_area: None,
            })
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&env.to_json().unwrap()).unwrap();

        assert_eq!(value["type"], "gigs.venue.created.v1");
        assert!(value["payload"].get("admin_area").is_none());
        let time = value["time"].as_str().unwrap();
        assert!(DateTime::parse_from_rfc3339(time).is_ok());
    }

    #[test]
    fn decode_rejects_other_kinds() {
        let env = factory()
            .wrap(&ConcertDiscovered {
                artist_id: "A".to_string(),
                artist_name: "Artist A".to_string(),
                concerts: vec![ScrapedConcert {
                    title: "T".to_string(),
                    listed_venue_name: "Zepp X".to_string(),
                    admin_area: None,
                    local_date: NaiveDate::from_ymd_opt(2026, 11, 3).unwrap(),
                    start_time: None,
                    open_time: None,
                    source_url: "https://example.com/t".to_string(),
                }],
            })
            .unwrap();

        let decoded: ConcertDiscovered = env.decode().unwrap();
        assert_eq!(decoded.concerts.len(), 1);

        let err = env.decode::<VenueCreated>().unwrap_err();
        assert!(matches!(err, PipelineError::UnexpectedEvent { .. }));
    }

    #[test]
    fn kind_lookup_ignores_namespace_but_not_partial_words() {
        assert_eq!(
            EventKind::from_type_name("other.concert.discovered.v1"),
            Some(EventKind::ConcertDiscovered)
        );
        assert_eq!(EventKind::from_type_name("venue.created.v1"), Some(EventKind::VenueCreated));
        assert_eq!(EventKind::from_type_name("x.bigvenue.created.v1"), None);
        assert_eq!(EventKind::from_type_name("x.venue.created.v2"), None);
    }
}
