use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use super::http_client::{api_key_from_env, build_client, with_bearer};
use crate::config::SearchConfig;
use crate::context::Ctx;
use crate::discovery::ConcertSearcher;
use crate::domain::{Artist, ScrapedConcert};
use crate::error::{PipelineError, Result};

#[derive(Debug, Serialize)]
struct SearchRequest<'a> {
    artist_id: &'a str,
    artist_name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    mbid: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    official_site: Option<&'a str>,
    from: NaiveDate,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    concerts: Vec<ScrapedConcert>,
}

/// Concert search service reached over JSON/HTTP: `POST {endpoint}` with the
/// artist and date floor, answered with `{"concerts": [...]}`.
pub struct HttpConcertSearcher {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpConcertSearcher {
    pub fn new(client: Client, endpoint: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            api_key,
        }
    }

    pub fn from_config(config: &SearchConfig) -> Result<Self> {
        let endpoint = config
            .endpoint
            .clone()
            .ok_or_else(|| PipelineError::Config("search.endpoint is required for discovery".to_string()))?;
        let client = build_client(std::time::Duration::from_secs(config.timeout_secs))?;
        Ok(Self::new(client, endpoint, api_key_from_env(config.api_key_env.as_deref())))
    }
}

#[async_trait]
impl ConcertSearcher for HttpConcertSearcher {
    #[instrument(skip(self, ctx, artist), fields(artist_id = %artist.id))]
    async fn search(
        &self,
        ctx: &Ctx,
        artist: &Artist,
        official_site: Option<&str>,
        from: NaiveDate,
    ) -> Result<Vec<ScrapedConcert>> {
        let body = SearchRequest {
            artist_id: &artist.id,
            artist_name: &artist.name,
            mbid: artist.mbid.as_deref(),
            official_site,
            from,
        };
        let request = with_bearer(self.client.post(&self.endpoint).json(&body), self.api_key.as_deref());
        let response = ctx.run(async { request.send().await.map_err(PipelineError::from) }).await?;

        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::Search {
                artist: artist.id.clone(),
                message: format!("search service returned {status}"),
            });
        }
        let parsed = ctx
            .run(async { response.json::<SearchResponse>().await.map_err(PipelineError::from) })
            .await?;
        debug!("Search returned {} concerts", parsed.concerts.len());
        Ok(parsed.concerts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::http_client::test_server::serve_once;
    use std::time::Duration;

    fn searcher(endpoint: String) -> HttpConcertSearcher {
        HttpConcertSearcher::new(build_client(Duration::from_secs(5)).unwrap(), endpoint, Some("k".to_string()))
    }

    #[tokio::test]
    async fn posts_artist_and_parses_concerts() {
        let (url, request) = serve_once(
            200,
            r#"{"concerts":[{"title":"T","listed_venue_name":"Zepp X","local_date":"2026-11-03","source_url":"https://example.com"}]}"#,
        )
        .await;
        let mut artist = Artist::new("A", "Artist A");
        artist.official_site = Some("https://artist-a.example".to_string());

        let concerts = searcher(url)
            .search(
                &Ctx::background(),
                &artist,
                artist.official_site.as_deref(),
                NaiveDate::from_ymd_opt(2026, 10, 18).unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(concerts.len(), 1);
        assert_eq!(concerts[0].listed_venue_name, "Zepp X");
        let raw = request.await.unwrap();
        assert!(raw.starts_with("POST "));
        assert!(raw.to_lowercase().contains("authorization: bearer k"));
        assert!(raw.contains("\"official_site\":\"https://artist-a.example\""));
    }

    #[tokio::test]
    async fn error_status_is_a_search_error() {
        let (url, _request) = serve_once(429, r#"{"error":"rate limited"}"#).await;

        let err = searcher(url)
            .search(
                &Ctx::background(),
                &Artist::new("A", "Artist A"),
                None,
                NaiveDate::from_ymd_opt(2026, 10, 18).unwrap(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::Search { .. }));
    }
}
