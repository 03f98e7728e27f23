use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, instrument};

use super::http_client::{api_key_from_env, build_client, with_bearer};
use crate::config::PlaceSearcherConfig;
use crate::context::Ctx;
use crate::enrichment::{PlaceMatch, PlaceSearcher};
use crate::error::{PipelineError, Result};

#[derive(Debug, Deserialize)]
struct PlaceResponse {
    place: Option<PlaceBody>,
}

#[derive(Debug, Deserialize)]
struct PlaceBody {
    place_id: String,
    canonical_name: String,
    #[serde(default)]
    admin_area: Option<String>,
}

/// Place-search service reached over JSON/HTTP:
/// `GET {endpoint}?name=..&admin_area=..`, answered with `{"place": {...}}`
/// or `{"place": null}`. A 404 also means not found.
pub struct HttpPlaceSearcher {
    name: String,
    client: Client,
    endpoint: Option<String>,
    api_key: Option<String>,
}

impl HttpPlaceSearcher {
    pub fn new(name: impl Into<String>, client: Client, endpoint: Option<String>, api_key: Option<String>) -> Self {
        Self {
            name: name.into(),
            client,
            endpoint,
            api_key,
        }
    }

    pub fn from_config(config: &PlaceSearcherConfig, timeout: Duration) -> Result<Self> {
        Ok(Self::new(
            config.name.clone(),
            build_client(timeout)?,
            config.endpoint.clone(),
            api_key_from_env(config.api_key_env.as_deref()),
        ))
    }

    fn failure(&self, message: impl Into<String>) -> PipelineError {
        PipelineError::PlaceSearch {
            source_name: self.name.clone(),
            message: message.into(),
        }
    }
}

#[async_trait]
impl PlaceSearcher for HttpPlaceSearcher {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_configured(&self) -> bool {
        self.endpoint.is_some()
    }

    #[instrument(skip(self, ctx), fields(searcher = %self.name))]
    async fn search_place(&self, ctx: &Ctx, name: &str, admin_area: Option<&str>) -> Result<Option<PlaceMatch>> {
        let endpoint = self
            .endpoint
            .as_deref()
            .ok_or_else(|| self.failure("no endpoint configured"))?;

        let mut query = vec![("name", name)];
        if let Some(area) = admin_area {
            query.push(("admin_area", area));
        }
        let request = with_bearer(self.client.get(endpoint).query(&query), self.api_key.as_deref());
        let response = ctx
            .run(async { request.send().await.map_err(|e| self.failure(e.to_string())) })
            .await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            debug!("Place service has no match");
            return Ok(None);
        }
        if !status.is_success() {
            return Err(self.failure(format!("place service returned {status}")));
        }

        let parsed = ctx
            .run(async {
                response
                    .json::<PlaceResponse>()
                    .await
                    .map_err(|e| self.failure(format!("invalid response body: {e}")))
            })
            .await?;
        Ok(parsed.place.map(|p| PlaceMatch {
            place_id: p.place_id,
            canonical_name: p.canonical_name,
            admin_area: p.admin_area,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::http_client::test_server::serve_once;

    fn searcher(endpoint: Option<String>) -> HttpPlaceSearcher {
        HttpPlaceSearcher::new("maps", build_client(Duration::from_secs(5)).unwrap(), endpoint, None)
    }

    #[tokio::test]
    async fn parses_a_match_and_sends_the_query() {
        let (url, request) = serve_once(
            200,
            r#"{"place":{"place_id":"p-1","canonical_name":"Zepp Haneda","admin_area":"Tokyo"}}"#,
        )
        .await;

        let found = searcher(Some(url))
            .search_place(&Ctx::background(), "Zepp X", Some("Tokyo"))
            .await
            .unwrap();

        assert_eq!(
            found,
            Some(PlaceMatch {
                place_id: "p-1".to_string(),
                canonical_name: "Zepp Haneda".to_string(),
                admin_area: Some("Tokyo".to_string()),
            })
        );
        let raw = request.await.unwrap();
        assert!(raw.starts_with("GET /?name=Zepp+X&admin_area=Tokyo"));
    }

    #[tokio::test]
    async fn null_place_and_404_are_not_found() {
        let (url, _r) = serve_once(200, r#"{"place":null}"#).await;
        assert_eq!(searcher(Some(url)).search_place(&Ctx::background(), "Nowhere", None).await.unwrap(), None);

        let (url, _r) = serve_once(404, "{}").await;
        assert_eq!(searcher(Some(url)).search_place(&Ctx::background(), "Nowhere", None).await.unwrap(), None);
    }

    #[tokio::test]
    async fn server_error_is_a_place_search_error() {
        let (url, _r) = serve_once(503, "{}").await;

        let err = searcher(Some(url))
            .search_place(&Ctx::background(), "Zepp X", None)
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::PlaceSearch { ref source_name, .. } if source_name == "maps"));
    }

    #[test]
    fn missing_endpoint_means_unconfigured() {
        assert!(!searcher(None).is_configured());
        assert!(searcher(Some("http://127.0.0.1:1".to_string())).is_configured());
    }
}
