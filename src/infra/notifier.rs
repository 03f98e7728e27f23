use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use tracing::{info, instrument};

use super::http_client::build_client;
use crate::config::NotifyConfig;
use crate::context::Ctx;
use crate::domain::{Artist, Concert, FollowedArtist};
use crate::error::{PipelineError, Result};
use crate::notification::Notifier;

/// Writes one log line per follower. Used when no webhook is configured.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(
        &self,
        _ctx: &Ctx,
        artist: &Artist,
        concerts: &[Concert],
        followers: &[FollowedArtist],
    ) -> Result<()> {
        for follower in followers {
            info!(
                user_id = %follower.user_id,
                passion = follower.passion.as_str(),
                artist_name = %artist.name,
                concerts = concerts.len(),
                "New concerts for followed artist"
            );
        }
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    artist_id: &'a str,
    artist_name: &'a str,
    concerts: &'a [Concert],
    followers: &'a [FollowedArtist],
}

/// Posts each notification batch as JSON to a push gateway.
pub struct WebhookNotifier {
    client: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(client: Client, url: impl Into<String>) -> Self {
        Self { client, url: url.into() }
    }

    /// `None` when no webhook URL is configured.
    pub fn from_config(config: &NotifyConfig) -> Result<Option<Self>> {
        match &config.webhook_url {
            Some(url) => Ok(Some(Self::new(build_client(Duration::from_secs(config.timeout_secs))?, url))),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    #[instrument(skip_all, fields(artist_id = %artist.id, followers = followers.len()))]
    async fn notify(
        &self,
        ctx: &Ctx,
        artist: &Artist,
        concerts: &[Concert],
        followers: &[FollowedArtist],
    ) -> Result<()> {
        let payload = WebhookPayload {
            artist_id: &artist.id,
            artist_name: &artist.name,
            concerts,
            followers,
        };
        let request = self.client.post(&self.url).json(&payload);
        let response = ctx
            .run(async {
                request
                    .send()
                    .await
                    .map_err(|e| PipelineError::Notify(e.to_string()))
            })
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::Notify(format!("webhook returned {status}")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::PassionLevel;
    use crate::infra::http_client::test_server::serve_once;

    fn followers() -> Vec<FollowedArtist> {
        vec![FollowedArtist {
            user_id: "u1".to_string(),
            artist_id: "A".to_string(),
            passion: PassionLevel::KeepAnEye,
        }]
    }

    fn notifier(url: String) -> WebhookNotifier {
        WebhookNotifier::new(build_client(Duration::from_secs(5)).unwrap(), url)
    }

    #[tokio::test]
    async fn webhook_posts_artist_and_followers() {
        let (url, request) = serve_once(202, "{}").await;

        notifier(url)
            .notify(&Ctx::background(), &Artist::new("A", "Artist A"), &[], &followers())
            .await
            .unwrap();

        let raw = request.await.unwrap();
        assert!(raw.starts_with("POST "));
        assert!(raw.contains("\"artist_name\":\"Artist A\""));
        assert!(raw.contains("\"user_id\":\"u1\""));
    }

    #[tokio::test]
    async fn webhook_failure_is_a_notify_error() {
        let (url, _request) = serve_once(500, "{}").await;

        let err = notifier(url)
            .notify(&Ctx::background(), &Artist::new("A", "Artist A"), &[], &followers())
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::Notify(_)));
    }

    #[test]
    fn no_url_means_no_webhook() {
        assert!(WebhookNotifier::from_config(&NotifyConfig::default()).unwrap().is_none());
    }
}
