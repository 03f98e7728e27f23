use reqwest::{Client, RequestBuilder};
use std::time::Duration;
use tracing::warn;

use crate::error::Result;

/// Shared client for the JSON-over-HTTP collaborators.
pub fn build_client(timeout: Duration) -> Result<Client> {
    Ok(Client::builder()
        .timeout(timeout)
        .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
        .build()?)
}

/// API key read from the environment variable named in config, if any.
pub fn api_key_from_env(var: Option<&str>) -> Option<String> {
    let var = var?;
    match std::env::var(var) {
        Ok(key) if !key.trim().is_empty() => Some(key),
        _ => {
            warn!("API key variable {} is not set", var);
            None
        }
    }
}

pub fn with_bearer(request: RequestBuilder, api_key: Option<&str>) -> RequestBuilder {
    match api_key {
        Some(key) => request.bearer_auth(key),
        None => request,
    }
}
