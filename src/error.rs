use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML deserialization failed: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {message}")]
    Store { message: String },

    #[error("Unique constraint violated: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Transport error: {message}")]
    Transport { message: String },

    #[error("Unexpected event type: expected {expected}, got {actual}")]
    UnexpectedEvent { expected: String, actual: String },

    #[error("Concert search failed for artist {artist}: {message}")]
    Search { artist: String, message: String },

    #[error("Place search via {source_name} failed: {message}")]
    PlaceSearch { source_name: String, message: String },

    #[error("Notification dispatch failed: {0}")]
    Notify(String),

    #[error("Handler panicked: {0}")]
    HandlerPanicked(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl PipelineError {
    pub fn store(message: impl Into<String>) -> Self {
        PipelineError::Store { message: message.into() }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        PipelineError::Transport { message: message.into() }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, PipelineError::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
