use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::constants::*;
use crate::envelope::{self, EnvelopeFactory};
use crate::error::{PipelineError, Result};
use crate::router::RouterConfig;
use crate::transport::sqlite::SqliteTransportConfig;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub events: EventsConfig,
    pub router: RouterSection,
    pub transport: TransportConfig,
    pub storage: StorageConfig,
    pub discovery: DiscoveryConfig,
    pub enrichment: EnrichmentConfig,
    pub search: SearchConfig,
    pub notify: NotifyConfig,
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    pub namespace: String,
    pub source: String,
    /// Overrides `<namespace>.poison`
    pub poison_topic: Option<String>,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            source: DEFAULT_SOURCE.to_string(),
            poison_topic: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RouterSection {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub shutdown_grace_secs: u64,
    pub max_in_flight: usize,
}

impl Default for RouterSection {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff_ms: DEFAULT_INITIAL_BACKOFF_MS,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            shutdown_grace_secs: DEFAULT_SHUTDOWN_GRACE_SECS,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub kind: BackendKind,
    /// Root for the broker file and the SQLite store
    pub data_root: PathBuf,
    pub ack_timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub channel_capacity: usize,
    /// In-memory transport only: envelopes per topic replayed to a new group
    pub memory_history_limit: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::Sqlite,
            data_root: PathBuf::from(DEFAULT_DATA_ROOT),
            ack_timeout_secs: DEFAULT_ACK_TIMEOUT_SECS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            memory_history_limit: DEFAULT_MEMORY_HISTORY_LIMIT,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub kind: BackendKind,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::Sqlite,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub breaker_threshold: u32,
    /// Search from today plus this many days
    pub from_offset_days: i64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            breaker_threshold: DEFAULT_BREAKER_THRESHOLD,
            from_offset_days: 0,
        }
    }
}

/// One place-search collaborator. Order in the file is chain order; the first
/// entry with an endpoint is the identity source.
#[derive(Debug, Clone, Deserialize)]
pub struct PlaceSearcherConfig {
    pub name: String,
    pub endpoint: Option<String>,
    /// Name of the environment variable holding the API key
    pub api_key_env: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EnrichmentConfig {
    pub place_searchers: Vec<PlaceSearcherConfig>,
    pub retry_failed: bool,
    pub sweep_interval_secs: u64,
    pub timeout_secs: u64,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            place_searchers: Vec::new(),
            retry_failed: true,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub endpoint: Option<String>,
    pub api_key_env: Option<String>,
    pub timeout_secs: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key_env: None,
            timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    /// Without a webhook, notifications are only logged
    pub webhook_url: Option<String>,
    pub timeout_secs: u64,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub listen: Option<String>,
}

impl Config {
    /// Load from `CONCERT_PIPELINE_CONFIG`, falling back to `config.toml`.
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_ENV_VAR).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(Path::new(&path))
    }

    /// A missing file yields the defaults; an unreadable or invalid one is an error.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!("No config file at {}; using defaults", path.display());
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)
            .map_err(|e| PipelineError::Config(format!("Failed to read config file '{}': {}", path.display(), e)))?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.events.namespace.trim().is_empty() {
            return Err(PipelineError::Config("events.namespace must not be empty".to_string()));
        }
        if self.router.backoff_multiplier < 1.0 {
            return Err(PipelineError::Config("router.backoff_multiplier must be at least 1.0".to_string()));
        }
        self.metrics_addr()?;
        Ok(())
    }

    pub fn envelope_factory(&self) -> EnvelopeFactory {
        EnvelopeFactory::new(self.events.namespace.clone(), self.events.source.clone())
    }

    pub fn poison_topic(&self) -> String {
        self.events
            .poison_topic
            .clone()
            .unwrap_or_else(|| envelope::poison_topic(&self.events.namespace))
    }

    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            max_attempts: self.router.max_attempts,
            initial_backoff: Duration::from_millis(self.router.initial_backoff_ms),
            backoff_multiplier: self.router.backoff_multiplier,
            poison_topic: self.poison_topic(),
            shutdown_grace: Duration::from_secs(self.router.shutdown_grace_secs),
            max_in_flight: self.router.max_in_flight,
        }
    }

    pub fn sqlite_transport_config(&self) -> SqliteTransportConfig {
        SqliteTransportConfig {
            ack_timeout: Duration::from_secs(self.transport.ack_timeout_secs),
            poll_interval: Duration::from_millis(self.transport.poll_interval_ms),
            channel_capacity: self.transport.channel_capacity,
        }
    }

    pub fn metrics_addr(&self) -> Result<Option<SocketAddr>> {
        self.metrics
            .listen
            .as_deref()
            .map(|addr| {
                addr.parse()
                    .map_err(|e| PipelineError::Config(format!("invalid metrics.listen '{addr}': {e}")))
            })
            .transpose()
    }
}
