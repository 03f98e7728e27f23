//! Defaults shared by config, CLI and tests

// Event naming
pub const DEFAULT_NAMESPACE: &str = "concerts";
pub const DEFAULT_SOURCE: &str = "concert-pipeline";

// Router
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_INITIAL_BACKOFF_MS: u64 = 500;
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;
pub const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 10;
pub const DEFAULT_MAX_IN_FLIGHT: usize = 16;

// Consumer groups, one per handler
pub const CREATE_CONCERTS_GROUP: &str = "create-concerts";
pub const NOTIFY_FOLLOWERS_GROUP: &str = "notify-followers";
pub const ENRICH_VENUE_GROUP: &str = "enrich-venue";
pub const DEAD_LETTER_REPLAY_GROUP: &str = "dead-letter-replay";

// Discovery
pub const DEFAULT_BREAKER_THRESHOLD: u32 = 3;

// Enrichment sweep. A venue whose reactive event was lost stays Pending for at
// most one interval.
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 6 * 60 * 60;

// Transport
pub const DEFAULT_DATA_ROOT: &str = "data";
pub const DEFAULT_ACK_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 250;
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;
/// Envelopes per topic the in-memory transport keeps for late consumer groups
pub const DEFAULT_MEMORY_HISTORY_LIMIT: usize = 1024;

// Config file lookup
pub const CONFIG_ENV_VAR: &str = "CONCERT_PIPELINE_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "config.toml";
