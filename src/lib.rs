pub mod concert_creation;
pub mod config;
pub mod constants;
pub mod context;
pub mod db;
pub mod discovery;
pub mod domain;
pub mod enrichment;
pub mod envelope;
pub mod error;
pub mod job;
pub mod logging;
pub mod notification;
pub mod observability;
pub mod router;
pub mod shutdown;
pub mod storage;
pub mod transport;

// Wiring and the HTTP adapters behind the collaborator traits
pub mod infra;
pub mod pipeline;
