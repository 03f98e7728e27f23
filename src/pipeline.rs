//! Wiring: builds the transport, store, collaborators and router from config.

use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::concert_creation::ConcertCreator;
use crate::config::{BackendKind, Config};
use crate::constants::*;
use crate::discovery::{ConcertSearcher, DiscoveryOrchestrator};
use crate::enrichment::{PlaceSearchChain, PlaceSearcher, VenueEnricher};
use crate::envelope::EventKind;
use crate::error::Result;
use crate::infra::{HttpConcertSearcher, HttpPlaceSearcher, LogNotifier, WebhookNotifier};
use crate::notification::{NotificationFanout, Notifier};
use crate::router::Router;
use crate::shutdown::{release_fn, Phase, ShutdownPlan};
use crate::storage::{InMemoryStorage, SqliteStorage, Storage};
use crate::transport::{EventPublisher, InMemoryTransport, SqliteTransport, Transport};

/// Handler names as they appear in logs and metrics.
pub const CREATE_CONCERTS_HANDLER: &str = "create_concerts";
pub const NOTIFY_FOLLOWERS_HANDLER: &str = "notify_followers";
pub const ENRICH_VENUE_HANDLER: &str = "enrich_venue";

pub struct Pipeline {
    config: Config,
    transport: Arc<dyn Transport>,
    storage: Arc<dyn Storage>,
    sqlite_store: Option<Arc<SqliteStorage>>,
}

impl Pipeline {
    /// Open the configured backends. SQLite files live under `transport.data_root`.
    pub fn open(config: Config) -> Result<Self> {
        let data_root = config.transport.data_root.clone();

        let transport: Arc<dyn Transport> = match config.transport.kind {
            BackendKind::Sqlite => Arc::new(SqliteTransport::open_at_root(&data_root, config.sqlite_transport_config())?),
            BackendKind::Memory => Arc::new(InMemoryTransport::with_history_limit(
                config.transport.channel_capacity,
                config.transport.memory_history_limit,
            )),
        };

        let (storage, sqlite_store) = match config.storage.kind {
            BackendKind::Sqlite => {
                let store = Arc::new(SqliteStorage::open_at_root(&data_root)?);
                (store.clone() as Arc<dyn Storage>, Some(store))
            }
            BackendKind::Memory => (Arc::new(InMemoryStorage::new()) as Arc<dyn Storage>, None),
        };

        info!(
            transport = ?config.transport.kind,
            storage = ?config.storage.kind,
            data_root = %data_root.display(),
            namespace = %config.events.namespace,
            "Pipeline backends opened"
        );
        Ok(Self {
            config,
            transport,
            storage,
            sqlite_store,
        })
    }

    /// Use already-built backends, e.g. shared in-memory ones.
    pub fn with_backends(config: Config, transport: Arc<dyn Transport>, storage: Arc<dyn Storage>) -> Self {
        Self {
            config,
            transport,
            storage,
            sqlite_store: None,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::clone(&self.transport)
    }

    pub fn storage(&self) -> Arc<dyn Storage> {
        Arc::clone(&self.storage)
    }

    pub fn publisher(&self) -> EventPublisher {
        EventPublisher::new(self.transport(), self.config.envelope_factory())
    }

    /// Place searchers in configured order; ones without an endpoint drop out.
    pub fn place_chain(&self) -> Result<PlaceSearchChain> {
        let timeout = Duration::from_secs(self.config.enrichment.timeout_secs);
        let mut searchers: Vec<Arc<dyn PlaceSearcher>> = Vec::new();
        for entry in &self.config.enrichment.place_searchers {
            searchers.push(Arc::new(HttpPlaceSearcher::from_config(entry, timeout)?));
        }
        let chain = PlaceSearchChain::new(searchers);
        info!(
            members = ?chain.member_names(),
            identity = chain.identity_source().unwrap_or("none"),
            "Place search chain ready"
        );
        Ok(chain)
    }

    pub fn notifier(&self) -> Result<Arc<dyn Notifier>> {
        Ok(match WebhookNotifier::from_config(&self.config.notify)? {
            Some(webhook) => Arc::new(webhook),
            None => {
                info!("No notification webhook configured; notifications are logged only");
                Arc::new(LogNotifier)
            }
        })
    }

    pub fn concert_searcher(&self) -> Result<Arc<dyn ConcertSearcher>> {
        Ok(Arc::new(HttpConcertSearcher::from_config(&self.config.search)?))
    }

    pub fn enricher(&self, chain: PlaceSearchChain) -> VenueEnricher {
        VenueEnricher::new(self.storage(), chain)
    }

    pub fn discovery(&self, searcher: Arc<dyn ConcertSearcher>) -> DiscoveryOrchestrator {
        DiscoveryOrchestrator::new(self.storage(), searcher, self.publisher())
            .with_breaker_threshold(self.config.discovery.breaker_threshold)
    }

    /// Router with the three reactive handlers, each on its own consumer group.
    pub fn build_router(&self, notifier: Arc<dyn Notifier>, chain: PlaceSearchChain) -> Router {
        let factory = self.config.envelope_factory();
        let mut router = Router::new(self.transport(), self.config.router_config());
        router
            .add_handler(
                CREATE_CONCERTS_HANDLER,
                EventKind::ConcertDiscovered,
                &factory.topic(EventKind::ConcertDiscovered),
                CREATE_CONCERTS_GROUP,
                Arc::new(ConcertCreator::new(self.storage(), self.publisher())),
            )
            .add_handler(
                NOTIFY_FOLLOWERS_HANDLER,
                EventKind::ConcertCreated,
                &factory.topic(EventKind::ConcertCreated),
                NOTIFY_FOLLOWERS_GROUP,
                Arc::new(NotificationFanout::new(self.storage(), notifier)),
            )
            .add_handler(
                ENRICH_VENUE_HANDLER,
                EventKind::VenueCreated,
                &factory.topic(EventKind::VenueCreated),
                ENRICH_VENUE_GROUP,
                Arc::new(self.enricher(chain)),
            );
        router
    }

    /// Router built from the configured collaborators.
    pub fn router(&self) -> Result<Router> {
        Ok(self.build_router(self.notifier()?, self.place_chain()?))
    }

    /// Registers the backends' teardown: the broker closes in Flush and the
    /// store is checkpointed in Datastore. Callers add their own Drain work.
    pub fn register_shutdown(&self, plan: &mut ShutdownPlan) {
        let transport = self.transport();
        plan.register(
            Phase::Flush,
            release_fn("transport", move || {
                let transport = Arc::clone(&transport);
                async move { transport.close().await }
            }),
        );
        if let Some(store) = &self.sqlite_store {
            let store = Arc::clone(store);
            plan.register(
                Phase::Datastore,
                release_fn("sqlite-store", move || {
                    let store = Arc::clone(&store);
                    async move { store.database().checkpoint().await }
                }),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PlaceSearcherConfig;
    use tempfile::tempdir;

    #[test]
    fn router_registers_the_three_handlers() {
        let mut config = Config::default();
        config.transport.kind = BackendKind::Memory;
        config.storage.kind = BackendKind::Memory;
        let pipeline = Pipeline::open(config).unwrap();

        let router = pipeline.router().unwrap();

        assert_eq!(
            router.handler_names(),
            vec![CREATE_CONCERTS_HANDLER, NOTIFY_FOLLOWERS_HANDLER, ENRICH_VENUE_HANDLER]
        );
        assert_eq!(router.config().poison_topic, "concerts.poison");
    }

    #[test]
    fn place_chain_skips_searchers_without_endpoint() {
        let mut config = Config::default();
        config.transport.kind = BackendKind::Memory;
        config.storage.kind = BackendKind::Memory;
        config.enrichment.place_searchers = vec![
            PlaceSearcherConfig {
                name: "maps".to_string(),
                endpoint: None,
                api_key_env: None,
            },
            PlaceSearcherConfig {
                name: "directory".to_string(),
                endpoint: Some("http://127.0.0.1:9/places".to_string()),
                api_key_env: None,
            },
        ];
        let pipeline = Pipeline::open(config).unwrap();

        let chain = pipeline.place_chain().unwrap();

        assert_eq!(chain.member_names(), vec!["directory"]);
        assert_eq!(chain.identity_source(), Some("directory"));
    }

    #[test]
    fn sqlite_backends_open_under_data_root() {
        let dir = tempdir().unwrap();
        let mut config = Config::default();
        config.transport.data_root = dir.path().to_path_buf();

        let pipeline = Pipeline::open(config).unwrap();

        assert!(pipeline.sqlite_store.is_some());
        assert!(dir.path().join("store").join("pipeline.db").exists());
    }

    #[test]
    fn discovery_requires_a_search_endpoint() {
        let mut config = Config::default();
        config.transport.kind = BackendKind::Memory;
        config.storage.kind = BackendKind::Memory;
        let pipeline = Pipeline::open(config).unwrap();

        assert!(pipeline.concert_searcher().is_err());
    }
}
