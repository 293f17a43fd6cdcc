use std::sync::{Arc, Mutex};

use parley_shared::constants::APP_NAME;
use parley_store::Database;

use crate::config::ServerConfig;
use crate::cors::CorsCache;
use crate::error::ServerError;
use crate::events::EventBus;
use crate::federation::keys::KeyAuthority;
use crate::federation::registry::InstanceTrustRegistry;
use crate::federation::relay::RelayDispatcher;
use crate::federation::resolver::IdentityResolver;
use crate::federation::tokens::TokenAuthority;
use crate::file_store::FileStorage;
use crate::ssrf::SsrfGuard;

/// Shared handle to the instance database.
///
/// The connection is synchronous; callers pass a closure and the lock is
/// released when it returns, so it is never held across an `.await`.
#[derive(Clone)]
pub struct Store(Arc<Mutex<Database>>);

impl Store {
    pub fn new(db: Database) -> Self {
        Self(Arc::new(Mutex::new(db)))
    }

    pub fn with<T, F>(&self, f: F) -> Result<T, ServerError>
    where
        F: FnOnce(&Database) -> parley_store::Result<T>,
    {
        let db = self
            .0
            .lock()
            .map_err(|_| ServerError::Internal("database lock poisoned".to_string()))?;
        f(&db).map_err(ServerError::from)
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub store: Store,
    pub files: Arc<dyn FileStorage>,
    pub events: EventBus,
    pub cors: CorsCache,
    pub keys: Arc<KeyAuthority>,
    pub tokens: Arc<TokenAuthority>,
    pub relay: Arc<RelayDispatcher>,
    pub registry: Arc<InstanceTrustRegistry>,
    pub resolver: Arc<IdentityResolver>,
}

impl AppState {
    /// Wire every federation component around one database and file store.
    pub fn new(
        config: ServerConfig,
        db: Database,
        files: Arc<dyn FileStorage>,
    ) -> Result<Self, ServerError> {
        let config = Arc::new(config);
        let store = Store::new(db);
        let http = build_http_client(&config)?;
        let events = EventBus::new();
        let cors = CorsCache::new(store.clone());

        let keys = Arc::new(KeyAuthority::new(store.clone(), &config.domain));
        let relay = Arc::new(RelayDispatcher::new(keys.clone(), http.clone(), &config));
        let registry = Arc::new(InstanceTrustRegistry::new(
            store.clone(),
            keys.clone(),
            relay.clone(),
            events.clone(),
            cors.clone(),
        ));
        let tokens = Arc::new(TokenAuthority::new(
            store.clone(),
            keys.clone(),
            registry.clone(),
        ));
        let resolver = Arc::new(IdentityResolver::new(
            store.clone(),
            relay.clone(),
            files.clone(),
            SsrfGuard::new(config.allow_private_fetch),
            http,
            config.profile_sync_debounce,
        ));

        Ok(Self {
            config,
            store,
            files,
            events,
            cors,
            keys,
            tokens,
            relay,
            registry,
            resolver,
        })
    }
}

/// Outbound HTTP client; every call to a peer is bounded by these timeouts.
pub fn build_http_client(config: &ServerConfig) -> Result<reqwest::Client, ServerError> {
    reqwest::Client::builder()
        .timeout(config.http_timeout)
        .connect_timeout(config.http_connect_timeout)
        .user_agent(format!("{APP_NAME}/{}", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| ServerError::Internal(format!("build http client: {e}")))
}
