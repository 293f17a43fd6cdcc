//! CORS allow-list derived from the active peer instances.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use axum::http::{header, HeaderValue, Method};
use parley_shared::types::InstanceStatus;
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::state::Store;

/// Lazily loaded set of active federated domains. Cleared on every trust
/// change and reloaded on the next CORS check.
#[derive(Clone)]
pub struct CorsCache {
    store: Store,
    domains: Arc<RwLock<Option<Arc<HashSet<String>>>>>,
}

impl CorsCache {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            domains: Arc::new(RwLock::new(None)),
        }
    }

    pub fn invalidate(&self) {
        if let Ok(mut guard) = self.domains.write() {
            *guard = None;
        }
        tracing::debug!("cors allow-list invalidated");
    }

    /// Whether an `Origin` header value belongs to an active instance.
    pub fn is_allowed(&self, origin: &str) -> bool {
        let Some(host) = origin
            .strip_prefix("https://")
            .or_else(|| origin.strip_prefix("http://"))
        else {
            return false;
        };
        self.domains().contains(host.trim_end_matches('/'))
    }

    fn domains(&self) -> Arc<HashSet<String>> {
        if let Ok(guard) = self.domains.read() {
            if let Some(domains) = guard.as_ref() {
                return domains.clone();
            }
        }

        let loaded = match self
            .store
            .with(|db| db.list_domains_with_status(InstanceStatus::Active))
        {
            Ok(list) => Arc::new(list.into_iter().collect::<HashSet<_>>()),
            Err(e) => {
                // Not cached, so the next request retries.
                tracing::warn!(error = %e, "failed to load cors allow-list");
                return Arc::new(HashSet::new());
            }
        };

        if let Ok(mut guard) = self.domains.write() {
            *guard = Some(loaded.clone());
        }
        loaded
    }

    pub fn layer(&self) -> CorsLayer {
        let cache = self.clone();
        CorsLayer::new()
            .allow_origin(AllowOrigin::predicate(
                move |origin: &HeaderValue, _parts| {
                    origin.to_str().map(|o| cache.is_allowed(o)).unwrap_or(false)
                },
            ))
            .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
            .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_shared::types::TrustState;
    use parley_store::Database;

    #[test]
    fn test_allow_list_follows_invalidation() {
        let store = Store::new(Database::open_in_memory().unwrap());
        let cache = CorsCache::new(store.clone());

        assert!(!cache.is_allowed("https://b.example"));

        store
            .with(|db| db.insert_instance("b.example", None, None, TrustState::ACTIVE_MUTUAL, None))
            .unwrap();
        // still cached
        assert!(!cache.is_allowed("https://b.example"));

        cache.invalidate();
        assert!(cache.is_allowed("https://b.example"));
        assert!(cache.is_allowed("http://b.example/"));
        assert!(!cache.is_allowed("https://c.example"));
        assert!(!cache.is_allowed("b.example"));
    }
}
