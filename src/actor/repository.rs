//! Cache-aside actor lookup

use super::{actor_from_node_row, actor_from_token_row, Actor};
use crate::config::CacheConfig;
use crate::error::Result;
use crate::store::AuthStore;
use moka::sync::Cache;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// Cache consulted before the store
///
/// Implementations must tolerate concurrent use from many request threads.
pub trait ActorCache: Send + Sync {
    fn get(&self, key: &str) -> Option<Arc<Actor>>;

    fn put(&self, key: String, actor: Arc<Actor>);
}

/// [`ActorCache`] backed by a TTL and capacity bounded moka cache
pub struct MokaActorCache {
    cache: Cache<String, Arc<Actor>>,
}

impl MokaActorCache {
    pub fn new(config: &CacheConfig) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.max_capacity)
            .time_to_live(Duration::from_secs(config.ttl_secs))
            .build();
        Self { cache }
    }

    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }
}

impl ActorCache for MokaActorCache {
    fn get(&self, key: &str) -> Option<Arc<Actor>> {
        self.cache.get(key)
    }

    fn put(&self, key: String, actor: Arc<Actor>) {
        self.cache.insert(key, actor);
    }
}

/// Resolves actors by token id or node id
///
/// Nothing is invalidated here: a revoked token stays usable until the cache
/// evicts it. Policy expiry is checked by callers on every decision, so a
/// cached actor with an expired policy is returned and then denied.
pub struct ActorRepository {
    store: Arc<dyn AuthStore>,
    cache: Option<Arc<dyn ActorCache>>,
}

impl ActorRepository {
    pub fn new(store: Arc<dyn AuthStore>, cache: Option<Arc<dyn ActorCache>>) -> Self {
        Self { store, cache }
    }

    /// Build the repository, with a moka cache if caching is enabled
    pub fn with_config(store: Arc<dyn AuthStore>, config: &CacheConfig) -> Self {
        let cache: Option<Arc<dyn ActorCache>> = if config.enabled {
            Some(Arc::new(MokaActorCache::new(config)))
        } else {
            None
        };
        Self::new(store, cache)
    }

    /// Look up the actor for a security token
    pub fn actor_by_token(&self, token_id: &str) -> Result<Option<Arc<Actor>>> {
        let key = format!("Token-{}", token_id);
        if let Some(actor) = self.cached(&key) {
            return Ok(Some(actor));
        }

        let Some(row) = self.store.actor_by_token(token_id)? else {
            debug!(token_id = %token_id, "No actor for token");
            return Ok(None);
        };
        let actor = Arc::new(actor_from_token_row(token_id, row)?);
        self.remember(key, &actor);
        Ok(Some(actor))
    }

    /// Look up the actor for a node
    pub fn actor_by_node(&self, node_id: i64) -> Result<Option<Arc<Actor>>> {
        let key = format!("Node-{}", node_id);
        if let Some(actor) = self.cached(&key) {
            return Ok(Some(actor));
        }

        let Some(row) = self.store.actor_by_node(node_id)? else {
            debug!(node_id, "No actor for node");
            return Ok(None);
        };
        let actor = Arc::new(actor_from_node_row(node_id, row));
        self.remember(key, &actor);
        Ok(Some(actor))
    }

    fn cached(&self, key: &str) -> Option<Arc<Actor>> {
        let actor = self.cache.as_ref()?.get(key)?;
        trace!(key = %key, "Actor cache hit");
        Some(actor)
    }

    fn remember(&self, key: String, actor: &Arc<Actor>) {
        if let Some(cache) = &self.cache {
            cache.put(key, Arc::clone(actor));
        }
    }
}
