//! Session cache wiring
//!
//! Each context gets an in-memory session store sized from [`CacheOptions`].
//! When an external cache provider is attached, the store is tiered: writes
//! go to both layers and misses fall through to the external cache, with
//! keys namespaced by the listener address and the certificate's primary
//! identity so VIPs sharing a backing store do not collide.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rustls::server::{ServerSessionMemoryCache, StoresServerSessions};
use tracing::debug;

/// Session cache sizing and lifetime parameters for one listener
#[derive(Debug, Clone)]
pub struct CacheOptions {
    /// How long cached sessions and minted tickets stay valid
    pub session_timeout: Duration,
    /// Capacity of the per-context in-memory store
    pub max_sessions: usize,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            session_timeout: Duration::from_secs(3600),
            max_sessions: 10_240,
        }
    }
}

impl CacheOptions {
    /// Ticket lifetime hint handed to the ticket manager, in seconds
    pub fn ticket_lifetime(&self) -> u32 {
        self.session_timeout.as_secs().min(u64::from(u32::MAX)) as u32
    }
}

/// External session cache shared across processes or hosts.
///
/// Implementations are external collaborators; the core only namespaces
/// keys and routes reads and writes.
pub trait SessionCacheProvider: fmt::Debug + Send + Sync {
    fn store(&self, key: &[u8], value: &[u8]);
    fn lookup(&self, key: &[u8]) -> Option<Vec<u8>>;
    fn remove(&self, key: &[u8]) -> Option<Vec<u8>>;
}

/// Build the session store for one context
pub(crate) fn build_session_storage(
    options: &CacheOptions,
    vip: SocketAddr,
    external: Option<Arc<dyn SessionCacheProvider>>,
    primary_cn: &str,
) -> Arc<dyn StoresServerSessions> {
    let local = ServerSessionMemoryCache::new(options.max_sessions);
    match external {
        None => local,
        Some(external) => {
            debug!(%vip, cn = primary_cn, "attaching external session cache");
            Arc::new(TieredSessionStore {
                local,
                external,
                namespace: format!("{vip}|{primary_cn}|").into_bytes(),
            })
        }
    }
}

#[derive(Debug)]
struct TieredSessionStore {
    local: Arc<dyn StoresServerSessions>,
    external: Arc<dyn SessionCacheProvider>,
    namespace: Vec<u8>,
}

impl TieredSessionStore {
    fn external_key(&self, key: &[u8]) -> Vec<u8> {
        let mut namespaced = Vec::with_capacity(self.namespace.len() + key.len());
        namespaced.extend_from_slice(&self.namespace);
        namespaced.extend_from_slice(key);
        namespaced
    }
}

impl StoresServerSessions for TieredSessionStore {
    fn put(&self, key: Vec<u8>, value: Vec<u8>) -> bool {
        self.external.store(&self.external_key(&key), &value);
        self.local.put(key, value)
    }

    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.local
            .get(key)
            .or_else(|| self.external.lookup(&self.external_key(key)))
    }

    fn take(&self, key: &[u8]) -> Option<Vec<u8>> {
        let external = self.external.remove(&self.external_key(key));
        self.local.take(key).or(external)
    }

    fn can_cache(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    struct MapCache {
        entries: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
    }

    impl SessionCacheProvider for MapCache {
        fn store(&self, key: &[u8], value: &[u8]) {
            self.entries
                .lock()
                .unwrap()
                .insert(key.to_vec(), value.to_vec());
        }

        fn lookup(&self, key: &[u8]) -> Option<Vec<u8>> {
            self.entries.lock().unwrap().get(key).cloned()
        }

        fn remove(&self, key: &[u8]) -> Option<Vec<u8>> {
            self.entries.lock().unwrap().remove(key)
        }
    }

    fn vip() -> SocketAddr {
        "203.0.113.9:443".parse().unwrap()
    }

    #[test]
    fn test_local_only_store() {
        let storage = build_session_storage(&CacheOptions::default(), vip(), None, "a.example");
        assert!(storage.put(b"sid".to_vec(), b"state".to_vec()));
        assert_eq!(storage.get(b"sid").unwrap(), b"state");
    }

    #[test]
    fn test_tiered_store_writes_both_layers() {
        let external = Arc::new(MapCache::default());
        let storage = build_session_storage(
            &CacheOptions::default(),
            vip(),
            Some(external.clone()),
            "a.example",
        );

        storage.put(b"sid".to_vec(), b"state".to_vec());
        assert_eq!(storage.get(b"sid").unwrap(), b"state");

        let entries = external.entries.lock().unwrap();
        let key = entries.keys().next().unwrap();
        assert!(key.starts_with(b"203.0.113.9:443|a.example|"));
    }

    #[test]
    fn test_tiered_store_falls_through_on_local_miss() {
        let external = Arc::new(MapCache::default());
        external.store(b"203.0.113.9:443|a.example|sid", b"remote-state");

        let storage = build_session_storage(
            &CacheOptions::default(),
            vip(),
            Some(external),
            "a.example",
        );
        assert_eq!(storage.get(b"sid").unwrap(), b"remote-state");
    }

    #[test]
    fn test_namespaces_differ_per_identity() {
        let external = Arc::new(MapCache::default());
        let a = build_session_storage(
            &CacheOptions::default(),
            vip(),
            Some(external.clone()),
            "a.example",
        );
        let b = build_session_storage(
            &CacheOptions::default(),
            vip(),
            Some(external.clone()),
            "b.example",
        );

        a.put(b"sid".to_vec(), b"state-a".to_vec());
        b.put(b"sid".to_vec(), b"state-b".to_vec());
        assert_eq!(external.entries.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_take_removes_from_both_layers() {
        let external = Arc::new(MapCache::default());
        let storage = build_session_storage(
            &CacheOptions::default(),
            vip(),
            Some(external.clone()),
            "a.example",
        );

        storage.put(b"sid".to_vec(), b"state".to_vec());
        assert_eq!(storage.take(b"sid").unwrap(), b"state");
        assert!(storage.get(b"sid").is_none());
        assert!(external.entries.lock().unwrap().is_empty());
    }
}
