use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{error, info};
use wbcache_core::{CacheEntity, CacheKey};

use crate::storage::impls::DelayedCacheSource;

// ---------------------------------------------------------------------------
// ManagedCache trait
// ---------------------------------------------------------------------------

/// Lifecycle of one write-behind cache, independent of its key and value types.
///
/// Caches are registered with a `CacheService`, started in registration
/// order, and stopped and drained in reverse registration order.
#[async_trait]
pub trait ManagedCache: Send + Sync {
    /// Entity name of the cache, used in logs.
    fn name(&self) -> &str;

    /// Start the background scheduler.
    fn start(&self);

    /// Stop the background scheduler.
    async fn stop(&self);

    /// Flush everything and return the primary keys (as strings) that
    /// could not be persisted.
    async fn drain(&self, current_time: i64) -> Vec<String>;

    /// Number of primary keys with buffered commands.
    fn pending_count(&self) -> usize;
}

#[async_trait]
impl<PK: CacheKey, V: CacheEntity> ManagedCache for DelayedCacheSource<PK, V> {
    fn name(&self) -> &str {
        DelayedCacheSource::name(self)
    }

    fn start(&self) {
        DelayedCacheSource::start(self);
    }

    async fn stop(&self) {
        DelayedCacheSource::stop(self).await;
    }

    async fn drain(&self, current_time: i64) -> Vec<String> {
        let key_builder = self.source().key_builder();
        self.flush_all(current_time)
            .await
            .iter()
            .map(|primary_key| key_builder.primary_key_string(primary_key))
            .collect()
    }

    fn pending_count(&self) -> usize {
        DelayedCacheSource::pending_count(self)
    }
}

// ---------------------------------------------------------------------------
// CacheService
// ---------------------------------------------------------------------------

/// Keys left buffered by a shutdown drain, per cache.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    /// (cache name, unpersisted primary keys) for every cache that lost data.
    pub lost: Vec<(String, Vec<String>)>,
}

impl ShutdownReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.lost.is_empty()
    }

    /// Total primary keys whose commands were lost.
    #[must_use]
    pub fn lost_keys(&self) -> usize {
        self.lost.iter().map(|(_, keys)| keys.len()).sum()
    }
}

/// Registry for lifecycle-managed caches.
///
/// Owns nothing but handles: callers keep their typed `Arc` to each cache
/// and register a clone here so shutdown can reach every cache.
pub struct CacheService {
    /// Registration order for deterministic start/shutdown sequencing.
    caches: RwLock<Vec<Arc<dyn ManagedCache>>>,
}

impl CacheService {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            caches: RwLock::new(Vec::new()),
        }
    }

    /// Register a cache. Registration order determines start/shutdown sequencing.
    pub fn register(&self, cache: Arc<dyn ManagedCache>) {
        self.caches.write().push(cache);
    }

    /// Retrieve the first cache registered under `name`.
    pub fn get_by_name(&self, name: &str) -> Option<Arc<dyn ManagedCache>> {
        self.caches
            .read()
            .iter()
            .find(|cache| cache.name() == name)
            .cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.caches.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.caches.read().is_empty()
    }

    /// Buffered primary keys across every cache.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.caches.read().iter().map(|cache| cache.pending_count()).sum()
    }

    /// Start every registered cache's scheduler in registration order.
    pub fn start_all(&self) {
        for cache in self.caches.read().iter() {
            cache.start();
        }
        info!(caches = self.len(), "cache schedulers started");
    }

    /// Stop and drain every cache in reverse registration order.
    ///
    /// Every cache is drained even if earlier ones lost data.
    pub async fn shutdown(&self, current_time: i64) -> ShutdownReport {
        let order = self.caches.read().clone();
        let mut report = ShutdownReport::default();
        for cache in order.iter().rev() {
            cache.stop().await;
            let lost = cache.drain(current_time).await;
            if !lost.is_empty() {
                error!(cache = cache.name(), keys = lost.len(), "cache drained with data loss");
                report.lost.push((cache.name().to_string(), lost));
            }
        }
        info!(lost_keys = report.lost_keys(), "cache service shut down");
        report
    }
}

impl Default for CacheService {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::service::config::CacheConfig;
    use crate::test_support::{durable_source, fast_config, Item, ScriptedDurableStore};

    /// Test cache that records lifecycle calls in a shared log.
    struct TestCache {
        cache_name: &'static str,
        starts: AtomicU32,
        lost: Vec<String>,
        order_log: Arc<parking_lot::Mutex<Vec<String>>>,
    }

    impl TestCache {
        fn new(name: &'static str, order_log: Arc<parking_lot::Mutex<Vec<String>>>) -> Self {
            Self {
                cache_name: name,
                starts: AtomicU32::new(0),
                lost: Vec::new(),
                order_log,
            }
        }
    }

    #[async_trait]
    impl ManagedCache for TestCache {
        fn name(&self) -> &str {
            self.cache_name
        }

        fn start(&self) {
            self.starts.fetch_add(1, Ordering::SeqCst);
            self.order_log.lock().push(format!("start:{}", self.cache_name));
        }

        async fn stop(&self) {
            self.order_log.lock().push(format!("stop:{}", self.cache_name));
        }

        async fn drain(&self, _current_time: i64) -> Vec<String> {
            self.order_log.lock().push(format!("drain:{}", self.cache_name));
            self.lost.clone()
        }

        fn pending_count(&self) -> usize {
            self.lost.len()
        }
    }

    #[tokio::test]
    async fn starts_in_order_and_shuts_down_in_reverse() {
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let service = CacheService::new();
        service.register(Arc::new(TestCache::new("first", log.clone())));
        service.register(Arc::new(TestCache::new("second", log.clone())));

        service.start_all();
        let report = service.shutdown(0).await;

        assert!(report.is_clean());
        assert_eq!(
            log.lock().clone(),
            vec![
                "start:first",
                "start:second",
                "stop:second",
                "drain:second",
                "stop:first",
                "drain:first",
            ]
        );
    }

    #[tokio::test]
    async fn report_collects_lost_keys_from_every_cache() {
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut lossy = TestCache::new("lossy", log.clone());
        lossy.lost = vec!["1".to_string(), "2".to_string()];
        let service = CacheService::new();
        service.register(Arc::new(lossy));
        service.register(Arc::new(TestCache::new("clean", log)));

        assert_eq!(service.pending_count(), 2);
        let report = service.shutdown(0).await;
        assert_eq!(report.lost_keys(), 2);
        assert_eq!(report.lost[0].0, "lossy");
    }

    #[test]
    fn get_by_name_finds_registered_cache() {
        let service = CacheService::new();
        assert!(service.is_empty());
        service.register(Arc::new(TestCache::new(
            "inventory",
            Arc::new(parking_lot::Mutex::new(Vec::new())),
        )));
        assert_eq!(service.get_by_name("inventory").unwrap().name(), "inventory");
        assert!(service.get_by_name("mail").is_none());
        assert_eq!(service.len(), 1);
    }

    #[tokio::test]
    async fn delayed_cache_drains_through_service() {
        let root = tempfile::tempdir().unwrap();
        let mut config: CacheConfig = fast_config();
        config.flush.log_path = root.path().join("flush");
        config.flush.delay_millis = 60_000;
        let store = ScriptedDurableStore::new();
        let cache = Arc::new(DelayedCacheSource::new(
            durable_source(store.clone(), &config),
            Arc::new(config),
        ));
        cache.replace_one(&42, &Item::new(1, 1));

        let service = CacheService::new();
        service.register(cache.clone());
        service.start_all();
        assert!(cache.is_running());

        let report = service.shutdown(5).await;
        assert!(report.is_clean());
        assert!(!cache.is_running());
        assert_eq!(cache.pending_count(), 0);
        assert_eq!(store.inner.count("Inventory"), 1);
    }
}
