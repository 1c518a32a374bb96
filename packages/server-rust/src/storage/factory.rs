//! Factory for creating fully-wired cache sources.
//!
//! [`SourceFactory`] is the dependency injection point that builds
//! [`FastStoreSource`], [`DurableStoreSource`] and [`DelayedCacheSource`]
//! instances for registered addresses, all sharing one set of drivers, one
//! [`SharedLoadCoordinator`] and one [`CacheConfig`].

use std::sync::Arc;

use wbcache_core::{AddressRegistry, CacheEntity, CacheKey, KeyValueBuilder, UniqueAddress};

use crate::error::CacheError;
use crate::service::config::CacheConfig;
use crate::storage::collection::CacheType;
use crate::storage::datastores::{DurableStoreSource, FastStoreSource, SharedLoadCoordinator};
use crate::storage::driver::{DurableStoreDriver, FastStoreDriver};
use crate::storage::impls::DelayedCacheSource;
use crate::storage::source::CacheSource;

/// Builds sources for the addresses of one [`AddressRegistry`].
pub struct SourceFactory {
    registry: Arc<AddressRegistry>,
    fast_store: Arc<dyn FastStoreDriver>,
    durable_store: Arc<dyn DurableStoreDriver>,
    coordinator: Arc<SharedLoadCoordinator>,
    config: Arc<CacheConfig>,
}

impl SourceFactory {
    #[must_use]
    pub fn new(
        registry: Arc<AddressRegistry>,
        fast_store: Arc<dyn FastStoreDriver>,
        durable_store: Arc<dyn DurableStoreDriver>,
        config: Arc<CacheConfig>,
    ) -> Self {
        Self {
            registry,
            fast_store,
            durable_store,
            coordinator: Arc::new(SharedLoadCoordinator::new()),
            config,
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<AddressRegistry> {
        &self.registry
    }

    /// Shared-load state of every fast-store source built here. Entries
    /// live until [`FastStoreSource::unload`] releases their primary key.
    #[must_use]
    pub fn coordinator(&self) -> &Arc<SharedLoadCoordinator> {
        &self.coordinator
    }

    #[must_use]
    pub fn config(&self) -> &Arc<CacheConfig> {
        &self.config
    }

    /// Looks up a registered address.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Config`] if nothing is registered under
    /// (`name`, `shared_id`).
    pub fn address(&self, name: &str, shared_id: u32) -> Result<Arc<UniqueAddress>, CacheError> {
        self.registry
            .get(name, shared_id)
            .ok_or_else(|| CacheError::Config(format!("no address registered for {name}.{shared_id}")))
    }

    fn key_builder<PK: CacheKey, V: CacheEntity>(
        address: &UniqueAddress,
    ) -> Result<KeyValueBuilder<PK, V::Key>, CacheError> {
        Ok(KeyValueBuilder::new(
            address.primary_key(),
            address.secondary_keys().to_vec(),
        )?)
    }

    /// # Errors
    ///
    /// Returns [`CacheError::Address`] if the key types do not fit the
    /// address's key fields.
    pub fn fast_source<PK: CacheKey, V: CacheEntity>(
        &self,
        address: &Arc<UniqueAddress>,
    ) -> Result<FastStoreSource<PK, V>, CacheError> {
        Ok(FastStoreSource::new(
            Arc::clone(address),
            &self.registry,
            Self::key_builder::<PK, V>(address)?,
            Arc::clone(&self.fast_store),
            Arc::clone(&self.coordinator),
        ))
    }

    /// # Errors
    ///
    /// Returns [`CacheError::Address`] if the key types do not fit the
    /// address's key fields.
    pub fn durable_source<PK: CacheKey, V: CacheEntity>(
        &self,
        address: &Arc<UniqueAddress>,
    ) -> Result<DurableStoreSource<PK, V>, CacheError> {
        Ok(DurableStoreSource::new(
            Arc::clone(address),
            Self::key_builder::<PK, V>(address)?,
            Arc::clone(&self.durable_store),
            self.config.flush.batch_count,
        ))
    }

    /// Source of the requested backend type, behind the common trait.
    ///
    /// # Errors
    ///
    /// As [`fast_source`](Self::fast_source).
    pub fn source<PK: CacheKey, V: CacheEntity>(
        &self,
        address: &Arc<UniqueAddress>,
        cache_type: CacheType,
    ) -> Result<Arc<dyn CacheSource<PK, V>>, CacheError> {
        let source: Arc<dyn CacheSource<PK, V>> = match cache_type {
            CacheType::Redis => Arc::new(self.fast_source::<PK, V>(address)?),
            CacheType::MongoDb => Arc::new(self.durable_source::<PK, V>(address)?),
        };
        Ok(source)
    }

    /// Write-behind cache over the durable store. The scheduler is not
    /// started.
    ///
    /// # Errors
    ///
    /// As [`durable_source`](Self::durable_source).
    pub fn delayed_source<PK: CacheKey, V: CacheEntity>(
        &self,
        address: &Arc<UniqueAddress>,
    ) -> Result<DelayedCacheSource<PK, V>, CacheError> {
        let source = Arc::new(self.durable_source::<PK, V>(address)?);
        Ok(DelayedCacheSource::new(source, Arc::clone(&self.config)))
    }
}

#[cfg(test)]
mod tests {
    use wbcache_core::AddressError;

    use super::*;
    use crate::storage::engines::{MemoryDurableStore, MemoryFastStore};
    use crate::test_support::{inventory_config, Item};

    fn factory() -> SourceFactory {
        let mut registry = AddressRegistry::new();
        registry.register(&inventory_config()).unwrap();
        registry.register(&inventory_config().with_shared_id(1)).unwrap();
        SourceFactory::new(
            Arc::new(registry),
            Arc::new(MemoryFastStore::new()),
            Arc::new(MemoryDurableStore::new()),
            Arc::new(CacheConfig::default()),
        )
    }

    #[tokio::test]
    async fn builds_sources_of_each_type() {
        let factory = factory();
        let address = factory.address("Inventory", 0).unwrap();

        let fast = factory.source::<i64, Item>(&address, CacheType::Redis).unwrap();
        let durable = factory.source::<i64, Item>(&address, CacheType::MongoDb).unwrap();
        assert_eq!(fast.cache_type(), CacheType::Redis);
        assert_eq!(durable.cache_type(), CacheType::MongoDb);

        fast.replace_one(&1, &Item::new(1, 1)).await.unwrap();
        assert!(durable.get(&1, &1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delayed_source_writes_to_durable_store() {
        let factory = factory();
        let address = factory.address("Inventory", 1).unwrap();
        let delayed = factory.delayed_source::<i64, Item>(&address).unwrap();
        let durable = factory.durable_source::<i64, Item>(&address).unwrap();

        delayed.replace_one(&5, &Item::new(2, 3));
        delayed.flush_one(&5).await.unwrap();
        assert_eq!(durable.get(&5, &2).await.unwrap(), Some(Item::new(2, 3)));
        assert!(!delayed.is_running());
    }

    #[test]
    fn unknown_address_is_a_config_error() {
        assert!(matches!(
            factory().address("Mail", 0),
            Err(CacheError::Config(_))
        ));
    }

    #[test]
    fn mismatched_key_types_are_rejected() {
        let factory = factory();
        let address = factory.address("Inventory", 0).unwrap();
        let result = factory.durable_source::<(i64, i64), Item>(&address);
        assert!(matches!(
            result,
            Err(CacheError::Address(AddressError::KeyArity { .. }))
        ));
    }
}
