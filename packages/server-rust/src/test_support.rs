//! Fixtures shared by the unit tests of this crate.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use wbcache_core::{
    AddressRegistry, CacheEntity, EntityConfig, KeyValue, KeyValueBuilder, StorageMap,
    UniqueAddress, Value,
};

use crate::service::config::CacheConfig;
use crate::storage::datastores::DurableStoreSource;
use crate::storage::driver::{BulkUpsertAck, DurableStoreDriver, UpsertModel};
use crate::storage::engines::MemoryDurableStore;

/// Inventory item owned by a player. Secondary key is `itemId`.
#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    pub id: i64,
    pub count: i64,
    pub bits: i64,
}

impl Item {
    pub fn new(id: i64, count: i64) -> Self {
        Self { id, count, bits: 0 }
    }
}

impl CacheEntity for Item {
    type Key = i64;

    fn secondary_key(&self) -> i64 {
        self.id
    }

    fn to_storage(&self) -> StorageMap {
        StorageMap::from([
            ("itemId".to_string(), Value::Int(self.id)),
            ("count".to_string(), Value::Int(self.count)),
        ])
    }

    fn from_storage(map: StorageMap) -> anyhow::Result<Self> {
        let field = |name: &str| {
            map.get(name)
                .and_then(Value::as_int)
                .ok_or_else(|| anyhow::anyhow!("missing field {name}"))
        };
        Ok(Self::new(field("itemId")?, field("count")?))
    }

    fn index_bits(&self) -> i64 {
        self.bits
    }

    fn set_index_bits(&mut self, bits: i64) {
        self.bits = bits;
    }
}

pub fn inventory_config() -> EntityConfig {
    EntityConfig::new("Inventory", 3, "playerId", "itemId")
}

pub fn inventory_address() -> Arc<UniqueAddress> {
    let mut registry = AddressRegistry::new();
    registry.register(&inventory_config()).unwrap()
}

pub fn item_keys() -> KeyValueBuilder<i64, i64> {
    KeyValueBuilder::new("playerId", vec!["itemId".to_string()]).unwrap()
}

/// Config with short timings so retry paths finish quickly.
pub fn fast_config() -> CacheConfig {
    let mut config = CacheConfig::default();
    config.flush.timeout_ms = 1_000;
    config.flush.batch_count = 2;
    config
}

pub fn durable_source(
    store: Arc<dyn DurableStoreDriver>,
    config: &CacheConfig,
) -> Arc<DurableStoreSource<i64, Item>> {
    Arc::new(DurableStoreSource::new(
        inventory_address(),
        item_keys(),
        store,
        config.flush.batch_count,
    ))
}

/// [`MemoryDurableStore`] with switches that make bulk requests fail.
#[derive(Default)]
pub struct ScriptedDurableStore {
    pub inner: MemoryDurableStore,
    /// Acknowledge zero deletes without touching any row.
    pub ack_no_deletes: AtomicBool,
    /// Acknowledge zero upserts without touching any row.
    pub ack_no_upserts: AtomicBool,
    /// Apply every upsert but acknowledge one row fewer than requested.
    pub short_upsert_ack: AtomicBool,
    /// Return an error from every bulk request.
    pub fail_bulk: AtomicBool,
    /// Sleep this long before answering a bulk request.
    pub latency_ms: AtomicU64,
    pub bulk_calls: AtomicU32,
}

impl ScriptedDurableStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    async fn before_bulk(&self) -> anyhow::Result<()> {
        self.bulk_calls.fetch_add(1, Ordering::SeqCst);
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.fail_bulk.load(Ordering::SeqCst) {
            anyhow::bail!("scripted bulk failure");
        }
        Ok(())
    }
}

#[async_trait]
impl DurableStoreDriver for ScriptedDurableStore {
    async fn find_one(
        &self,
        collection: &str,
        filter: &[KeyValue],
    ) -> anyhow::Result<Option<StorageMap>> {
        self.inner.find_one(collection, filter).await
    }

    async fn find_all(
        &self,
        collection: &str,
        filter: &[KeyValue],
    ) -> anyhow::Result<Vec<StorageMap>> {
        self.inner.find_all(collection, filter).await
    }

    async fn bulk_upsert(
        &self,
        collection: &str,
        models: Vec<UpsertModel>,
    ) -> anyhow::Result<BulkUpsertAck> {
        self.before_bulk().await?;
        if self.ack_no_upserts.load(Ordering::SeqCst) {
            return Ok(BulkUpsertAck::default());
        }
        let mut ack = self.inner.bulk_upsert(collection, models).await?;
        if self.short_upsert_ack.load(Ordering::SeqCst) {
            if ack.upserted > 0 {
                ack.upserted -= 1;
            } else {
                ack.matched = ack.matched.saturating_sub(1);
            }
        }
        Ok(ack)
    }

    async fn bulk_delete(
        &self,
        collection: &str,
        filters: Vec<Vec<KeyValue>>,
    ) -> anyhow::Result<u64> {
        self.before_bulk().await?;
        if self.ack_no_deletes.load(Ordering::SeqCst) {
            return Ok(0);
        }
        self.inner.bulk_delete(collection, filters).await
    }
}
