//! [`CacheSource`] over a [`DurableStoreDriver`].
//!
//! One collection per entity name. Rows are selected by the address's
//! primary unique keys plus the entity's secondary key fields; rows of a
//! shared address also carry [`SHARED_ID_FIELD`] so sibling entity types
//! stored in one collection never match each other's filters.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error};
use wbcache_core::{CacheEntity, CacheKey, KeyValue, KeyValueBuilder, StorageMap, UniqueAddress};

use crate::storage::batch::apply_in_batches;
use crate::storage::collection::{CacheInformation, CacheType, DataCollection};
use crate::storage::command::PendingCommand;
use crate::storage::delay_cache::PrimaryDelayCache;
use crate::storage::driver::{DurableStoreDriver, UpsertModel};
use crate::storage::source::{CacheSource, DelayWriteSource, WriteBackFailures};

/// Row field holding the shared id of a shared address.
pub const SHARED_ID_FIELD: &str = "sharedId";

/// Durable document-store source for one entity type.
pub struct DurableStoreSource<PK: CacheKey, V: CacheEntity> {
    address: Arc<UniqueAddress>,
    key_builder: KeyValueBuilder<PK, V::Key>,
    driver: Arc<dyn DurableStoreDriver>,
    batch_count: usize,
}

impl<PK: CacheKey, V: CacheEntity> DurableStoreSource<PK, V> {
    /// `batch_count` bounds the commands sent in one bulk request by
    /// [`write_back`](DelayWriteSource::write_back).
    #[must_use]
    pub fn new(
        address: Arc<UniqueAddress>,
        key_builder: KeyValueBuilder<PK, V::Key>,
        driver: Arc<dyn DurableStoreDriver>,
        batch_count: usize,
    ) -> Self {
        Self {
            address,
            key_builder,
            driver,
            batch_count: batch_count.max(1),
        }
    }

    /// Collection the entity type is stored in.
    #[must_use]
    pub fn collection(&self) -> &str {
        self.address.name()
    }

    /// Filter selecting every row of `primary_key`.
    #[must_use]
    pub fn primary_filter(&self, primary_key: &PK) -> Vec<KeyValue> {
        let mut filter = self.address.primary_unique_keys(primary_key);
        if self.address.is_shared() {
            filter.push(KeyValue::new(SHARED_ID_FIELD, self.address.shared_id()));
        }
        filter
    }

    /// Filter selecting the single row of (`primary_key`, `secondary_key`).
    #[must_use]
    pub fn row_filter(&self, primary_key: &PK, secondary_key: &V::Key) -> Vec<KeyValue> {
        let mut filter = self.primary_filter(primary_key);
        filter.extend(self.key_builder.secondary_key_values(secondary_key));
        filter
    }

    fn upsert_model(&self, primary_key: &PK, value: &V) -> UpsertModel {
        let filter = self.row_filter(primary_key, &value.secondary_key());
        let mut document = value.to_storage();
        for binding in &filter {
            document.insert(binding.name.clone(), binding.value.clone());
        }
        UpsertModel { filter, document }
    }

    fn decode(mut row: StorageMap) -> anyhow::Result<V> {
        row.remove(SHARED_ID_FIELD);
        V::from_storage(row)
    }

    async fn upsert(&self, models: Vec<UpsertModel>) -> anyhow::Result<bool> {
        upsert_rows(self.driver.as_ref(), self.collection(), models).await
    }

    async fn delete(&self, filters: Vec<Vec<KeyValue>>) -> anyhow::Result<bool> {
        delete_rows(self.driver.as_ref(), self.collection(), filters).await
    }
}

async fn upsert_rows(
    driver: &dyn DurableStoreDriver,
    collection: &str,
    models: Vec<UpsertModel>,
) -> anyhow::Result<bool> {
    if models.is_empty() {
        return Ok(true);
    }
    let requested = models.len() as u64;
    let ack = driver.bulk_upsert(collection, models).await?;
    if ack.acknowledged() == requested {
        return Ok(true);
    }
    error!(
        entity = collection,
        requested,
        matched = ack.matched,
        upserted = ack.upserted,
        "bulk upsert not fully acknowledged"
    );
    Ok(false)
}

async fn delete_rows(
    driver: &dyn DurableStoreDriver,
    collection: &str,
    filters: Vec<Vec<KeyValue>>,
) -> anyhow::Result<bool> {
    if filters.is_empty() {
        return Ok(true);
    }
    let requested = filters.len() as u64;
    let deleted = driver.bulk_delete(collection, filters).await?;
    if deleted == requested {
        return Ok(true);
    }
    error!(
        entity = collection,
        requested, deleted, "bulk delete not fully acknowledged"
    );
    Ok(false)
}

#[async_trait]
impl<PK: CacheKey, V: CacheEntity> CacheSource<PK, V> for DurableStoreSource<PK, V> {
    fn address(&self) -> &Arc<UniqueAddress> {
        &self.address
    }

    fn key_builder(&self) -> &KeyValueBuilder<PK, V::Key> {
        &self.key_builder
    }

    fn cache_type(&self) -> CacheType {
        CacheType::MongoDb
    }

    async fn get(&self, primary_key: &PK, secondary_key: &V::Key) -> anyhow::Result<Option<V>> {
        let filter = self.row_filter(primary_key, secondary_key);
        self.driver
            .find_one(self.collection(), &filter)
            .await?
            .map(Self::decode)
            .transpose()
    }

    async fn get_all(&self, primary_key: &PK) -> anyhow::Result<Vec<V>> {
        let filter = self.primary_filter(primary_key);
        self.driver
            .find_all(self.collection(), &filter)
            .await?
            .into_iter()
            .map(Self::decode)
            .collect()
    }

    async fn get_collection(&self, primary_key: &PK) -> anyhow::Result<DataCollection<V>> {
        let values = self.get_all(primary_key).await?;
        Ok(DataCollection::new(values, CacheInformation::default()))
    }

    async fn replace_one(&self, primary_key: &PK, value: &V) -> anyhow::Result<bool> {
        self.upsert(vec![self.upsert_model(primary_key, value)]).await
    }

    async fn replace_batch(&self, primary_key: &PK, values: &[V]) -> anyhow::Result<bool> {
        let models = values
            .iter()
            .map(|value| self.upsert_model(primary_key, value))
            .collect();
        self.upsert(models).await
    }

    async fn delete_one(&self, primary_key: &PK, secondary_key: &V::Key) -> anyhow::Result<bool> {
        self.delete(vec![self.row_filter(primary_key, secondary_key)])
            .await
    }

    async fn delete_batch(
        &self,
        primary_key: &PK,
        secondary_keys: &[V::Key],
    ) -> anyhow::Result<bool> {
        let filters = secondary_keys
            .iter()
            .map(|key| self.row_filter(primary_key, key))
            .collect();
        self.delete(filters).await
    }
}

#[async_trait]
impl<PK: CacheKey, V: CacheEntity> DelayWriteSource<PK, V> for DurableStoreSource<PK, V> {
    async fn write_back(&self, batch: Vec<PrimaryDelayCache<PK, V>>) -> WriteBackFailures<PK, V> {
        let mut delete_filters = Vec::new();
        let mut delete_commands = Vec::new();
        let mut upsert_models = Vec::new();
        let mut upsert_commands = Vec::new();

        for cache in batch {
            let (primary_key, commands) = cache.into_parts();
            for command in commands {
                match command.value() {
                    Some(value) => {
                        upsert_models.push(self.upsert_model(&primary_key, value));
                        upsert_commands.push((primary_key.clone(), command));
                    }
                    None => {
                        delete_filters.push(self.row_filter(&primary_key, command.key()));
                        delete_commands.push((primary_key.clone(), command));
                    }
                }
            }
        }
        debug!(
            entity = self.collection(),
            deletes = delete_filters.len(),
            upserts = upsert_models.len(),
            "writing back delay cache batch"
        );

        let driver = self.driver.as_ref();
        let collection = self.collection();
        let mut failed = apply_in_batches(
            collection,
            delete_filters,
            delete_commands,
            self.batch_count,
            |filters| delete_rows(driver, collection, filters),
        )
        .await;
        failed.extend(
            apply_in_batches(
                collection,
                upsert_models,
                upsert_commands,
                self.batch_count,
                |models| upsert_rows(driver, collection, models),
            )
            .await,
        );

        let mut failures: HashMap<PK, Vec<PendingCommand<V>>> = HashMap::new();
        for (primary_key, command) in failed {
            failures.entry(primary_key).or_default().push(command);
        }
        failures
    }
}
