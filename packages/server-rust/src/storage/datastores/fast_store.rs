//! [`CacheSource`] over a [`FastStoreDriver`].
//!
//! Each primary key maps to one hash bucket at the entity's address. The
//! hash field is the secondary-key string and the field value is the JSON
//! encoding of the entity's storage map with its index bits embedded under
//! [`BITS_FIELD`]. Information fields such as [`EXPIRED_FIELD`] live in
//! the same hash and are never decoded as entities.

use std::slice;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use tracing::debug;
use wbcache_core::{
    AddressRegistry, CacheEntity, CacheKey, KeyValueBuilder, StorageMap, UniqueAddress, Value,
};

use super::shared_load::SharedLoadCoordinator;
use crate::storage::collection::{
    CacheInformation, CacheType, DataCollection, RedisCollection, EXPIRED_FIELD,
    INFORMATION_FIELDS,
};
use crate::storage::driver::{FastStoreDriver, PipelineCommand, PipelineReply};
use crate::storage::source::CacheSource;

/// Field of an encoded value holding the entity's index bits.
pub const BITS_FIELD: &str = "_bits";

/// Fast key/value store source for one entity type.
pub struct FastStoreSource<PK: CacheKey, V: CacheEntity> {
    address: Arc<UniqueAddress>,
    /// Address family loaded together, `[address]` when unshared.
    siblings: Vec<Arc<UniqueAddress>>,
    key_builder: KeyValueBuilder<PK, V::Key>,
    driver: Arc<dyn FastStoreDriver>,
    coordinator: Arc<SharedLoadCoordinator>,
}

impl<PK: CacheKey, V: CacheEntity> FastStoreSource<PK, V> {
    /// Resolves the address family from `registry` once, at construction.
    #[must_use]
    pub fn new(
        address: Arc<UniqueAddress>,
        registry: &AddressRegistry,
        key_builder: KeyValueBuilder<PK, V::Key>,
        driver: Arc<dyn FastStoreDriver>,
        coordinator: Arc<SharedLoadCoordinator>,
    ) -> Self {
        let siblings = address.sibling_addresses(registry);
        Self {
            address,
            siblings,
            key_builder,
            driver,
            coordinator,
        }
    }

    #[must_use]
    pub fn siblings(&self) -> &[Arc<UniqueAddress>] {
        &self.siblings
    }

    /// Forgets the shared-load claim of `primary_key` and any sibling
    /// results nobody took.
    ///
    /// Call when the owning aggregate unloads. Until then the coordinator
    /// keeps both, and a later [`get_collection`](CacheSource::get_collection)
    /// of a sibling is served from the parked result.
    pub fn unload(&self, primary_key: &PK) {
        if self.address.is_shared() {
            self.coordinator
                .release(&self.key_builder.primary_key_string(primary_key));
        }
    }

    fn bucket(&self, primary_key: &PK) -> String {
        self.address.address_for_key(primary_key)
    }

    fn encode(value: &V) -> anyhow::Result<String> {
        let mut map = value.to_storage();
        map.insert(BITS_FIELD.to_string(), Value::Int(value.index_bits()));
        Ok(serde_json::to_string(&map)?)
    }

    fn decode(payload: &str) -> anyhow::Result<V> {
        let mut map: StorageMap =
            serde_json::from_str(payload).context("malformed fast-store value")?;
        let bits = map
            .remove(BITS_FIELD)
            .and_then(|bits| bits.as_int())
            .unwrap_or(0);
        let mut value = V::from_storage(map)?;
        value.set_index_bits(bits);
        Ok(value)
    }

    fn read_collection(collection: RedisCollection) -> anyhow::Result<DataCollection<V>> {
        let (payloads, information) = collection.into_payloads();
        let values = payloads
            .iter()
            .map(|payload| Self::decode(payload))
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(DataCollection::new(values, information))
    }

    /// Loads `addresses` for `primary_key` in one pipeline (`HGETALL` and
    /// `PTTL` per address). Results come back in `addresses` order.
    async fn fetch(
        &self,
        primary_key: &PK,
        addresses: &[Arc<UniqueAddress>],
    ) -> anyhow::Result<Vec<RedisCollection>> {
        let keys: Vec<String> = addresses
            .iter()
            .map(|address| address.address_for_key(primary_key))
            .collect();
        let commands = keys
            .iter()
            .flat_map(|key| {
                [
                    PipelineCommand::HGetAll { key: key.clone() },
                    PipelineCommand::PTtl { key: key.clone() },
                ]
            })
            .collect();
        let replies = self.driver.execute_pipeline(commands).await?;
        if replies.is_empty() || replies.len() % keys.len() != 0 {
            anyhow::bail!(
                "pipeline returned {} replies for {} addresses",
                replies.len(),
                keys.len()
            );
        }

        let per_address = replies.len() / keys.len();
        let mut replies = replies.into_iter();
        Ok(keys
            .into_iter()
            .map(|address| {
                let mut collection = RedisCollection {
                    address,
                    ..RedisCollection::default()
                };
                for (_, reply) in replies.by_ref().take(per_address) {
                    match reply {
                        PipelineReply::Hash(fields) => collection.fields.extend(fields),
                        PipelineReply::Int(ttl) => collection.ttl_millis = Some(ttl),
                    }
                }
                collection
            })
            .collect())
    }

    /// Writes `values` and, when `information` carries an expiry, the
    /// [`EXPIRED_FIELD`] plus an absolute bucket expiry in one pipeline.
    ///
    /// # Errors
    ///
    /// Returns an error if a value cannot be encoded or the driver fails.
    pub async fn replace_batch_with_information(
        &self,
        primary_key: &PK,
        values: &[V],
        information: Option<CacheInformation>,
    ) -> anyhow::Result<bool> {
        let expired_time = information.map_or(0, |information| information.expired_time);
        if values.is_empty() && expired_time <= 0 {
            return Ok(true);
        }
        let mut fields = values
            .iter()
            .map(|value| -> anyhow::Result<(String, String)> {
                let field = self.key_builder.secondary_key_string(&value.secondary_key());
                Ok((field, Self::encode(value)?))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        let key = self.bucket(primary_key);

        if expired_time > 0 {
            fields.push((EXPIRED_FIELD.to_string(), expired_time.to_string()));
            self.driver
                .execute_pipeline(vec![
                    PipelineCommand::HSet {
                        key: key.clone(),
                        fields,
                    },
                    PipelineCommand::PExpireAt {
                        key,
                        at_millis: expired_time,
                    },
                ])
                .await?;
        } else {
            self.driver.hset_multiple(&key, &fields).await?;
        }
        Ok(true)
    }

    /// Refreshes the information record of `primary_key`'s bucket.
    ///
    /// # Errors
    ///
    /// Returns an error if the driver fails.
    pub async fn update_information(
        &self,
        primary_key: &PK,
        information: CacheInformation,
    ) -> anyhow::Result<bool> {
        self.replace_batch_with_information(primary_key, &[], Some(information))
            .await
    }
}

#[async_trait]
impl<PK: CacheKey, V: CacheEntity> CacheSource<PK, V> for FastStoreSource<PK, V> {
    fn address(&self) -> &Arc<UniqueAddress> {
        &self.address
    }

    fn key_builder(&self) -> &KeyValueBuilder<PK, V::Key> {
        &self.key_builder
    }

    fn cache_type(&self) -> CacheType {
        CacheType::Redis
    }

    async fn get(&self, primary_key: &PK, secondary_key: &V::Key) -> anyhow::Result<Option<V>> {
        let field = self.key_builder.secondary_key_string(secondary_key);
        match self.driver.hget(&self.bucket(primary_key), &field).await? {
            Some(payload) if !payload.is_empty() => Self::decode(&payload).map(Some),
            _ => Ok(None),
        }
    }

    async fn get_all(&self, primary_key: &PK) -> anyhow::Result<Vec<V>> {
        self.driver
            .hget_all(&self.bucket(primary_key))
            .await?
            .into_iter()
            .filter(|(field, _)| !INFORMATION_FIELDS.contains(&field.as_str()))
            .map(|(_, payload)| Self::decode(&payload))
            .collect()
    }

    async fn get_collection(&self, primary_key: &PK) -> anyhow::Result<DataCollection<V>> {
        let key_string = self.key_builder.primary_key_string(primary_key);
        if self.address.is_shared() {
            if let Some(collection) = self.coordinator.take(&key_string, &self.address) {
                return Self::read_collection(collection);
            }
        }

        let shared_load = self.address.is_shared()
            && self
                .coordinator
                .try_begin_load(&key_string, self.address.name());
        let addresses = if shared_load {
            self.siblings.as_slice()
        } else {
            slice::from_ref(&self.address)
        };
        debug!(
            entity = self.address.name(),
            primary_key = %key_string,
            addresses = addresses.len(),
            shared_load,
            "loading fast-store collection"
        );

        let collections = self.fetch(primary_key, addresses).await?;
        let mut own = None;
        for (address, collection) in addresses.iter().zip(collections) {
            if **address == *self.address {
                own = Some(collection);
            } else {
                self.coordinator.publish(&key_string, address, collection);
            }
        }
        let own = own.with_context(|| {
            format!("{} missing from its own shared load", self.address.template())
        })?;
        Self::read_collection(own)
    }

    async fn replace_one(&self, primary_key: &PK, value: &V) -> anyhow::Result<bool> {
        let field = self.key_builder.secondary_key_string(&value.secondary_key());
        self.driver
            .hset(&self.bucket(primary_key), &field, &Self::encode(value)?)
            .await?;
        Ok(true)
    }

    async fn replace_batch(&self, primary_key: &PK, values: &[V]) -> anyhow::Result<bool> {
        self.replace_batch_with_information(primary_key, values, None)
            .await
    }

    async fn delete_one(&self, primary_key: &PK, secondary_key: &V::Key) -> anyhow::Result<bool> {
        let field = self.key_builder.secondary_key_string(secondary_key);
        self.driver.hdel(&self.bucket(primary_key), &[field]).await?;
        Ok(true)
    }

    async fn delete_batch(
        &self,
        primary_key: &PK,
        secondary_keys: &[V::Key],
    ) -> anyhow::Result<bool> {
        if secondary_keys.is_empty() {
            return Ok(true);
        }
        let fields: Vec<String> = secondary_keys
            .iter()
            .map(|key| self.key_builder.secondary_key_string(key))
            .collect();
        self.driver.hdel(&self.bucket(primary_key), &fields).await?;
        Ok(true)
    }
}
