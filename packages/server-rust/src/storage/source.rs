//! Backend source traits.
//!
//! [`CacheSource`] is the uniform get/replace/delete contract every backend
//! source offers for one entity type. [`DelayWriteSource`] adds the bulk
//! write-back used by the delay cache to persist buffered commands.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use wbcache_core::{CacheEntity, CacheKey, KeyValueBuilder, UniqueAddress};

use super::collection::{CacheType, DataCollection};
use super::command::PendingCommand;
use super::delay_cache::PrimaryDelayCache;

/// Commands that could not be persisted, grouped by primary key.
pub type WriteBackFailures<PK, V> = HashMap<PK, Vec<PendingCommand<V>>>;

/// Uniform contract against one physical backend for one entity type.
///
/// Used as `Arc<S>` where `S` is a concrete source, or through the
/// delay cache which wraps a [`DelayWriteSource`].
#[async_trait]
pub trait CacheSource<PK, V>: Send + Sync
where
    PK: CacheKey,
    V: CacheEntity,
{
    /// Address of the entity type this source serves.
    fn address(&self) -> &Arc<UniqueAddress>;

    /// Key builder for this entity type.
    fn key_builder(&self) -> &KeyValueBuilder<PK, V::Key>;

    fn cache_type(&self) -> CacheType;

    /// Entity name used in logs and metrics.
    fn name(&self) -> &str {
        self.address().name()
    }

    /// Load a single entity.
    async fn get(&self, primary_key: &PK, secondary_key: &V::Key) -> anyhow::Result<Option<V>>;

    /// Load every entity of a primary key.
    async fn get_all(&self, primary_key: &PK) -> anyhow::Result<Vec<V>>;

    /// Load every entity of a primary key with its information record.
    async fn get_collection(&self, primary_key: &PK) -> anyhow::Result<DataCollection<V>>;

    /// Store one entity. `Ok(false)` means the backend did not confirm it.
    async fn replace_one(&self, primary_key: &PK, value: &V) -> anyhow::Result<bool>;

    /// Store several entities of one primary key.
    async fn replace_batch(&self, primary_key: &PK, values: &[V]) -> anyhow::Result<bool>;

    /// Delete one entity.
    async fn delete_one(&self, primary_key: &PK, secondary_key: &V::Key) -> anyhow::Result<bool>;

    /// Delete several entities of one primary key.
    async fn delete_batch(
        &self,
        primary_key: &PK,
        secondary_keys: &[V::Key],
    ) -> anyhow::Result<bool>;
}

/// A source the delay cache can flush buffered commands into.
#[async_trait]
pub trait DelayWriteSource<PK, V>: CacheSource<PK, V>
where
    PK: CacheKey,
    V: CacheEntity,
{
    /// Persists every command of every buffer in `batch`.
    ///
    /// Never fails as a whole: commands the backend did not confirm are
    /// returned for rollback, and an empty map means everything persisted.
    async fn write_back(&self, batch: Vec<PrimaryDelayCache<PK, V>>) -> WriteBackFailures<PK, V>;
}
