//! Capability contract every cached entity type implements.

use crate::key::CacheKey;
use crate::types::StorageMap;

/// An entity the cache engine can buffer, persist and reload.
///
/// The engine is generic over this trait; it never inspects entity fields
/// beyond what the conversion exposes.
pub trait CacheEntity: Clone + Send + Sync + 'static {
    /// Key distinguishing entities within one primary-key group.
    type Key: CacheKey;

    /// This entity's secondary key.
    fn secondary_key(&self) -> Self::Key;

    /// Converts to the storage representation.
    fn to_storage(&self) -> StorageMap;

    /// Rebuilds an entity from its storage representation.
    ///
    /// # Errors
    ///
    /// Returns an error if a required field is missing or has the wrong type.
    fn from_storage(map: StorageMap) -> anyhow::Result<Self>;

    /// Auxiliary index bits carried alongside the entity in the fast store.
    fn index_bits(&self) -> i64 {
        0
    }

    /// Restores index bits read back from the fast store.
    fn set_index_bits(&mut self, _bits: i64) {}
}
