//! wbcache core: storage values, cache keys, unique addresses and the entity contract.

pub mod address;
pub mod entity;
pub mod error;
pub mod key;
pub mod types;

pub use address::{AddressRegistry, EntityConfig, UniqueAddress};
pub use entity::CacheEntity;
pub use error::AddressError;
pub use key::{CacheKey, KeyValueBuilder};
pub use types::{KeyValue, StorageMap, Value};

#[cfg(test)]
mod tests {
    #[test]
    fn crate_loads() {
        // Empty body: if this test runs, the crate compiles and loads.
    }
}
