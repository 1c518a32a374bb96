//! Single-loader-wins coordination for shared fast-store buckets.
//!
//! When several entity types share one bucket family, the first source to
//! load a primary key fetches every sibling address in one pipeline and
//! parks the siblings' results here. The siblings then take their parked
//! result instead of issuing their own round trip.

use dashmap::{DashMap, DashSet};
use wbcache_core::UniqueAddress;

use crate::storage::collection::RedisCollection;

/// Shared-load flags and parked results, keyed by primary-key string.
#[derive(Debug, Default)]
pub struct SharedLoadCoordinator {
    /// (primary key, family name) pairs whose shared load was claimed.
    loading: DashSet<(String, String)>,
    /// Parked results by (primary key, family name, shared id).
    results: DashMap<(String, String, u32), RedisCollection>,
}

impl SharedLoadCoordinator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims the shared load of `family` for `primary_key`.
    ///
    /// Returns `true` for exactly one caller until [`release`](Self::release)
    /// is called for the key. Losers should load only their own address.
    pub fn try_begin_load(&self, primary_key: &str, family: &str) -> bool {
        self.loading
            .insert((primary_key.to_string(), family.to_string()))
    }

    /// Removes and returns the parked result for `address`, if any.
    pub fn take(&self, primary_key: &str, address: &UniqueAddress) -> Option<RedisCollection> {
        self.results
            .remove(&(
                primary_key.to_string(),
                address.name().to_string(),
                address.shared_id(),
            ))
            .map(|(_, collection)| collection)
    }

    /// Parks `collection` for a sibling `address` to take later.
    pub fn publish(&self, primary_key: &str, address: &UniqueAddress, collection: RedisCollection) {
        self.results.insert(
            (
                primary_key.to_string(),
                address.name().to_string(),
                address.shared_id(),
            ),
            collection,
        );
    }

    /// Forgets the claim and any unconsumed results of `primary_key`, so the
    /// next load of it can win again.
    pub fn release(&self, primary_key: &str) {
        self.loading.retain(|(key, _)| key != primary_key);
        self.results.retain(|(key, _, _), _| key != primary_key);
    }

    /// Number of parked results not yet taken.
    #[must_use]
    pub fn parked(&self) -> usize {
        self.results.len()
    }
}
