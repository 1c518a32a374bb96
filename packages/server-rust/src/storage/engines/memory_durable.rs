//! In-memory [`DurableStoreDriver`].
//!
//! Collections are plain row vectors behind a [`DashMap`]; filters are
//! matched by field equality. Acknowledgement counts follow the durable
//! store's contract exactly, so flush accounting behaves the same as
//! against a real deployment.

use async_trait::async_trait;
use dashmap::DashMap;
use wbcache_core::{KeyValue, StorageMap};

use crate::storage::driver::{BulkUpsertAck, DurableStoreDriver, UpsertModel};

fn matches_all(row: &StorageMap, filter: &[KeyValue]) -> bool {
    filter.iter().all(|binding| binding.matches(row))
}

/// In-memory document store.
#[derive(Default)]
pub struct MemoryDurableStore {
    collections: DashMap<String, Vec<StorageMap>>,
}

impl MemoryDurableStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rows in `collection`.
    #[must_use]
    pub fn count(&self, collection: &str) -> usize {
        self.collections.get(collection).map_or(0, |rows| rows.len())
    }
}

#[async_trait]
impl DurableStoreDriver for MemoryDurableStore {
    async fn find_one(
        &self,
        collection: &str,
        filter: &[KeyValue],
    ) -> anyhow::Result<Option<StorageMap>> {
        Ok(self.collections.get(collection).and_then(|rows| {
            rows.iter()
                .find(|row| matches_all(row, filter))
                .cloned()
        }))
    }

    async fn find_all(
        &self,
        collection: &str,
        filter: &[KeyValue],
    ) -> anyhow::Result<Vec<StorageMap>> {
        Ok(self
            .collections
            .get(collection)
            .map(|rows| {
                rows.iter()
                    .filter(|row| matches_all(row, filter))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn bulk_upsert(
        &self,
        collection: &str,
        models: Vec<UpsertModel>,
    ) -> anyhow::Result<BulkUpsertAck> {
        let mut rows = self.collections.entry(collection.to_string()).or_default();
        let mut ack = BulkUpsertAck::default();
        for model in models {
            // The filter's bindings are always part of the stored row.
            let mut document = model.document;
            for binding in &model.filter {
                document.insert(binding.name.clone(), binding.value.clone());
            }
            match rows.iter_mut().find(|row| matches_all(row, &model.filter)) {
                Some(row) => {
                    *row = document;
                    ack.matched += 1;
                }
                None => {
                    rows.push(document);
                    ack.upserted += 1;
                }
            }
        }
        Ok(ack)
    }

    async fn bulk_delete(
        &self,
        collection: &str,
        filters: Vec<Vec<KeyValue>>,
    ) -> anyhow::Result<u64> {
        let Some(mut rows) = self.collections.get_mut(collection) else {
            return Ok(0);
        };
        let mut deleted = 0;
        for filter in &filters {
            if let Some(index) = rows.iter().position(|row| matches_all(row, filter)) {
                rows.remove(index);
                deleted += 1;
            }
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use wbcache_core::Value;

    use super::*;

    fn model(player: i64, item: i64, count: i64) -> UpsertModel {
        UpsertModel {
            filter: vec![KeyValue::new("playerId", player), KeyValue::new("itemId", item)],
            document: StorageMap::from([("count".to_string(), Value::Int(count))]),
        }
    }

    #[tokio::test]
    async fn upsert_inserts_then_matches() {
        let store = MemoryDurableStore::new();
        let ack = store.bulk_upsert("bag", vec![model(1, 1, 5), model(1, 2, 6)]).await.unwrap();
        assert_eq!(ack, BulkUpsertAck { matched: 0, upserted: 2 });

        let ack = store.bulk_upsert("bag", vec![model(1, 1, 9)]).await.unwrap();
        assert_eq!(ack, BulkUpsertAck { matched: 1, upserted: 0 });
        assert_eq!(store.count("bag"), 2);

        let row = store
            .find_one("bag", &[KeyValue::new("playerId", 1_i64), KeyValue::new("itemId", 1_i64)])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.get("count"), Some(&Value::Int(9)));
        assert_eq!(row.get("itemId"), Some(&Value::Int(1)));
    }

    #[tokio::test]
    async fn find_all_filters_by_primary_key() {
        let store = MemoryDurableStore::new();
        store
            .bulk_upsert("bag", vec![model(1, 1, 1), model(1, 2, 2), model(2, 1, 3)])
            .await
            .unwrap();
        let rows = store.find_all("bag", &[KeyValue::new("playerId", 1_i64)]).await.unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn bulk_delete_counts_only_existing_rows() {
        let store = MemoryDurableStore::new();
        store.bulk_upsert("bag", vec![model(1, 1, 1)]).await.unwrap();

        let deleted = store
            .bulk_delete(
                "bag",
                vec![
                    vec![KeyValue::new("playerId", 1_i64), KeyValue::new("itemId", 1_i64)],
                    vec![KeyValue::new("playerId", 1_i64), KeyValue::new("itemId", 7_i64)],
                ],
            )
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(store.count("bag"), 0);
        assert_eq!(store.bulk_delete("missing", vec![Vec::new()]).await.unwrap(), 0);
    }
}
