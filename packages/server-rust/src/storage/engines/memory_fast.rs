//! In-memory [`FastStoreDriver`] backed by [`DashMap`].
//!
//! Hash buckets keyed by address, with lazy absolute expiry. Suitable for
//! tests, the demo binary and single-process deployments where the fast
//! tier does not need to survive a restart.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::storage::driver::{FastStoreDriver, PipelineCommand, PipelineReply};
use crate::storage::now_millis;

/// `PTTL` reply for a missing key.
pub const TTL_MISSING: i64 = -2;

/// `PTTL` reply for a key without expiry.
pub const TTL_PERSISTENT: i64 = -1;

#[derive(Debug, Default, Clone)]
struct Bucket {
    fields: HashMap<String, String>,
    expire_at: Option<i64>,
}

impl Bucket {
    fn is_expired(&self, now: i64) -> bool {
        self.expire_at.is_some_and(|at| at <= now)
    }
}

/// In-memory hash store.
///
/// Every call is answered from a sharded [`DashMap`]; pipelines are applied
/// command by command and counted so callers can observe round trips.
pub struct MemoryFastStore {
    buckets: DashMap<String, Bucket>,
    pipelines: AtomicU64,
}

impl MemoryFastStore {
    /// Creates a new, empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            buckets: DashMap::new(),
            pipelines: AtomicU64::new(0),
        }
    }

    /// Number of pipelines executed so far.
    #[must_use]
    pub fn pipeline_count(&self) -> u64 {
        self.pipelines.load(Ordering::Relaxed)
    }

    /// Number of live buckets.
    #[must_use]
    pub fn len(&self) -> usize {
        let now = now_millis();
        self.buckets.iter().filter(|b| !b.is_expired(now)).count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops `key` if it has expired.
    fn evict_expired(&self, key: &str, now: i64) {
        self.buckets.remove_if(key, |_, bucket| bucket.is_expired(now));
    }

    fn read_all(&self, key: &str) -> HashMap<String, String> {
        self.evict_expired(key, now_millis());
        self.buckets
            .get(key)
            .map(|bucket| bucket.fields.clone())
            .unwrap_or_default()
    }

    fn write_fields(&self, key: &str, fields: &[(String, String)]) -> i64 {
        self.evict_expired(key, now_millis());
        let mut bucket = self.buckets.entry(key.to_string()).or_default();
        let mut added = 0;
        for (field, value) in fields {
            if bucket.fields.insert(field.clone(), value.clone()).is_none() {
                added += 1;
            }
        }
        added
    }

    fn delete_fields(&self, key: &str, fields: &[String]) -> u64 {
        self.evict_expired(key, now_millis());
        let removed = match self.buckets.get_mut(key) {
            Some(mut bucket) => fields
                .iter()
                .filter(|field| bucket.fields.remove(*field).is_some())
                .count() as u64,
            None => 0,
        };
        // Empty hashes cease to exist.
        self.buckets.remove_if(key, |_, bucket| bucket.fields.is_empty());
        removed
    }

    fn expire_at(&self, key: &str, at_millis: i64) -> bool {
        self.evict_expired(key, now_millis());
        match self.buckets.get_mut(key) {
            Some(mut bucket) => {
                bucket.expire_at = Some(at_millis);
                true
            }
            None => false,
        }
    }

    fn ttl(&self, key: &str) -> i64 {
        let now = now_millis();
        self.evict_expired(key, now);
        match self.buckets.get(key) {
            None => TTL_MISSING,
            Some(bucket) => bucket.expire_at.map_or(TTL_PERSISTENT, |at| at - now),
        }
    }
}

impl Default for MemoryFastStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FastStoreDriver for MemoryFastStore {
    async fn hget(&self, key: &str, field: &str) -> anyhow::Result<Option<String>> {
        self.evict_expired(key, now_millis());
        Ok(self
            .buckets
            .get(key)
            .and_then(|bucket| bucket.fields.get(field).cloned()))
    }

    async fn hget_all(&self, key: &str) -> anyhow::Result<HashMap<String, String>> {
        Ok(self.read_all(key))
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> anyhow::Result<()> {
        self.write_fields(key, &[(field.to_string(), value.to_string())]);
        Ok(())
    }

    async fn hset_multiple(&self, key: &str, fields: &[(String, String)]) -> anyhow::Result<()> {
        self.write_fields(key, fields);
        Ok(())
    }

    async fn hdel(&self, key: &str, fields: &[String]) -> anyhow::Result<u64> {
        Ok(self.delete_fields(key, fields))
    }

    async fn pexpire_at(&self, key: &str, at_millis: i64) -> anyhow::Result<bool> {
        Ok(self.expire_at(key, at_millis))
    }

    async fn execute_pipeline(
        &self,
        commands: Vec<PipelineCommand>,
    ) -> anyhow::Result<Vec<(String, PipelineReply)>> {
        self.pipelines.fetch_add(1, Ordering::Relaxed);
        let replies = commands
            .into_iter()
            .map(|command| {
                let reply = match &command {
                    PipelineCommand::HGetAll { key } => PipelineReply::Hash(self.read_all(key)),
                    PipelineCommand::PTtl { key } => PipelineReply::Int(self.ttl(key)),
                    PipelineCommand::HSet { key, fields } => {
                        PipelineReply::Int(self.write_fields(key, fields))
                    }
                    #[allow(clippy::cast_possible_wrap)]
                    PipelineCommand::HDel { key, fields } => {
                        PipelineReply::Int(self.delete_fields(key, fields) as i64)
                    }
                    PipelineCommand::PExpireAt { key, at_millis } => {
                        PipelineReply::Int(i64::from(self.expire_at(key, *at_millis)))
                    }
                };
                (command.key().to_string(), reply)
            })
            .collect();
        Ok(replies)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[tokio::test]
    async fn hset_hget_hdel_round_trip() {
        let store = MemoryFastStore::new();
        store.hset("bag", "1", "sword").await.unwrap();
        assert_eq!(store.hget("bag", "1").await.unwrap().as_deref(), Some("sword"));

        assert_eq!(store.hdel("bag", &["1".to_string(), "2".to_string()]).await.unwrap(), 1);
        assert!(store.hget("bag", "1").await.unwrap().is_none());
        assert!(store.is_empty(), "empty hash should be dropped");
    }

    #[tokio::test]
    async fn hget_all_of_missing_key_is_empty() {
        let store = MemoryFastStore::new();
        assert!(store.hget_all("nothing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn expired_bucket_reads_as_missing() {
        let store = MemoryFastStore::new();
        store.hset_multiple("bag", &fields(&[("1", "a")])).await.unwrap();
        assert!(store.pexpire_at("bag", now_millis() - 1).await.unwrap());

        assert!(store.hget_all("bag").await.unwrap().is_empty());
        assert!(!store.pexpire_at("bag", now_millis() + 1000).await.unwrap());
    }

    #[tokio::test]
    async fn pipeline_replies_in_command_order() {
        let store = MemoryFastStore::new();
        store.hset("a", "f", "1").await.unwrap();

        let replies = store
            .execute_pipeline(vec![
                PipelineCommand::HGetAll { key: "a".to_string() },
                PipelineCommand::PTtl { key: "a".to_string() },
                PipelineCommand::PTtl { key: "b".to_string() },
                PipelineCommand::HSet {
                    key: "b".to_string(),
                    fields: fields(&[("x", "1"), ("y", "2")]),
                },
            ])
            .await
            .unwrap();

        assert_eq!(replies.len(), 4);
        assert_eq!(replies[0].0, "a");
        assert!(matches!(&replies[0].1, PipelineReply::Hash(map) if map.len() == 1));
        assert_eq!(replies[1].1, PipelineReply::Int(TTL_PERSISTENT));
        assert_eq!(replies[2].1, PipelineReply::Int(TTL_MISSING));
        assert_eq!(replies[3].1, PipelineReply::Int(2));
        assert_eq!(store.pipeline_count(), 1);
    }

    #[tokio::test]
    async fn ttl_reports_remaining_millis() {
        let store = MemoryFastStore::new();
        store.hset("a", "f", "1").await.unwrap();
        store.pexpire_at("a", now_millis() + 60_000).await.unwrap();
        let ttl = store.ttl("a");
        assert!(ttl > 50_000 && ttl <= 60_000, "ttl was {ttl}");
    }
}
