//! Backend driver traits.
//!
//! Defines the two physical backends the cache talks to:
//!
//! - [`FastStoreDriver`]: hash buckets with field get/set/delete, absolute
//!   expiry and a pipelined batch executor (Redis-like)
//! - [`DurableStoreDriver`]: document collections with bulk
//!   update-or-insert and bulk delete by query (Mongo-like)
//!
//! Both are used as `Arc<dyn ...>` and shared by every source built from a
//! [`SourceFactory`](super::SourceFactory).

use std::collections::HashMap;

use async_trait::async_trait;
use wbcache_core::{KeyValue, StorageMap};

/// One command inside a fast-store pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineCommand {
    /// Read every field of a hash.
    HGetAll { key: String },
    /// Remaining time-to-live of a key in milliseconds.
    PTtl { key: String },
    /// Set several fields of a hash.
    HSet {
        key: String,
        fields: Vec<(String, String)>,
    },
    /// Delete fields of a hash.
    HDel { key: String, fields: Vec<String> },
    /// Expire a key at an absolute time (epoch millis).
    PExpireAt { key: String, at_millis: i64 },
}

impl PipelineCommand {
    /// Key the command addresses.
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::HGetAll { key }
            | Self::PTtl { key }
            | Self::HSet { key, .. }
            | Self::HDel { key, .. }
            | Self::PExpireAt { key, .. } => key,
        }
    }
}

/// Raw reply to one pipelined command.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineReply {
    /// Field map returned by `HGetAll`.
    Hash(HashMap<String, String>),
    /// Integer reply (`PTtl`, `HDel`, `PExpireAt`, `HSet`).
    Int(i64),
}

/// Fast key/value store with hash buckets.
#[async_trait]
pub trait FastStoreDriver: Send + Sync {
    /// Read one field of a hash.
    async fn hget(&self, key: &str, field: &str) -> anyhow::Result<Option<String>>;

    /// Read every field of a hash. Missing keys yield an empty map.
    async fn hget_all(&self, key: &str) -> anyhow::Result<HashMap<String, String>>;

    /// Set one field of a hash.
    async fn hset(&self, key: &str, field: &str, value: &str) -> anyhow::Result<()>;

    /// Set several fields of a hash at once.
    async fn hset_multiple(&self, key: &str, fields: &[(String, String)]) -> anyhow::Result<()>;

    /// Delete fields of a hash, returning how many existed.
    async fn hdel(&self, key: &str, fields: &[String]) -> anyhow::Result<u64>;

    /// Expire `key` at an absolute time. Returns `false` if the key is missing.
    async fn pexpire_at(&self, key: &str, at_millis: i64) -> anyhow::Result<bool>;

    /// Run `commands` as one round trip.
    ///
    /// Replies come back in command order, each paired with the key it
    /// addressed.
    async fn execute_pipeline(
        &self,
        commands: Vec<PipelineCommand>,
    ) -> anyhow::Result<Vec<(String, PipelineReply)>>;
}

/// Update-or-insert request for one document.
#[derive(Debug, Clone, PartialEq)]
pub struct UpsertModel {
    /// Query selecting the document to replace.
    pub filter: Vec<KeyValue>,
    /// Full replacement document.
    pub document: StorageMap,
}

/// Acknowledgement of a bulk update-or-insert.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BulkUpsertAck {
    /// Documents that matched an existing row.
    pub matched: u64,
    /// Documents inserted because nothing matched.
    pub upserted: u64,
}

impl BulkUpsertAck {
    /// Rows the store acknowledged as written.
    #[must_use]
    pub fn acknowledged(&self) -> u64 {
        self.matched + self.upserted
    }
}

/// Durable document store.
#[async_trait]
pub trait DurableStoreDriver: Send + Sync {
    /// First document in `collection` matching every binding of `filter`.
    async fn find_one(
        &self,
        collection: &str,
        filter: &[KeyValue],
    ) -> anyhow::Result<Option<StorageMap>>;

    /// Every document in `collection` matching `filter`.
    async fn find_all(&self, collection: &str, filter: &[KeyValue])
        -> anyhow::Result<Vec<StorageMap>>;

    /// Update-or-insert each model in one request.
    async fn bulk_upsert(
        &self,
        collection: &str,
        models: Vec<UpsertModel>,
    ) -> anyhow::Result<BulkUpsertAck>;

    /// Delete one document per filter in one request, returning the
    /// number of documents deleted.
    async fn bulk_delete(&self, collection: &str, filters: Vec<Vec<KeyValue>>)
        -> anyhow::Result<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_command_reports_key() {
        let cmd = PipelineCommand::PExpireAt {
            key: "100:1_Bag.v1".to_string(),
            at_millis: 5,
        };
        assert_eq!(cmd.key(), "100:1_Bag.v1");
    }

    #[test]
    fn ack_sums_matched_and_upserted() {
        let ack = BulkUpsertAck {
            matched: 3,
            upserted: 2,
        };
        assert_eq!(ack.acknowledged(), 5);
        assert_eq!(BulkUpsertAck::default().acknowledged(), 0);
    }
}
