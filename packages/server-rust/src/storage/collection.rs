//! Read-side aggregates returned by `get_collection`.

use std::collections::HashMap;

use wbcache_core::CacheEntity;

/// Hash field holding the absolute expiry written with
/// [`replace_batch_with_information`](crate::storage::datastores::FastStoreSource::replace_batch_with_information).
pub const EXPIRED_FIELD: &str = "ttl.expired";

/// Hash fields that carry bucket metadata rather than entities.
pub const INFORMATION_FIELDS: &[&str] = &[EXPIRED_FIELD];

/// Which backend a source talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheType {
    /// Fast key/value store.
    Redis,
    /// Durable document store.
    MongoDb,
}

/// Auxiliary record for one primary key's bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheInformation {
    /// Absolute expiry (epoch millis) recorded in the bucket. 0 = none.
    pub expired_time: i64,
    /// Remaining time-to-live reported by the store, if it was queried.
    pub ttl_millis: Option<i64>,
}

impl CacheInformation {
    /// Information with an absolute expiry.
    #[must_use]
    pub fn expiring_at(expired_time: i64) -> Self {
        Self {
            expired_time,
            ttl_millis: None,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.expired_time == 0
    }
}

/// Values of one primary key plus its information record.
#[derive(Debug, Clone)]
pub struct DataCollection<V: CacheEntity> {
    pub values: Vec<V>,
    pub information: CacheInformation,
}

impl<V: CacheEntity> DataCollection<V> {
    #[must_use]
    pub fn new(values: Vec<V>, information: CacheInformation) -> Self {
        Self {
            values,
            information,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Raw fast-store contents of one address, as returned by a pipelined load.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RedisCollection {
    /// Address the fields were read from.
    pub address: String,
    /// Every hash field, information fields included.
    pub fields: HashMap<String, String>,
    /// `PTTL` reply for the address.
    pub ttl_millis: Option<i64>,
}

impl RedisCollection {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Splits the fields into entity payloads and the information record.
    ///
    /// An unparsable expiry field is treated as absent.
    #[must_use]
    pub fn into_payloads(mut self) -> (Vec<String>, CacheInformation) {
        let expired_time = self
            .fields
            .remove(EXPIRED_FIELD)
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0);
        for name in INFORMATION_FIELDS {
            self.fields.remove(*name);
        }
        let information = CacheInformation {
            expired_time,
            ttl_millis: self.ttl_millis,
        };
        (self.fields.into_values().collect(), information)
    }
}
