//! Per-primary-key buffer of pending commands.

use std::collections::BTreeMap;

use wbcache_core::{CacheEntity, CacheKey};

use super::command::PendingCommand;

/// Pending commands for one primary key plus the time the buffer becomes
/// eligible for a scheduled flush.
///
/// Holds at most one command per secondary key: a later command replaces
/// the earlier one, whatever their kinds.
#[derive(Debug, Clone)]
pub struct PrimaryDelayCache<PK, V: CacheEntity> {
    primary_key: PK,
    entries: BTreeMap<V::Key, PendingCommand<V>>,
    expired_time: i64,
}

impl<PK: CacheKey, V: CacheEntity> PrimaryDelayCache<PK, V> {
    /// Creates an empty buffer eligible for flush at `expired_time` (epoch millis).
    #[must_use]
    pub fn new(primary_key: PK, expired_time: i64) -> Self {
        Self {
            primary_key,
            entries: BTreeMap::new(),
            expired_time,
        }
    }

    #[must_use]
    pub fn primary_key(&self) -> &PK {
        &self.primary_key
    }

    #[must_use]
    pub fn expired_time(&self) -> i64 {
        self.expired_time
    }

    /// Whether the buffer is eligible for a scheduled flush at `now`.
    #[must_use]
    pub fn is_expired(&self, now: i64) -> bool {
        now >= self.expired_time
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Buffers `command`, replacing any command for the same secondary key.
    pub fn add(&mut self, command: PendingCommand<V>) {
        self.entries.insert(command.key().clone(), command);
    }

    pub fn upsert(&mut self, value: V) {
        self.add(PendingCommand::upsert(value));
    }

    pub fn delete(&mut self, key: V::Key) {
        self.add(PendingCommand::delete(key));
    }

    /// Re-buffers commands from a failed flush.
    ///
    /// A command already present for the same secondary key was issued
    /// after the failed one and is kept. Returns how many commands were
    /// re-inserted.
    pub fn rollback_all(&mut self, commands: impl IntoIterator<Item = PendingCommand<V>>) -> usize {
        let mut restored = 0;
        for command in commands {
            if !self.entries.contains_key(command.key()) {
                self.entries.insert(command.key().clone(), command);
                restored += 1;
            }
        }
        restored
    }

    #[must_use]
    pub fn get(&self, key: &V::Key) -> Option<&PendingCommand<V>> {
        self.entries.get(key)
    }

    /// Commands in secondary-key order.
    pub fn commands(&self) -> impl Iterator<Item = &PendingCommand<V>> {
        self.entries.values()
    }

    /// Consumes the buffer, returning its primary key and commands.
    #[must_use]
    pub fn into_parts(self) -> (PK, Vec<PendingCommand<V>>) {
        (self.primary_key, self.entries.into_values().collect())
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::storage::command::CacheCommand;
    use crate::test_support::Item;

    #[test]
    fn later_command_replaces_earlier() {
        let mut cache: PrimaryDelayCache<i64, Item> = PrimaryDelayCache::new(1, 0);
        cache.upsert(Item::new(5, 10));
        cache.delete(5);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&5).unwrap().command(), CacheCommand::Delete);

        cache.upsert(Item::new(5, 11));
        let pending = cache.get(&5).unwrap();
        assert_eq!(pending.command(), CacheCommand::Upsert);
        assert_eq!(pending.value().unwrap().count, 11);
    }

    #[test]
    fn rollback_keeps_newer_commands() {
        let mut failed: PrimaryDelayCache<i64, Item> = PrimaryDelayCache::new(1, 0);
        failed.upsert(Item::new(1, 1));
        failed.upsert(Item::new(2, 2));
        let (_, commands) = failed.into_parts();

        let mut fresh: PrimaryDelayCache<i64, Item> = PrimaryDelayCache::new(1, 100);
        fresh.delete(2);
        assert_eq!(fresh.rollback_all(commands), 1);

        assert_eq!(fresh.len(), 2);
        assert_eq!(fresh.get(&1).unwrap().command(), CacheCommand::Upsert);
        assert_eq!(fresh.get(&2).unwrap().command(), CacheCommand::Delete);
        assert_eq!(fresh.expired_time(), 100);
    }

    #[test]
    fn expiry_is_inclusive() {
        let cache: PrimaryDelayCache<i64, Item> = PrimaryDelayCache::new(1, 1_000);
        assert!(!cache.is_expired(999));
        assert!(cache.is_expired(1_000));
        assert!(cache.is_expired(1_001));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Upsert(i64),
        Delete,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![any::<i64>().prop_map(Op::Upsert), Just(Op::Delete)]
    }

    proptest! {
        #[test]
        fn buffered_state_equals_last_command(ops in prop::collection::vec(op(), 1..40)) {
            let mut cache: PrimaryDelayCache<i64, Item> = PrimaryDelayCache::new(9, 0);
            for op in &ops {
                match op {
                    Op::Upsert(count) => cache.upsert(Item::new(3, *count)),
                    Op::Delete => cache.delete(3),
                }
            }
            prop_assert_eq!(cache.len(), 1);
            let pending = cache.get(&3).unwrap();
            match ops.last().unwrap() {
                Op::Upsert(count) => {
                    prop_assert_eq!(pending.command(), CacheCommand::Upsert);
                    prop_assert_eq!(pending.value().unwrap().count, *count);
                }
                Op::Delete => {
                    prop_assert!(pending.is_delete());
                    prop_assert!(pending.value().is_none());
                }
            }
        }
    }
}
