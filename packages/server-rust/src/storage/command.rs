//! Pending commands buffered by the delay cache.

use std::fmt;

use wbcache_core::CacheEntity;

/// Kind of a buffered mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheCommand {
    /// Insert or replace the entity.
    Upsert,
    /// Remove the entity.
    Delete,
}

impl CacheCommand {
    /// Upper-case name used in drain logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Upsert => "UPSERT",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for CacheCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One buffered mutation for a secondary key.
///
/// `value` is present for [`CacheCommand::Upsert`] and absent for
/// [`CacheCommand::Delete`]; the constructors keep that pairing.
#[derive(Debug, Clone)]
pub struct PendingCommand<V: CacheEntity> {
    key: V::Key,
    command: CacheCommand,
    value: Option<V>,
}

impl<V: CacheEntity> PendingCommand<V> {
    /// Upsert of `value` under its own secondary key.
    #[must_use]
    pub fn upsert(value: V) -> Self {
        Self {
            key: value.secondary_key(),
            command: CacheCommand::Upsert,
            value: Some(value),
        }
    }

    #[must_use]
    pub fn delete(key: V::Key) -> Self {
        Self {
            key,
            command: CacheCommand::Delete,
            value: None,
        }
    }

    #[must_use]
    pub fn key(&self) -> &V::Key {
        &self.key
    }

    #[must_use]
    pub fn command(&self) -> CacheCommand {
        self.command
    }

    #[must_use]
    pub fn value(&self) -> Option<&V> {
        self.value.as_ref()
    }

    #[must_use]
    pub fn is_delete(&self) -> bool {
        self.command == CacheCommand::Delete
    }

    /// Splits into key and value. The value is `None` for deletes.
    #[must_use]
    pub fn into_parts(self) -> (V::Key, Option<V>) {
        (self.key, self.value)
    }
}
