//! Write-behind cache server: delay caches, backend sources and scheduling.

pub mod error;
pub mod logging;
pub mod service;
pub mod storage;

#[cfg(test)]
mod test_support;

pub use error::CacheError;
pub use service::{CacheConfig, CacheService, ManagedCache};
pub use storage::{
    CacheSource, DelayWriteSource, DelayedCacheSource, DurableStoreSource, FastStoreSource,
    SourceFactory,
};
