//! Cache lifecycle framework.
//!
//! 1. **Configuration** (`config`): `cache.*` settings shared by every cache
//! 2. **Background workers** (`worker`): periodic flush scheduling
//! 3. **Registry** (`registry`): ordered start, stop and drain of all caches

pub mod config;
pub mod registry;
pub mod worker;

// Re-export key types for convenient access.
pub use config::{CacheConfig, FlushConfig};
pub use registry::{CacheService, ManagedCache, ShutdownReport};
pub use worker::{PeriodicTask, ScheduledWorker};
