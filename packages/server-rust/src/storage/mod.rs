//! Storage system for the write-behind cache.
//!
//! Provides the trait hierarchy and shared types for the three storage
//! layers:
//!
//! - **Drivers** ([`FastStoreDriver`], [`DurableStoreDriver`]): physical
//!   backends, with in-memory implementations in [`engines`]
//! - **Sources** ([`CacheSource`], [`DelayWriteSource`]): one entity type
//!   against one backend, implemented in [`datastores`]
//! - **Delay cache** ([`DelayedCacheSource`]): buffered mutations flushed
//!   to a [`DelayWriteSource`] in the background
//!
//! [`SourceFactory`] wires all three from shared drivers.

pub mod batch;
pub mod collection;
pub mod command;
pub mod datastores;
pub mod delay_cache;
pub mod driver;
pub mod engines;
pub mod factory;
pub mod impls;
pub mod source;

use std::time::{SystemTime, UNIX_EPOCH};

pub use batch::apply_in_batches;
pub use collection::*;
pub use command::*;
pub use datastores::{DurableStoreSource, FastStoreSource, SharedLoadCoordinator};
pub use delay_cache::PrimaryDelayCache;
pub use driver::*;
pub use factory::SourceFactory;
pub use impls::DelayedCacheSource;
pub use source::*;

/// Returns the current wall-clock time as milliseconds since the Unix epoch.
///
/// Millisecond timestamps fit comfortably in i64 until the year 292 million.
#[allow(clippy::cast_possible_truncation)]
#[must_use]
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
