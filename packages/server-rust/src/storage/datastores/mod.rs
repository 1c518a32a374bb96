//! Backend [`CacheSource`](super::CacheSource) implementations.
//!
//! - [`DurableStoreSource`]: document collections, also the write-back
//!   target of the delay cache
//! - [`FastStoreSource`]: hash buckets with pipelined, shared loading
//!   coordinated by a [`SharedLoadCoordinator`]

mod durable_store;
mod fast_store;
mod shared_load;

pub use durable_store::{DurableStoreSource, SHARED_ID_FIELD};
pub use fast_store::{FastStoreSource, BITS_FIELD};
pub use shared_load::SharedLoadCoordinator;
