//! In-memory backend drivers.
//!
//! Concrete implementations of [`FastStoreDriver`](super::FastStoreDriver)
//! and [`DurableStoreDriver`](super::DurableStoreDriver) that keep all
//! data in process memory.

mod memory_durable;
mod memory_fast;

pub use memory_durable::MemoryDurableStore;
pub use memory_fast::{MemoryFastStore, TTL_MISSING, TTL_PERSISTENT};
