//! Write-behind layer over the backend sources.
//!
//! Provides [`DelayedCacheSource`] and the drain-log writer it uses at
//! shutdown.

mod delayed_source;
pub mod drain_log;

pub use delayed_source::DelayedCacheSource;
