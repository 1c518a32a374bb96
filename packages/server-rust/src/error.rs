//! Errors surfaced by the delay cache and its configuration.

use wbcache_core::AddressError;

/// Errors returned by cache sources, the delay cache and startup wiring.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("flush of primary key {primary_key} failed after {attempts} attempts: {last_error}")]
    FlushExhausted {
        primary_key: String,
        attempts: u32,
        last_error: String,
    },
    #[error("invalid cache configuration: {0}")]
    Config(String),
    #[error("address error: {0}")]
    Address(#[from] AddressError),
    #[error("drain log write failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("backend error: {0}")]
    Backend(#[from] anyhow::Error),
}
