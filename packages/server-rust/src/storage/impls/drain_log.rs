//! Emergency drain log.
//!
//! Before a shutdown drain attempts its final flushes, every buffered
//! primary key is written to `<logPath>_<time>/<address>.cache` so pending
//! commands can be replayed by hand if the backend never acknowledges them.
//!
//! File layout:
//!
//! ```text
//! primaryKey:<pk>
//! key:<sk>\tcommand:<UPSERT|DELETE>\tdata:<json>
//! ```

use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::error;
use wbcache_core::{CacheEntity, CacheKey, KeyValueBuilder, UniqueAddress};

use crate::storage::delay_cache::PrimaryDelayCache;

/// Directory for a drain started at `current_time`.
#[must_use]
pub fn drain_dir(log_path: &Path, current_time: i64) -> PathBuf {
    let mut dir = log_path.as_os_str().to_owned();
    dir.push(format!("_{current_time}"));
    PathBuf::from(dir)
}

/// Renders one buffer in drain-log format.
#[must_use]
pub fn render<PK: CacheKey, V: CacheEntity>(
    key_builder: &KeyValueBuilder<PK, V::Key>,
    cache: &PrimaryDelayCache<PK, V>,
) -> String {
    let mut out = format!(
        "primaryKey:{}\n",
        key_builder.primary_key_string(cache.primary_key())
    );
    for command in cache.commands() {
        let data = command.value().map_or_else(
            || "null".to_string(),
            |value| {
                serde_json::to_string(&value.to_storage()).unwrap_or_else(|e| format!("<{e}>"))
            },
        );
        let _ = writeln!(
            out,
            "key:{}\tcommand:{}\tdata:{data}",
            key_builder.secondary_key_string(command.key()),
            command.command(),
        );
    }
    out
}

/// Writes one `.cache` file per buffer into `dir`, creating it if needed.
///
/// A file that cannot be written is logged and skipped; the remaining
/// buffers are still written. Returns the number of files written.
///
/// # Errors
///
/// Returns an error only if `dir` cannot be created.
pub fn write_drain_log<'a, PK: CacheKey, V: CacheEntity>(
    dir: &Path,
    address: &UniqueAddress,
    key_builder: &KeyValueBuilder<PK, V::Key>,
    caches: impl IntoIterator<Item = &'a PrimaryDelayCache<PK, V>>,
) -> io::Result<usize> {
    fs::create_dir_all(dir)?;
    let mut written = 0;
    for cache in caches {
        let primary_key = key_builder.primary_key_string(cache.primary_key());
        let path = dir.join(format!("{}.cache", address.address_for(&primary_key)));
        match fs::write(&path, render(key_builder, cache)) {
            Ok(()) => written += 1,
            Err(e) => {
                error!(
                    entity = address.name(),
                    primary_key = %primary_key,
                    path = %path.display(),
                    error = %e,
                    "drain log file write failed"
                );
            }
        }
    }
    Ok(written)
}
