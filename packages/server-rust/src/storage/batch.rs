//! Splits large apply-lists into backend-sized sub-batches.

use std::future::Future;

use tracing::error;

/// Applies `apply` to trailing sub-lists of `items` of at most `batch_size`
/// elements, last sub-list first.
///
/// `cache_items` is index-aligned with `items`. Whenever a sub-batch
/// returns `Ok(false)` or `Err`, the matching `cache_items` are collected
/// and returned, so callers can retry exactly what failed.
///
/// # Panics
///
/// Panics if the two lists differ in length or `batch_size` is zero. Both
/// are caller bugs.
pub async fn apply_in_batches<T, C, F, Fut>(
    name: &str,
    mut items: Vec<T>,
    mut cache_items: Vec<C>,
    batch_size: usize,
    mut apply: F,
) -> Vec<C>
where
    F: FnMut(Vec<T>) -> Fut,
    Fut: Future<Output = anyhow::Result<bool>>,
{
    assert_eq!(
        items.len(),
        cache_items.len(),
        "{name}: items and cache items must be index-aligned"
    );
    assert!(batch_size > 0, "{name}: batch size must be positive");

    let mut failures = Vec::new();
    while !items.is_empty() {
        let index = (items.len() - 1) / batch_size * batch_size;
        let batch = items.split_off(index);
        let batch_cache_items = cache_items.split_off(index);
        let batch_len = batch.len();
        match apply(batch).await {
            Ok(true) => {}
            Ok(false) => failures.extend(batch_cache_items),
            Err(e) => {
                error!(name, index, batch_len, error = %e, "batch apply failed");
                failures.extend(batch_cache_items);
            }
        }
    }
    failures
}
