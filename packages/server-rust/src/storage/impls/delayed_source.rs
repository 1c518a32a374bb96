//! Write-behind layer over a [`DelayWriteSource`].
//!
//! [`DelayedCacheSource`] buffers upserts and deletes per primary key and
//! returns immediately. A [`ScheduledWorker`] periodically flushes buffers
//! whose delay expired, plus the latest-expiring ones once more than
//! `cache.maximumCount` keys are waiting. Commands the backend does not
//! acknowledge are rolled back into a fresh buffer with a randomized
//! 1-5 s backoff.
//!
//! Per primary key the state is absent, buffered, flushing, then absent
//! again or buffered with backoff. A buffer is removed from the map before
//! it is flushed, so writers racing a flush start a new buffer. At most one
//! flush per primary key is in flight; the newer buffer waits for it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use metrics::{counter, gauge};
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use wbcache_core::{CacheEntity, CacheKey, UniqueAddress};

use super::drain_log::{drain_dir, write_drain_log};
use crate::error::CacheError;
use crate::service::config::CacheConfig;
use crate::service::worker::{PeriodicTask, ScheduledWorker};
use crate::storage::collection::DataCollection;
use crate::storage::delay_cache::PrimaryDelayCache;
use crate::storage::now_millis;
use crate::storage::source::DelayWriteSource;

/// Backoff range in milliseconds for buffers re-created by a rollback.
const ROLLBACK_DELAY_MILLIS: std::ops::RangeInclusive<i64> = 1_000..=5_000;

/// Pause range in milliseconds between synchronous flush attempts.
const RETRY_PAUSE_MILLIS: std::ops::RangeInclusive<u64> = 50..=200;

/// Pause between whole-map attempts of a drain.
const DRAIN_PAUSE: Duration = Duration::from_millis(500);

struct DelayedInner<PK: CacheKey, V: CacheEntity> {
    source: Arc<dyn DelayWriteSource<PK, V>>,
    caches: DashMap<PK, PrimaryDelayCache<PK, V>>,
    /// Primary keys whose taken buffer has not finished flushing.
    ///
    /// Marked while the `caches` entry of the key is locked, so a key is
    /// always either buffered, in flight, or settled.
    in_flight: DashMap<PK, usize>,
    /// Signalled whenever a flush releases its keys.
    flushed: Notify,
    config: Arc<CacheConfig>,
    name: String,
}

/// Outcome of claiming one primary key's buffer.
enum Claim<PK, V: CacheEntity> {
    /// An earlier flush of the key is still running.
    Busy,
    /// Nothing in flight; the buffer, if any, now belongs to the caller.
    Idle(Option<PrimaryDelayCache<PK, V>>),
}

/// Releases the in-flight marks of a batch once its flush ends, rollback
/// included.
struct InFlightGuard<'a, PK: CacheKey, V: CacheEntity> {
    inner: &'a DelayedInner<PK, V>,
    keys: Vec<PK>,
}

impl<PK: CacheKey, V: CacheEntity> Drop for InFlightGuard<'_, PK, V> {
    fn drop(&mut self) {
        for key in &self.keys {
            if let Entry::Occupied(mut entry) = self.inner.in_flight.entry(key.clone()) {
                if *entry.get() <= 1 {
                    entry.remove();
                } else {
                    *entry.get_mut() -= 1;
                }
            }
        }
        self.inner.flushed.notify_waiters();
    }
}

impl<PK: CacheKey, V: CacheEntity> DelayedInner<PK, V> {
    fn key_string(&self, primary_key: &PK) -> String {
        self.source.key_builder().primary_key_string(primary_key)
    }

    fn buffer(&self, primary_key: &PK, apply: impl FnOnce(&mut PrimaryDelayCache<PK, V>)) {
        let expired_time = now_millis() + self.config.flush.delay_millis;
        let mut cache = self
            .caches
            .entry(primary_key.clone())
            .or_insert_with(|| PrimaryDelayCache::new(primary_key.clone(), expired_time));
        apply(&mut cache);
    }

    /// Takes the buffer of `primary_key` unless a flush of it is in flight.
    ///
    /// A taken non-empty buffer is marked in flight and must be handed to
    /// [`flush_batch`](Self::flush_batch).
    fn claim(&self, primary_key: &PK) -> Claim<PK, V> {
        match self.caches.entry(primary_key.clone()) {
            Entry::Occupied(entry) => {
                if self.in_flight.contains_key(primary_key) {
                    return Claim::Busy;
                }
                if entry.get().is_empty() {
                    entry.remove();
                    return Claim::Idle(None);
                }
                // Mark before the entry lock is released.
                *self.in_flight.entry(primary_key.clone()).or_insert(0) += 1;
                Claim::Idle(Some(entry.remove()))
            }
            Entry::Vacant(_vacant) => {
                if self.in_flight.contains_key(primary_key) {
                    Claim::Busy
                } else {
                    Claim::Idle(None)
                }
            }
        }
    }

    /// Removes `keys` from the map, dropping empty buffers. Keys with a
    /// flush in flight stay buffered for a later pass.
    fn take_buffers(&self, keys: impl IntoIterator<Item = PK>) -> Vec<PrimaryDelayCache<PK, V>> {
        keys.into_iter()
            .filter_map(|key| match self.claim(&key) {
                Claim::Idle(cache) => cache,
                Claim::Busy => None,
            })
            .collect()
    }

    /// Waits until no flush of `primary_key` is in flight, then takes its
    /// buffer.
    async fn claim_settled(&self, primary_key: &PK) -> Option<PrimaryDelayCache<PK, V>> {
        loop {
            let notified = self.flushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            match self.claim(primary_key) {
                Claim::Idle(cache) => return cache,
                Claim::Busy => notified.await,
            }
        }
    }

    /// Waits until no flush of any key is in flight.
    async fn settle(&self) {
        loop {
            let notified = self.flushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.in_flight.is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// Writes `batch` back and rolls failed commands into the map.
    ///
    /// Every key that failed in this batch gets the same backoff, drawn once
    /// from 1-5 s, so a failed batch is retried together.
    ///
    /// Returns `true` when every command was acknowledged.
    async fn flush_batch(&self, batch: Vec<PrimaryDelayCache<PK, V>>) -> bool {
        if batch.is_empty() {
            return true;
        }
        let _guard = InFlightGuard {
            inner: self,
            keys: batch.iter().map(|cache| cache.primary_key().clone()).collect(),
        };
        let keys = batch.len();
        debug!(entity = %self.name, keys, "flushing delay cache batch");
        counter!("wbcache_flush_total", "entity" => self.name.clone()).increment(keys as u64);

        let failures = self.source.write_back(batch).await;
        if failures.is_empty() {
            return true;
        }

        let expired_time = now_millis() + rand::rng().random_range(ROLLBACK_DELAY_MILLIS);
        let failed_keys = failures.len();
        let mut failed_commands = 0;
        for (primary_key, commands) in failures {
            failed_commands += commands.len();
            let mut cache = self
                .caches
                .entry(primary_key.clone())
                .or_insert_with(|| PrimaryDelayCache::new(primary_key, expired_time));
            cache.rollback_all(commands);
        }
        counter!("wbcache_flush_failed_total", "entity" => self.name.clone())
            .increment(failed_keys as u64);
        counter!("wbcache_rollback_commands_total", "entity" => self.name.clone())
            .increment(failed_commands as u64);
        error!(
            entity = %self.name,
            keys = failed_keys,
            commands = failed_commands,
            "flush not acknowledged, commands rolled back"
        );
        false
    }

    /// Flushes the buffer of one key once any earlier flush of it has
    /// finished. An absent buffer counts as flushed.
    ///
    /// `true` means every command buffered for the key before the call has
    /// been acknowledged by the backend.
    async fn flush_key(self: Arc<Self>, primary_key: PK) -> bool {
        let batch: Vec<_> = self.claim_settled(&primary_key).await.into_iter().collect();
        self.flush_batch(batch).await
    }

    async fn on_schedule(&self, now: i64) -> usize {
        if self.caches.is_empty() {
            return 0;
        }
        let mut selected = Vec::new();
        let mut waiting = Vec::new();
        for entry in self.caches.iter() {
            let cache = entry.value();
            if cache.is_empty() {
                continue;
            }
            if cache.is_expired(now) {
                selected.push(entry.key().clone());
            } else {
                waiting.push((entry.key().clone(), cache.expired_time()));
            }
        }

        let maximum = self.config.maximum_count;
        if waiting.len() > maximum {
            waiting.sort_by_key(|(_, expired_time)| *expired_time);
            selected.extend(waiting.drain(maximum..).map(|(key, _)| key));
        }

        let batch = self.take_buffers(selected);
        let flushed = batch.len();
        self.flush_batch(batch).await;
        #[allow(clippy::cast_precision_loss)]
        gauge!("wbcache_buffered_keys", "entity" => self.name.clone())
            .set(self.caches.len() as f64);
        flushed
    }
}

#[async_trait]
impl<PK: CacheKey, V: CacheEntity> PeriodicTask for DelayedInner<PK, V> {
    fn task_name(&self) -> &str {
        &self.name
    }

    async fn on_tick(&self) {
        self.on_schedule(now_millis()).await;
    }
}

/// Write-behind cache for one entity type.
///
/// Mutations are buffered and never fail. Reads go straight to the backend,
/// except [`get_collection`](Self::get_collection) which first flushes the
/// key so the backend reflects every buffered command.
pub struct DelayedCacheSource<PK: CacheKey, V: CacheEntity> {
    inner: Arc<DelayedInner<PK, V>>,
    worker: Mutex<Option<ScheduledWorker>>,
}

impl<PK: CacheKey, V: CacheEntity> DelayedCacheSource<PK, V> {
    /// Wraps `source`. The scheduler is not running until [`start`](Self::start).
    #[must_use]
    pub fn new(source: Arc<dyn DelayWriteSource<PK, V>>, config: Arc<CacheConfig>) -> Self {
        let name = source.name().to_string();
        Self {
            inner: Arc::new(DelayedInner {
                source,
                caches: DashMap::new(),
                in_flight: DashMap::new(),
                flushed: Notify::new(),
                config,
                name,
            }),
            worker: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    #[must_use]
    pub fn address(&self) -> &Arc<UniqueAddress> {
        self.inner.source.address()
    }

    /// The backend this cache writes to.
    #[must_use]
    pub fn source(&self) -> &Arc<dyn DelayWriteSource<PK, V>> {
        &self.inner.source
    }

    /// Number of primary keys with buffered commands.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.caches.len()
    }

    #[must_use]
    pub fn is_buffered(&self, primary_key: &PK) -> bool {
        self.inner.caches.contains_key(primary_key)
    }

    /// Expiry of `primary_key`'s buffer, if one exists.
    #[must_use]
    pub fn expired_time(&self, primary_key: &PK) -> Option<i64> {
        self.inner
            .caches
            .get(primary_key)
            .map(|cache| cache.expired_time())
    }

    /// Buffered commands of `primary_key`, if any.
    #[must_use]
    pub fn buffered(&self, primary_key: &PK) -> Option<PrimaryDelayCache<PK, V>> {
        self.inner.caches.get(primary_key).map(|cache| cache.clone())
    }

    pub fn replace_one(&self, primary_key: &PK, value: &V) {
        self.inner
            .buffer(primary_key, |cache| cache.upsert(value.clone()));
    }

    pub fn replace_batch(&self, primary_key: &PK, values: &[V]) {
        self.inner.buffer(primary_key, |cache| {
            for value in values {
                cache.upsert(value.clone());
            }
        });
    }

    pub fn delete_one(&self, primary_key: &PK, secondary_key: &V::Key) {
        self.inner
            .buffer(primary_key, |cache| cache.delete(secondary_key.clone()));
    }

    pub fn delete_batch(&self, primary_key: &PK, secondary_keys: &[V::Key]) {
        self.inner.buffer(primary_key, |cache| {
            for key in secondary_keys {
                cache.delete(key.clone());
            }
        });
    }

    /// Reads one entity from the backend.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Backend`] if the backend read fails.
    pub async fn get(
        &self,
        primary_key: &PK,
        secondary_key: &V::Key,
    ) -> Result<Option<V>, CacheError> {
        Ok(self.inner.source.get(primary_key, secondary_key).await?)
    }

    /// Reads every entity of `primary_key` from the backend.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Backend`] if the backend read fails.
    pub async fn get_all(&self, primary_key: &PK) -> Result<Vec<V>, CacheError> {
        Ok(self.inner.source.get_all(primary_key).await?)
    }

    /// Flushes `primary_key`, then reads its collection from the backend.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::FlushExhausted`] if the flush never succeeds,
    /// or [`CacheError::Backend`] if the read fails.
    pub async fn get_collection(&self, primary_key: &PK) -> Result<DataCollection<V>, CacheError> {
        self.flush_one(primary_key).await?;
        Ok(self.inner.source.get_collection(primary_key).await?)
    }

    /// Runs one scheduler pass as of `now` and returns how many primary
    /// keys were flushed.
    pub async fn on_schedule(&self, now: i64) -> usize {
        self.inner.on_schedule(now).await
    }

    /// Flushes `primary_key` now, retrying up to `cache.flush.tryOneCount`
    /// times with each attempt bounded by `cache.flush.timeOut`.
    ///
    /// A timed-out attempt keeps running in the background; its commands are
    /// either persisted or rolled back like any other flush. The next
    /// attempt waits for it before flushing, so success always means the
    /// backend holds every command buffered before the call.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::FlushExhausted`] with the last failure once
    /// every attempt failed.
    pub async fn flush_one(&self, primary_key: &PK) -> Result<(), CacheError> {
        let attempts = self.inner.config.flush.try_one_count.max(1);
        let timeout = self.inner.config.flush_timeout();
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            let task = tokio::spawn(Arc::clone(&self.inner).flush_key(primary_key.clone()));
            last_error = match tokio::time::timeout(timeout, task).await {
                Ok(Ok(true)) => return Ok(()),
                Ok(Ok(false)) => "backend did not acknowledge every command".to_string(),
                Ok(Err(join_error)) => join_error.to_string(),
                Err(_) => format!("timed out after {}ms", timeout.as_millis()),
            };
            warn!(
                entity = %self.inner.name,
                primary_key = %self.inner.key_string(primary_key),
                attempt,
                error = %last_error,
                "flush attempt failed"
            );
            if attempt < attempts {
                let pause = rand::rng().random_range(RETRY_PAUSE_MILLIS);
                tokio::time::sleep(Duration::from_millis(pause)).await;
            }
        }

        Err(CacheError::FlushExhausted {
            primary_key: self.inner.key_string(primary_key),
            attempts,
            last_error,
        })
    }

    /// Flushes `primary_key` in the background and hands the outcome to
    /// `callback`. Does not wait for the flush.
    pub fn flush_one_with<F>(&self, primary_key: &PK, callback: F) -> JoinHandle<()>
    where
        F: FnOnce(bool) + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let primary_key = primary_key.clone();
        tokio::spawn(async move {
            let flushed = inner.flush_key(primary_key).await;
            callback(flushed);
        })
    }

    /// Drains every buffer, ignoring expiry. Used at shutdown.
    ///
    /// Buffered commands are first written to a drain log under
    /// `<cache.flush.logPath>_<current_time>`. Then up to
    /// `max(2, cache.flush.tryAllCount)` whole-map flushes are attempted.
    /// Returns the primary keys still buffered afterwards; their commands
    /// are reported as lost.
    pub async fn flush_all(&self, current_time: i64) -> Vec<PK> {
        let inner = &self.inner;
        let snapshot: Vec<PrimaryDelayCache<PK, V>> = inner
            .caches
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        if !snapshot.is_empty() {
            let dir = drain_dir(&inner.config.flush.log_path, current_time);
            match write_drain_log(&dir, self.address(), inner.source.key_builder(), &snapshot) {
                Ok(files) => {
                    info!(entity = %inner.name, files, dir = %dir.display(), "wrote drain log");
                }
                Err(e) => {
                    error!(entity = %inner.name, dir = %dir.display(), error = %e, "drain log write failed");
                }
            }
        }

        let attempts = inner.config.drain_attempts();
        for attempt in 1..=attempts {
            inner.settle().await;
            if inner.caches.is_empty() {
                break;
            }
            let keys: Vec<PK> = inner.caches.iter().map(|entry| entry.key().clone()).collect();
            let batch = inner.take_buffers(keys);
            if inner.flush_batch(batch).await {
                break;
            }
            if attempt < attempts {
                tokio::time::sleep(DRAIN_PAUSE).await;
            }
        }

        let remaining: Vec<PK> = inner.caches.iter().map(|entry| entry.key().clone()).collect();
        for primary_key in &remaining {
            error!(
                entity = %inner.name,
                primary_key = %inner.key_string(primary_key),
                "drain left commands unpersisted, data lost"
            );
        }
        if !remaining.is_empty() {
            counter!("wbcache_data_loss_total", "entity" => inner.name.clone())
                .increment(remaining.len() as u64);
        }
        remaining
    }

    /// Starts the background scheduler. A running scheduler is left as is.
    pub fn start(&self) {
        let mut worker = self.worker.lock();
        if worker.as_ref().is_some_and(ScheduledWorker::is_running) {
            return;
        }
        let config = &self.inner.config;
        *worker = Some(ScheduledWorker::start(
            Arc::clone(&self.inner),
            config.initial_delay(),
            config.period(),
        ));
    }

    /// Stops the background scheduler, waiting for an in-flight pass.
    pub async fn stop(&self) {
        let worker = self.worker.lock().take();
        if let Some(mut worker) = worker {
            worker.stop().await;
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .as_ref()
            .is_some_and(ScheduledWorker::is_running)
    }
}
