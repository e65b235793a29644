//! Query cache with stale-while-revalidate reads and a durable snapshot.
//!
//! Per key the entry moves `Empty -> Fetching -> Fresh -> Stale`, then either
//! back to `Fetching` on the next read or out of the map once it is older
//! than the garbage-collection window. A settled fetch (success or failure)
//! rewrites the durable snapshot.

use chrono::{DateTime, Duration, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::{CacheError, Result};
use crate::key::QueryKey;
use crate::retry::{with_retry, RetryPolicy};
use crate::snapshot::{has_content, PersistedEntry, Snapshot};
use crate::store::{DurableStore, MemoryStore};

type FetchError = Arc<dyn std::error::Error + Send + Sync>;
type Fetcher = Arc<dyn Fn() -> BoxFuture<'static, std::result::Result<Value, FetchError>> + Send + Sync>;
type SharedFetch = Shared<BoxFuture<'static, Result<(Value, DateTime<Utc>)>>>;

/// Knobs for a [`QueryCache`]
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Age after which a cached value is served but refreshed in the background
    pub stale_time: Duration,
    /// Age after which a cached value is dropped
    pub gc_time: Duration,
    /// How often the janitor sweeps for expired entries
    pub gc_interval: std::time::Duration,
    pub retry: RetryPolicy,
    /// Mirror settled entries into durable storage
    pub persist: bool,
    /// Snapshots older than this are ignored on start
    pub persist_max_age: Duration,
    pub storage_key: String,
    pub buster: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            stale_time: Duration::minutes(5),
            gc_time: Duration::minutes(30),
            gc_interval: std::time::Duration::from_secs(60),
            retry: RetryPolicy::default(),
            persist: true,
            persist_max_age: Duration::hours(24),
            storage_key: "tradepost.query-cache".to_string(),
            buster: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
    Fetching,
    Success,
    Error,
}

/// Observable lifecycle state of a key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Empty,
    Fetching,
    Fresh,
    Stale,
    Errored,
    Evicted,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub data: Option<Value>,
    pub fetched_at: Option<DateTime<Utc>>,
    pub status: QueryStatus,
    /// Message of the last failed fetch
    pub error: Option<String>,
    pub error_count: u32,
    pub is_invalidated: bool,
    /// Last time the entry was created or settled
    pub updated_at: DateTime<Utc>,
}

impl CacheEntry {
    fn empty(now: DateTime<Utc>) -> Self {
        Self {
            data: None,
            fetched_at: None,
            status: QueryStatus::Fetching,
            error: None,
            error_count: 0,
            is_invalidated: false,
            updated_at: now,
        }
    }

    fn success(data: Value, fetched_at: DateTime<Utc>) -> Self {
        Self {
            data: Some(data),
            fetched_at: Some(fetched_at),
            status: QueryStatus::Success,
            error: None,
            error_count: 0,
            is_invalidated: false,
            updated_at: fetched_at,
        }
    }

    /// Worth writing to durable storage: settled, successful, non-empty
    pub fn is_persistable(&self) -> bool {
        self.status == QueryStatus::Success
            && self.fetched_at.is_some()
            && self.data.as_ref().map(has_content).unwrap_or(false)
    }
}

/// Where a read was served from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
    /// Fetched by this read (or a concurrent identical one)
    Network,
    /// Cached and within the staleness window
    Fresh,
    /// Cached past the staleness window; a refresh is running
    Stale,
}

#[derive(Debug, Clone)]
pub struct CacheResult<T> {
    pub data: T,
    pub source: CacheSource,
    pub fetched_at: DateTime<Utc>,
}

struct Slot {
    entry: CacheEntry,
    in_flight: Option<SharedFetch>,
    generation: u64,
}

enum Action {
    Hit(Value, DateTime<Utc>, CacheSource),
    Wait(SharedFetch),
}

struct Inner {
    config: CacheConfig,
    store: Arc<dyn DurableStore>,
    clock: Arc<dyn Clock>,
    slots: Mutex<HashMap<QueryKey, Slot>>,
    generation: AtomicU64,
    janitor: Mutex<Option<JoinHandle<()>>>,
    /// Held while a snapshot is built and written
    snapshot_lock: Mutex<()>,
    /// Set by teardown; no snapshot is written afterwards
    closed: AtomicBool,
}

/// Client-side cache of query results
///
/// Cloning is cheap; clones share the same entries.
#[derive(Clone)]
pub struct QueryCache {
    inner: Arc<Inner>,
}

impl QueryCache {
    /// Build a cache, restore the durable snapshot and start the janitor
    ///
    /// The janitor only runs when called inside a tokio runtime.
    pub fn init(config: CacheConfig, store: Arc<dyn DurableStore>, clock: Arc<dyn Clock>) -> Self {
        let cache = Self {
            inner: Arc::new(Inner {
                config,
                store,
                clock,
                slots: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
                janitor: Mutex::new(None),
                snapshot_lock: Mutex::new(()),
                closed: AtomicBool::new(false),
            }),
        };

        if cache.inner.config.persist {
            match cache.inner.restore() {
                Ok(restored) => debug!("Restored {} cached queries", restored),
                Err(e) => warn!("Could not restore cache snapshot: {}", e),
            }
        }

        cache.start_janitor();
        cache
    }

    /// Non-persistent cache on the wall clock
    pub fn in_memory(config: CacheConfig) -> Self {
        let config = CacheConfig {
            persist: false,
            ..config
        };
        Self::init(config, Arc::new(MemoryStore::new()), Arc::new(SystemClock))
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Write a final snapshot, stop the janitor and drop every entry
    ///
    /// Fetches still in flight afterwards settle without touching storage.
    /// Call [`QueryCache::wait_idle`] first to keep their results.
    pub fn teardown(&self) {
        if let Some(handle) = self.inner.lock_janitor().take() {
            handle.abort();
        }

        if let Err(e) = self.inner.close() {
            warn!("Final cache snapshot failed: {}", e);
        }

        let dropped = {
            let mut slots = self.inner.lock_slots();
            let count = slots.len();
            slots.clear();
            count
        };
        info!("Cache torn down, dropped {} entries", dropped);
    }

    /// Read `key`, fetching through `fetcher` when needed
    ///
    /// - fresh entry: served from memory
    /// - stale entry: served from memory, refreshed in the background
    /// - missing, errored or expired entry: fetched (with retries) and awaited
    ///
    /// Identical concurrent reads share one in-flight fetch.
    pub async fn fetch<F, Fut, E>(&self, key: QueryKey, fetcher: F) -> Result<CacheResult<Value>>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Value, E>> + Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        let fetcher: Fetcher = Arc::new(move || {
            let fut = fetcher();
            async move { fut.await.map_err(|e| Arc::new(e) as FetchError) }.boxed()
        });
        self.fetch_erased(key, fetcher).await
    }

    /// Typed wrapper around [`QueryCache::fetch`]
    pub async fn fetch_typed<T, F, Fut, E>(&self, key: QueryKey, fetcher: F) -> Result<CacheResult<T>>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        let fetcher: Fetcher = Arc::new(move || {
            let fut = fetcher();
            async move {
                let value = fut.await.map_err(|e| Arc::new(e) as FetchError)?;
                serde_json::to_value(value).map_err(|e| Arc::new(e) as FetchError)
            }
            .boxed()
        });

        let result = self.fetch_erased(key, fetcher).await?;
        Ok(CacheResult {
            data: serde_json::from_value(result.data)?,
            source: result.source,
            fetched_at: result.fetched_at,
        })
    }

    async fn fetch_erased(&self, key: QueryKey, fetcher: Fetcher) -> Result<CacheResult<Value>> {
        let now = self.inner.clock.now();

        let action = {
            let mut slots = self.inner.lock_slots();
            self.inner.evict_if_expired(&mut slots, &key, now);

            let existing = slots.get(&key).map(|slot| {
                (
                    self.inner.state_of(&slot.entry, now),
                    slot.entry.data.clone(),
                    slot.entry.fetched_at,
                    slot.in_flight.clone(),
                )
            });

            match existing {
                Some((EntryState::Fresh, Some(data), Some(fetched_at), _)) => {
                    debug!("Cache hit for {}", key);
                    Action::Hit(data, fetched_at, CacheSource::Fresh)
                }
                Some((EntryState::Stale, Some(data), Some(fetched_at), _)) => {
                    debug!("Serving stale {} while refreshing", key);
                    let _refresh = self.inner.launch(&mut slots, key.clone(), fetcher, now);
                    Action::Hit(data, fetched_at, CacheSource::Stale)
                }
                Some((EntryState::Fetching, data, fetched_at, Some(in_flight))) => {
                    match (data, fetched_at) {
                        (Some(data), Some(fetched_at)) if !self.inner.is_past(fetched_at, now, self.inner.config.gc_time) => {
                            debug!("Serving stale {} while a refresh is in flight", key);
                            Action::Hit(data, fetched_at, CacheSource::Stale)
                        }
                        _ => {
                            debug!("Joining in-flight fetch for {}", key);
                            Action::Wait(in_flight)
                        }
                    }
                }
                _ => {
                    debug!("Cache miss for {}", key);
                    Action::Wait(self.inner.launch(&mut slots, key.clone(), fetcher, now))
                }
            }
        };

        match action {
            Action::Hit(data, fetched_at, source) => Ok(CacheResult {
                data,
                source,
                fetched_at,
            }),
            Action::Wait(in_flight) => {
                let (data, fetched_at) = in_flight.await?;
                Ok(CacheResult {
                    data,
                    source: CacheSource::Network,
                    fetched_at,
                })
            }
        }
    }

    /// Wait for every fetch in flight right now, background refreshes included
    pub async fn wait_idle(&self) {
        let pending: Vec<SharedFetch> = self
            .inner
            .lock_slots()
            .values()
            .filter_map(|slot| slot.in_flight.clone())
            .collect();
        if pending.is_empty() {
            return;
        }

        debug!("Waiting for {} in-flight fetches", pending.len());
        // Failures were already recorded on their entries
        futures::future::join_all(pending).await;
    }

    pub fn get_query_data(&self, key: &QueryKey) -> Option<Value> {
        self.inner
            .lock_slots()
            .get(key)
            .and_then(|slot| slot.entry.data.clone())
    }

    /// Store `data` as a fresh result for `key`
    ///
    /// Any fetch already in flight for the key will not overwrite it.
    pub fn set_query_data(&self, key: QueryKey, data: Value) {
        let now = self.inner.clock.now();
        {
            let mut slots = self.inner.lock_slots();
            let generation = self.inner.next_generation();
            slots.insert(
                key,
                Slot {
                    entry: CacheEntry::success(data, now),
                    in_flight: None,
                    generation,
                },
            );
        }
        self.persist_quietly();
    }

    /// Mark every entry under `prefix` stale; returns how many matched
    pub fn invalidate(&self, prefix: &QueryKey) -> usize {
        let count = {
            let mut slots = self.inner.lock_slots();
            let mut count = 0;
            for (key, slot) in slots.iter_mut() {
                if key.starts_with(prefix) {
                    slot.entry.is_invalidated = true;
                    count += 1;
                }
            }
            count
        };
        debug!("Invalidated {} entries under {}", count, prefix);
        if count > 0 {
            self.persist_quietly();
        }
        count
    }

    /// Drop every entry under `prefix`; returns how many were dropped
    pub fn remove(&self, prefix: &QueryKey) -> usize {
        let removed = {
            let mut slots = self.inner.lock_slots();
            let before = slots.len();
            slots.retain(|key, _| !key.starts_with(prefix));
            before - slots.len()
        };
        if removed > 0 {
            self.persist_quietly();
        }
        removed
    }

    /// Drop everything, in memory and on disk
    pub fn clear(&self) -> Result<()> {
        self.inner.lock_slots().clear();
        self.inner.store.remove(&self.inner.config.storage_key)
    }

    /// Evict entries older than the garbage-collection window
    pub fn gc(&self) -> usize {
        let evicted = self.inner.gc();
        if evicted > 0 {
            self.persist_quietly();
        }
        evicted
    }

    pub fn state(&self, key: &QueryKey) -> EntryState {
        let now = self.inner.clock.now();
        self.inner
            .lock_slots()
            .get(key)
            .map(|slot| self.inner.state_of(&slot.entry, now))
            .unwrap_or(EntryState::Empty)
    }

    pub fn entry(&self, key: &QueryKey) -> Option<CacheEntry> {
        self.inner.lock_slots().get(key).map(|slot| slot.entry.clone())
    }

    pub fn keys(&self) -> Vec<QueryKey> {
        let mut keys: Vec<QueryKey> = self.inner.lock_slots().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.inner.lock_slots().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write eligible entries to durable storage now
    pub fn persist(&self) -> Result<()> {
        self.inner.persist()
    }

    fn persist_quietly(&self) {
        if let Err(e) = self.inner.persist() {
            warn!("Cache snapshot failed: {}", e);
        }
    }

    fn start_janitor(&self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!("No runtime, cache janitor not started");
            return;
        };

        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.config.gc_interval;
        let task = runtime.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // First tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                if inner.gc() > 0 {
                    if let Err(e) = inner.persist() {
                        warn!("Cache snapshot failed: {}", e);
                    }
                }
            }
        });

        *self.inner.lock_janitor() = Some(task);
    }
}

impl Inner {
    fn lock_slots(&self) -> MutexGuard<'_, HashMap<QueryKey, Slot>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_janitor(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.janitor.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn is_past(&self, since: DateTime<Utc>, now: DateTime<Utc>, window: Duration) -> bool {
        now - since >= window
    }

    fn is_expired(&self, entry: &CacheEntry, now: DateTime<Utc>) -> bool {
        if entry.status == QueryStatus::Fetching {
            return false;
        }
        let since = entry.fetched_at.unwrap_or(entry.updated_at);
        self.is_past(since, now, self.config.gc_time)
    }

    fn state_of(&self, entry: &CacheEntry, now: DateTime<Utc>) -> EntryState {
        match entry.status {
            QueryStatus::Fetching => EntryState::Fetching,
            _ if self.is_expired(entry, now) => EntryState::Evicted,
            QueryStatus::Error => EntryState::Errored,
            QueryStatus::Success => match entry.fetched_at {
                Some(fetched_at)
                    if !entry.is_invalidated
                        && !self.is_past(fetched_at, now, self.config.stale_time) =>
                {
                    EntryState::Fresh
                }
                _ => EntryState::Stale,
            },
        }
    }

    fn evict_if_expired(&self, slots: &mut HashMap<QueryKey, Slot>, key: &QueryKey, now: DateTime<Utc>) {
        let expired = slots
            .get(key)
            .map(|slot| self.is_expired(&slot.entry, now))
            .unwrap_or(false);
        if expired {
            debug!("Evicting expired {}", key);
            slots.remove(key);
        }
    }

    /// Start a fetch for `key` and register it as the key's newest request
    fn launch(
        self: &Arc<Self>,
        slots: &mut HashMap<QueryKey, Slot>,
        key: QueryKey,
        fetcher: Fetcher,
        now: DateTime<Utc>,
    ) -> SharedFetch {
        let generation = self.next_generation();
        let inner = Arc::clone(self);
        let policy = self.config.retry.clone();
        let task_key = key.clone();

        let fetch = async move {
            info!("Fetching {}", task_key);
            let outcome = with_retry(&policy, || (fetcher.as_ref())()).await;
            let (result, recorded) = inner.settle(&task_key, generation, outcome);
            if recorded {
                if let Err(e) = Arc::clone(&inner).persist_off_thread().await {
                    warn!("Cache snapshot failed: {}", e);
                }
            }
            result
        }
        .boxed()
        .shared();

        let slot = slots.entry(key).or_insert_with(|| Slot {
            entry: CacheEntry::empty(now),
            in_flight: None,
            generation,
        });
        slot.entry.status = QueryStatus::Fetching;
        slot.in_flight = Some(fetch.clone());
        slot.generation = generation;

        // Drive the fetch to completion even if every reader goes away
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(fetch.clone());
        }

        fetch
    }

    /// Record a finished fetch unless a newer request superseded it
    ///
    /// The flag says whether the entry was written.
    fn settle(
        &self,
        key: &QueryKey,
        generation: u64,
        outcome: std::result::Result<Value, FetchError>,
    ) -> (Result<(Value, DateTime<Utc>)>, bool) {
        let now = self.clock.now();
        let result = outcome
            .map(|data| (data, now))
            .map_err(|source| CacheError::Fetch {
                key: key.to_string(),
                attempts: self.config.retry.attempts(),
                source,
            });

        let recorded = {
            let mut slots = self.lock_slots();
            match slots.get_mut(key) {
                Some(slot) if slot.generation == generation => {
                    slot.in_flight = None;
                    match &result {
                        Ok((data, fetched_at)) => {
                            info!("Settled {}", key);
                            slot.entry = CacheEntry::success(data.clone(), *fetched_at);
                        }
                        Err(e) => {
                            warn!("Query {} errored: {}", key, e);
                            slot.entry.status = QueryStatus::Error;
                            slot.entry.error = Some(e.to_string());
                            slot.entry.error_count += 1;
                            slot.entry.updated_at = now;
                        }
                    }
                    true
                }
                _ => {
                    debug!("Dropping superseded response for {}", key);
                    false
                }
            }
        };

        (result, recorded)
    }

    fn gc(&self) -> usize {
        let now = self.clock.now();
        let mut slots = self.lock_slots();
        let before = slots.len();
        slots.retain(|_, slot| !self.is_expired(&slot.entry, now));
        let evicted = before - slots.len();
        if evicted > 0 {
            debug!("Garbage collected {} entries", evicted);
        }
        evicted
    }

    fn lock_snapshot(&self) -> MutexGuard<'_, ()> {
        self.snapshot_lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn persist(&self) -> Result<()> {
        let _guard = self.lock_snapshot();
        if self.closed.load(Ordering::SeqCst) {
            debug!("Cache closed, skipping snapshot");
            return Ok(());
        }
        self.write_snapshot()
    }

    /// Write the snapshot on the blocking pool when a runtime is around
    async fn persist_off_thread(self: Arc<Self>) -> Result<()> {
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime
                .spawn_blocking(move || self.persist())
                .await
                .unwrap_or_else(|e| Err(CacheError::Storage(format!("snapshot task failed: {}", e)))),
            Err(_) => self.persist(),
        }
    }

    /// Final snapshot; later writes become no-ops
    fn close(&self) -> Result<()> {
        let _guard = self.lock_snapshot();
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.write_snapshot()
    }

    fn write_snapshot(&self) -> Result<()> {
        if !self.config.persist {
            return Ok(());
        }

        let entries: Vec<PersistedEntry> = {
            let slots = self.lock_slots();
            slots
                .iter()
                .filter(|(_, slot)| slot.in_flight.is_none() && slot.entry.is_persistable())
                .filter_map(|(key, slot)| {
                    Some(PersistedEntry {
                        key: key.clone(),
                        data: slot.entry.data.clone()?,
                        fetched_at: slot.entry.fetched_at?,
                        invalidated: slot.entry.is_invalidated,
                    })
                })
                .collect()
        };

        debug!("Writing cache snapshot with {} entries", entries.len());
        Snapshot::new(self.clock.now(), &self.config.buster, entries)
            .save(self.store.as_ref(), &self.config.storage_key)
    }

    fn restore(&self) -> Result<usize> {
        let Some(snapshot) = Snapshot::load(self.store.as_ref(), &self.config.storage_key)? else {
            return Ok(0);
        };

        let now = self.clock.now();
        if !snapshot.is_usable(now, self.config.persist_max_age, &self.config.buster) {
            info!("Cache snapshot from {} is too old or outdated, discarding", snapshot.timestamp);
            self.store.remove(&self.config.storage_key)?;
            return Ok(0);
        }

        let mut slots = self.lock_slots();
        let count = snapshot.entries.len();
        for persisted in snapshot.entries {
            let generation = self.next_generation();
            let mut entry = CacheEntry::success(persisted.data, persisted.fetched_at);
            entry.is_invalidated = persisted.invalidated;
            slots.insert(
                persisted.key,
                Slot {
                    entry,
                    in_flight: None,
                    generation,
                },
            );
        }
        Ok(count)
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let janitor = self.janitor.get_mut().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = janitor.take() {
            handle.abort();
        }
    }
}
