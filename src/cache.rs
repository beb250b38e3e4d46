//! The cache facade and its builder.
//!
//! [`ObservableCache`] composes the keyed store, the change multiplexer, the
//! expiration pipeline, and the observer-exception channel behind the public
//! operations. Mutations commit synchronously against the store; their
//! events are delivered on the notification scheduler, never inline.

use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::entry::{CacheEntry, EntryHooks, ExpirationPolicy};
use crate::errors::{BoxError, CacheError, ErrorChannel, ErrorStream, HandlerId, ObserverError};
use crate::events::{self, CacheChange, ChangeStream, FilteredChanges};
use crate::expiration::{self, PipelineContext};
use crate::loader::{BulkKeyLoader, FnBulkLoader, FnLoader, KeyLoader};
use crate::mux::{Multiplexer, ObserverId, SuppressKind, SuppressionGuard};
use crate::notify::PropertyChangeSource;
use crate::store::KeyedStore;

/// Injected value-equality relation, consulted by Refresh to decide whether
/// a reloaded value is an actual change.
pub(crate) type ValueEq<V> = Arc<dyn Fn(&V, &V) -> bool + Send + Sync>;

const ACTIVE: u8 = 0;
const DEGRADED: u8 = 1;
const CLOSED: u8 = 2;

/// Lifecycle state shared between the facade and the pipeline.
pub(crate) struct CacheState(AtomicU8);

impl CacheState {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self(AtomicU8::new(ACTIVE)))
    }

    /// Active → Degraded; closed caches stay closed.
    pub(crate) fn mark_degraded(&self) {
        let _ = self
            .0
            .compare_exchange(ACTIVE, DEGRADED, Ordering::SeqCst, Ordering::SeqCst);
    }

    /// Returns false when the cache was already closed.
    pub(crate) fn close(&self) -> bool {
        self.0.swap(CLOSED, Ordering::SeqCst) != CLOSED
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.0.load(Ordering::SeqCst) == CLOSED
    }

    pub(crate) fn is_degraded(&self) -> bool {
        self.0.load(Ordering::SeqCst) == DEGRADED
    }

    pub(crate) fn ensure_open(&self) -> Result<(), CacheError> {
        if self.is_closed() {
            Err(CacheError::Closed)
        } else {
            Ok(())
        }
    }
}

/// Per-key partition returned by [`ObservableCache::add_range`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddOutcome<K> {
    /// Keys that entered the cache.
    pub added: Vec<K>,
    /// Keys that were already present.
    pub rejected: Vec<K>,
}

/// Configuration for an [`ObservableCache`].
pub struct CacheBuilder<K, V> {
    value_eq: ValueEq<V>,
    single_loader: Option<Arc<dyn KeyLoader<K, V>>>,
    bulk_loader: Option<Arc<dyn BulkKeyLoader<K, V>>>,
    expiration_batch_window: Duration,
    throw_on_expiration_errors: bool,
    expiration_scheduler: Option<Handle>,
    notification_scheduler: Option<Handle>,
    reset_coalesce_threshold: usize,
    key_change_source: Option<Arc<dyn PropertyChangeSource<K>>>,
    value_change_source: Option<Arc<dyn PropertyChangeSource<V>>>,
    event_capacity: usize,
}

impl<K, V: PartialEq> CacheBuilder<K, V> {
    /// A builder with structural value equality and default settings.
    pub fn new() -> Self {
        Self::with_value_eq(|a: &V, b: &V| a == b)
    }
}

impl<K, V: PartialEq> Default for CacheBuilder<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> CacheBuilder<K, V> {
    /// A builder with an explicit value-equality relation, for value types
    /// without a usable `PartialEq`.
    pub fn with_value_eq(eq: impl Fn(&V, &V) -> bool + Send + Sync + 'static) -> Self {
        Self {
            value_eq: Arc::new(eq),
            single_loader: None,
            bulk_loader: None,
            expiration_batch_window: Duration::from_secs(1),
            throw_on_expiration_errors: true,
            expiration_scheduler: None,
            notification_scheduler: None,
            reset_coalesce_threshold: usize::MAX,
            key_change_source: None,
            value_change_source: None,
            event_capacity: 256,
        }
    }

    /// Replaces the value-equality relation.
    pub fn value_eq(mut self, eq: impl Fn(&V, &V) -> bool + Send + Sync + 'static) -> Self {
        self.value_eq = Arc::new(eq);
        self
    }

    /// Loader consulted when a single Refresh entry expires.
    pub fn single_loader(mut self, loader: Arc<dyn KeyLoader<K, V>>) -> Self {
        self.single_loader = Some(loader);
        self
    }

    /// Closure form of [`single_loader`](Self::single_loader).
    pub fn single_loader_fn(
        self,
        loader: impl Fn(&K) -> Result<V, BoxError> + Send + Sync + 'static,
    ) -> Self
    where
        K: Sync + Send + 'static,
        V: Send + 'static,
    {
        self.single_loader(Arc::new(FnLoader(loader)))
    }

    /// Loader consulted when a batch of Refresh entries expires together.
    pub fn bulk_loader(mut self, loader: Arc<dyn BulkKeyLoader<K, V>>) -> Self {
        self.bulk_loader = Some(loader);
        self
    }

    /// Closure form of [`bulk_loader`](Self::bulk_loader).
    pub fn bulk_loader_fn(
        self,
        loader: impl Fn(&[K]) -> Result<Vec<(K, V)>, BoxError> + Send + Sync + 'static,
    ) -> Self
    where
        K: Sync + Send + 'static,
        V: Send + 'static,
    {
        self.bulk_loader(Arc::new(FnBulkLoader(loader)))
    }

    /// The chill window over which fired entries accumulate before a batch
    /// is processed. Zero processes whatever already accumulated
    /// immediately. Default: one second.
    pub fn expiration_batch_window(mut self, window: Duration) -> Self {
        self.expiration_batch_window = window;
        self
    }

    /// Whether an unhandled loader/observer failure during expiration tears
    /// the pipeline down. Default: true.
    pub fn throw_on_expiration_errors(mut self, throw: bool) -> Self {
        self.throw_on_expiration_errors = throw;
        self
    }

    /// Runtime that runs entry timers and the expiration pipeline.
    /// Default: the runtime `build` is called on.
    pub fn expiration_scheduler(mut self, handle: Handle) -> Self {
        self.expiration_scheduler = Some(handle);
        self
    }

    /// Runtime that delivers events to subscribers.
    /// Default: the runtime `build` is called on.
    pub fn notification_scheduler(mut self, handle: Handle) -> Self {
        self.notification_scheduler = Some(handle);
        self
    }

    /// Once a suppression scope has swallowed this many item changes, its
    /// release emits a single `Reset` regardless of the scope's signal flag.
    /// Default: never.
    pub fn reset_coalesce_threshold(mut self, threshold: usize) -> Self {
        self.reset_coalesce_threshold = threshold;
        self
    }

    /// Capability to forward the keys' own property-change notifications.
    pub fn key_change_source(mut self, source: Arc<dyn PropertyChangeSource<K>>) -> Self {
        self.key_change_source = Some(source);
        self
    }

    /// Capability to forward the values' own property-change notifications.
    pub fn value_change_source(mut self, source: Arc<dyn PropertyChangeSource<V>>) -> Self {
        self.value_change_source = Some(source);
        self
    }

    /// Buffered events per subscriber before the oldest are dropped.
    /// Default: 256.
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }
}

impl<K, V> CacheBuilder<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Builds the cache and spawns its background tasks.
    ///
    /// Must be called from within a tokio runtime unless both schedulers
    /// were provided explicitly.
    ///
    /// # Panics
    ///
    /// Panics when `event_capacity` is zero.
    pub fn build(self) -> ObservableCache<K, V> {
        if self.event_capacity == 0 {
            panic!("`event_capacity` of an ObservableCache must be greater than zero");
        }
        let expiration = self.expiration_scheduler.unwrap_or_else(Handle::current);
        let notification = self.notification_scheduler.unwrap_or_else(Handle::current);

        let errors = ErrorChannel::new(self.event_capacity);
        let mux = Multiplexer::spawn(
            &notification,
            self.event_capacity,
            self.reset_coalesce_threshold,
            Arc::clone(&errors),
        );
        let store = Arc::new(KeyedStore::new(Arc::clone(&mux)));
        let state = CacheState::new();

        let (pipeline_tx, pipeline_rx) = mpsc::unbounded_channel();
        let hooks = EntryHooks {
            scheduler: expiration.clone(),
            pipeline: pipeline_tx,
            errors: Arc::clone(&errors),
            mux: Arc::clone(&mux),
            key_source: self.key_change_source,
            value_source: self.value_change_source,
        };

        let has_loader = self.single_loader.is_some() || self.bulk_loader.is_some();
        let pipeline = expiration::spawn(
            &expiration,
            pipeline_rx,
            PipelineContext {
                store: Arc::clone(&store),
                mux: Arc::clone(&mux),
                errors: Arc::clone(&errors),
                hooks: hooks.clone(),
                single_loader: self.single_loader,
                bulk_loader: self.bulk_loader,
                value_eq: Arc::clone(&self.value_eq),
                window: self.expiration_batch_window,
                throw_on_errors: self.throw_on_expiration_errors,
                state: Arc::clone(&state),
            },
        );

        ObservableCache {
            store,
            mux,
            errors,
            hooks,
            state,
            has_loader,
            pipeline: Mutex::new(Some(pipeline)),
        }
    }
}

/// In-memory key/value cache with per-entry expiration and observable
/// change streams.
///
/// Entries carry their own time-to-live and an [`ExpirationPolicy`] deciding
/// what happens when it runs out. Every mutation and expiration is published
/// to subscribers; see [`changes`](Self::changes) and the typed sub-streams.
pub struct ObservableCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    store: Arc<KeyedStore<K, V>>,
    mux: Arc<Multiplexer<K, V>>,
    errors: Arc<ErrorChannel>,
    hooks: EntryHooks<K, V>,
    state: Arc<CacheState>,
    has_loader: bool,
    pipeline: Mutex<Option<JoinHandle<()>>>,
}

impl<K, V> ObservableCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + PartialEq + Send + Sync + 'static,
{
    /// A cache with default configuration on the current runtime.
    pub fn new() -> Self {
        CacheBuilder::new().build()
    }

    /// Starts configuring a cache.
    pub fn builder() -> CacheBuilder<K, V> {
        CacheBuilder::new()
    }
}

impl<K, V> ObservableCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Adds a never-expiring entry with the [`ExpirationPolicy::DoNothing`]
    /// policy.
    pub fn add(&self, key: K, value: V) -> Result<(), CacheError> {
        self.add_with(key, value, None, ExpirationPolicy::DoNothing)
    }

    /// Adds an entry with an explicit time-to-live (`None` never expires)
    /// and expiration policy.
    pub fn add_with(
        &self,
        key: K,
        value: V,
        expiry: Option<Duration>,
        policy: ExpirationPolicy,
    ) -> Result<(), CacheError> {
        self.state.ensure_open()?;
        self.ensure_refresh_possible(policy)?;
        let entry = CacheEntry::new(key, value, policy, expiry);
        if !self.store.try_add(Arc::clone(&entry)) {
            return Err(CacheError::KeyAlreadyExists);
        }
        self.hooks.attach(&entry);
        Ok(())
    }

    /// Adds a batch of entries sharing one expiry and policy; reports the
    /// per-key outcome. Only an invalid configuration rejects the batch as
    /// a whole.
    pub fn add_range(
        &self,
        items: impl IntoIterator<Item = (K, V)>,
        expiry: Option<Duration>,
        policy: ExpirationPolicy,
    ) -> Result<AddOutcome<K>, CacheError> {
        self.state.ensure_open()?;
        self.ensure_refresh_possible(policy)?;
        let entries: Vec<Arc<CacheEntry<K, V>>> = items
            .into_iter()
            .map(|(key, value)| CacheEntry::new(key, value, policy, expiry))
            .collect();
        let (added, rejected) = self.store.try_add_range(entries);
        for entry in &added {
            self.hooks.attach(entry);
        }
        Ok(AddOutcome {
            added: added.iter().map(|entry| entry.key().clone()).collect(),
            rejected: rejected.iter().map(|entry| entry.key().clone()).collect(),
        })
    }

    fn ensure_refresh_possible(&self, policy: ExpirationPolicy) -> Result<(), CacheError> {
        if policy == ExpirationPolicy::Refresh && !self.has_loader {
            return Err(CacheError::InvalidConfiguration(
                "expiration policy `Refresh` requires a single-key or bulk loader",
            ));
        }
        Ok(())
    }

    /// Returns the unexpired value stored under `key`.
    pub fn get(&self, key: &K) -> Result<V, CacheError> {
        self.get_with(key, true)
    }

    /// Returns the value stored under `key`. With `throw_if_expired` the
    /// read fails with [`CacheError::KeyHasExpired`] once the entry is past
    /// its deadline; without it the stale value is returned.
    pub fn get_with(&self, key: &K, throw_if_expired: bool) -> Result<V, CacheError> {
        self.state.ensure_open()?;
        let entry = self.store.get(key).ok_or(CacheError::KeyNotFound)?;
        if throw_if_expired {
            if let Some(expired_at) = past_deadline(&entry) {
                return Err(CacheError::KeyHasExpired { expired_at });
            }
        }
        Ok(entry.value().clone())
    }

    /// Reads a batch of keys with at most `max_concurrent` in-flight per-key
    /// reads (clamped to at least one). Per-key failures surface in the
    /// per-key results; dropping the returned future cancels at a key
    /// boundary without rolling back anything already read.
    pub async fn get_many(
        &self,
        keys: Vec<K>,
        throw_if_expired: bool,
        max_concurrent: usize,
    ) -> Result<Vec<(K, Result<V, CacheError>)>, CacheError> {
        self.state.ensure_open()?;
        let results = stream::iter(keys.into_iter().map(|key| async move {
            // Reads are synchronous; the await point makes cancellation and
            // the concurrency bound observable per key.
            tokio::task::yield_now().await;
            let result = self.get_with(&key, throw_if_expired);
            (key, result)
        }))
        .buffer_unordered(max_concurrent.max(1))
        .collect()
        .await;
        Ok(results)
    }

    /// Whether `key` is present, expired or not. A closed cache contains
    /// nothing.
    pub fn contains(&self, key: &K) -> bool {
        !self.state.is_closed() && self.store.contains(key)
    }

    /// Whether every key is present.
    pub fn contains_all<'a>(&self, keys: impl IntoIterator<Item = &'a K>) -> bool
    where
        K: 'a,
    {
        keys.into_iter().all(|key| self.contains(key))
    }

    /// The subset of `keys` that is present.
    pub fn contains_which<'a>(&self, keys: impl IntoIterator<Item = &'a K>) -> Vec<K>
    where
        K: 'a,
    {
        keys.into_iter()
            .filter(|&key| self.contains(key))
            .cloned()
            .collect()
    }

    /// The instant the entry expires at, `None` for never-expiring entries.
    /// Expired entries report their past deadline rather than failing.
    pub fn expires_at(&self, key: &K) -> Result<Option<Instant>, CacheError> {
        self.state.ensure_open()?;
        let entry = self.store.get(key).ok_or(CacheError::KeyNotFound)?;
        Ok(entry.expires_at())
    }

    /// Remaining lifetime of the entry, zero once expired, `None` for
    /// never-expiring entries.
    pub fn expires_in(&self, key: &K) -> Result<Option<Duration>, CacheError> {
        self.state.ensure_open()?;
        let entry = self.store.get(key).ok_or(CacheError::KeyNotFound)?;
        Ok(entry.expires_in())
    }

    /// Removes the entry under `key` and returns its value.
    pub fn remove(&self, key: &K) -> Result<V, CacheError> {
        self.state.ensure_open()?;
        let entry = self.store.try_remove(key).ok_or(CacheError::KeyNotFound)?;
        self.hooks.detach(&entry);
        Ok(entry.value().clone())
    }

    /// Removes a batch of keys; missing keys fail per-key with
    /// [`CacheError::KeyNotFound`].
    pub fn remove_range(
        &self,
        keys: impl IntoIterator<Item = K>,
    ) -> Result<Vec<(K, Result<V, CacheError>)>, CacheError> {
        self.state.ensure_open()?;
        Ok(keys
            .into_iter()
            .map(|key| {
                let result = self.remove(&key);
                (key, result)
            })
            .collect())
    }

    /// Replaces the value under `key`, keeping the remaining (not the
    /// original) expiration, and returns the previous value. Expired entries
    /// must be resurrected with [`update_expiration`](Self::update_expiration)
    /// first, or read with `throw_if_expired = false`.
    pub fn update(&self, key: &K, value: V) -> Result<V, CacheError> {
        self.state.ensure_open()?;
        loop {
            let current = self.store.get(key).ok_or(CacheError::KeyNotFound)?;
            if let Some(expired_at) = past_deadline(&current) {
                return Err(CacheError::KeyHasExpired { expired_at });
            }
            let fresh = CacheEntry::with_deadline(
                key.clone(),
                value.clone(),
                current.policy(),
                current.original_expiry(),
                current.expires_at(),
            );
            if let Some(old) = self.store.try_update(key, Arc::clone(&fresh), Some(&current)) {
                self.hooks.attach(&fresh);
                self.hooks.detach(&old);
                return Ok(old.value().clone());
            }
            // Lost the slot to a concurrent writer; retry against the new
            // entry.
        }
    }

    /// Replaces a batch of values. The missing/expired pre-check is
    /// all-or-nothing: any pre-check failure rejects the whole batch before
    /// a single entry is touched. Failures after the pre-check surface
    /// aggregated.
    pub fn update_range(
        &self,
        items: impl IntoIterator<Item = (K, V)>,
    ) -> Result<(), CacheError> {
        self.state.ensure_open()?;
        let items: Vec<(K, V)> = items.into_iter().collect();
        let keys: Vec<K> = items.iter().map(|(key, _)| key.clone()).collect();

        let mut failures = Vec::new();
        for (_, entry) in self.store.get_range(&keys) {
            match entry {
                None => failures.push(CacheError::KeyNotFound),
                Some(entry) => {
                    if let Some(expired_at) = past_deadline(&entry) {
                        failures.push(CacheError::KeyHasExpired { expired_at });
                    }
                }
            }
        }
        if !failures.is_empty() {
            return Err(CacheError::aggregate(failures));
        }

        let mut failures = Vec::new();
        for (key, value) in items {
            if let Err(err) = self.update(&key, value) {
                failures.push(err);
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(CacheError::aggregate(failures))
        }
    }

    /// Re-arms the entry's timer with a new time-to-live (`None` never
    /// expires). Clears the expired flag, making this the sanctioned way to
    /// resurrect an expired entry.
    pub fn update_expiration(&self, key: &K, expiry: Option<Duration>) -> Result<(), CacheError> {
        self.state.ensure_open()?;
        let entry = self.store.get(key).ok_or(CacheError::KeyNotFound)?;
        entry.rearm(
            expiry,
            &self.hooks.scheduler,
            &self.hooks.pipeline,
            &self.hooks.errors,
        );
        Ok(())
    }

    /// [`update_expiration`](Self::update_expiration) over a batch of keys;
    /// per-key failures surface aggregated.
    pub fn update_expiration_range(
        &self,
        keys: impl IntoIterator<Item = K>,
        expiry: Option<Duration>,
    ) -> Result<(), CacheError> {
        self.state.ensure_open()?;
        let mut failures = Vec::new();
        for key in keys {
            if let Err(err) = self.update_expiration(&key, expiry) {
                failures.push(err);
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(CacheError::aggregate(failures))
        }
    }

    /// Removes every entry and emits a single `Reset` (subject to
    /// suppression). Per-entry removal events are not emitted.
    pub fn clear(&self) -> Result<(), CacheError> {
        self.state.ensure_open()?;
        for entry in self.store.clear() {
            self.hooks.detach(&entry);
        }
        Ok(())
    }

    /// The full stream of cache changes.
    pub fn changes(&self) -> ChangeStream<K, V> {
        ChangeStream::new(self.mux.subscribe())
    }

    /// Value replacements and in-place value changes.
    pub fn value_changes(&self) -> FilteredChanges<K, V> {
        FilteredChanges::new(self.mux.subscribe(), events::is_value_change)
    }

    /// In-place key changes.
    pub fn key_changes(&self) -> FilteredChanges<K, V> {
        FilteredChanges::new(self.mux.subscribe(), events::is_key_change)
    }

    /// Expiration notifications.
    pub fn expirations(&self) -> FilteredChanges<K, V> {
        FilteredChanges::new(self.mux.subscribe(), events::is_expiration)
    }

    /// Reset events.
    pub fn resets(&self) -> FilteredChanges<K, V> {
        FilteredChanges::new(self.mux.subscribe(), events::is_reset)
    }

    /// Watch over the entry count, updated on every structural change.
    pub fn count_changes(&self) -> watch::Receiver<usize> {
        self.mux.count_watch()
    }

    /// Registers a callback observer, invoked serially on the notification
    /// scheduler for every change. An `Err` return or a panic is routed
    /// through the observer-exception channel.
    pub fn observe(
        &self,
        observer: impl Fn(&CacheChange<K, V>) -> Result<(), BoxError> + Send + Sync + 'static,
    ) -> ObserverId {
        self.mux.observe(Arc::new(observer))
    }

    /// Removes a callback observer.
    pub fn unobserve(&self, id: ObserverId) {
        self.mux.unobserve(id);
    }

    /// Stream of failures raised by observers, listeners, and loaders.
    pub fn observer_errors(&self) -> ErrorStream {
        ErrorStream::new(self.errors.subscribe())
    }

    /// Registers a synchronous handler that sees every observer failure
    /// before the raising site decides whether to continue; handlers mark
    /// failures handled via [`ObserverError::mark_handled`].
    pub fn on_observer_error(
        &self,
        handler: impl Fn(&ObserverError) + Send + Sync + 'static,
    ) -> HandlerId {
        self.errors.register(Arc::new(handler))
    }

    /// Removes an observer-error handler.
    pub fn remove_observer_error_handler(&self, id: HandlerId) {
        self.errors.unregister(id);
    }

    /// Suppresses all outgoing notifications until the guard drops; with
    /// `signal_reset`, the release emits one `Reset` when anything was
    /// dropped.
    pub fn suppress_notifications(&self, signal_reset: bool) -> SuppressionGuard<K, V> {
        SuppressionGuard::new(Arc::clone(&self.mux), SuppressKind::All, signal_reset)
    }

    /// Suppresses per-item change notifications until the guard drops.
    pub fn suppress_item_changes(&self, signal_reset: bool) -> SuppressionGuard<K, V> {
        SuppressionGuard::new(Arc::clone(&self.mux), SuppressKind::Items, signal_reset)
    }

    /// Suppresses `Reset` notifications until the guard drops.
    pub fn suppress_resets(&self) -> SuppressionGuard<K, V> {
        SuppressionGuard::new(Arc::clone(&self.mux), SuppressKind::Resets, false)
    }

    /// Suppresses count updates until the guard drops.
    pub fn suppress_count_changes(&self) -> SuppressionGuard<K, V> {
        SuppressionGuard::new(Arc::clone(&self.mux), SuppressKind::Counts, false)
    }
}

impl<K, V> ObservableCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Number of entries, expired DoNothing entries included.
    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Snapshot of the keys; ordering is unspecified.
    pub fn keys(&self) -> Vec<K> {
        self.store.snapshot_keys()
    }

    /// Snapshot of the values; ordering is unspecified. Expired DoNothing
    /// entries are included.
    pub fn values(&self) -> Vec<V> {
        self.store.snapshot_values()
    }

    /// Whether an unhandled expiration failure stopped the pipeline. Reads
    /// and mutations keep working in this state, but the change and
    /// expiration streams have completed.
    pub fn is_degraded(&self) -> bool {
        self.state.is_degraded()
    }

    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    /// Shuts the cache down: cancels all timers, detaches all forwarders,
    /// clears the store under suppression, and completes every stream.
    /// Subsequent operations fail with [`CacheError::Closed`]. Idempotent;
    /// also runs on drop.
    pub fn close(&self) {
        if !self.state.close() {
            return;
        }
        if let Some(pipeline) = self.pipeline.lock().take() {
            pipeline.abort();
        }
        {
            let _mute = SuppressionGuard::new(Arc::clone(&self.mux), SuppressKind::All, false);
            for entry in self.store.clear() {
                self.hooks.detach(&entry);
            }
        }
        self.mux.close_input();
        log::debug!("cache closed");
    }
}

impl<K, V> Drop for ObservableCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn drop(&mut self) {
        self.close();
    }
}

impl<K, V> fmt::Debug for ObservableCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObservableCache")
            .field("len", &self.len())
            .field("degraded", &self.is_degraded())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// The deadline of an entry that is already past it.
fn past_deadline<K, V>(entry: &CacheEntry<K, V>) -> Option<Instant> {
    entry.expires_at().filter(|deadline| *deadline <= Instant::now())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn refresh_policy_requires_a_loader() {
        let cache: ObservableCache<&str, u32> = ObservableCache::new();
        let err = cache
            .add_with("a", 1, Some(Duration::from_secs(1)), ExpirationPolicy::Refresh)
            .unwrap_err();
        assert!(matches!(err, CacheError::InvalidConfiguration(_)));
    }

    #[tokio::test]
    async fn operations_fail_after_close() {
        let cache: ObservableCache<&str, u32> = ObservableCache::new();
        cache.add("a", 1).unwrap();
        cache.close();
        cache.close();

        assert_eq!(cache.add("b", 2), Err(CacheError::Closed));
        assert_eq!(cache.get(&"a"), Err(CacheError::Closed));
        assert_eq!(cache.remove(&"a"), Err(CacheError::Closed));
        assert_eq!(cache.clear(), Err(CacheError::Closed));
        assert!(!cache.contains(&"a"));
        assert!(cache.is_closed());
    }

    #[tokio::test]
    async fn contains_which_filters_present_keys() {
        let cache: ObservableCache<&str, u32> = ObservableCache::new();
        cache.add("a", 1).unwrap();
        cache.add("b", 2).unwrap();
        assert!(cache.contains_all(["a", "b"].iter()));
        assert!(!cache.contains_all(["a", "c"].iter()));
        assert_eq!(cache.contains_which(["a", "c"].iter()), vec!["a"]);
    }

    #[tokio::test]
    #[should_panic(expected = "event_capacity")]
    async fn zero_event_capacity_panics() {
        let _cache: ObservableCache<&str, u32> =
            CacheBuilder::new().event_capacity(0).build();
    }

    #[tokio::test]
    async fn update_keeps_remaining_expiration() {
        tokio::time::pause();
        let cache: ObservableCache<&str, u32> = ObservableCache::new();
        cache
            .add_with("a", 1, Some(Duration::from_secs(10)), ExpirationPolicy::DoNothing)
            .unwrap();
        tokio::time::sleep(Duration::from_secs(4)).await;

        let old = cache.update(&"a", 2).unwrap();
        assert_eq!(old, 1);
        let remaining = cache.expires_in(&"a").unwrap().unwrap();
        assert!(remaining <= Duration::from_secs(6));
        assert!(remaining > Duration::from_secs(5));
    }
}
