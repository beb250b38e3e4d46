//! Cache entries.
//!
//! An entry binds a key to a value together with its expiration state: the
//! requested time-to-live, the concrete deadline, the armed one-shot timer,
//! and the forwarding subscriptions to the key's/value's own change
//! notifications. Values are never mutated in place; replacing a value means
//! constructing a fresh entry so the expired flag of the old arming can never
//! leak into the new one.

use std::fmt;
use std::hash::Hash;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::errors::{ErrorChannel, ObserverError};
use crate::events::CacheChange;
use crate::mux::Multiplexer;
use crate::notify::{PropertyChangeSource, PropertyListener, PropertySubscription};

/// What happens to an entry when its timer fires.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ExpirationPolicy {
    /// Keep the entry; reads may observe it as expired.
    #[default]
    DoNothing,
    /// Evict the entry.
    Remove,
    /// Ask the configured loader for a replacement value.
    Refresh,
}

struct TimerState {
    /// The requested time-to-live; `None` means the entry never expires.
    original: Option<Duration>,
    /// Concrete deadline for the current arming; `None` when infinite or
    /// when the requested deadline is not representable.
    expires_at: Option<Instant>,
    handle: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct ForwardState {
    key_sub: Option<PropertySubscription>,
    value_sub: Option<PropertySubscription>,
}

/// A single cached key/value pair plus its expiration state.
pub(crate) struct CacheEntry<K, V> {
    key: K,
    value: V,
    policy: ExpirationPolicy,
    has_expired: AtomicBool,
    update_count: AtomicU64,
    timer: Mutex<TimerState>,
    forwards: Mutex<ForwardState>,
}

impl<K, V> CacheEntry<K, V> {
    /// Builds an entry whose deadline is `now + expiry`.
    pub(crate) fn new(
        key: K,
        value: V,
        policy: ExpirationPolicy,
        expiry: Option<Duration>,
    ) -> Arc<Self> {
        // Deadlines past the representable maximum degrade to "never".
        let expires_at = expiry.and_then(|ttl| Instant::now().checked_add(ttl));
        Self::with_deadline(key, value, policy, expiry, expires_at)
    }

    /// Builds an entry with an explicit deadline, used when a replacement
    /// must keep the remaining (not the original) expiration.
    pub(crate) fn with_deadline(
        key: K,
        value: V,
        policy: ExpirationPolicy,
        original: Option<Duration>,
        expires_at: Option<Instant>,
    ) -> Arc<Self> {
        Arc::new(Self {
            key,
            value,
            policy,
            has_expired: AtomicBool::new(false),
            update_count: AtomicU64::new(0),
            timer: Mutex::new(TimerState {
                original,
                expires_at,
                handle: None,
            }),
            forwards: Mutex::new(ForwardState::default()),
        })
    }

    pub(crate) fn key(&self) -> &K {
        &self.key
    }

    pub(crate) fn value(&self) -> &V {
        &self.value
    }

    pub(crate) fn policy(&self) -> ExpirationPolicy {
        self.policy
    }

    pub(crate) fn original_expiry(&self) -> Option<Duration> {
        self.timer.lock().original
    }

    pub(crate) fn expires_at(&self) -> Option<Instant> {
        self.timer.lock().expires_at
    }

    /// Remaining time before expiry; zero once the deadline passed, `None`
    /// for entries that never expire.
    pub(crate) fn expires_in(&self) -> Option<Duration> {
        self.expires_at()
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Whether the deadline has passed, regardless of timer delivery.
    pub(crate) fn is_past_expiry(&self) -> bool {
        match self.timer.lock().expires_at {
            Some(deadline) => deadline <= Instant::now(),
            None => false,
        }
    }

    /// Whether the armed timer has fired for this entry.
    pub(crate) fn has_expired(&self) -> bool {
        self.has_expired.load(Ordering::SeqCst)
    }

    pub(crate) fn update_count(&self) -> u64 {
        self.update_count.load(Ordering::Relaxed)
    }

    pub(crate) fn bump_update_count(&self) {
        self.update_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn set_forwards(
        &self,
        key_sub: Option<PropertySubscription>,
        value_sub: Option<PropertySubscription>,
    ) {
        let mut forwards = self.forwards.lock();
        forwards.key_sub = key_sub;
        forwards.value_sub = value_sub;
    }

    /// Detaches both forwarding subscriptions; their drop glue unsubscribes.
    pub(crate) fn drop_forwards(&self) {
        let detached = {
            let mut forwards = self.forwards.lock();
            (forwards.key_sub.take(), forwards.value_sub.take())
        };
        drop(detached);
    }

    /// Aborts the armed timer, if any, without touching the expired flag.
    pub(crate) fn cancel_timer(&self) {
        if let Some(handle) = self.timer.lock().handle.take() {
            handle.abort();
        }
    }
}

impl<K, V> CacheEntry<K, V>
where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Arms the one-shot timer for the stored deadline. Entries without a
    /// deadline are never armed, so their expired flag stays false forever.
    ///
    /// The spawned task holds only a weak reference back to the entry and a
    /// clone of the pipeline sender, so an armed timer keeps neither the
    /// entry nor the cache alive.
    pub(crate) fn arm(
        self: &Arc<Self>,
        scheduler: &Handle,
        pipeline: &mpsc::UnboundedSender<Arc<Self>>,
        errors: &Arc<ErrorChannel>,
    ) {
        let mut timer = self.timer.lock();
        if let Some(old) = timer.handle.take() {
            old.abort();
        }
        let Some(deadline) = timer.expires_at else {
            return;
        };
        let weak = Arc::downgrade(self);
        let tx = pipeline.clone();
        let errors = Arc::clone(errors);
        // A zero duration still goes through the scheduler: the task cannot
        // run before this call returns, so firing is never synchronous.
        timer.handle = Some(scheduler.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(entry) = weak.upgrade() {
                entry.fire(&tx, &errors);
            }
        }));
    }

    /// Re-arms with a new time-to-live and clears the expired flag. This is
    /// the sanctioned resurrection path for entries whose timer already
    /// fired.
    pub(crate) fn rearm(
        self: &Arc<Self>,
        expiry: Option<Duration>,
        scheduler: &Handle,
        pipeline: &mpsc::UnboundedSender<Arc<Self>>,
        errors: &Arc<ErrorChannel>,
    ) {
        {
            let mut timer = self.timer.lock();
            if let Some(old) = timer.handle.take() {
                old.abort();
            }
            timer.original = expiry;
            timer.expires_at = expiry.and_then(|ttl| Instant::now().checked_add(ttl));
        }
        self.has_expired.store(false, Ordering::SeqCst);
        self.bump_update_count();
        self.arm(scheduler, pipeline, errors);
    }

    /// Timer-fire path: mark expired, detach forwarders, hand the entry to
    /// the expiration pipeline, release the cancel handle. A failure while
    /// detaching goes through the observer-exception channel; unhandled, it
    /// aborts the rest of the dispatch so the stale signal never reaches the
    /// pipeline.
    fn fire(self: &Arc<Self>, pipeline: &mpsc::UnboundedSender<Arc<Self>>, errors: &ErrorChannel) {
        self.has_expired.store(true, Ordering::SeqCst);
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| self.drop_forwards())) {
            let err =
                ObserverError::from_panic("unsubscribing change forwarders on expiry", payload);
            if !errors.publish(&err) {
                log::error!("dropping expiration signal after unhandled error: {err}");
                self.timer.lock().handle = None;
                return;
            }
        }
        let _ = pipeline.send(Arc::clone(self));
        self.timer.lock().handle = None;
    }
}

impl<K, V> fmt::Debug for CacheEntry<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let timer = self.timer.lock();
        f.debug_struct("CacheEntry")
            .field("policy", &self.policy)
            .field("original_expiry", &timer.original)
            .field("expires_at", &timer.expires_at)
            .field("armed", &timer.handle.is_some())
            .field("has_expired", &self.has_expired())
            .field("update_count", &self.update_count())
            .finish()
    }
}

/// Everything an entry needs to participate in the cache: the expiration
/// scheduler, the pipeline input, the error channel, the multiplexer the
/// forward listeners publish into, and the optional property-change
/// capabilities. Cloned into the pipeline so refreshed replacements can be
/// wired up the same way `add` wires new entries.
pub(crate) struct EntryHooks<K, V> {
    pub(crate) scheduler: Handle,
    pub(crate) pipeline: mpsc::UnboundedSender<Arc<CacheEntry<K, V>>>,
    pub(crate) errors: Arc<ErrorChannel>,
    pub(crate) mux: Arc<Multiplexer<K, V>>,
    pub(crate) key_source: Option<Arc<dyn PropertyChangeSource<K>>>,
    pub(crate) value_source: Option<Arc<dyn PropertyChangeSource<V>>>,
}

impl<K, V> Clone for EntryHooks<K, V> {
    fn clone(&self) -> Self {
        Self {
            scheduler: self.scheduler.clone(),
            pipeline: self.pipeline.clone(),
            errors: Arc::clone(&self.errors),
            mux: Arc::clone(&self.mux),
            key_source: self.key_source.clone(),
            value_source: self.value_source.clone(),
        }
    }
}

impl<K, V> EntryHooks<K, V> {
    /// Cancels the timer and detaches forwarders of an entry leaving the
    /// cache.
    pub(crate) fn detach(&self, entry: &CacheEntry<K, V>) {
        entry.cancel_timer();
        entry.drop_forwards();
    }
}

impl<K, V> EntryHooks<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Wires a freshly-stored entry: forwarding subscriptions first, then the
    /// timer, so a deadline of zero still finds the forwarders in place.
    pub(crate) fn attach(&self, entry: &Arc<CacheEntry<K, V>>) {
        self.subscribe_forwards(entry);
        entry.arm(&self.scheduler, &self.pipeline, &self.errors);
    }

    fn subscribe_forwards(&self, entry: &Arc<CacheEntry<K, V>>) {
        let key_sub = self.key_source.as_ref().map(|source| {
            let weak = Arc::downgrade(entry);
            let mux = Arc::clone(&self.mux);
            let listener: PropertyListener = Arc::new(move |property: &str| {
                if let Some(entry) = weak.upgrade() {
                    entry.bump_update_count();
                    mux.emit(CacheChange::key_changed(&entry, Some(property.to_string())));
                }
            });
            source.subscribe(entry.key(), listener)
        });
        let value_sub = self.value_source.as_ref().map(|source| {
            let weak = Arc::downgrade(entry);
            let mux = Arc::clone(&self.mux);
            let listener: PropertyListener = Arc::new(move |property: &str| {
                if let Some(entry) = weak.upgrade() {
                    entry.bump_update_count();
                    mux.emit(CacheChange::value_changed(
                        &entry,
                        Some(property.to_string()),
                    ));
                }
            });
            source.subscribe(entry.value(), listener)
        });
        entry.set_forwards(key_sub, value_sub);
    }
}
