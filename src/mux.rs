//! Change multiplexer.
//!
//! Merges the three internal event sources (storage changes, per-entry
//! property-change forwards, expiration notifications) into one ordered
//! stream, fans it out to broadcast subscribers and callback observers on
//! the notification scheduler, and implements the suppression switches and
//! reset coalescing.
//!
//! The multiplexer is the only writer into subscriber-visible streams.
//! Emission is a synchronous, lock-ordered enqueue so every subscriber sees
//! the same event order; delivery happens on a single background task so a
//! given observer never sees two events concurrently.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc, watch};

use crate::errors::{BoxError, ErrorChannel, ObserverError};
use crate::events::CacheChange;

/// Callback observer registered with [`ObservableCache::observe`].
///
/// [`ObservableCache::observe`]: crate::ObservableCache::observe
pub(crate) type ChangeObserver<K, V> =
    Arc<dyn Fn(&CacheChange<K, V>) -> Result<(), BoxError> + Send + Sync>;

/// Identifier for a registered callback observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(pub(crate) u64);

/// Categories of events that can be suppressed independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SuppressKind {
    /// Everything, including count updates.
    All,
    /// Per-item changes (adds, removes, replacements, expirations, forwards).
    Items,
    /// Reset events.
    Resets,
    /// Count updates.
    Counts,
}

struct Category {
    depth: AtomicUsize,
    dropped: AtomicUsize,
    signal: AtomicBool,
}

impl Category {
    fn new() -> Self {
        Self {
            depth: AtomicUsize::new(0),
            dropped: AtomicUsize::new(0),
            signal: AtomicBool::new(false),
        }
    }

    fn acquire(&self, signal: bool) {
        if self.depth.fetch_add(1, Ordering::SeqCst) == 0 {
            self.dropped.store(0, Ordering::SeqCst);
            self.signal.store(false, Ordering::SeqCst);
        }
        if signal {
            self.signal.store(true, Ordering::SeqCst);
        }
    }

    /// Decrements the nesting depth; yields the scope's drop count and
    /// signal request when the outermost guard releases.
    fn release(&self) -> Option<(usize, bool)> {
        let dropped = self.dropped.load(Ordering::SeqCst);
        let signal = self.signal.load(Ordering::SeqCst);
        if self.depth.fetch_sub(1, Ordering::SeqCst) == 1 {
            Some((dropped, signal))
        } else {
            None
        }
    }

    fn active(&self) -> bool {
        self.depth.load(Ordering::SeqCst) > 0
    }

    fn record_drop(&self) {
        self.dropped.fetch_add(1, Ordering::SeqCst);
    }
}

struct Suppression {
    all: Category,
    items: Category,
    resets: Category,
    counts: Category,
    coalesce_threshold: usize,
}

impl Suppression {
    fn category(&self, kind: SuppressKind) -> &Category {
        match kind {
            SuppressKind::All => &self.all,
            SuppressKind::Items => &self.items,
            SuppressKind::Resets => &self.resets,
            SuppressKind::Counts => &self.counts,
        }
    }
}

pub(crate) struct Multiplexer<K, V> {
    queue: Mutex<Option<mpsc::UnboundedSender<CacheChange<K, V>>>>,
    changes: Mutex<Option<broadcast::Sender<CacheChange<K, V>>>>,
    count: watch::Sender<usize>,
    observers: RwLock<Vec<(ObserverId, ChangeObserver<K, V>)>>,
    next_observer: AtomicU64,
    suppression: Suppression,
    errors: Arc<ErrorChannel>,
}

impl<K, V> Multiplexer<K, V>
where
    K: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Builds the multiplexer and spawns its notification task on the given
    /// scheduler.
    pub(crate) fn spawn(
        notification: &Handle,
        capacity: usize,
        coalesce_threshold: usize,
        errors: Arc<ErrorChannel>,
    ) -> Arc<Self> {
        let (queue_tx, mut queue_rx) = mpsc::unbounded_channel();
        let (changes_tx, _) = broadcast::channel(capacity);
        let (count_tx, _) = watch::channel(0usize);
        let mux = Arc::new(Self {
            queue: Mutex::new(Some(queue_tx)),
            changes: Mutex::new(Some(changes_tx)),
            count: count_tx,
            observers: RwLock::new(Vec::new()),
            next_observer: AtomicU64::new(0),
            suppression: Suppression {
                all: Category::new(),
                items: Category::new(),
                resets: Category::new(),
                counts: Category::new(),
                coalesce_threshold,
            },
            errors,
        });

        let dispatch = Arc::clone(&mux);
        notification.spawn(async move {
            // Already-queued events are still drained after the input closes,
            // so subscribers see everything that happened before a shutdown.
            while let Some(change) = queue_rx.recv().await {
                if !dispatch.deliver(change) {
                    break;
                }
            }
            dispatch.close_input();
            dispatch.close_streams();
            log::debug!("change notification dispatch terminated");
        });

        mux
    }

    /// Delivers one change to the broadcast stream and each callback
    /// observer in turn. Returns false when an unhandled observer error
    /// requires tearing the dispatch down.
    fn deliver(&self, change: CacheChange<K, V>) -> bool {
        let Some(tx) = self.changes.lock().clone() else {
            return false;
        };
        let _ = tx.send(change.clone());

        let observers: Vec<(ObserverId, ChangeObserver<K, V>)> =
            self.observers.read().iter().cloned().collect();
        for (id, observer) in observers {
            let err = match catch_unwind(AssertUnwindSafe(|| observer(&change))) {
                Ok(Ok(())) => continue,
                Ok(Err(cause)) => ObserverError::from_error("change observer failed", cause),
                Err(payload) => ObserverError::from_panic("change observer", payload),
            };
            if !self.errors.publish(&err) {
                log::error!(
                    "unhandled error from observer {:?}, terminating notification dispatch: {err}",
                    id
                );
                return false;
            }
        }
        true
    }
}

impl<K: Clone, V: Clone> Multiplexer<K, V> {
    /// Enqueues a change for delivery, honoring the active suppression
    /// scopes. Suppressed events are dropped, never buffered.
    pub(crate) fn emit(&self, change: CacheChange<K, V>) {
        if self.should_drop(change.is_reset()) {
            return;
        }
        if let Some(tx) = &*self.queue.lock() {
            let _ = tx.send(change);
        }
    }

    fn should_drop(&self, is_reset: bool) -> bool {
        let suppression = &self.suppression;
        let mut dropped = false;
        if suppression.all.active() {
            suppression.all.record_drop();
            dropped = true;
        }
        if is_reset {
            if suppression.resets.active() {
                suppression.resets.record_drop();
                dropped = true;
            }
        } else if suppression.items.active() {
            suppression.items.record_drop();
            dropped = true;
        }
        dropped
    }

    /// Publishes a new entry count to the count watch unless count updates
    /// are suppressed.
    pub(crate) fn set_len(&self, len: usize) {
        let suppression = &self.suppression;
        if suppression.all.active() || suppression.counts.active() {
            if suppression.counts.active() {
                suppression.counts.record_drop();
            }
            return;
        }
        self.count.send_if_modified(|current| {
            if *current != len {
                *current = len;
                true
            } else {
                false
            }
        });
    }

    pub(crate) fn acquire(&self, kind: SuppressKind, signal: bool) {
        self.suppression.category(kind).acquire(signal);
    }

    /// Releases one guard of `kind`; when the outermost guard of the scope
    /// releases, emits the synthetic `Reset` the scope asked for, or the
    /// coalesced `Reset` when enough mutations were swallowed.
    pub(crate) fn release(&self, kind: SuppressKind) {
        let Some((dropped, signal)) = self.suppression.category(kind).release() else {
            return;
        };
        let coalesced = matches!(kind, SuppressKind::All | SuppressKind::Items)
            && dropped >= self.suppression.coalesce_threshold;
        if (signal && dropped > 0) || coalesced {
            log::debug!(
                "suppression scope released, {dropped} events dropped, emitting reset (coalesced: {coalesced})"
            );
            self.emit(CacheChange::Reset);
        }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<CacheChange<K, V>> {
        match &*self.changes.lock() {
            Some(tx) => tx.subscribe(),
            None => {
                // Streams already completed: hand out a receiver that is
                // immediately closed.
                let (tx, rx) = broadcast::channel(1);
                drop(tx);
                rx
            }
        }
    }

    pub(crate) fn count_watch(&self) -> watch::Receiver<usize> {
        self.count.subscribe()
    }

    pub(crate) fn observe(&self, observer: ChangeObserver<K, V>) -> ObserverId {
        let id = ObserverId(self.next_observer.fetch_add(1, Ordering::Relaxed));
        self.observers.write().push((id, observer));
        id
    }

    pub(crate) fn unobserve(&self, id: ObserverId) {
        self.observers.write().retain(|(oid, _)| *oid != id);
    }

    /// Closes the input queue: no further events are accepted, but events
    /// already queued still reach subscribers before the streams complete.
    /// Idempotent.
    pub(crate) fn close_input(&self) {
        self.queue.lock().take();
    }

    fn close_streams(&self) {
        self.changes.lock().take();
    }
}

/// RAII token for a suppression scope; releasing (dropping) it may emit a
/// synthetic `Reset` so subscribers can reconcile.
#[must_use = "dropping the guard immediately ends the suppression scope"]
pub struct SuppressionGuard<K: Clone, V: Clone> {
    mux: Arc<Multiplexer<K, V>>,
    kind: SuppressKind,
}

impl<K: Clone, V: Clone> SuppressionGuard<K, V> {
    pub(crate) fn new(mux: Arc<Multiplexer<K, V>>, kind: SuppressKind, signal: bool) -> Self {
        mux.acquire(kind, signal);
        Self { mux, kind }
    }
}

impl<K: Clone, V: Clone> Drop for SuppressionGuard<K, V> {
    fn drop(&mut self) {
        self.mux.release(self.kind);
    }
}

impl<K: Clone, V: Clone> std::fmt::Debug for SuppressionGuard<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SuppressionGuard")
            .field("kind", &self.kind)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ChangeStream;
    use std::time::Duration;

    fn mux(coalesce: usize) -> Arc<Multiplexer<&'static str, u32>> {
        Multiplexer::spawn(
            &Handle::current(),
            64,
            coalesce,
            ErrorChannel::new(16),
        )
    }

    fn added(key: &'static str, value: u32) -> CacheChange<&'static str, u32> {
        CacheChange::ItemAdded {
            key,
            value,
            expires_at: None,
            policy: crate::ExpirationPolicy::DoNothing,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn delivers_in_emission_order() {
        let mux = mux(usize::MAX);
        let mut stream = ChangeStream::new(mux.subscribe());
        mux.emit(added("a", 1));
        mux.emit(added("b", 2));
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(stream.try_recv().unwrap().key(), Some(&"a"));
        assert_eq!(stream.try_recv().unwrap().key(), Some(&"b"));
    }

    #[tokio::test(start_paused = true)]
    async fn suppression_drops_and_signals_reset() {
        let mux = mux(usize::MAX);
        let mut stream = ChangeStream::new(mux.subscribe());
        {
            let _guard = SuppressionGuard::new(Arc::clone(&mux), SuppressKind::All, true);
            mux.emit(added("a", 1));
            mux.emit(added("b", 2));
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
        let only = stream.try_recv().unwrap();
        assert!(only.is_reset());
        assert!(stream.try_recv().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn empty_suppression_scope_emits_nothing() {
        let mux = mux(usize::MAX);
        let mut stream = ChangeStream::new(mux.subscribe());
        drop(SuppressionGuard::new(Arc::clone(&mux), SuppressKind::All, true));
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(stream.try_recv().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn coalescing_forces_reset_without_signal() {
        let mux = mux(3);
        let mut stream = ChangeStream::new(mux.subscribe());
        {
            let _guard = SuppressionGuard::new(Arc::clone(&mux), SuppressKind::Items, false);
            for i in 0..4 {
                mux.emit(added("k", i));
            }
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(stream.try_recv().unwrap().is_reset());
        assert!(stream.try_recv().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn nested_guards_release_on_outermost() {
        let mux = mux(usize::MAX);
        let mut stream = ChangeStream::new(mux.subscribe());
        let outer = SuppressionGuard::new(Arc::clone(&mux), SuppressKind::Items, true);
        let inner = SuppressionGuard::new(Arc::clone(&mux), SuppressKind::Items, false);
        mux.emit(added("a", 1));
        drop(inner);
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(stream.try_recv().is_none());
        drop(outer);
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(stream.try_recv().unwrap().is_reset());
    }

    #[tokio::test(start_paused = true)]
    async fn count_watch_tracks_len() {
        let mux = mux(usize::MAX);
        let watch = mux.count_watch();
        mux.set_len(2);
        assert_eq!(*watch.borrow(), 2);

        let _guard = SuppressionGuard::new(Arc::clone(&mux), SuppressKind::Counts, false);
        mux.set_len(5);
        assert_eq!(*watch.borrow(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn unhandled_observer_error_tears_down_dispatch() {
        let errors = ErrorChannel::new(16);
        let mux: Arc<Multiplexer<&str, u32>> =
            Multiplexer::spawn(&Handle::current(), 64, usize::MAX, Arc::clone(&errors));
        let mut stream = ChangeStream::new(mux.subscribe());
        mux.observe(Arc::new(|_| Err("observer rejects everything".into())));

        mux.emit(added("a", 1));
        tokio::time::sleep(Duration::from_millis(1)).await;

        // The event reached the broadcast stream before dispatch stopped,
        // and the stream then completed.
        assert!(stream.try_recv().is_some());
        assert!(stream.recv().await.is_none());
    }
}
