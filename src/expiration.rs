//! Batched expiration handling.
//!
//! Fired entries arrive one at a time on an unbounded channel. The pipeline
//! task opens a chill window when the first one lands, drains whatever else
//! accumulated by the time the window closes, and processes the batch:
//! filter to entries that are still cached and still expired, announce the
//! expirations, then apply each entry's policy. Loader and observer failures
//! are routed through the observer-exception channel; an unhandled failure
//! tears the pipeline down and completes the change streams while reads keep
//! working.

use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::cache::{CacheState, ValueEq};
use crate::entry::{CacheEntry, EntryHooks, ExpirationPolicy};
use crate::errors::{BoxError, ErrorChannel, ObserverError};
use crate::events::CacheChange;
use crate::loader::{BulkKeyLoader, KeyLoader};
use crate::mux::Multiplexer;
use crate::store::KeyedStore;

/// Everything the pipeline task needs, captured at build time.
pub(crate) struct PipelineContext<K, V> {
    pub(crate) store: Arc<KeyedStore<K, V>>,
    pub(crate) mux: Arc<Multiplexer<K, V>>,
    pub(crate) errors: Arc<ErrorChannel>,
    pub(crate) hooks: EntryHooks<K, V>,
    pub(crate) single_loader: Option<Arc<dyn KeyLoader<K, V>>>,
    pub(crate) bulk_loader: Option<Arc<dyn BulkKeyLoader<K, V>>>,
    pub(crate) value_eq: ValueEq<V>,
    pub(crate) window: Duration,
    pub(crate) throw_on_errors: bool,
    pub(crate) state: Arc<CacheState>,
}

/// Spawns the pipeline task on the expiration scheduler.
pub(crate) fn spawn<K, V>(
    scheduler: &Handle,
    mut rx: mpsc::UnboundedReceiver<Arc<CacheEntry<K, V>>>,
    ctx: PipelineContext<K, V>,
) -> JoinHandle<()>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    scheduler.spawn(async move {
        while let Some(first) = rx.recv().await {
            let mut batch = vec![first];
            if !ctx.window.is_zero() {
                tokio::time::sleep(ctx.window).await;
            }
            while let Ok(entry) = rx.try_recv() {
                batch.push(entry);
            }

            let unhandled = process_batch(&ctx, batch).await;
            if !unhandled.is_empty() && ctx.throw_on_errors {
                for err in &unhandled {
                    log::error!("expiration pipeline failure: {err}");
                }
                log::error!(
                    "expiration pipeline terminating after {} unhandled error(s)",
                    unhandled.len()
                );
                ctx.state.mark_degraded();
                ctx.mux.close_input();
                return;
            }
        }
        log::debug!("expiration pipeline input closed");
    })
}

/// Processes one batch; returns the unhandled failures it ran into.
async fn process_batch<K, V>(
    ctx: &PipelineContext<K, V>,
    batch: Vec<Arc<CacheEntry<K, V>>>,
) -> Vec<Arc<ObserverError>>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    let fired = batch.len();

    // An entry only survives if its expired flag is still set (a concurrent
    // update re-arms and clears it) and the store still holds that exact
    // entry (a replacement makes the firing stale).
    let mut survivors = Vec::with_capacity(batch.len());
    for entry in batch {
        if !entry.has_expired() {
            continue;
        }
        match ctx.store.get(entry.key()) {
            Some(current) if Arc::ptr_eq(&current, &entry) => survivors.push(entry),
            _ => {}
        }
    }
    log::debug!("expiration batch: {fired} fired, {} survived filtering", survivors.len());
    if survivors.is_empty() {
        return Vec::new();
    }

    // All expirations are announced before any policy consequence.
    for entry in &survivors {
        ctx.mux.emit(CacheChange::expired(entry));
    }

    let mut removals = Vec::new();
    let mut refreshes = Vec::new();
    for entry in survivors {
        match entry.policy() {
            ExpirationPolicy::DoNothing => {}
            ExpirationPolicy::Remove => removals.push(entry),
            ExpirationPolicy::Refresh => refreshes.push(entry),
        }
    }

    let mut unhandled = Vec::new();

    if !removals.is_empty() {
        let expected = removals
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry)))
            .collect();
        let (removed, kept) = ctx.store.try_remove_range(expected);
        if !kept.is_empty() {
            log::trace!("{} expired entries were replaced before removal", kept.len());
        }
        for entry in removed {
            ctx.hooks.detach(&entry);
        }
    }

    if !refreshes.is_empty() {
        refresh_entries(ctx, refreshes, &mut unhandled).await;
    }

    unhandled
}

async fn refresh_entries<K, V>(
    ctx: &PipelineContext<K, V>,
    entries: Vec<Arc<CacheEntry<K, V>>>,
    unhandled: &mut Vec<Arc<ObserverError>>,
) where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    let loaded: Vec<(K, V)> = match (&ctx.single_loader, &ctx.bulk_loader) {
        (Some(single), _) if entries.len() == 1 => {
            let key = entries[0].key();
            match single.load(key).await {
                Ok(value) => vec![(key.clone(), value)],
                Err(cause) => {
                    report_loader_failure(ctx, cause, unhandled);
                    Vec::new()
                }
            }
        }
        (_, Some(bulk)) => {
            let keys: Vec<K> = entries.iter().map(|entry| entry.key().clone()).collect();
            match bulk.load_all(&keys).await {
                Ok(pairs) => pairs,
                Err(cause) => {
                    report_loader_failure(ctx, cause, unhandled);
                    Vec::new()
                }
            }
        }
        (Some(single), None) => {
            let mut pairs = Vec::with_capacity(entries.len());
            for entry in &entries {
                match single.load(entry.key()).await {
                    Ok(value) => pairs.push((entry.key().clone(), value)),
                    Err(cause) => report_loader_failure(ctx, cause, unhandled),
                }
            }
            pairs
        }
        (None, None) => {
            // `add` refuses Refresh entries without a loader, so this only
            // happens if a refresh entry outlived a configuration bug.
            report_loader_failure(ctx, "no refresh loader configured".into(), unhandled);
            Vec::new()
        }
    };

    for (key, new_value) in loaded {
        let Some(current) = ctx.store.get(&key) else {
            // Key left the cache while the loader ran.
            continue;
        };
        if (ctx.value_eq)(current.value(), &new_value) {
            // Same value: keep the entry and start another full lifetime.
            current.rearm(
                current.original_expiry(),
                &ctx.hooks.scheduler,
                &ctx.hooks.pipeline,
                &ctx.hooks.errors,
            );
            continue;
        }
        let fresh = CacheEntry::new(
            key.clone(),
            new_value,
            current.policy(),
            current.original_expiry(),
        );
        if let Some(old) = ctx.store.try_update(&key, Arc::clone(&fresh), Some(&current)) {
            ctx.hooks.attach(&fresh);
            ctx.hooks.detach(&old);
        }
        // On an expected-entry mismatch a concurrent writer won; the fresh
        // entry was never stored and simply drops here.
    }
}

fn report_loader_failure<K, V>(
    ctx: &PipelineContext<K, V>,
    cause: BoxError,
    unhandled: &mut Vec<Arc<ObserverError>>,
) {
    let err = ObserverError::from_error("refresh loader failed", cause);
    if !ctx.errors.publish(&err) {
        unhandled.push(err);
    }
}
