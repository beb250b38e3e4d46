//! Cache change events and the streams that deliver them.
//!
//! Every mutation, per-entry change, and expiration surfaces as a
//! [`CacheChange`]. The full stream is available from
//! [`ObservableCache::changes`]; typed sub-streams filter it down to one
//! category. Delivery is fan-out over a broadcast channel: a slow subscriber
//! loses its oldest events instead of stalling the cache.
//!
//! [`ObservableCache::changes`]: crate::ObservableCache::changes

use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::entry::{CacheEntry, ExpirationPolicy};

/// A single observed change to the cache.
#[derive(Clone, Debug, PartialEq)]
pub enum CacheChange<K, V> {
    /// A key/value pair entered the cache.
    ItemAdded {
        key: K,
        value: V,
        expires_at: Option<Instant>,
        policy: ExpirationPolicy,
    },
    /// A key/value pair left the cache.
    ItemRemoved {
        key: K,
        value: V,
        expires_at: Option<Instant>,
        policy: ExpirationPolicy,
    },
    /// The cache replaced the value stored under a key. The only kind that
    /// carries the previous value.
    ItemValueReplaced {
        key: K,
        value: V,
        old_value: V,
        expires_at: Option<Instant>,
        policy: ExpirationPolicy,
    },
    /// A value mutated in place and announced it through its own
    /// property-change notifications.
    ItemValueChanged {
        key: K,
        value: V,
        changed_property: Option<String>,
        expires_at: Option<Instant>,
        policy: ExpirationPolicy,
    },
    /// A key mutated in place and announced it through its own
    /// property-change notifications.
    ItemKeyChanged {
        key: K,
        changed_property: Option<String>,
        expires_at: Option<Instant>,
        policy: ExpirationPolicy,
    },
    /// An entry's timer fired while it was still cached.
    ItemExpired {
        key: K,
        value: V,
        expires_at: Option<Instant>,
        policy: ExpirationPolicy,
    },
    /// The cache changed wholesale; subscribers should re-read current state.
    Reset,
}

/// Discriminant of a [`CacheChange`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Added,
    Removed,
    ValueReplaced,
    ValueChanged,
    KeyChanged,
    Expired,
    Reset,
}

impl<K, V> CacheChange<K, V> {
    pub fn kind(&self) -> ChangeKind {
        match self {
            CacheChange::ItemAdded { .. } => ChangeKind::Added,
            CacheChange::ItemRemoved { .. } => ChangeKind::Removed,
            CacheChange::ItemValueReplaced { .. } => ChangeKind::ValueReplaced,
            CacheChange::ItemValueChanged { .. } => ChangeKind::ValueChanged,
            CacheChange::ItemKeyChanged { .. } => ChangeKind::KeyChanged,
            CacheChange::ItemExpired { .. } => ChangeKind::Expired,
            CacheChange::Reset => ChangeKind::Reset,
        }
    }

    pub fn is_reset(&self) -> bool {
        matches!(self, CacheChange::Reset)
    }

    /// The key this change concerns; `None` for [`CacheChange::Reset`].
    pub fn key(&self) -> Option<&K> {
        match self {
            CacheChange::ItemAdded { key, .. }
            | CacheChange::ItemRemoved { key, .. }
            | CacheChange::ItemValueReplaced { key, .. }
            | CacheChange::ItemValueChanged { key, .. }
            | CacheChange::ItemKeyChanged { key, .. }
            | CacheChange::ItemExpired { key, .. } => Some(key),
            CacheChange::Reset => None,
        }
    }

    /// The value carried by this change, when the kind carries one.
    pub fn value(&self) -> Option<&V> {
        match self {
            CacheChange::ItemAdded { value, .. }
            | CacheChange::ItemRemoved { value, .. }
            | CacheChange::ItemValueReplaced { value, .. }
            | CacheChange::ItemValueChanged { value, .. }
            | CacheChange::ItemExpired { value, .. } => Some(value),
            CacheChange::ItemKeyChanged { .. } | CacheChange::Reset => None,
        }
    }

    /// The replaced value; populated only for
    /// [`CacheChange::ItemValueReplaced`].
    pub fn old_value(&self) -> Option<&V> {
        match self {
            CacheChange::ItemValueReplaced { old_value, .. } => Some(old_value),
            _ => None,
        }
    }

    /// The name of the changed property; populated only for the in-place
    /// change kinds.
    pub fn changed_property(&self) -> Option<&str> {
        match self {
            CacheChange::ItemValueChanged {
                changed_property, ..
            }
            | CacheChange::ItemKeyChanged {
                changed_property, ..
            } => changed_property.as_deref(),
            _ => None,
        }
    }

    pub fn expires_at(&self) -> Option<Instant> {
        match self {
            CacheChange::ItemAdded { expires_at, .. }
            | CacheChange::ItemRemoved { expires_at, .. }
            | CacheChange::ItemValueReplaced { expires_at, .. }
            | CacheChange::ItemValueChanged { expires_at, .. }
            | CacheChange::ItemKeyChanged { expires_at, .. }
            | CacheChange::ItemExpired { expires_at, .. } => *expires_at,
            CacheChange::Reset => None,
        }
    }

    pub fn policy(&self) -> Option<ExpirationPolicy> {
        match self {
            CacheChange::ItemAdded { policy, .. }
            | CacheChange::ItemRemoved { policy, .. }
            | CacheChange::ItemValueReplaced { policy, .. }
            | CacheChange::ItemValueChanged { policy, .. }
            | CacheChange::ItemKeyChanged { policy, .. }
            | CacheChange::ItemExpired { policy, .. } => Some(*policy),
            CacheChange::Reset => None,
        }
    }
}

impl<K: Clone, V: Clone> CacheChange<K, V> {
    pub(crate) fn added(entry: &CacheEntry<K, V>) -> Self {
        CacheChange::ItemAdded {
            key: entry.key().clone(),
            value: entry.value().clone(),
            expires_at: entry.expires_at(),
            policy: entry.policy(),
        }
    }

    pub(crate) fn removed(entry: &CacheEntry<K, V>) -> Self {
        CacheChange::ItemRemoved {
            key: entry.key().clone(),
            value: entry.value().clone(),
            expires_at: entry.expires_at(),
            policy: entry.policy(),
        }
    }

    pub(crate) fn replaced(new_entry: &CacheEntry<K, V>, old_value: V) -> Self {
        CacheChange::ItemValueReplaced {
            key: new_entry.key().clone(),
            value: new_entry.value().clone(),
            old_value,
            expires_at: new_entry.expires_at(),
            policy: new_entry.policy(),
        }
    }

    pub(crate) fn expired(entry: &CacheEntry<K, V>) -> Self {
        CacheChange::ItemExpired {
            key: entry.key().clone(),
            value: entry.value().clone(),
            expires_at: entry.expires_at(),
            policy: entry.policy(),
        }
    }

    pub(crate) fn value_changed(entry: &CacheEntry<K, V>, changed_property: Option<String>) -> Self {
        CacheChange::ItemValueChanged {
            key: entry.key().clone(),
            value: entry.value().clone(),
            changed_property,
            expires_at: entry.expires_at(),
            policy: entry.policy(),
        }
    }

    pub(crate) fn key_changed(entry: &CacheEntry<K, V>, changed_property: Option<String>) -> Self {
        CacheChange::ItemKeyChanged {
            key: entry.key().clone(),
            changed_property,
            expires_at: entry.expires_at(),
            policy: entry.policy(),
        }
    }
}

/// The full stream of cache changes.
///
/// Backed by a broadcast receiver: if this subscriber falls behind the
/// configured event capacity, the oldest events are dropped and a warning is
/// logged, but the cache itself never blocks.
pub struct ChangeStream<K, V> {
    rx: broadcast::Receiver<CacheChange<K, V>>,
}

impl<K: Clone, V: Clone> ChangeStream<K, V> {
    pub(crate) fn new(rx: broadcast::Receiver<CacheChange<K, V>>) -> Self {
        Self { rx }
    }

    /// Receives the next change, or `None` once the cache closed its streams.
    pub async fn recv(&mut self) -> Option<CacheChange<K, V>> {
        loop {
            match self.rx.recv().await {
                Ok(change) => return Some(change),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!("change stream lagged, skipped {skipped} events");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv); `None` when no event is
    /// ready or the stream completed.
    pub fn try_recv(&mut self) -> Option<CacheChange<K, V>> {
        loop {
            match self.rx.try_recv() {
                Ok(change) => return Some(change),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}

/// A typed sub-stream of [`ChangeStream`], delivering one category of change.
pub struct FilteredChanges<K, V> {
    inner: ChangeStream<K, V>,
    filter: fn(&CacheChange<K, V>) -> bool,
}

impl<K: Clone, V: Clone> FilteredChanges<K, V> {
    pub(crate) fn new(
        rx: broadcast::Receiver<CacheChange<K, V>>,
        filter: fn(&CacheChange<K, V>) -> bool,
    ) -> Self {
        Self {
            inner: ChangeStream::new(rx),
            filter,
        }
    }

    /// Receives the next matching change, or `None` once the cache closed
    /// its streams.
    pub async fn recv(&mut self) -> Option<CacheChange<K, V>> {
        loop {
            let change = self.inner.recv().await?;
            if (self.filter)(&change) {
                return Some(change);
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<CacheChange<K, V>> {
        loop {
            let change = self.inner.try_recv()?;
            if (self.filter)(&change) {
                return Some(change);
            }
        }
    }
}

pub(crate) fn is_value_change<K, V>(change: &CacheChange<K, V>) -> bool {
    matches!(
        change,
        CacheChange::ItemValueChanged { .. } | CacheChange::ItemValueReplaced { .. }
    )
}

pub(crate) fn is_key_change<K, V>(change: &CacheChange<K, V>) -> bool {
    matches!(change, CacheChange::ItemKeyChanged { .. })
}

pub(crate) fn is_expiration<K, V>(change: &CacheChange<K, V>) -> bool {
    matches!(change, CacheChange::ItemExpired { .. })
}

pub(crate) fn is_reset<K, V>(change: &CacheChange<K, V>) -> bool {
    change.is_reset()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::CacheEntry;
    use std::time::Duration;

    #[test]
    fn field_rules_per_kind() {
        let entry = CacheEntry::new("k", 7u32, ExpirationPolicy::Remove, Some(Duration::from_secs(1)));
        let added = CacheChange::added(&entry);
        assert_eq!(added.kind(), ChangeKind::Added);
        assert_eq!(added.key(), Some(&"k"));
        assert_eq!(added.old_value(), None);
        assert_eq!(added.policy(), Some(ExpirationPolicy::Remove));
        assert!(added.expires_at().is_some());

        let replaced = CacheChange::replaced(&entry, 3u32);
        assert_eq!(replaced.old_value(), Some(&3));

        let changed = CacheChange::value_changed(&entry, Some("field".into()));
        assert_eq!(changed.changed_property(), Some("field"));

        let reset: CacheChange<&str, u32> = CacheChange::Reset;
        assert!(reset.is_reset());
        assert_eq!(reset.key(), None);
        assert_eq!(reset.policy(), None);
        assert_eq!(reset.expires_at(), None);
    }

    #[test]
    fn category_filters() {
        let entry = CacheEntry::new("k", 7u32, ExpirationPolicy::DoNothing, None);
        assert!(is_value_change(&CacheChange::replaced(&entry, 1)));
        assert!(is_value_change(&CacheChange::value_changed(&entry, None)));
        assert!(!is_value_change(&CacheChange::added(&entry)));
        assert!(is_key_change(&CacheChange::key_changed(&entry, None)));
        assert!(is_expiration(&CacheChange::expired(&entry)));
        assert!(is_reset::<&str, u32>(&CacheChange::Reset));
    }
}
