//! Property-change forwarding capability.
//!
//! Keys and values are opaque to the cache, but some of them can announce
//! in-place mutations of their own state. That capability is never probed
//! from the type: the builder accepts an explicit [`PropertyChangeSource`]
//! per side, and entries only forward when one is configured.

use std::fmt;
use std::sync::Arc;

/// Listener invoked with the name of the property that changed.
pub type PropertyListener = Arc<dyn Fn(&str) + Send + Sync>;

/// Capability to subscribe a listener to a key's or value's own
/// property-change notifications.
pub trait PropertyChangeSource<T>: Send + Sync {
    /// Attaches `listener` to `target`; the returned subscription detaches
    /// it when dropped.
    fn subscribe(&self, target: &T, listener: PropertyListener) -> PropertySubscription;
}

/// RAII handle for a property-change subscription; unsubscribes on drop.
pub struct PropertySubscription {
    unsubscribe: Option<Box<dyn FnOnce() + Send>>,
}

impl PropertySubscription {
    /// Builds a subscription that runs `unsubscribe` exactly once, on drop.
    pub fn new(unsubscribe: impl FnOnce() + Send + 'static) -> Self {
        Self {
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }

    /// A subscription with nothing to detach.
    pub fn empty() -> Self {
        Self { unsubscribe: None }
    }
}

impl Drop for PropertySubscription {
    fn drop(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

impl fmt::Debug for PropertySubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropertySubscription")
            .field("armed", &self.unsubscribe.is_some())
            .finish()
    }
}
