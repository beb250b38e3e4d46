//! Error types surfaced by the cache and the observer-exception channel.

use std::any::Any;
use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio::time::Instant;

/// Boxed error type accepted from loaders and observers.
pub type BoxError = Box<dyn Error + Send + Sync + 'static>;

/// Errors returned by cache operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    /// The key is already present and `add` refuses to overwrite it.
    #[error("key already exists in the cache")]
    KeyAlreadyExists,

    /// The key is not present in the cache.
    #[error("key was not found in the cache")]
    KeyNotFound,

    /// The entry is past its expiration instant and the read asked for
    /// unexpired values only.
    #[error("entry expired at {expired_at:?}")]
    KeyHasExpired {
        /// The instant the entry expired at.
        expired_at: Instant,
    },

    /// The operation cannot be carried out with the configuration the cache
    /// was built with.
    #[error("invalid cache configuration: {0}")]
    InvalidConfiguration(&'static str),

    /// The cache has been closed; only `close` itself is idempotent.
    #[error("cache has been closed")]
    Closed,

    /// Several per-key failures rolled into one.
    #[error("{} cache operations failed", .0.len())]
    Aggregate(Vec<CacheError>),
}

impl PartialEq for CacheError {
    fn eq(&self, other: &Self) -> bool {
        use CacheError::*;
        match (self, other) {
            (KeyAlreadyExists, KeyAlreadyExists) => true,
            (KeyNotFound, KeyNotFound) => true,
            (KeyHasExpired { expired_at: a }, KeyHasExpired { expired_at: b }) => a == b,
            (InvalidConfiguration(a), InvalidConfiguration(b)) => a == b,
            (Closed, Closed) => true,
            (Aggregate(a), Aggregate(b)) => a == b,
            _ => false,
        }
    }
}

impl CacheError {
    /// Collapses a list of per-key failures into a single error: the failure
    /// itself when there is exactly one, `Aggregate` otherwise.
    pub(crate) fn aggregate(mut errors: Vec<CacheError>) -> CacheError {
        if errors.len() == 1 {
            errors.remove(0)
        } else {
            CacheError::Aggregate(errors)
        }
    }
}

/// A failure raised by user code the cache called into: a callback observer,
/// a property-change listener, or a refresh loader.
///
/// Handlers registered through the cache see every record synchronously and
/// may mark it handled; the raising site reads the flag once afterwards to
/// decide whether the surrounding pipeline continues or tears down.
pub struct ObserverError {
    message: String,
    cause: Option<BoxError>,
    handled: AtomicBool,
}

impl ObserverError {
    pub(crate) fn from_error(context: &str, cause: BoxError) -> Arc<Self> {
        Arc::new(Self {
            message: format!("{context}: {cause}"),
            cause: Some(cause),
            handled: AtomicBool::new(false),
        })
    }

    pub(crate) fn from_panic(context: &str, payload: Box<dyn Any + Send>) -> Arc<Self> {
        let detail = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "opaque panic payload".to_string()
        };
        Arc::new(Self {
            message: format!("{context}: panicked: {detail}"),
            cause: None,
            handled: AtomicBool::new(false),
        })
    }

    /// Human-readable description of the failure.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The underlying error, when the failure was a returned error rather
    /// than a panic.
    pub fn cause(&self) -> Option<&(dyn Error + Send + Sync + 'static)> {
        self.cause.as_deref()
    }

    /// Marks this failure as handled so the raising site carries on.
    pub fn mark_handled(&self) {
        self.handled.store(true, Ordering::SeqCst);
    }

    /// Whether some handler marked this failure as handled.
    pub fn is_handled(&self) -> bool {
        self.handled.load(Ordering::SeqCst)
    }
}

impl fmt::Display for ObserverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl fmt::Debug for ObserverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserverError")
            .field("message", &self.message)
            .field("handled", &self.is_handled())
            .finish()
    }
}

type ErrorHandler = Arc<dyn Fn(&ObserverError) + Send + Sync>;

/// Identifier for a registered observer-error handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(pub(crate) u64);

/// The observer-exception channel: synchronous handlers plus a broadcast
/// mirror stream.
pub(crate) struct ErrorChannel {
    handlers: RwLock<Vec<(HandlerId, ErrorHandler)>>,
    next_id: AtomicU64,
    stream: broadcast::Sender<Arc<ObserverError>>,
}

impl ErrorChannel {
    pub(crate) fn new(capacity: usize) -> Arc<Self> {
        let (stream, _) = broadcast::channel(capacity);
        Arc::new(Self {
            handlers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(0),
            stream,
        })
    }

    pub(crate) fn register(&self, handler: ErrorHandler) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers.write().push((id, handler));
        id
    }

    pub(crate) fn unregister(&self, id: HandlerId) {
        self.handlers.write().retain(|(hid, _)| *hid != id);
    }

    /// Publishes the record to all handlers and the mirror stream, then
    /// reports whether any handler marked it handled.
    pub(crate) fn publish(&self, err: &Arc<ObserverError>) -> bool {
        let handlers: Vec<ErrorHandler> =
            self.handlers.read().iter().map(|(_, h)| Arc::clone(h)).collect();
        for handler in handlers {
            let call = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(err)));
            if call.is_err() {
                log::warn!("observer-error handler panicked; skipping it");
            }
        }
        let _ = self.stream.send(Arc::clone(err));
        err.is_handled()
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<Arc<ObserverError>> {
        self.stream.subscribe()
    }
}

/// Stream of [`ObserverError`] records, one per failed call into user code.
pub struct ErrorStream {
    rx: broadcast::Receiver<Arc<ObserverError>>,
}

impl ErrorStream {
    pub(crate) fn new(rx: broadcast::Receiver<Arc<ObserverError>>) -> Self {
        Self { rx }
    }

    /// Receives the next record, or `None` once the cache is closed.
    pub async fn recv(&mut self) -> Option<Arc<ObserverError>> {
        loop {
            match self.rx.recv().await {
                Ok(err) => return Some(err),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!("observer-error stream lagged, skipped {skipped} records");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<Arc<ObserverError>> {
        loop {
            match self.rx.try_recv() {
                Ok(err) => return Some(err),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}
