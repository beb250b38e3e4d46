//! # observable-cache
//!
//! An in-memory key/value cache whose every mutation, per-entry change, and
//! expiration is observable as a push-based event stream.
//!
//! Each entry carries its own time-to-live and an [`ExpirationPolicy`]
//! deciding what happens when the timer fires: keep the stale entry
//! ([`ExpirationPolicy::DoNothing`]), evict it ([`ExpirationPolicy::Remove`]),
//! or ask a configured loader for a replacement
//! ([`ExpirationPolicy::Refresh`]). Fired entries are buffered for a
//! configurable
//! chill window and handled in batches, so a burst of expirations costs one
//! pass and one bulk load.
//!
//! ## Features
//!
//! - Thread-safe reads and mutations, with bulk variants that report per-key
//!   outcomes
//! - Per-entry expiration with `DoNothing` / `Remove` / `Refresh` policies
//!   and single-key or bulk refresh loaders
//! - A merged [`CacheChange`] stream plus typed sub-streams (value changes,
//!   key changes, expirations, resets) and a count watch
//! - Suppression scopes that drop categories of notifications and can emit a
//!   synthetic `Reset` on release, with optional coalescing of large bursts
//! - Forwarding of the keys'/values' own property-change notifications via
//!   an explicit capability
//! - An observer-exception channel that lets subscribers decide whether a
//!   failing observer or loader is tolerated or tears the pipeline down
//!
//! ## Usage
//!
//! ```rust
//! use observable_cache::{CacheChange, ExpirationPolicy, ObservableCache};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let cache = ObservableCache::builder()
//!         .expiration_batch_window(Duration::from_millis(100))
//!         .build();
//!     let mut changes = cache.changes();
//!
//!     cache.add("session", 42).unwrap();
//!     cache
//!         .add_with(
//!             "token",
//!             7,
//!             Some(Duration::from_millis(50)),
//!             ExpirationPolicy::Remove,
//!         )
//!         .unwrap();
//!
//!     assert_eq!(cache.get(&"session").unwrap(), 42);
//!
//!     let first = changes.recv().await.unwrap();
//!     assert!(matches!(first, CacheChange::ItemAdded { key: "session", .. }));
//! }
//! ```
//!
//! ## Timing
//!
//! Expiration is never exact: an entry with time-to-live `d` fires its
//! `ItemExpired` within `[d, d + 2w]` where `w` is the configured batch
//! window. Tests drive all timing deterministically with tokio's paused
//! clock.

mod cache;
mod entry;
mod errors;
mod events;
mod expiration;
mod loader;
mod mux;
mod notify;
mod store;

pub use cache::{AddOutcome, CacheBuilder, ObservableCache};
pub use entry::ExpirationPolicy;
pub use errors::{BoxError, CacheError, ErrorStream, HandlerId, ObserverError};
pub use events::{CacheChange, ChangeKind, ChangeStream, FilteredChanges};
pub use loader::{BulkKeyLoader, FnBulkLoader, FnLoader, KeyLoader};
pub use mux::{ObserverId, SuppressionGuard};
pub use notify::{PropertyChangeSource, PropertyListener, PropertySubscription};
