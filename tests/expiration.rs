//! End-to-end expiration scenarios, driven on tokio's paused clock so every
//! timing property is deterministic.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use observable_cache::{CacheError, ChangeKind, ExpirationPolicy, ObservableCache};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[tokio::test(start_paused = true)]
async fn remove_policy_evicts_and_announces_in_order() {
    init_logging();
    let cache: ObservableCache<&str, u32> = ObservableCache::builder()
        .expiration_batch_window(Duration::from_millis(100))
        .build();
    let mut changes = cache.changes();

    cache
        .add_with("a", 1, Some(Duration::from_millis(50)), ExpirationPolicy::Remove)
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let added = changes.recv().await.unwrap();
    assert_eq!(added.kind(), ChangeKind::Added);
    assert_eq!(added.key(), Some(&"a"));

    let expired = changes.recv().await.unwrap();
    assert_eq!(expired.kind(), ChangeKind::Expired);
    assert_eq!(expired.value(), Some(&1));

    let removed = changes.recv().await.unwrap();
    assert_eq!(removed.kind(), ChangeKind::Removed);
    assert_eq!(removed.value(), Some(&1));

    assert!(!cache.contains(&"a"));
    assert_eq!(cache.get(&"a"), Err(CacheError::KeyNotFound));
}

#[tokio::test(start_paused = true)]
async fn refresh_policy_reloads_and_rearms() {
    init_logging();
    let cache: ObservableCache<&str, usize> = ObservableCache::builder()
        .expiration_batch_window(Duration::from_millis(100))
        .single_loader_fn(|key: &&str| Ok(key.len()))
        .build();
    let mut changes = cache.changes();

    cache
        .add_with("xyz", 0, Some(Duration::from_millis(50)), ExpirationPolicy::Refresh)
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(changes.recv().await.unwrap().kind(), ChangeKind::Added);

    let expired = changes.recv().await.unwrap();
    assert_eq!(expired.kind(), ChangeKind::Expired);
    assert_eq!(expired.value(), Some(&0));

    let replaced = changes.recv().await.unwrap();
    assert_eq!(replaced.kind(), ChangeKind::ValueReplaced);
    assert_eq!(replaced.old_value(), Some(&0));
    assert_eq!(replaced.value(), Some(&3));

    assert_eq!(cache.get_with(&"xyz", false).unwrap(), 3);
    // The replacement runs a fresh lifetime of the original expiry.
    assert!(replaced.expires_at().unwrap() > expired.expires_at().unwrap());
}

#[tokio::test(start_paused = true)]
async fn refresh_with_equal_value_rearms_without_replacement() {
    init_logging();
    let cache: ObservableCache<&str, usize> = ObservableCache::builder()
        .expiration_batch_window(Duration::from_millis(20))
        .single_loader_fn(|key: &&str| Ok(key.len()))
        .build();
    let mut changes = cache.changes();

    // The stored value already equals what the loader returns.
    cache
        .add_with("xyz", 3, Some(Duration::from_millis(50)), ExpirationPolicy::Refresh)
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(changes.recv().await.unwrap().kind(), ChangeKind::Added);
    assert_eq!(changes.recv().await.unwrap().kind(), ChangeKind::Expired);
    // No replacement event; the entry is simply armed again.
    assert!(changes.try_recv().is_none());
    assert_eq!(cache.get(&"xyz").unwrap(), 3);
    assert!(cache.expires_in(&"xyz").unwrap().unwrap() > Duration::ZERO);
}

#[tokio::test(start_paused = true)]
async fn do_nothing_policy_keeps_expired_entries_readable() {
    init_logging();
    let cache: ObservableCache<&str, u32> = ObservableCache::builder()
        .expiration_batch_window(Duration::from_millis(10))
        .build();

    cache
        .add_with("k", 1, Some(Duration::from_millis(10)), ExpirationPolicy::DoNothing)
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(cache.get_with(&"k", false).unwrap(), 1);
    assert!(matches!(
        cache.get(&"k"),
        Err(CacheError::KeyHasExpired { .. })
    ));
    assert!(cache.contains(&"k"));
    // Expired DoNothing entries stay visible in value snapshots.
    assert_eq!(cache.values(), vec![1]);
}

#[tokio::test(start_paused = true)]
async fn bulk_refresh_coalesces_one_batch() {
    init_logging();
    let loads = Arc::new(AtomicUsize::new(0));
    let counted = Arc::clone(&loads);
    let cache: ObservableCache<&str, u32> = ObservableCache::builder()
        .expiration_batch_window(Duration::from_millis(100))
        .bulk_loader_fn(move |keys: &[&str]| {
            counted.fetch_add(1, Ordering::SeqCst);
            Ok(keys
                .iter()
                .map(|key| {
                    let next = match *key {
                        "a" => 2,
                        "b" => 3,
                        _ => 4,
                    };
                    (*key, next)
                })
                .collect())
        })
        .build();
    let mut changes = cache.changes();

    for (key, value) in [("a", 1), ("b", 2), ("c", 3)] {
        cache
            .add_with(key, value, Some(Duration::from_millis(50)), ExpirationPolicy::Refresh)
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    for _ in 0..3 {
        assert_eq!(changes.recv().await.unwrap().kind(), ChangeKind::Added);
    }
    // All expirations of the batch precede any policy consequence.
    for _ in 0..3 {
        assert_eq!(changes.recv().await.unwrap().kind(), ChangeKind::Expired);
    }
    for _ in 0..3 {
        assert_eq!(changes.recv().await.unwrap().kind(), ChangeKind::ValueReplaced);
    }

    assert_eq!(loads.load(Ordering::SeqCst), 1);
    let mut values = cache.values();
    values.sort_unstable();
    assert_eq!(values, vec![2, 3, 4]);
}

#[tokio::test(start_paused = true)]
async fn expiration_lands_within_two_batch_windows() {
    init_logging();
    let cache: ObservableCache<&str, u32> = ObservableCache::builder()
        .expiration_batch_window(Duration::from_millis(100))
        .build();
    let mut expirations = cache.expirations();

    let start = tokio::time::Instant::now();
    cache
        .add_with("a", 1, Some(Duration::from_millis(200)), ExpirationPolicy::Remove)
        .unwrap();

    let event = expirations.recv().await.unwrap();
    assert_eq!(event.key(), Some(&"a"));
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(200), "fired early: {elapsed:?}");
    assert!(elapsed <= Duration::from_millis(400), "fired late: {elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn zero_window_processes_immediately() {
    init_logging();
    let cache: ObservableCache<&str, u32> = ObservableCache::builder()
        .expiration_batch_window(Duration::ZERO)
        .build();
    let mut changes = cache.changes();

    cache
        .add_with("a", 1, Some(Duration::from_millis(10)), ExpirationPolicy::Remove)
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(changes.recv().await.unwrap().kind(), ChangeKind::Added);
    assert_eq!(changes.recv().await.unwrap().kind(), ChangeKind::Expired);
    assert_eq!(changes.recv().await.unwrap().kind(), ChangeKind::Removed);
    assert!(!cache.contains(&"a"));
}

#[tokio::test(start_paused = true)]
async fn removal_during_the_window_suppresses_the_expiration() {
    init_logging();
    let cache: ObservableCache<&str, u32> = ObservableCache::builder()
        .expiration_batch_window(Duration::from_millis(200))
        .build();
    let mut changes = cache.changes();

    cache
        .add_with("a", 1, Some(Duration::from_millis(50)), ExpirationPolicy::Remove)
        .unwrap();
    // The timer fires at 50ms; remove the entry while the batch window is
    // still open.
    tokio::time::sleep(Duration::from_millis(60)).await;
    cache.remove(&"a").unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;

    assert_eq!(changes.recv().await.unwrap().kind(), ChangeKind::Added);
    assert_eq!(changes.recv().await.unwrap().kind(), ChangeKind::Removed);
    assert!(changes.try_recv().is_none());
}

#[tokio::test(start_paused = true)]
async fn resurrection_after_do_nothing_expiry_fires_again() {
    init_logging();
    let cache: ObservableCache<&str, u32> = ObservableCache::builder()
        .expiration_batch_window(Duration::from_millis(10))
        .build();
    let mut expirations = cache.expirations();

    cache
        .add_with("k", 1, Some(Duration::from_millis(10)), ExpirationPolicy::DoNothing)
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(expirations.try_recv().is_some());

    cache
        .update_expiration(&"k", Some(Duration::from_millis(30)))
        .unwrap();
    assert_eq!(cache.get(&"k").unwrap(), 1);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let again = expirations.try_recv().expect("second expiration after resurrection");
    assert_eq!(again.key(), Some(&"k"));
}

#[tokio::test(start_paused = true)]
async fn unhandled_loader_failure_degrades_the_cache() {
    init_logging();
    let cache: ObservableCache<&str, u32> = ObservableCache::builder()
        .expiration_batch_window(Duration::from_millis(10))
        .single_loader_fn(|_: &&str| Err("backing store unreachable".into()))
        .build();
    let mut changes = cache.changes();

    cache
        .add_with("a", 1, Some(Duration::from_millis(10)), ExpirationPolicy::Refresh)
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(cache.is_degraded());
    // The entry keeps its pre-refresh state and stays past expiry.
    assert_eq!(cache.get_with(&"a", false).unwrap(), 1);
    assert!(matches!(
        cache.get(&"a"),
        Err(CacheError::KeyHasExpired { .. })
    ));
    // Mutations still work in the degraded state.
    cache.add("b", 2).unwrap();

    // The change stream delivered what happened before the teardown, then
    // completed.
    assert_eq!(changes.recv().await.unwrap().kind(), ChangeKind::Added);
    assert_eq!(changes.recv().await.unwrap().kind(), ChangeKind::Expired);
    assert!(changes.recv().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn handled_loader_failure_keeps_the_pipeline_alive() {
    init_logging();
    let cache: ObservableCache<&str, u32> = ObservableCache::builder()
        .expiration_batch_window(Duration::from_millis(10))
        .single_loader_fn(|_: &&str| Err("transient".into()))
        .build();
    cache.on_observer_error(|err| err.mark_handled());
    let mut errors = cache.observer_errors();

    cache
        .add_with("a", 1, Some(Duration::from_millis(10)), ExpirationPolicy::Refresh)
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(!cache.is_degraded());
    let seen = errors.try_recv().expect("loader failure on the error stream");
    assert!(seen.is_handled());
    assert!(seen.message().contains("refresh loader failed"));

    // Failed refreshes are not retried: the entry stays expired until acted
    // upon.
    assert!(matches!(
        cache.get(&"a"),
        Err(CacheError::KeyHasExpired { .. })
    ));
}
