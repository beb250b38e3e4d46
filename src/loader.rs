//! Refresh loaders.
//!
//! Entries added with [`ExpirationPolicy::Refresh`] need a way to obtain a
//! replacement value when they expire. The pipeline prefers the single-key
//! loader for one-entry batches and the bulk loader otherwise, falling back
//! to per-key single loads when no bulk loader is configured.
//!
//! [`ExpirationPolicy::Refresh`]: crate::ExpirationPolicy::Refresh

use async_trait::async_trait;

use crate::errors::BoxError;

/// Loads a replacement value for one expired key.
#[async_trait]
pub trait KeyLoader<K, V>: Send + Sync {
    async fn load(&self, key: &K) -> Result<V, BoxError>;
}

/// Loads replacement values for a batch of expired keys.
///
/// Keys missing from the returned pairs are simply not refreshed; keys the
/// cache no longer holds by the time the result lands are discarded.
#[async_trait]
pub trait BulkKeyLoader<K, V>: Send + Sync {
    async fn load_all(&self, keys: &[K]) -> Result<Vec<(K, V)>, BoxError>;
}

/// Adapter turning a plain closure into a [`KeyLoader`].
pub struct FnLoader<F>(pub F);

#[async_trait]
impl<K, V, F> KeyLoader<K, V> for FnLoader<F>
where
    K: Sync,
    V: Send,
    F: Fn(&K) -> Result<V, BoxError> + Send + Sync,
{
    async fn load(&self, key: &K) -> Result<V, BoxError> {
        (self.0)(key)
    }
}

/// Adapter turning a plain closure into a [`BulkKeyLoader`].
pub struct FnBulkLoader<F>(pub F);

#[async_trait]
impl<K, V, F> BulkKeyLoader<K, V> for FnBulkLoader<F>
where
    K: Sync,
    V: Send,
    F: Fn(&[K]) -> Result<Vec<(K, V)>, BoxError> + Send + Sync,
{
    async fn load_all(&self, keys: &[K]) -> Result<Vec<(K, V)>, BoxError> {
        (self.0)(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fn_loader_delegates() {
        let loader = FnLoader(|key: &String| Ok(key.len()));
        assert_eq!(loader.load(&"xyz".to_string()).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn fn_bulk_loader_delegates() {
        let loader = FnBulkLoader(|keys: &[u32]| Ok(keys.iter().map(|k| (*k, k + 1)).collect()));
        let loaded = loader.load_all(&[1, 2]).await.unwrap();
        assert_eq!(loaded, vec![(1, 2), (2, 3)]);
    }
}
