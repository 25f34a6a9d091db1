//! Process-local compare-and-swap backend.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::{CasBackend, StoreError};

/// In-memory backend for tests and single-instance deployments.
///
/// DashMap's per-shard locking makes each compare-and-swap atomic. Records
/// never expire; [`evict`](Self::evict) drops one explicitly.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    records: DashMap<String, Vec<u8>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored buckets.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Drop a bucket, as an expiring store would.
    pub fn evict(&self, key: &str) -> bool {
        self.records.remove(key).is_some()
    }

    pub fn clear(&self) {
        self.records.clear();
    }
}

#[async_trait]
impl CasBackend for MemoryBackend {
    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.records.get(key).map(|record| record.value().clone()))
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Vec<u8>,
        _retain_for: Duration,
    ) -> Result<bool, StoreError> {
        let swapped = match (self.records.entry(key.to_string()), expected) {
            (Entry::Occupied(mut entry), Some(expected)) if entry.get().as_slice() == expected => {
                entry.insert(new);
                true
            }
            (Entry::Vacant(entry), None) => {
                entry.insert(new);
                true
            }
            _ => false,
        };
        Ok(swapped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RETAIN: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn test_insert_only_when_absent() {
        let backend = MemoryBackend::new();

        assert!(backend.compare_and_swap("k", None, b"one".to_vec(), RETAIN).await.unwrap());
        assert!(!backend.compare_and_swap("k", None, b"two".to_vec(), RETAIN).await.unwrap());
        assert_eq!(backend.load("k").await.unwrap(), Some(b"one".to_vec()));
    }

    #[tokio::test]
    async fn test_swap_requires_matching_value() {
        let backend = MemoryBackend::new();
        backend.compare_and_swap("k", None, b"one".to_vec(), RETAIN).await.unwrap();

        assert!(!backend
            .compare_and_swap("k", Some(b"stale"), b"two".to_vec(), RETAIN)
            .await
            .unwrap());
        assert!(backend
            .compare_and_swap("k", Some(b"one"), b"two".to_vec(), RETAIN)
            .await
            .unwrap());
        assert_eq!(backend.load("k").await.unwrap(), Some(b"two".to_vec()));
    }

    #[tokio::test]
    async fn test_swap_against_missing_key_fails() {
        let backend = MemoryBackend::new();
        assert!(!backend
            .compare_and_swap("k", Some(b"one"), b"two".to_vec(), RETAIN)
            .await
            .unwrap());
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn test_evict() {
        let backend = MemoryBackend::new();
        backend.compare_and_swap("k", None, b"one".to_vec(), RETAIN).await.unwrap();
        assert_eq!(backend.len(), 1);
        assert!(backend.evict("k"));
        assert!(backend.load("k").await.unwrap().is_none());
    }
}
