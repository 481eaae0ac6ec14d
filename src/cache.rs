//! Caching decorator: wraps any [`UsenetClient`] and memoizes the
//! cacheable metadata operations (`stat`, `date`, `get_segment_header`,
//! `get_file_size`) under a bounded, LRU-evicted map. `get_segment_stream`
//! passes straight through, since streams are single-use and never cached.
//!
//! Single-flight coalescing (spec.md's "at-most-one-builder-per-key") is
//! implemented with [`tokio::sync::OnceCell::get_or_try_init`]: concurrent
//! callers for the same key share one in-flight fetch, and a failed fetch
//! leaves the cell uninitialized so the next caller tries again rather than
//! seeing a cached error.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::client::{ArticleStatus, SegmentBodyStream, SegmentHeader};
use crate::error::{NntpError, Result};
use crate::multi::UsenetClient;

/// Default cache capacity from spec.md §4.4 (8,192 entries, LRU eviction).
pub const DEFAULT_CAPACITY: usize = 8192;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum CacheKey {
    Stat(String),
    Header(String),
    FileSize(String),
    Date,
}

#[derive(Clone)]
enum CacheValue {
    Stat(ArticleStatus),
    Header(Option<SegmentHeader>),
    FileSize(Option<u64>),
    Date(DateTime<Utc>),
}

struct CacheEntry {
    cell: Arc<OnceCell<CacheValue>>,
    last_accessed: Instant,
}

/// Point-in-time hit/miss counters, exposed for observability.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl CacheStats {
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }
    pub fn hit_rate(&self) -> f64 {
        let (hits, misses) = (self.hits() as f64, self.misses() as f64);
        if hits + misses == 0.0 {
            0.0
        } else {
            hits / (hits + misses)
        }
    }
}

/// A bounded, single-flight metadata cache in front of any [`UsenetClient`].
pub struct CachingClient {
    inner: Arc<dyn UsenetClient>,
    map: RwLock<HashMap<CacheKey, CacheEntry>>,
    capacity: usize,
    stats: CacheStats,
}

impl CachingClient {
    pub fn new(inner: Arc<dyn UsenetClient>) -> Self {
        Self::with_capacity(inner, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(inner: Arc<dyn UsenetClient>, capacity: usize) -> Self {
        Self {
            inner,
            map: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            stats: CacheStats::default(),
        }
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fetch (or create) the single-flight cell for a key, recording a hit
    /// if it was already present, and evicting the least-recently-touched
    /// entry if this insert pushed the map over capacity.
    fn cell_for(&self, key: CacheKey) -> Arc<OnceCell<CacheValue>> {
        let mut map = self.map.write();
        if let Some(entry) = map.get_mut(&key) {
            entry.last_accessed = Instant::now();
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            return Arc::clone(&entry.cell);
        }
        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        let cell = Arc::new(OnceCell::new());
        map.insert(
            key,
            CacheEntry {
                cell: Arc::clone(&cell),
                last_accessed: Instant::now(),
            },
        );
        if map.len() > self.capacity {
            if let Some(stale_key) = map
                .iter()
                .min_by_key(|(_, entry)| entry.last_accessed)
                .map(|(k, _)| k.clone())
            {
                map.remove(&stale_key);
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                debug!("evicted stale cache entry");
            }
        }
        cell
    }
}

#[async_trait]
impl UsenetClient for CachingClient {
    async fn stat(&self, message_id: &str, cancel: CancellationToken) -> Result<ArticleStatus> {
        let cell = self.cell_for(CacheKey::Stat(message_id.to_string()));
        let value = cell
            .get_or_try_init(|| async {
                self.inner
                    .stat(message_id, cancel)
                    .await
                    .map(CacheValue::Stat)
            })
            .await?;
        match value {
            CacheValue::Stat(status) => Ok(*status),
            _ => unreachable!("cache key/value kind mismatch"),
        }
    }

    async fn date(&self, cancel: CancellationToken) -> Result<DateTime<Utc>> {
        let cell = self.cell_for(CacheKey::Date);
        let value = cell
            .get_or_try_init(|| async { self.inner.date(cancel).await.map(CacheValue::Date) })
            .await?;
        match value {
            CacheValue::Date(when) => Ok(*when),
            _ => unreachable!("cache key/value kind mismatch"),
        }
    }

    async fn get_segment_header(
        &self,
        message_id: &str,
        cancel: CancellationToken,
    ) -> Result<Option<SegmentHeader>> {
        let cell = self.cell_for(CacheKey::Header(message_id.to_string()));
        let value = cell
            .get_or_try_init(|| async {
                self.inner
                    .get_segment_header(message_id, cancel)
                    .await
                    .map(CacheValue::Header)
            })
            .await?;
        match value {
            CacheValue::Header(header) => Ok(header.clone()),
            _ => unreachable!("cache key/value kind mismatch"),
        }
    }

    async fn get_file_size(&self, message_id: &str, cancel: CancellationToken) -> Result<Option<u64>> {
        let cell = self.cell_for(CacheKey::FileSize(message_id.to_string()));
        let value = cell
            .get_or_try_init(|| async {
                self.inner
                    .get_file_size(message_id, cancel)
                    .await
                    .map(CacheValue::FileSize)
            })
            .await?;
        match value {
            CacheValue::FileSize(size) => Ok(*size),
            _ => unreachable!("cache key/value kind mismatch"),
        }
    }

    /// Streams are single-use; never cached, never coalesced.
    async fn get_segment_stream(
        &self,
        message_id: &str,
        cancel: CancellationToken,
    ) -> Result<SegmentBodyStream> {
        self.inner.get_segment_stream(message_id, cancel).await
    }

    async fn wait_for_ready(&self, cancel: CancellationToken) -> Result<()> {
        self.inner.wait_for_ready(cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingClient {
        calls: AtomicUsize,
        result: ArticleStatus,
    }

    #[async_trait]
    impl UsenetClient for CountingClient {
        async fn stat(&self, _message_id: &str, _cancel: CancellationToken) -> Result<ArticleStatus> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            Ok(self.result)
        }
        async fn date(&self, _cancel: CancellationToken) -> Result<DateTime<Utc>> {
            Ok(Utc::now())
        }
        async fn get_segment_header(
            &self,
            _message_id: &str,
            _cancel: CancellationToken,
        ) -> Result<Option<SegmentHeader>> {
            Ok(None)
        }
        async fn get_file_size(&self, _message_id: &str, _cancel: CancellationToken) -> Result<Option<u64>> {
            Ok(None)
        }
        async fn get_segment_stream(
            &self,
            _message_id: &str,
            _cancel: CancellationToken,
        ) -> Result<SegmentBodyStream> {
            unimplemented!()
        }
        async fn wait_for_ready(&self, _cancel: CancellationToken) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn concurrent_stat_calls_coalesce_into_one_fetch() {
        let inner = Arc::new(CountingClient {
            calls: AtomicUsize::new(0),
            result: ArticleStatus::Exists,
        });
        let cache = Arc::new(CachingClient::new(inner.clone()));

        let (a, b) = tokio::join!(
            cache.stat("m1", CancellationToken::new()),
            cache.stat("m1", CancellationToken::new())
        );
        assert_eq!(a.unwrap(), ArticleStatus::Exists);
        assert_eq!(b.unwrap(), ArticleStatus::Exists);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_article_is_cached_as_a_stable_fact() {
        let inner = Arc::new(CountingClient {
            calls: AtomicUsize::new(0),
            result: ArticleStatus::Missing,
        });
        let cache = CachingClient::new(inner.clone());

        let first = cache.stat("m1", CancellationToken::new()).await.unwrap();
        let second = cache.stat("m1", CancellationToken::new()).await.unwrap();
        assert_eq!(first, ArticleStatus::Missing);
        assert_eq!(second, ArticleStatus::Missing);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
    }

    struct FailingThenSucceedingClient {
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl UsenetClient for FailingThenSucceedingClient {
        async fn stat(&self, _message_id: &str, _cancel: CancellationToken) -> Result<ArticleStatus> {
            if self.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(NntpError::Other("transient".into()))
            } else {
                Ok(ArticleStatus::Exists)
            }
        }
        async fn date(&self, _cancel: CancellationToken) -> Result<DateTime<Utc>> {
            Ok(Utc::now())
        }
        async fn get_segment_header(
            &self,
            _message_id: &str,
            _cancel: CancellationToken,
        ) -> Result<Option<SegmentHeader>> {
            Ok(None)
        }
        async fn get_file_size(&self, _message_id: &str, _cancel: CancellationToken) -> Result<Option<u64>> {
            Ok(None)
        }
        async fn get_segment_stream(
            &self,
            _message_id: &str,
            _cancel: CancellationToken,
        ) -> Result<SegmentBodyStream> {
            unimplemented!()
        }
        async fn wait_for_ready(&self, _cancel: CancellationToken) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn errors_are_not_cached() {
        let inner = Arc::new(FailingThenSucceedingClient {
            attempts: AtomicUsize::new(0),
        });
        let cache = CachingClient::new(inner);

        let first = cache.stat("m1", CancellationToken::new()).await;
        assert!(first.is_err());
        let second = cache.stat("m1", CancellationToken::new()).await;
        assert_eq!(second.unwrap(), ArticleStatus::Exists);
    }

    #[tokio::test]
    async fn capacity_is_enforced() {
        let inner = Arc::new(CountingClient {
            calls: AtomicUsize::new(0),
            result: ArticleStatus::Exists,
        });
        let cache = CachingClient::with_capacity(inner, 4);
        for i in 0..10 {
            cache
                .stat(&format!("m{i}"), CancellationToken::new())
                .await
                .unwrap();
        }
        assert!(cache.len() <= 4);
        assert!(cache.stats().evictions() > 0);
    }
}
