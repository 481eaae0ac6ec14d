//! Property-based tests for the pool/cache invariants spec.md §8 lists.
//!
//! Each property is checked against randomly generated provider topologies
//! and concurrency levels, driving the async pool/cache machinery from a
//! blocking `tokio::runtime::Runtime` the way a sync `proptest!` body has to
//! when the thing under test is itself async.

use std::sync::Arc;

use proptest::collection::vec as pvec;
use proptest::prelude::*;
use tokio_util::sync::CancellationToken;

use nntp_core::cache::CachingClient;
use nntp_core::client::{ArticleStatus, MockClientFactory, MockNntpClient};
use nntp_core::multi::{MultiNntpClient, UsenetClient};
use nntp_core::{ConnectionPool, ProviderAllocator, ProviderRecord};

fn provider(name: &str, max: u32) -> ProviderRecord {
    ProviderRecord {
        name: name.to_string(),
        host: "news.example.com".into(),
        port: 119,
        use_ssl: false,
        user: String::new(),
        pass: String::new(),
        connections: max,
    }
}

fn rt() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Invariant 1 & 2: for any provider cap topology, every provider's live
    /// count stays within its own cap, and the pool never has more
    /// concurrently-leased connections than the sum of the caps.
    #[test]
    fn live_counts_never_exceed_provider_caps(caps in pvec(1u32..4, 1..4), extra_acquires in 0usize..4) {
        rt().block_on(async move {
            let factory = Arc::new(MockClientFactory::new(MockNntpClient::new));
            let providers: Vec<_> = caps
                .iter()
                .enumerate()
                .map(|(i, &max)| provider(&format!("p{i}"), max))
                .collect();
            let total: u32 = caps.iter().sum();
            let allocator = ProviderAllocator::new(providers, factory);
            let pool = ConnectionPool::new(allocator.clone(), None);

            // Try to acquire more than total capacity concurrently; only
            // `total` should succeed without blocking, the rest queue.
            let attempts = total as usize + extra_acquires;
            let mut handles = Vec::new();
            for _ in 0..attempts {
                let pool = Arc::clone(&pool);
                handles.push(tokio::spawn(async move {
                    pool.acquire(CancellationToken::new()).await
                }));
            }

            // Give the first `total` leases a chance to land; anything past
            // that legitimately blocks until we cancel it below.
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;

            prop_assert!(pool.stats().live <= total);
            for (i, &live) in allocator.live_counts().iter().enumerate() {
                prop_assert!(live <= caps[i]);
            }

            for handle in handles {
                handle.abort();
            }
            Ok(())
        })?;
    }

    /// Invariant 3: every successful acquire is paired with exactly one
    /// release, even when some callers are cancelled mid-wait, no lease is
    /// ever leaked, so after all tasks finish the pool's idle+live count
    /// never exceeds what was actually created.
    #[test]
    fn leases_are_never_leaked_under_cancellation(max in 1u32..3, waiters in 1usize..6) {
        rt().block_on(async move {
            let factory = Arc::new(MockClientFactory::new(MockNntpClient::new));
            let allocator = ProviderAllocator::new(vec![provider("a", max)], factory);
            let pool = ConnectionPool::new(allocator, None);

            let mut held = Vec::new();
            for _ in 0..max {
                held.push(pool.acquire(CancellationToken::new()).await.unwrap());
            }

            let cancel = CancellationToken::new();
            let mut handles = Vec::new();
            for _ in 0..waiters {
                let pool = Arc::clone(&pool);
                let cancel = cancel.clone();
                handles.push(tokio::spawn(async move { pool.acquire(cancel).await }));
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            cancel.cancel();
            for handle in handles {
                let _ = handle.await;
            }

            // Releasing every held lease must bring the pool back to a fully
            // idle state with no stray leases outstanding.
            held.clear();
            let stats = pool.stats();
            prop_assert_eq!(stats.live, 0);
            prop_assert_eq!(stats.idle, max);
            Ok(())
        })?;
    }

    /// Invariant 5: a cache built with capacity `C` never holds more than
    /// `C` entries, regardless of how many distinct keys are requested.
    #[test]
    fn cache_never_exceeds_its_capacity(capacity in 1usize..8, key_count in 1usize..40) {
        rt().block_on(async move {
            let factory = Arc::new(MockClientFactory::new(MockNntpClient::new));
            let allocator = ProviderAllocator::new(vec![provider("a", 2)], factory);
            let pool = ConnectionPool::new(allocator, None);
            let multi: Arc<dyn UsenetClient> =
                Arc::new(MultiNntpClient::new(pool, std::time::Duration::from_secs(30)));
            let cache = CachingClient::with_capacity(multi, capacity);

            for i in 0..key_count {
                let _ = cache
                    .stat(&format!("m{i}"), CancellationToken::new())
                    .await;
                prop_assert!(cache.len() <= capacity);
            }
            prop_assert!(cache.len() <= capacity);
            Ok(())
        })?;
    }

    /// Invariant 6: a cached `stat` result is stable across repeated reads
    /// as long as the underlying truth doesn't change, the cache must
    /// never silently mutate a previously observed value.
    #[test]
    fn cached_stat_is_stable_across_repeated_reads(reads in 2usize..10) {
        rt().block_on(async move {
            let factory = Arc::new(MockClientFactory::new(|| {
                MockNntpClient::new().script_stat(vec![Ok(ArticleStatus::Exists); 1])
            }));
            let allocator = ProviderAllocator::new(vec![provider("a", 1)], factory);
            let pool = ConnectionPool::new(allocator, None);
            let multi: Arc<dyn UsenetClient> =
                Arc::new(MultiNntpClient::new(pool, std::time::Duration::from_secs(30)));
            let cache = CachingClient::new(multi);

            let first = cache.stat("m1", CancellationToken::new()).await.unwrap();
            for _ in 1..reads {
                let again = cache.stat("m1", CancellationToken::new()).await.unwrap();
                prop_assert_eq!(again, first);
            }
            Ok(())
        })?;
    }
}
