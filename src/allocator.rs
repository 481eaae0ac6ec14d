//! Provider allocator: picks which configured provider a new connection
//! should be created against, enforcing per-provider connection caps while
//! rotating fairly across providers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::client::{ClientFactory, NntpClient};
use crate::config::ProviderRecord;
use crate::error::{NntpError, Result};

struct Inner {
    live: Vec<u32>,
    cursor: usize,
}

/// Scans the configured provider list under a short lock, hands out
/// connections against whichever provider has spare capacity, and
/// guarantees the slot it reserved is released exactly once.
pub struct ProviderAllocator {
    providers: Vec<ProviderRecord>,
    inner: Mutex<Inner>,
    factory: Arc<dyn ClientFactory>,
}

impl ProviderAllocator {
    pub fn new(providers: Vec<ProviderRecord>, factory: Arc<dyn ClientFactory>) -> Arc<Self> {
        let live = vec![0; providers.len()];
        Arc::new(Self {
            providers,
            inner: Mutex::new(Inner { live, cursor: 0 }),
            factory,
        })
    }

    /// Sum of every provider's connection cap, clamped to at least 1, the
    /// pool's own maximum size.
    pub fn total_connections(&self) -> u32 {
        self.providers
            .iter()
            .map(|p| p.max_connections())
            .sum::<u32>()
            .max(1)
    }

    /// Create a new connection against the next eligible provider.
    ///
    /// Selection and the live-count increment happen under a single short
    /// lock; the network round trip (connect + authenticate) happens
    /// outside it. On failure the reserved slot is released before the
    /// error is returned to the caller.
    pub async fn create_connection(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> Result<ScopedConnection> {
        let index = self.reserve_slot()?;
        let provider = &self.providers[index];
        debug!(provider = %provider.name, index, "creating new connection");

        match self.factory.connect(provider, cancel).await {
            Ok(client) => Ok(ScopedConnection {
                client: Some(client),
                provider_index: index,
                allocator: Arc::clone(self),
                released: AtomicBool::new(false),
            }),
            Err(err) => {
                self.release_slot(index);
                Err(err)
            }
        }
    }

    fn reserve_slot(&self) -> Result<usize> {
        let n = self.providers.len();
        if n == 0 {
            return Err(NntpError::NoCapacity);
        }
        let mut inner = self.inner.lock();
        let mut chosen = None;
        for offset in 0..n {
            let idx = (inner.cursor + offset) % n;
            if inner.live[idx] < self.providers[idx].max_connections() {
                chosen = Some(idx);
                break;
            }
        }
        let idx = chosen.ok_or(NntpError::NoCapacity)?;
        inner.live[idx] += 1;
        inner.cursor = (idx + 1) % n;
        Ok(idx)
    }

    fn release_slot(&self, index: usize) {
        let mut inner = self.inner.lock();
        if let Some(count) = inner.live.get_mut(index) {
            *count = count.saturating_sub(1);
        }
    }

    /// Snapshot of live connection counts, one entry per provider, in
    /// configured order. Exposed for tests and telemetry.
    pub fn live_counts(&self) -> Vec<u32> {
        self.inner.lock().live.clone()
    }

    pub fn provider_names(&self) -> Vec<&str> {
        self.providers.iter().map(|p| p.name.as_str()).collect()
    }
}

/// A connection on loan from one specific provider. Disposal (via [`Drop`])
/// decrements that provider's live count exactly once, however the
/// connection meets its end: clean release, protocol error, or
/// cancellation.
pub struct ScopedConnection {
    client: Option<Box<dyn NntpClient>>,
    provider_index: usize,
    allocator: Arc<ProviderAllocator>,
    released: AtomicBool,
}

impl ScopedConnection {
    pub fn client_mut(&mut self) -> &mut (dyn NntpClient + 'static) {
        self.client
            .as_deref_mut()
            .expect("ScopedConnection used after disposal")
    }
}

impl Drop for ScopedConnection {
    fn drop(&mut self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.allocator.release_slot(self.provider_index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockClientFactory;

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

    #[tokio::test]
    async fn releases_slot_on_disposal() {
        let factory = Arc::new(MockClientFactory::new(Default::default));
        let allocator = ProviderAllocator::new(vec![provider("a", 2)], factory);
        let conn = allocator
            .create_connection(CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(allocator.live_counts(), vec![1]);
        drop(conn);
        assert_eq!(allocator.live_counts(), vec![0]);
    }

    #[tokio::test]
    async fn fairness_alternates_providers() {
        let factory = Arc::new(MockClientFactory::new(Default::default));
        let allocator = ProviderAllocator::new(vec![provider("a", 2), provider("b", 2)], factory);

        let mut conns = Vec::new();
        for _ in 0..4 {
            conns.push(
                allocator
                    .create_connection(CancellationToken::new())
                    .await
                    .unwrap(),
            );
        }
        assert_eq!(allocator.live_counts(), vec![2, 2]);
    }

    #[tokio::test]
    async fn at_capacity_returns_no_capacity() {
        let factory = Arc::new(MockClientFactory::new(Default::default));
        let allocator = ProviderAllocator::new(vec![provider("a", 1)], factory);
        let _conn = allocator
            .create_connection(CancellationToken::new())
            .await
            .unwrap();
        let result = allocator.create_connection(CancellationToken::new()).await;
        assert!(matches!(result, Err(NntpError::NoCapacity)));
    }

    #[tokio::test]
    async fn error_releases_slot_before_propagating() {
        struct FailingFactory;
        #[async_trait::async_trait]
        impl ClientFactory for FailingFactory {
            async fn connect(
                &self,
                _provider: &ProviderRecord,
                _cancel: CancellationToken,
            ) -> Result<Box<dyn NntpClient>> {
                Err(NntpError::CannotConnect("boom".into()))
            }
        }

        let allocator = ProviderAllocator::new(vec![provider("a", 1)], Arc::new(FailingFactory));
        let result = allocator.create_connection(CancellationToken::new()).await;
        assert!(result.is_err());
        assert_eq!(allocator.live_counts(), vec![0]);
    }
}
