//! Multi-connection client: implements the same operation surface as the
//! single-connection primitive, but leases from a [`ConnectionPool`] per
//! call and layers on the retry/replace/readiness protocol spec.md §4.3
//! describes.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::client::{ArticleStatus, SegmentBodyStream, SegmentHeader};
use crate::error::Result;
use crate::pool::{ConnectionPool, Lease};

/// The operation surface every layer above the single-connection primitive
/// exposes: the caching decorator, the multi-connection client, and the
/// streaming facade all implement this the same way so they can be
/// composed transparently.
#[async_trait]
pub trait UsenetClient: Send + Sync {
    async fn stat(&self, message_id: &str, cancel: CancellationToken) -> Result<ArticleStatus>;
    async fn date(&self, cancel: CancellationToken) -> Result<DateTime<Utc>>;
    async fn get_segment_header(
        &self,
        message_id: &str,
        cancel: CancellationToken,
    ) -> Result<Option<SegmentHeader>>;
    async fn get_file_size(&self, message_id: &str, cancel: CancellationToken) -> Result<Option<u64>>;
    async fn get_segment_stream(
        &self,
        message_id: &str,
        cancel: CancellationToken,
    ) -> Result<SegmentBodyStream>;
    async fn wait_for_ready(&self, cancel: CancellationToken) -> Result<()>;
}

type OpFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Leases from a swappable pool, applying retry-once-on-replace and
/// fire-and-forget readiness release around every operation.
pub struct MultiNntpClient {
    pool: ArcSwap<ConnectionPool>,
    readiness_timeout: Duration,
}

impl MultiNntpClient {
    pub fn new(pool: Arc<ConnectionPool>, readiness_timeout: Duration) -> Self {
        Self {
            pool: ArcSwap::new(pool),
            readiness_timeout,
        }
    }

    /// Atomically replace the pool in use. In-flight operations against the
    /// old pool run to completion; the old pool stops accepting new
    /// acquires and disposes its connections as leases return.
    pub fn update_pool(&self, new_pool: Arc<ConnectionPool>) {
        let old = self.pool.swap(new_pool);
        old.dispose();
    }

    pub fn pool(&self) -> Arc<ConnectionPool> {
        self.pool.load_full()
    }

    async fn run_with_retry<T, F>(&self, cancel: CancellationToken, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: for<'a> Fn(&'a mut Lease, CancellationToken) -> OpFuture<'a, T> + Send + Sync,
    {
        let pool = self.pool.load_full();
        let mut lease = pool.acquire(cancel.clone()).await?;

        match op(&mut lease, cancel.clone()).await {
            Ok(value) => {
                self.spawn_readiness_release(lease, cancel);
                Ok(value)
            }
            Err(err) if err.is_cancelled() => Err(err),
            Err(err) if !err.is_retryable() => Err(err),
            Err(_first_err) => {
                lease.mark_for_replace();
                drop(lease);

                let pool = self.pool.load_full();
                let mut lease = pool.acquire(cancel.clone()).await?;
                match op(&mut lease, cancel.clone()).await {
                    Ok(value) => {
                        self.spawn_readiness_release(lease, cancel);
                        Ok(value)
                    }
                    Err(second_err) => {
                        if second_err.is_retryable() {
                            lease.mark_for_replace();
                        }
                        Err(second_err)
                    }
                }
            }
        }
    }

    /// Spawn the background readiness wait. The operation's result has
    /// already been returned to the caller by the time this resolves; its
    /// only job is to decide whether the connection is safe to recycle.
    fn spawn_readiness_release(&self, mut lease: Lease, cancel: CancellationToken) {
        let linked = cancel.child_token();
        let timeout = self.readiness_timeout;
        tokio::spawn(async move {
            let wait = lease.client_mut().wait_for_ready(linked.clone());
            tokio::select! {
                result = wait => {
                    match result {
                        Ok(()) => {}
                        Err(err) => {
                            warn!(error = %err, "readiness wait faulted; replacing connection");
                            lease.mark_for_replace();
                        }
                    }
                }
                _ = tokio::time::sleep(timeout) => {
                    linked.cancel();
                    warn!(timeout_secs = timeout.as_secs(), "readiness timeout; replacing connection");
                    lease.mark_for_replace();
                }
            }
            // `lease` drops here, returning the connection to its pool.
        });
    }
}

#[async_trait]
impl UsenetClient for MultiNntpClient {
    async fn stat(&self, message_id: &str, cancel: CancellationToken) -> Result<ArticleStatus> {
        self.run_with_retry(cancel, move |lease, cancel| {
            Box::pin(async move { lease.client_mut().stat(message_id, cancel).await })
        })
        .await
    }

    async fn date(&self, cancel: CancellationToken) -> Result<DateTime<Utc>> {
        self.run_with_retry(cancel, move |lease, cancel| {
            Box::pin(async move { lease.client_mut().date(cancel).await })
        })
        .await
    }

    async fn get_segment_header(
        &self,
        message_id: &str,
        cancel: CancellationToken,
    ) -> Result<Option<SegmentHeader>> {
        self.run_with_retry(cancel, move |lease, cancel| {
            Box::pin(async move { lease.client_mut().get_segment_header(message_id, cancel).await })
        })
        .await
    }

    async fn get_file_size(&self, message_id: &str, cancel: CancellationToken) -> Result<Option<u64>> {
        self.run_with_retry(cancel, move |lease, cancel| {
            Box::pin(async move { lease.client_mut().get_file_size(message_id, cancel).await })
        })
        .await
    }

    async fn get_segment_stream(
        &self,
        message_id: &str,
        cancel: CancellationToken,
    ) -> Result<SegmentBodyStream> {
        self.run_with_retry(cancel, move |lease, cancel| {
            Box::pin(async move { lease.client_mut().get_segment_stream(message_id, cancel).await })
        })
        .await
    }

    /// Acquires and immediately releases a lease, verifying end-to-end
    /// reachability without running any NNTP command at all.
    async fn wait_for_ready(&self, cancel: CancellationToken) -> Result<()> {
        let pool = self.pool.load_full();
        let _lease = pool.acquire(cancel).await?;
        Ok(())
    }
}
