//! The streaming client facade and the article-set stream adapter built on
//! top of it.
//!
//! [`StreamingClient`] is the crate's top-level entry point: it owns the
//! swappable pool, wires a [`ConfigWatcher`](crate::config::ConfigWatcher)'s
//! reload notifications into [`MultiNntpClient::update_pool`], and exposes
//! the same [`UsenetClient`] surface everything below it does, wrapped in a
//! [`CachingClient`]. [`ArticleStream`] sits above the facade: given an
//! ordered list of segment message-ids, it fetches up to *P* of them
//! concurrently while still handing bytes to the caller in strict segment
//! order, the way downloading a multi-segment Usenet post actually has to
//! work. [`check_health`] is the companion parallel-stat probe: it fires a
//! `stat` at every segment at once and cancels the rest as soon as the
//! first missing one turns up.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt, TryStreamExt};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::allocator::ProviderAllocator;
use crate::cache::CachingClient;
use crate::client::{ArticleStatus, ClientFactory, SegmentBodyStream, SegmentHeader};
use crate::config::{ConfigChange, NntpConfig};
use crate::error::Result;
use crate::multi::{MultiNntpClient, UsenetClient};
use crate::pool::ConnectionPool;
use crate::telemetry::PoolTelemetry;

/// The crate's top-level client: a caching decorator over a multi-connection
/// client whose pool can be hot-swapped in response to config reloads.
pub struct StreamingClient {
    inner: Arc<CachingClient>,
    multi: Arc<MultiNntpClient>,
    prefetch_degree: usize,
    factory: Arc<dyn ClientFactory>,
    telemetry: Option<Arc<dyn PoolTelemetry>>,
    reload_task: AsyncMutex<Option<JoinHandle<()>>>,
}

impl StreamingClient {
    /// Build the pool, multi-connection client, and cache from an initial
    /// configuration snapshot.
    pub fn new(
        config: &NntpConfig,
        factory: Arc<dyn ClientFactory>,
        telemetry: Option<Arc<dyn PoolTelemetry>>,
    ) -> Arc<Self> {
        let allocator = ProviderAllocator::new(config.provider_records(), Arc::clone(&factory));
        let pool = ConnectionPool::new(allocator, telemetry.clone());
        let readiness_timeout =
            std::time::Duration::from_secs(config.usenet.readiness_timeout_secs);
        let multi = Arc::new(MultiNntpClient::new(pool, readiness_timeout));
        let inner = Arc::new(CachingClient::with_capacity(
            Arc::clone(&multi) as Arc<dyn UsenetClient>,
            config.usenet.cache_capacity,
        ));
        Arc::new(Self {
            inner,
            multi,
            prefetch_degree: config.usenet.stream_prefetch_degree.max(1),
            factory,
            telemetry,
            reload_task: AsyncMutex::new(None),
        })
    }

    /// The concurrency window [`Self::article_stream`] uses unless told
    /// otherwise.
    pub fn prefetch_degree(&self) -> usize {
        self.prefetch_degree
    }

    /// Stream an ordered article, fetching up to `prefetch_degree`
    /// segments' bodies concurrently while still delivering bytes to the
    /// caller in segment order.
    pub fn article_stream(
        self: &Arc<Self>,
        message_ids: Vec<String>,
        cancel: CancellationToken,
    ) -> ArticleStream {
        ArticleStream::new(
            Arc::clone(&self.inner) as Arc<dyn UsenetClient>,
            message_ids,
            self.prefetch_degree,
            cancel,
        )
    }

    /// Fire a `stat` at every segment concurrently; the first missing
    /// segment (or error) cancels the rest. `Ok(true)` means every segment
    /// is present.
    pub async fn check_health(
        self: &Arc<Self>,
        message_ids: Vec<String>,
        cancel: CancellationToken,
    ) -> Result<bool> {
        check_health(Arc::clone(&self.inner) as Arc<dyn UsenetClient>, message_ids, cancel).await
    }

    /// Consume config reload notifications, rebuilding the pool whenever a
    /// change touches `usenet.*`. Replaces any reload task started earlier.
    pub async fn watch_config(self: &Arc<Self>, mut changes: mpsc::UnboundedReceiver<ConfigChange>) {
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            while let Some(change) = changes.recv().await {
                if !change.touches_usenet_pool() {
                    continue;
                }
                info!(keys = ?change.keys, "rebuilding pool after config change");
                let allocator = ProviderAllocator::new(
                    change.snapshot.provider_records(),
                    Arc::clone(&this.factory),
                );
                let new_pool = ConnectionPool::new(allocator, this.telemetry.clone());
                this.multi.update_pool(new_pool);
            }
        });
        let mut slot = self.reload_task.lock().await;
        if let Some(old) = slot.replace(handle) {
            old.abort();
        }
    }

    /// Stop watching for config changes. The pool itself is untouched; only
    /// the background reload task is torn down.
    pub async fn stop_watching_config(&self) {
        if let Some(handle) = self.reload_task.lock().await.take() {
            handle.abort();
        }
    }
}

#[async_trait::async_trait]
impl UsenetClient for StreamingClient {
    async fn stat(&self, message_id: &str, cancel: CancellationToken) -> Result<ArticleStatus> {
        self.inner.stat(message_id, cancel).await
    }

    async fn date(&self, cancel: CancellationToken) -> Result<DateTime<Utc>> {
        self.inner.date(cancel).await
    }

    async fn get_segment_header(
        &self,
        message_id: &str,
        cancel: CancellationToken,
    ) -> Result<Option<SegmentHeader>> {
        self.inner.get_segment_header(message_id, cancel).await
    }

    async fn get_file_size(&self, message_id: &str, cancel: CancellationToken) -> Result<Option<u64>> {
        self.inner.get_file_size(message_id, cancel).await
    }

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

/// An ordered, concurrency-bounded stream of one article's segment bodies.
///
/// Built on [`futures::stream::StreamExt::buffered`]: up to `prefetch_degree`
/// `get_segment_stream` calls run at once, but `buffered` yields their
/// results in the original request order regardless of completion order,
/// which is exactly the "strict order delivery, sliding-window prefetch"
/// behavior this adapter needs. [`TryStreamExt::try_flatten`] then turns the
/// resulting stream-of-streams into one flat byte stream.
pub struct ArticleStream {
    inner: Pin<Box<dyn futures::Stream<Item = Result<Bytes>> + Send>>,
}

impl ArticleStream {
    pub fn new(
        client: Arc<dyn UsenetClient>,
        message_ids: Vec<String>,
        prefetch_degree: usize,
        cancel: CancellationToken,
    ) -> Self {
        let degree = prefetch_degree.max(1);
        let stream = futures::stream::iter(message_ids.into_iter())
            .map(move |message_id| {
                let client = Arc::clone(&client);
                let cancel = cancel.clone();
                async move {
                    if cancel.is_cancelled() {
                        return Err(crate::error::NntpError::Cancelled);
                    }
                    client.get_segment_stream(&message_id, cancel).await
                }
            })
            .buffered(degree)
            .try_flatten();
        Self {
            inner: Box::pin(stream),
        }
    }
}

impl futures::Stream for ArticleStream {
    type Item = Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

/// Run a `stat` against every message-id concurrently, cancelling the rest
/// of the batch as soon as one comes back missing or errors.
pub async fn check_health(
    client: Arc<dyn UsenetClient>,
    message_ids: Vec<String>,
    cancel: CancellationToken,
) -> Result<bool> {
    let linked = cancel.child_token();
    let mut pending: FuturesUnordered<_> = message_ids
        .into_iter()
        .map(|message_id| {
            let client = Arc::clone(&client);
            let linked = linked.clone();
            async move { client.stat(&message_id, linked).await }
        })
        .collect();

    let mut outcome = Ok(true);
    while let Some(result) = pending.next().await {
        match result {
            Ok(ArticleStatus::Exists) => {}
            Ok(ArticleStatus::Missing) => {
                outcome = Ok(false);
                linked.cancel();
                break;
            }
            Err(err) if err.is_cancelled() => {
                // A sibling's failure already triggered this cancellation.
                break;
            }
            Err(err) => {
                warn!(error = %err, "health check segment failed");
                outcome = Err(err);
                linked.cancel();
                break;
            }
        }
    }
    outcome
}
