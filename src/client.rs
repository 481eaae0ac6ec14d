//! The single-connection client primitive: one authenticated TCP/TLS session
//! to one NNTP server.
//!
//! This is the "~10% of core" layer spec.md treats as a given, everything
//! above it (allocator, pool, multi-client, cache, streaming facade) is
//! built against the [`NntpClient`] trait, never against a concrete
//! transport. Two implementations are provided: [`MockNntpClient`] for unit
//! tests that need scriptable, instantaneous responses, and
//! [`TcpNntpClient`], a real (if deliberately minimal) line-oriented RFC
//! 3977 client over plain TCP or TLS, since wire framing, while out of this
//! crate's core concern, still has to exist for the stack above it to run
//! against something real.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::Stream;
use parking_lot::Mutex as SyncMutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::ProviderRecord;
use crate::error::{NntpError, Result};

/// Whether a stat check found the article present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArticleStatus {
    Exists,
    Missing,
}

/// Metadata about one segment, as returned by `get_segment_header`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentHeader {
    pub message_id: String,
    pub byte_size: u64,
}

/// A single-use stream of article body bytes. Not cacheable, not
/// re-readable; consumed once by the caller (or the article-set adapter).
pub struct SegmentBodyStream {
    pub inner: std::pin::Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>,
}

impl Stream for SegmentBodyStream {
    type Item = Result<Bytes>;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

/// The single-connection NNTP primitive. Every operation takes a
/// cancellation token; suspension points (socket reads/writes) must honor
/// it.
#[async_trait]
pub trait NntpClient: Send {
    async fn connect(&mut self, cancel: CancellationToken) -> Result<()>;
    async fn authenticate(&mut self, cancel: CancellationToken) -> Result<()>;
    async fn stat(&mut self, message_id: &str, cancel: CancellationToken) -> Result<ArticleStatus>;
    async fn date(&mut self, cancel: CancellationToken) -> Result<DateTime<Utc>>;
    async fn get_segment_header(
        &mut self,
        message_id: &str,
        cancel: CancellationToken,
    ) -> Result<Option<SegmentHeader>>;

    /// Default: derive file size from the segment header. Real NNTP servers
    /// don't expose a distinct "file size" command; it's the header's byte
    /// count under another name.
    async fn get_file_size(
        &mut self,
        message_id: &str,
        cancel: CancellationToken,
    ) -> Result<Option<u64>> {
        Ok(self
            .get_segment_header(message_id, cancel)
            .await?
            .map(|h| h.byte_size))
    }

    async fn get_segment_stream(
        &mut self,
        message_id: &str,
        cancel: CancellationToken,
    ) -> Result<SegmentBodyStream>;

    /// Resolves once the connection is idle and safe to hand to another
    /// caller. For read-only operations this resolves promptly; for
    /// stream-returning operations it resolves only once the body has been
    /// fully drained.
    async fn wait_for_ready(&mut self, cancel: CancellationToken) -> Result<()>;
}

/// Creates authenticated [`NntpClient`] instances against a given provider.
/// This is the "single-connection factory" the provider allocator calls
/// outside its lock.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    async fn connect(
        &self,
        provider: &ProviderRecord,
        cancel: CancellationToken,
    ) -> Result<Box<dyn NntpClient>>;
}

/// Builds real [`TcpNntpClient`]/TLS clients.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpClientFactory;

#[async_trait]
impl ClientFactory for TcpClientFactory {
    async fn connect(
        &self,
        provider: &ProviderRecord,
        cancel: CancellationToken,
    ) -> Result<Box<dyn NntpClient>> {
        let mut client = TcpNntpClient::dial(provider).await?;
        client.connect(cancel.clone()).await?;
        client.authenticate(cancel).await?;
        Ok(Box::new(client))
    }
}

// ---------------------------------------------------------------------
// Real line-oriented client
// ---------------------------------------------------------------------

enum Transport {
    Plain(BufReader<TcpStream>),
    Tls(BufReader<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl Transport {
    async fn write_line(&mut self, line: &str) -> Result<()> {
        let framed = format!("{line}\r\n");
        let res = match self {
            Transport::Plain(s) => s.get_mut().write_all(framed.as_bytes()).await,
            Transport::Tls(s) => s.get_mut().write_all(framed.as_bytes()).await,
        };
        res.map_err(|e| NntpError::Other(format!("write failed: {e}")))
    }

    async fn read_line(&mut self) -> Result<String> {
        let mut buf = String::new();
        let read = match self {
            Transport::Plain(s) => s.read_line(&mut buf).await,
            Transport::Tls(s) => s.read_line(&mut buf).await,
        }
        .map_err(|e| NntpError::Other(format!("read failed: {e}")))?;
        if read == 0 {
            return Err(NntpError::Other("connection closed by peer".into()));
        }
        Ok(buf.trim_end_matches(['\r', '\n']).to_string())
    }
}

/// A real RFC 3977 client. Internals are wrapped in an `Arc<Mutex<..>>` so
/// that a [`SegmentBodyStream`] returned by `get_segment_stream` can keep
/// reading from the same socket after the method that issued the command
/// has already returned control to the caller.
pub struct TcpNntpClient {
    provider: ProviderRecord,
    transport: Arc<AsyncMutex<Option<Transport>>>,
    /// Set while a body stream is still draining; cleared (and `ready`
    /// notified) once the terminator line is read.
    draining: Arc<AtomicBool>,
    ready: Arc<Notify>,
}

impl TcpNntpClient {
    async fn dial(provider: &ProviderRecord) -> Result<Self> {
        Ok(Self {
            provider: provider.clone(),
            transport: Arc::new(AsyncMutex::new(None)),
            draining: Arc::new(AtomicBool::new(false)),
            ready: Arc::new(Notify::new()),
        })
    }

    async fn send_and_read(&self, command: &str) -> Result<String> {
        let mut guard = self.transport.lock().await;
        let transport = guard
            .as_mut()
            .ok_or_else(|| NntpError::Other("client not connected".into()))?;
        transport.write_line(command).await?;
        transport.read_line().await
    }
}

#[async_trait]
impl NntpClient for TcpNntpClient {
    async fn connect(&mut self, _cancel: CancellationToken) -> Result<()> {
        let addr = (self.provider.host.as_str(), self.provider.port);
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| NntpError::CannotConnect(format!("{}:{}: {e}", self.provider.host, self.provider.port)))?;

        let transport = if self.provider.use_ssl {
            let mut roots = rustls::RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            let tls_config = rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth();
            let connector = tokio_rustls::TlsConnector::from(Arc::new(tls_config));
            let server_name = rustls::pki_types::ServerName::try_from(self.provider.host.clone())
                .map_err(|e| NntpError::CannotConnect(format!("invalid server name: {e}")))?;
            let tls_stream = connector
                .connect(server_name, stream)
                .await
                .map_err(|e| NntpError::CannotConnect(format!("TLS handshake failed: {e}")))?;
            Transport::Tls(BufReader::new(tls_stream))
        } else {
            Transport::Plain(BufReader::new(stream))
        };

        let mut transport = transport;
        let greeting = transport.read_line().await?;
        if !(greeting.starts_with("200") || greeting.starts_with("201")) {
            return Err(NntpError::ProtocolError(format!(
                "unexpected greeting: {greeting}"
            )));
        }
        *self.transport.lock().await = Some(transport);
        Ok(())
    }

    async fn authenticate(&mut self, _cancel: CancellationToken) -> Result<()> {
        if self.provider.user.is_empty() {
            return Ok(());
        }
        let resp = self
            .send_and_read(&format!("AUTHINFO USER {}", self.provider.user))
            .await?;
        if resp.starts_with("281") {
            return Ok(()); // no password required
        }
        if !resp.starts_with("381") {
            return Err(NntpError::CannotAuthenticate(format!(
                "unexpected response to AUTHINFO USER: {resp}"
            )));
        }
        let resp = self
            .send_and_read(&format!("AUTHINFO PASS {}", self.provider.pass))
            .await?;
        if resp.starts_with("281") {
            Ok(())
        } else {
            Err(NntpError::CannotAuthenticate(resp))
        }
    }

    async fn stat(&mut self, message_id: &str, _cancel: CancellationToken) -> Result<ArticleStatus> {
        let resp = self.send_and_read(&format!("STAT <{message_id}>")).await?;
        match resp.get(0..3) {
            Some("223") => Ok(ArticleStatus::Exists),
            Some("430") | Some("423") => Ok(ArticleStatus::Missing),
            _ => Err(NntpError::ProtocolError(format!(
                "unexpected STAT response: {resp}"
            ))),
        }
    }

    async fn date(&mut self, _cancel: CancellationToken) -> Result<DateTime<Utc>> {
        let resp = self.send_and_read("DATE").await?;
        if !resp.starts_with("111") {
            return Err(NntpError::ProtocolError(format!(
                "unexpected DATE response: {resp}"
            )));
        }
        let stamp = resp
            .split_whitespace()
            .nth(1)
            .ok_or_else(|| NntpError::ProtocolError("DATE response missing timestamp".into()))?;
        chrono::NaiveDateTime::parse_from_str(stamp, "%Y%m%d%H%M%S")
            .map(|naive| naive.and_utc())
            .map_err(|e| NntpError::ProtocolError(format!("unparseable DATE timestamp: {e}")))
    }

    async fn get_segment_header(
        &mut self,
        message_id: &str,
        _cancel: CancellationToken,
    ) -> Result<Option<SegmentHeader>> {
        let resp = self
            .send_and_read(&format!("HDR bytes <{message_id}> <{message_id}>"))
            .await?;
        match resp.get(0..3) {
            Some("430") | Some("423") => return Ok(None),
            Some("225") => {}
            _ => {
                return Err(NntpError::ProtocolError(format!(
                    "unexpected HDR response: {resp}"
                )))
            }
        }
        let line = {
            let mut guard = self.transport.lock().await;
            let transport = guard
                .as_mut()
                .ok_or_else(|| NntpError::Other("client not connected".into()))?;
            let line = transport.read_line().await?;
            let terminator = transport.read_line().await?;
            debug_assert_eq!(terminator, ".");
            line
        };
        let byte_size: u64 = line
            .split_whitespace()
            .last()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| NntpError::ProtocolError(format!("unparseable HDR line: {line}")))?;
        Ok(Some(SegmentHeader {
            message_id: message_id.to_string(),
            byte_size,
        }))
    }

    async fn get_segment_stream(
        &mut self,
        message_id: &str,
        _cancel: CancellationToken,
    ) -> Result<SegmentBodyStream> {
        let resp = self.send_and_read(&format!("BODY <{message_id}>")).await?;
        match resp.get(0..3) {
            Some("430") | Some("423") => {
                return Err(NntpError::ArticleMissing(message_id.to_string()))
            }
            Some("222") => {}
            _ => {
                return Err(NntpError::ProtocolError(format!(
                    "unexpected BODY response: {resp}"
                )))
            }
        }

        self.draining.store(true, Ordering::SeqCst);
        let transport = Arc::clone(&self.transport);
        let draining = Arc::clone(&self.draining);
        let ready = Arc::clone(&self.ready);

        let stream = futures::stream::unfold(
            (transport, draining, ready, false),
            move |(transport, draining, ready, done)| async move {
                if done {
                    return None;
                }
                let mut guard = transport.lock().await;
                let t = match guard.as_mut() {
                    Some(t) => t,
                    None => return Some((Err(NntpError::Other("connection closed".into())), (transport.clone(), draining, ready, true))),
                };
                match t.read_line().await {
                    Ok(line) if line == "." => {
                        drop(guard);
                        draining.store(false, Ordering::SeqCst);
                        ready.notify_waiters();
                        None
                    }
                    Ok(line) => {
                        drop(guard);
                        // RFC 3977 dot-unstuffing.
                        let unstuffed = line.strip_prefix("..").map(|_| format!(".{}", &line[2..])).unwrap_or(line);
                        let mut bytes = unstuffed.into_bytes();
                        bytes.extend_from_slice(b"\r\n");
                        Some((Ok(Bytes::from(bytes)), (transport.clone(), draining, ready, false)))
                    }
                    Err(e) => {
                        drop(guard);
                        draining.store(false, Ordering::SeqCst);
                        ready.notify_waiters();
                        Some((Err(e), (transport.clone(), draining, ready, true)))
                    }
                }
            },
        );

        Ok(SegmentBodyStream {
            inner: Box::pin(stream),
        })
    }

    async fn wait_for_ready(&mut self, cancel: CancellationToken) -> Result<()> {
        loop {
            if !self.draining.load(Ordering::SeqCst) {
                return Ok(());
            }
            let notified = self.ready.notified();
            tokio::select! {
                _ = notified => continue,
                _ = cancel.cancelled() => return Err(NntpError::Cancelled),
            }
        }
    }
}

// ---------------------------------------------------------------------
// Mock client for unit and scenario tests
// ---------------------------------------------------------------------

/// Scripted behavior for [`MockNntpClient::wait_for_ready`].
#[derive(Debug, Clone)]
pub enum ReadyBehavior {
    Immediate,
    Never,
    Fault(String),
}

/// A scriptable [`NntpClient`] double. Each fallible operation is driven by
/// a queue of canned results; once the queue is exhausted, calls return a
/// default "not scripted" error so a mis-specified test fails loudly rather
/// than succeeding by accident.
pub struct MockNntpClient {
    pub stat_script: Arc<SyncMutex<VecDeque<Result<ArticleStatus>>>>,
    pub stat_calls: Arc<AtomicUsize>,
    pub ready_behavior: Arc<SyncMutex<ReadyBehavior>>,
    pub connect_calls: Arc<AtomicUsize>,
    pub disposed: Arc<AtomicBool>,
}

impl Default for MockNntpClient {
    fn default() -> Self {
        Self {
            stat_script: Arc::new(SyncMutex::new(VecDeque::new())),
            stat_calls: Arc::new(AtomicUsize::new(0)),
            ready_behavior: Arc::new(SyncMutex::new(ReadyBehavior::Immediate)),
            connect_calls: Arc::new(AtomicUsize::new(0)),
            disposed: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl MockNntpClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script_stat(self, results: Vec<Result<ArticleStatus>>) -> Self {
        *self.stat_script.lock() = results.into();
        self
    }

    pub fn never_ready(self) -> Self {
        *self.ready_behavior.lock() = ReadyBehavior::Never;
        self
    }

    pub fn stat_call_count(&self) -> usize {
        self.stat_calls.load(Ordering::SeqCst)
    }
}

impl Drop for MockNntpClient {
    fn drop(&mut self) {
        self.disposed.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl NntpClient for MockNntpClient {
    async fn connect(&mut self, _cancel: CancellationToken) -> Result<()> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn authenticate(&mut self, _cancel: CancellationToken) -> Result<()> {
        Ok(())
    }

    async fn stat(&mut self, _message_id: &str, _cancel: CancellationToken) -> Result<ArticleStatus> {
        self.stat_calls.fetch_add(1, Ordering::SeqCst);
        let next = self.stat_script.lock().pop_front();
        next.unwrap_or_else(|| {
            warn!("MockNntpClient::stat called with an empty script");
            Err(NntpError::Other("mock stat script exhausted".into()))
        })
    }

    async fn date(&mut self, _cancel: CancellationToken) -> Result<DateTime<Utc>> {
        Ok(Utc::now())
    }

    async fn get_segment_header(
        &mut self,
        message_id: &str,
        _cancel: CancellationToken,
    ) -> Result<Option<SegmentHeader>> {
        Ok(Some(SegmentHeader {
            message_id: message_id.to_string(),
            byte_size: 0,
        }))
    }

    async fn get_segment_stream(
        &mut self,
        _message_id: &str,
        _cancel: CancellationToken,
    ) -> Result<SegmentBodyStream> {
        let stream = futures::stream::once(async { Ok(Bytes::from_static(b"")) });
        Ok(SegmentBodyStream {
            inner: Box::pin(stream),
        })
    }

    async fn wait_for_ready(&mut self, cancel: CancellationToken) -> Result<()> {
        let behavior = self.ready_behavior.lock().clone();
        match behavior {
            ReadyBehavior::Immediate => Ok(()),
            ReadyBehavior::Fault(msg) => Err(NntpError::Other(msg)),
            ReadyBehavior::Never => {
                debug!("mock connection will never become ready; waiting for cancellation");
                cancel.cancelled().await;
                Err(NntpError::Cancelled)
            }
        }
    }
}

/// Builds [`MockNntpClient`] instances for the provider allocator to hand
/// out in tests.
pub struct MockClientFactory {
    pub template: Arc<dyn Fn() -> MockNntpClient + Send + Sync>,
}

impl MockClientFactory {
    pub fn new<F>(template: F) -> Self
    where
        F: Fn() -> MockNntpClient + Send + Sync + 'static,
    {
        Self {
            template: Arc::new(template),
        }
    }
}

#[async_trait]
impl ClientFactory for MockClientFactory {
    async fn connect(
        &self,
        _provider: &ProviderRecord,
        _cancel: CancellationToken,
    ) -> Result<Box<dyn NntpClient>> {
        Ok(Box::new((self.template)()))
    }
}
