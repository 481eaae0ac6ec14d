//! # nntp-core
//!
//! A multi-provider NNTP connection pool and streaming client.
//!
//! `nntp-core` layers five pieces on top of each other:
//!
//! 1. A single-connection client primitive ([`client`]), one authenticated
//!    session to one server.
//! 2. A provider allocator ([`allocator`]), fair, capacity-aware selection
//!    across multiple configured providers.
//! 3. A bounded connection pool ([`pool`]), FIFO leasing of connections
//!    created by the allocator.
//! 4. A multi-connection client ([`multi`]), the retry/replace/readiness
//!    protocol above the pool, with hot-swappable backing pools.
//! 5. A caching decorator ([`cache`]), bounded, single-flight memoization
//!    of the metadata operations.
//!
//! [`stream`] sits on top of all five: [`stream::StreamingClient`] is the
//! crate's main entry point, and [`stream::ArticleStream`] is the
//! order-preserving, concurrency-bounded adapter for downloading a whole
//! multi-segment article.
//!
//! [`config`] owns TOML loading, validation, and hot reload; [`telemetry`]
//! publishes pool occupancy snapshots; [`error`] is the shared error
//! vocabulary every layer returns.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

/// Provider selection: fair, capacity-aware allocation of new connections
/// across configured providers.
pub mod allocator;
/// Caching decorator: bounded, single-flight memoization of metadata ops.
pub mod cache;
/// The single-connection client primitive and its real/mock implementations.
pub mod client;
/// Configuration loading, validation, and hot reload.
pub mod config;
/// The shared error type and its retry/cancellation classification.
pub mod error;
/// The multi-connection client: retry/replace/readiness over a pool.
pub mod multi;
/// The bounded, FIFO-queued connection pool.
pub mod pool;
/// The streaming client facade and the article-set stream adapter.
pub mod stream;
/// Best-effort pool occupancy telemetry.
pub mod telemetry;

pub use allocator::{ProviderAllocator, ScopedConnection};
pub use cache::CachingClient;
pub use client::{
    ArticleStatus, ClientFactory, NntpClient, SegmentBodyStream, SegmentHeader, TcpClientFactory,
    TcpNntpClient,
};
pub use config::{ConfigChange, ConfigError, ConfigWatcher, NntpConfig, ProviderRecord};
pub use error::{NntpError, Result};
pub use multi::{MultiNntpClient, UsenetClient};
pub use pool::{ConnectionPool, Lease, PoolConfig, PoolEvent};
pub use stream::{check_health, ArticleStream, StreamingClient};
pub use telemetry::{ChannelTelemetry, PoolTelemetry};
