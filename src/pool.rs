//! Bounded connection pool: leases at most `max_size` connections at a
//! time, creating them lazily via the [`ProviderAllocator`], recycling idle
//! ones, and disposing broken ones on request.
//!
//! The waiter queue is an explicit FIFO (`VecDeque` of one-shot channels)
//! rather than a semaphore: a released connection is handed directly to the
//! earliest still-interested waiter, which is what spec.md's "earliest
//! waiter is woken first" ordering guarantee requires. A waiter that
//! cancels simply drops its receiver; the queue entry is skipped lazily,
//! the next time someone tries to wake it, rather than removed eagerly.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::allocator::{ProviderAllocator, ScopedConnection};
use crate::client::NntpClient;
use crate::error::{NntpError, Result};
use crate::telemetry::PoolTelemetry;

/// Pool sizing. `max_size` is ordinarily derived from the allocator's total
/// provider capacity (`Σ p.max_connections`).
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub max_size: u32,
}

impl PoolConfig {
    pub fn from_allocator(allocator: &ProviderAllocator) -> Self {
        Self {
            max_size: allocator.total_connections(),
        }
    }
}

/// `(live, idle, max)`, published after every acquire and release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolEvent {
    pub live: u32,
    pub idle: u32,
    pub max: u32,
}

/// A queued caller waiting for a connection. Woken either with an actual
/// connection (handed off by a releasing lease) or [`WakeSignal::SlotFreed`]
/// (a connection was disposed; the waiter should attempt to create a fresh
/// one).
enum WakeSignal {
    Connection(ScopedConnection),
    SlotFreed,
}

struct Waiter {
    tx: oneshot::Sender<WakeSignal>,
}

struct Inner {
    idle: VecDeque<ScopedConnection>,
    /// Count of connections that currently exist, whether idle or leased.
    total: u32,
    waiters: VecDeque<Waiter>,
}

impl Inner {
    /// Hand a signal to the earliest waiter still listening, dropping any
    /// that already cancelled (their receiver is gone). Returns the signal
    /// back if nobody was waiting, so the caller can fall back to pushing
    /// into idle.
    fn wake_next(&mut self, mut signal: WakeSignal) -> Option<WakeSignal> {
        while let Some(waiter) = self.waiters.pop_front() {
            match waiter.tx.send(signal) {
                Ok(()) => return None,
                Err(returned) => signal = returned,
            }
        }
        Some(signal)
    }
}

/// The bounded pool itself. Construct with [`ConnectionPool::new`], acquire
/// leases with [`ConnectionPool::acquire`], and tear it down with
/// [`ConnectionPool::dispose`] when swapping in a replacement.
pub struct ConnectionPool {
    allocator: Arc<ProviderAllocator>,
    max_size: u32,
    inner: Mutex<Inner>,
    draining: AtomicBool,
    telemetry: Option<Arc<dyn PoolTelemetry>>,
}

impl ConnectionPool {
    pub fn new(
        allocator: Arc<ProviderAllocator>,
        telemetry: Option<Arc<dyn PoolTelemetry>>,
    ) -> Arc<Self> {
        let config = PoolConfig::from_allocator(&allocator);
        Arc::new(Self {
            allocator,
            max_size: config.max_size,
            inner: Mutex::new(Inner {
                idle: VecDeque::new(),
                total: 0,
                waiters: VecDeque::new(),
            }),
            draining: AtomicBool::new(false),
            telemetry,
        })
    }

    pub fn max_size(&self) -> u32 {
        self.max_size
    }

    /// Acquire an exclusive lease: reuse an idle connection, create a new
    /// one if there's spare capacity, or queue FIFO until one frees up.
    /// Honors cancellation both while queued and while a fresh connection
    /// is being created.
    pub async fn acquire(self: &Arc<Self>, cancel: CancellationToken) -> Result<Lease> {
        loop {
            enum Action {
                Claim(ScopedConnection),
                CreateNew,
                Wait(oneshot::Receiver<WakeSignal>),
            }

            let action = {
                let mut inner = self.inner.lock();
                if self.draining.load(Ordering::SeqCst) {
                    return Err(NntpError::NoCapacity);
                }
                if !inner.waiters.is_empty() {
                    // Someone is already queued; don't cut the line even if
                    // idle capacity momentarily looks free.
                    let (tx, rx) = oneshot::channel();
                    inner.waiters.push_back(Waiter { tx });
                    Action::Wait(rx)
                } else if let Some(conn) = inner.idle.pop_front() {
                    Action::Claim(conn)
                } else if inner.total < self.max_size {
                    inner.total += 1;
                    Action::CreateNew
                } else {
                    let (tx, rx) = oneshot::channel();
                    inner.waiters.push_back(Waiter { tx });
                    Action::Wait(rx)
                }
            };

            match action {
                Action::Claim(conn) => {
                    self.publish();
                    return Ok(Lease::new(conn, Arc::clone(self)));
                }
                Action::CreateNew => match self.allocator.create_connection(cancel.clone()).await {
                    Ok(conn) => {
                        self.publish();
                        return Ok(Lease::new(conn, Arc::clone(self)));
                    }
                    Err(err) => {
                        let mut inner = self.inner.lock();
                        inner.total = inner.total.saturating_sub(1);
                        let _ = inner.wake_next(WakeSignal::SlotFreed);
                        drop(inner);
                        self.publish();
                        return Err(err);
                    }
                },
                Action::Wait(rx) => {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(NntpError::Cancelled),
                        signal = rx => match signal {
                            Ok(WakeSignal::Connection(conn)) => {
                                self.publish();
                                return Ok(Lease::new(conn, Arc::clone(self)));
                            }
                            Ok(WakeSignal::SlotFreed) => continue,
                            Err(_) => return Err(NntpError::Cancelled),
                        },
                    }
                }
            }
        }
    }

    /// Called by [`Lease::drop`]. Hands the connection directly to the next
    /// waiter if one exists; otherwise returns it to idle, or disposes it
    /// (and its slot) if the lease was marked for replacement.
    fn release(&self, conn: ScopedConnection, replace: bool) {
        let mut inner = self.inner.lock();
        if replace || self.draining.load(Ordering::SeqCst) {
            inner.total = inner.total.saturating_sub(1);
            debug!("disposing connection on release");
            let _ = inner.wake_next(WakeSignal::SlotFreed);
            drop(inner);
            drop(conn); // releases the provider slot via ScopedConnection::drop
        } else if let Some(WakeSignal::Connection(conn)) = inner.wake_next(WakeSignal::Connection(conn)) {
            // nobody was waiting after all; park it as idle.
            inner.idle.push_back(conn);
        }
        self.publish();
    }

    fn publish(&self) {
        if let Some(telemetry) = &self.telemetry {
            telemetry.publish(self.stats());
        }
    }

    /// Drain all idle connections and refuse new acquires. Live connections
    /// are disposed as their leases return, not blocked on here.
    pub fn dispose(&self) {
        self.draining.store(true, Ordering::SeqCst);
        let mut inner = self.inner.lock();
        let drained: Vec<_> = inner.idle.drain(..).collect();
        inner.total = inner.total.saturating_sub(drained.len() as u32);
        // Wake every remaining waiter so none blocks forever on a pool
        // that will never again have capacity.
        while let Some(waiter) = inner.waiters.pop_front() {
            let _ = waiter.tx.send(WakeSignal::SlotFreed);
        }
        drop(inner);
        let count = drained.len();
        drop(drained);
        if count > 0 {
            debug!(count, "disposed idle connections on pool teardown");
        }
    }

    pub fn stats(&self) -> PoolEvent {
        let inner = self.inner.lock();
        PoolEvent {
            live: inner.total.saturating_sub(inner.idle.len() as u32),
            idle: inner.idle.len() as u32,
            max: self.max_size,
        }
    }
}

/// Exclusive, short-lived grant of one connection. Carries a *replace*
/// flag: set it via [`Lease::mark_for_replace`] when the connection must
/// not be recycled; otherwise it returns to idle (or straight to the next
/// waiter) when dropped.
pub struct Lease {
    connection: Option<ScopedConnection>,
    pool: Arc<ConnectionPool>,
    replace: AtomicBool,
}

impl Lease {
    fn new(connection: ScopedConnection, pool: Arc<ConnectionPool>) -> Self {
        Self {
            connection: Some(connection),
            pool,
            replace: AtomicBool::new(false),
        }
    }

    pub fn client_mut(&mut self) -> &mut dyn NntpClient {
        self.connection
            .as_mut()
            .expect("lease used after release")
            .client_mut()
    }

    /// Mark this lease's connection for disposal instead of recycling. Does
    /// not itself release the lease.
    pub fn mark_for_replace(&self) {
        self.replace.store(true, Ordering::SeqCst);
    }

    pub fn will_replace(&self) -> bool {
        self.replace.load(Ordering::SeqCst)
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(conn) = self.connection.take() {
            let replace = self.replace.load(Ordering::SeqCst);
            self.pool.release(conn, replace);
        }
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("ConnectionPool")
            .field("live", &stats.live)
            .field("idle", &stats.idle)
            .field("max", &stats.max)
            .finish()
    }
}
