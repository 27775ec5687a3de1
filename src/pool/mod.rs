// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Bounded connection pools for downstream dependencies.
//!
//! A [`Pool`] hands out at most `max_size` connections at once. Checkout
//! waits up to `acquire_timeout` for a slot and then fails fast with
//! [`PoolError::Exhausted`], which callers surface as backpressure.
//!
//! ```text
//!   acquire() ──► permit (bounded wait) ──► idle conn? ──► probe ──► PoolHandle
//!                                              │             │ unhealthy: drop, retry
//!                                              └── none ─────┴──► connect()
//!
//!   PoolHandle::drop ──► conn back to idle ──► permit released
//! ```
//!
//! Handles return their connection on every exit path, including errors
//! and panics in the caller, because the return happens in `Drop`.

pub mod manager;

pub use manager::{ConnectionPoolManager, ManagedPool};

use crate::config::PoolConfig;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use tracing::{debug, info, warn};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// No slot freed up within the acquire timeout.
    #[error("pool '{pool}' exhausted after waiting {waited_ms} ms")]
    Exhausted { pool: String, waited_ms: u64 },
    /// The pool is shut down and accepts no checkouts.
    #[error("pool '{pool}' is shut down")]
    Closed { pool: String },
    /// A fresh connection could not be established.
    #[error("pool '{pool}' failed to connect: {reason}")]
    Connect { pool: String, reason: String },
}

/// Opens and probes connections for one dependency.
///
/// Dropping a connection closes it.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Connection: Send + 'static;
    type Error: std::fmt::Display + Send;

    async fn connect(&self) -> Result<Self::Connection, Self::Error>;

    /// Cheap liveness probe run at checkout.
    async fn is_healthy(&self, conn: &mut Self::Connection) -> bool;
}

/// Point-in-time pool utilization.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolStats {
    pub name: String,
    pub max_size: usize,
    /// Connections currently open (in use + idle)
    pub size: usize,
    pub idle: usize,
    pub in_use: usize,
    /// `in_use / max_size`
    pub utilization: f64,
    /// Checkouts that timed out with `PoolExhausted`
    pub exhausted: u64,
    /// Connections dropped after failing the checkout probe
    pub evicted_unhealthy: u64,
    pub created: u64,
    pub closed: bool,
}

/// Outcome of a pool shutdown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub pool: String,
    /// Idle connections closed after the drain
    pub closed_idle: usize,
    /// Handles still checked out when the drain timeout hit
    pub abandoned: usize,
    pub timed_out: bool,
}

struct IdleConnection<T> {
    conn: T,
    since: Instant,
}

/// A bounded pool of connections produced by `C`.
pub struct Pool<C: Connector> {
    name: String,
    connector: C,
    config: PoolConfig,
    permits: Arc<Semaphore>,
    idle: Mutex<VecDeque<IdleConnection<C::Connection>>>,
    in_use: AtomicUsize,
    closed: AtomicBool,
    drained: Notify,
    created: AtomicU64,
    exhausted: AtomicU64,
    evicted_unhealthy: AtomicU64,
}

impl<C: Connector> Pool<C> {
    pub fn new(name: impl Into<String>, connector: C, config: PoolConfig) -> Arc<Self> {
        let max = config.max_size.max(1);
        Arc::new(Self {
            name: name.into(),
            connector,
            permits: Arc::new(Semaphore::new(max)),
            config,
            idle: Mutex::new(VecDeque::with_capacity(max)),
            in_use: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            drained: Notify::new(),
            created: AtomicU64::new(0),
            exhausted: AtomicU64::new(0),
            evicted_unhealthy: AtomicU64::new(0),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn closed_error(&self) -> PoolError {
        PoolError::Closed { pool: self.name.clone() }
    }

    /// Check out a connection, waiting at most `acquire_timeout` for a slot.
    pub async fn acquire(self: &Arc<Self>) -> Result<PoolHandle<C>, PoolError> {
        if self.is_closed() {
            return Err(self.closed_error());
        }

        let wait = self.config.acquire_timeout();
        let started = Instant::now();
        let permit = match timeout(wait, self.permits.clone().acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(self.closed_error()),
            Err(_) => {
                self.exhausted.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_pool_exhausted(&self.name);
                warn!(pool = %self.name, waited_ms = started.elapsed().as_millis() as u64, "Pool exhausted");
                return Err(PoolError::Exhausted {
                    pool: self.name.clone(),
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }
        };
        crate::metrics::record_pool_wait(&self.name, started.elapsed());

        // Counted from here so a drain waits for the health check and connect
        let reservation = Reservation::new(self);
        let conn = match self.checkout_idle().await {
            Some(conn) => conn,
            None => self.open(wait).await?,
        };

        // Shutdown may have started while we were checking
        if self.is_closed() {
            drop(conn);
            return Err(self.closed_error());
        }

        reservation.keep();
        Ok(PoolHandle {
            conn: Some(conn),
            pool: Arc::clone(self),
            discard: false,
            _permit: permit,
        })
    }

    /// Pop idle connections until one passes the probe.
    async fn checkout_idle(&self) -> Option<C::Connection> {
        let skip_probe_below = self.config.probe_after_idle();
        loop {
            let candidate = self.idle.lock().pop_front()?;
            let IdleConnection { mut conn, since } = candidate;

            if skip_probe_below > Duration::ZERO && since.elapsed() < skip_probe_below {
                return Some(conn);
            }
            if self.connector.is_healthy(&mut conn).await {
                return Some(conn);
            }

            self.evicted_unhealthy.fetch_add(1, Ordering::Relaxed);
            crate::metrics::record_pool_unhealthy(&self.name);
            debug!(pool = %self.name, "Evicted unhealthy idle connection");
        }
    }

    async fn open(&self, bound: Duration) -> Result<C::Connection, PoolError> {
        let connect_error = |reason: String| PoolError::Connect {
            pool: self.name.clone(),
            reason,
        };
        let conn = timeout(bound, self.connector.connect())
            .await
            .map_err(|_| connect_error(format!("connect timed out after {:?}", bound)))?
            .map_err(|e| connect_error(e.to_string()))?;
        self.created.fetch_add(1, Ordering::Relaxed);
        debug!(pool = %self.name, "Opened new connection");
        Ok(conn)
    }

    fn release(&self, conn: C::Connection, discard: bool) {
        if !discard && !self.is_closed() {
            self.idle.lock().push_back(IdleConnection {
                conn,
                since: Instant::now(),
            });
        }
        self.leave();
    }

    fn leave(&self) {
        if self.in_use.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.drained.notify_waiters();
        }
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let idle = self.idle.lock().len();
        let in_use = self.in_use.load(Ordering::Acquire);
        let max_size = self.config.max_size.max(1);
        PoolStats {
            name: self.name.clone(),
            max_size,
            size: idle + in_use,
            idle,
            in_use,
            utilization: in_use as f64 / max_size as f64,
            exhausted: self.exhausted.load(Ordering::Relaxed),
            evicted_unhealthy: self.evicted_unhealthy.load(Ordering::Relaxed),
            created: self.created.load(Ordering::Relaxed),
            closed: self.is_closed(),
        }
    }

    /// Stop checkouts, wait (bounded) for in-flight handles, close idle connections.
    pub async fn shutdown(&self) -> DrainReport {
        self.closed.store(true, Ordering::Release);
        self.permits.close();

        let wait_for_handles = async {
            loop {
                let notified = self.drained.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.in_use.load(Ordering::Acquire) == 0 {
                    break;
                }
                notified.await;
            }
        };
        let timed_out = timeout(self.config.drain_timeout(), wait_for_handles).await.is_err();

        let closed_idle = {
            let mut idle = self.idle.lock();
            let n = idle.len();
            idle.clear();
            n
        };
        let abandoned = self.in_use.load(Ordering::Acquire);

        if timed_out {
            warn!(pool = %self.name, abandoned, "Pool drain timed out");
        } else {
            info!(pool = %self.name, closed_idle, "Pool drained");
        }

        DrainReport {
            pool: self.name.clone(),
            closed_idle,
            abandoned,
            timed_out,
        }
    }
}

/// An `in_use` slot held while a checkout is still in progress. Given back
/// on drop unless the checkout completed and a handle took it over.
struct Reservation<'a, C: Connector> {
    pool: &'a Pool<C>,
    kept: bool,
}

impl<'a, C: Connector> Reservation<'a, C> {
    fn new(pool: &'a Pool<C>) -> Self {
        pool.in_use.fetch_add(1, Ordering::AcqRel);
        Self { pool, kept: false }
    }

    fn keep(mut self) {
        self.kept = true;
    }
}

impl<C: Connector> Drop for Reservation<'_, C> {
    fn drop(&mut self) {
        if !self.kept {
            self.pool.leave();
        }
    }
}

/// A checked-out connection. Returned to its pool on drop.
pub struct PoolHandle<C: Connector> {
    conn: Option<C::Connection>,
    pool: Arc<Pool<C>>,
    discard: bool,
    // Declared last: released after the connection is back in the pool
    _permit: OwnedSemaphorePermit,
}

impl<C: Connector> PoolHandle<C> {
    /// Drop the connection instead of returning it (e.g. after a protocol error).
    pub fn discard(mut self) {
        self.discard = true;
    }

    #[must_use]
    pub fn pool_name(&self) -> &str {
        self.pool.name()
    }
}

impl<C: Connector> Deref for PoolHandle<C> {
    type Target = C::Connection;

    fn deref(&self) -> &Self::Target {
        // Only taken in Drop
        self.conn.as_ref().unwrap_or_else(|| unreachable!("connection taken before drop"))
    }
}

impl<C: Connector> DerefMut for PoolHandle<C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().unwrap_or_else(|| unreachable!("connection taken before drop"))
    }
}

impl<C: Connector> Drop for PoolHandle<C> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn, self.discard);
        }
    }
}

impl<C: Connector> std::fmt::Debug for PoolHandle<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolHandle")
            .field("pool", &self.pool.name)
            .field("discard", &self.discard)
            .finish()
    }
}
