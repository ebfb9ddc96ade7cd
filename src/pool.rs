//! Bounded per-node connection pool
//!
//! A fixed number of permits guards the pool: a caller must hold one to hold
//! a connection, so at most `capacity` connections are ever checked out, and
//! checked-out plus idle connections never exceed `capacity`. Connections are
//! created lazily the first time a permit finds no idle one to reuse.

use std::borrow::{Borrow, BorrowMut};
use std::fmt;
use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

use crate::cluster::config::NodeConfig;
use crate::error::{DriverError, DriverResult};
use crate::transport::{BufferPool, SocketTransport};

/// Point-in-time view of a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Fixed capacity
    pub capacity: usize,
    /// Connections parked and ready for reuse
    pub available: usize,
    /// Connections currently checked out
    pub in_use: usize,
}

pub struct ConnectionPool {
    config: Arc<NodeConfig>,
    buffers: Arc<BufferPool>,
    idle: Mutex<Vec<SocketTransport>>,
    permits: Arc<Semaphore>,
    /// Bumped by `reset_all`; connections from older generations are discarded
    generation: AtomicU64,
    closed: AtomicBool,
    capacity: usize,
}

impl ConnectionPool {
    pub fn new(config: Arc<NodeConfig>) -> Arc<Self> {
        let capacity = config.pool_size;
        let buffers = BufferPool::new(config.buffer_pool_size);
        Arc::new(Self {
            config,
            buffers,
            idle: Mutex::new(Vec::with_capacity(capacity)),
            permits: Arc::new(Semaphore::new(capacity)),
            generation: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            capacity,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Check out a connection, waiting up to the node's acquire timeout.
    pub async fn acquire(self: &Arc<Self>) -> DriverResult<PooledTransport> {
        self.acquire_timeout(self.config.acquire_timeout()).await
    }

    /// Check out a connection, waiting up to `timeout` for one to be released.
    /// A zero timeout only succeeds if a slot is free right now.
    pub async fn acquire_timeout(
        self: &Arc<Self>,
        timeout: Duration,
    ) -> DriverResult<PooledTransport> {
        if self.is_closed() {
            return Err(DriverError::ShuttingDown);
        }

        let permit = if timeout.is_zero() {
            match self.permits.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(TryAcquireError::Closed) => return Err(DriverError::ShuttingDown),
                Err(TryAcquireError::NoPermits) => return Err(self.exhausted(timeout)),
            }
        } else {
            match tokio::time::timeout(timeout, self.permits.clone().acquire_owned()).await {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => return Err(DriverError::ShuttingDown),
                Err(_) => return Err(self.exhausted(timeout)),
            }
        };

        let (transport, generation) = {
            let mut idle = self.idle.lock();
            let generation = self.generation.load(Ordering::Acquire);
            let transport = idle.pop().unwrap_or_else(|| self.new_transport());
            (transport, generation)
        };

        Ok(PooledTransport {
            transport: ManuallyDrop::new(transport),
            pool: self.clone(),
            generation,
            _permit: permit,
        })
    }

    /// Drop every idle connection and mark checked-out ones for disposal on
    /// release. Fresh connections are made on demand afterwards.
    pub fn reset_all(&self) {
        let dropped = {
            let mut idle = self.idle.lock();
            self.generation.fetch_add(1, Ordering::AcqRel);
            std::mem::take(&mut *idle)
        };
        tracing::debug!(
            "Reset pool for {}: closed {} idle connections",
            self.config.name(),
            dropped.len()
        );
    }

    /// Close the pool: idle connections are dropped, waiting and future
    /// acquires fail with `ShuttingDown`.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.permits.close();
        self.idle.lock().clear();
        tracing::debug!("Closed pool for {}", self.config.name());
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> PoolStats {
        let idle = self.idle.lock().len();
        let in_use = if self.is_closed() {
            0
        } else {
            self.capacity
                .saturating_sub(self.permits.available_permits())
        };
        PoolStats {
            capacity: self.capacity,
            available: idle,
            in_use,
        }
    }

    fn new_transport(&self) -> SocketTransport {
        SocketTransport::new(self.config.clone(), self.buffers.clone())
    }

    fn exhausted(&self, timeout: Duration) -> DriverError {
        DriverError::NoConnections(format!(
            "All {} connections to {} busy for {:?}",
            self.capacity,
            self.config.name(),
            timeout
        ))
    }

    fn give_back(&self, mut transport: SocketTransport, generation: u64) {
        if transport.is_poisoned() {
            tracing::debug!(
                "Discarding interrupted connection to {}",
                self.config.name()
            );
            transport.disconnect();
        }

        let mut idle = self.idle.lock();
        if self.is_closed() || generation != self.generation.load(Ordering::Acquire) {
            return;
        }
        idle.push(transport);
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("node", &self.config.name())
            .field("stats", &self.stats())
            .finish()
    }
}

/// A connection checked out of a [`ConnectionPool`].
///
/// It goes back to the pool when dropped, so every exit path releases it
/// exactly once. A connection interrupted mid-exchange is closed first.
pub struct PooledTransport {
    /// Moved out exactly once, in `drop`
    transport: ManuallyDrop<SocketTransport>,
    pool: Arc<ConnectionPool>,
    generation: u64,
    _permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for PooledTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledTransport")
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

impl Deref for PooledTransport {
    type Target = SocketTransport;

    fn deref(&self) -> &SocketTransport {
        &self.transport
    }
}

impl DerefMut for PooledTransport {
    fn deref_mut(&mut self) -> &mut SocketTransport {
        &mut self.transport
    }
}

impl Borrow<SocketTransport> for PooledTransport {
    fn borrow(&self) -> &SocketTransport {
        &self.transport
    }
}

impl BorrowMut<SocketTransport> for PooledTransport {
    fn borrow_mut(&mut self) -> &mut SocketTransport {
        &mut self.transport
    }
}

impl Drop for PooledTransport {
    fn drop(&mut self) {
        // The permit field is dropped after this body, so the connection is
        // parked before a waiter can be woken.
        // SAFETY: `transport` is never touched again after this take.
        let transport = unsafe { ManuallyDrop::take(&mut self.transport) };
        self.pool.give_back(transport, self.generation);
    }
}
