//! Bounded free-list of scratch buffers
//!
//! Each node owns one pool shared by all of its connections. Frames are
//! encoded into and read out of buffers checked out here, so steady-state
//! traffic does not allocate per request.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::Mutex;

/// Initial capacity of a freshly allocated buffer
pub const DEFAULT_BUFFER_CAPACITY: usize = 8 * 1024;

/// Buffers that grew past this are not kept
const MAX_RETAINED_CAPACITY: usize = 1024 * 1024;

pub struct BufferPool {
    free: Mutex<Vec<BytesMut>>,
    max_pooled: usize,
    buffer_capacity: usize,
}

impl BufferPool {
    pub fn new(max_pooled: usize) -> Arc<Self> {
        Self::with_capacity(max_pooled, DEFAULT_BUFFER_CAPACITY)
    }

    pub fn with_capacity(max_pooled: usize, buffer_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            free: Mutex::new(Vec::with_capacity(max_pooled)),
            max_pooled,
            buffer_capacity,
        })
    }

    /// Take a cleared buffer, allocating only if the free-list is empty.
    pub fn checkout(self: &Arc<Self>) -> PooledBuffer {
        let buf = self
            .free
            .lock()
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(self.buffer_capacity));
        PooledBuffer {
            buf,
            pool: self.clone(),
        }
    }

    /// Number of buffers currently parked in the free-list.
    pub fn idle(&self) -> usize {
        self.free.lock().len()
    }

    fn give_back(&self, mut buf: BytesMut) {
        if buf.capacity() > MAX_RETAINED_CAPACITY {
            return;
        }
        buf.clear();
        let mut free = self.free.lock();
        if free.len() < self.max_pooled {
            free.push(buf);
        }
    }
}

/// A buffer on loan from a [`BufferPool`]; returned on drop.
pub struct PooledBuffer {
    buf: BytesMut,
    pool: Arc<BufferPool>,
}

impl Deref for PooledBuffer {
    type Target = BytesMut;

    fn deref(&self) -> &BytesMut {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        self.pool.give_back(std::mem::take(&mut self.buf));
    }
}
