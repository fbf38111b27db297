//! Packet buffer pool
//!
//! Fixed-size buffers for the socket readers. A buffer is owned by exactly
//! one task at a time and goes back to the pool when its `PooledBuffer`
//! drops, so it is returned once and never retained past forwarding.

use std::fmt;
use std::net::SocketAddr;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;

/// Default number of pooled buffers
pub const DEFAULT_POOL_CAPACITY: usize = 256;

/// Extra room above the MTU for encapsulation headers
pub const BUFFER_HEADROOM: usize = 128;

/// Buffer pool counters
#[derive(Debug, Default)]
pub struct BufferPoolStats {
    allocations: AtomicU64,
    reuses: AtomicU64,
    returns: AtomicU64,
    drops: AtomicU64,
}

impl BufferPoolStats {
    pub fn allocations(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }

    pub fn reuses(&self) -> u64 {
        self.reuses.load(Ordering::Relaxed)
    }

    pub fn returns(&self) -> u64 {
        self.returns.load(Ordering::Relaxed)
    }

    /// Buffers discarded because the pool was already full
    pub fn drops(&self) -> u64 {
        self.drops.load(Ordering::Relaxed)
    }
}

/// Pool of MTU-sized byte buffers
pub struct BufferPool {
    buffers: ArrayQueue<Vec<u8>>,
    buffer_size: usize,
    stats: BufferPoolStats,
}

impl BufferPool {
    /// Create a pool holding up to `capacity` idle buffers of `buffer_size` bytes
    pub fn new(capacity: usize, buffer_size: usize) -> Arc<Self> {
        Arc::new(Self {
            buffers: ArrayQueue::new(capacity.max(1)),
            buffer_size,
            stats: BufferPoolStats::default(),
        })
    }

    /// Pool sized for packets of the given MTU
    pub fn for_mtu(mtu: u16) -> Arc<Self> {
        Self::new(DEFAULT_POOL_CAPACITY, mtu as usize + BUFFER_HEADROOM)
    }

    /// Borrow a buffer; allocates when the pool is empty
    pub fn get(self: &Arc<Self>) -> PooledBuffer {
        let buffer = match self.buffers.pop() {
            Some(buf) => {
                self.stats.reuses.fetch_add(1, Ordering::Relaxed);
                buf
            }
            None => {
                self.stats.allocations.fetch_add(1, Ordering::Relaxed);
                vec![0u8; self.buffer_size]
            }
        };

        PooledBuffer {
            buffer: Some(buffer),
            pool: Arc::clone(self),
        }
    }

    fn put_back(&self, buffer: Vec<u8>) {
        // Buffers keep their full length; readers track the filled length separately.
        match self.buffers.push(buffer) {
            Ok(()) => {
                self.stats.returns.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.stats.drops.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Idle buffers currently in the pool
    pub fn available(&self) -> usize {
        self.buffers.len()
    }

    pub fn stats(&self) -> &BufferPoolStats {
        &self.stats
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("buffer_size", &self.buffer_size)
            .field("available", &self.available())
            .finish()
    }
}

/// A buffer borrowed from a [`BufferPool`]
pub struct PooledBuffer {
    buffer: Option<Vec<u8>>,
    pool: Arc<BufferPool>,
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buffer.as_deref().unwrap_or(&[])
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buffer.as_deref_mut().unwrap_or(&mut [])
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.pool.put_back(buffer);
        }
    }
}

/// A received datagram held in a pooled buffer
pub struct Datagram {
    pub from: SocketAddr,
    pub buf: PooledBuffer,
    pub len: usize,
}

impl Datagram {
    pub fn data(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_returns_on_drop() {
        let pool = BufferPool::new(4, 1500);
        let buf = pool.get();
        assert_eq!(buf.len(), 1500);
        assert_eq!(pool.available(), 0);

        drop(buf);
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.stats().returns(), 1);

        let _again = pool.get();
        assert_eq!(pool.stats().reuses(), 1);
        assert_eq!(pool.stats().allocations(), 1);
    }

    #[test]
    fn test_full_pool_drops_extra_buffers() {
        let pool = BufferPool::new(1, 64);
        let a = pool.get();
        let b = pool.get();
        drop(a);
        drop(b);
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.stats().drops(), 1);
    }

    #[test]
    fn test_mtu_sizing() {
        let pool = BufferPool::for_mtu(1420);
        assert_eq!(pool.buffer_size(), 1420 + BUFFER_HEADROOM);
    }
}
