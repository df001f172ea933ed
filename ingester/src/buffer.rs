//! Receive buffer pool
//!
//! The receiver acquires [`RecvBuffer`]s here and the ingress queue's release
//! hook gives them back once a decoder worker has consumed them. Release takes
//! the buffer by value, so a buffer can only come back once.

use crate::message::{MessageType, RecvBuffer};
use bytes::BytesMut;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe pool of reusable receive buffers
///
/// When empty, `acquire` allocates. When full, `release` drops the storage.
pub struct BufferPool {
    free: Mutex<Vec<BytesMut>>,
    max_pooled: usize,
    buffer_capacity: usize,
    metrics: PoolMetrics,
}

/// Counters for pool monitoring and leak checks
#[derive(Default)]
pub struct PoolMetrics {
    /// Buffers handed out
    pub acquired: AtomicU64,
    /// Buffers given back
    pub released: AtomicU64,
    /// Acquires served from the free list
    pub hits: AtomicU64,
    /// Acquires that had to allocate
    pub misses: AtomicU64,
}

impl BufferPool {
    /// Create a pool keeping at most `max_pooled` idle buffers of `buffer_capacity` bytes
    pub fn new(max_pooled: usize, buffer_capacity: usize) -> Self {
        Self {
            free: Mutex::new(Vec::with_capacity(max_pooled.min(1024))),
            max_pooled,
            buffer_capacity,
            metrics: PoolMetrics::default(),
        }
    }

    /// Take a cleared buffer from the pool
    pub fn acquire(&self, msg_type: MessageType) -> RecvBuffer {
        let pooled = self.free.lock().pop();
        let data = match pooled {
            Some(data) => {
                self.metrics.hits.fetch_add(1, Ordering::Relaxed);
                data
            }
            None => {
                self.metrics.misses.fetch_add(1, Ordering::Relaxed);
                BytesMut::with_capacity(self.buffer_capacity)
            }
        };
        self.metrics.acquired.fetch_add(1, Ordering::Relaxed);
        crate::metrics::try_set_buffers_outstanding(self.outstanding());
        RecvBuffer::new(msg_type, data)
    }

    /// Give a buffer back to the pool
    pub fn release(&self, buffer: RecvBuffer) {
        let mut data = buffer.into_bytes();
        data.clear();
        self.metrics.released.fetch_add(1, Ordering::Relaxed);
        crate::metrics::try_set_buffers_outstanding(self.outstanding());

        let mut free = self.free.lock();
        if free.len() < self.max_pooled {
            free.push(data);
        }
    }

    /// Number of idle buffers currently pooled
    pub fn idle(&self) -> usize {
        self.free.lock().len()
    }

    /// Buffers acquired but not yet released
    pub fn outstanding(&self) -> u64 {
        let acquired = self.metrics.acquired.load(Ordering::Acquire);
        let released = self.metrics.released.load(Ordering::Acquire);
        acquired.saturating_sub(released)
    }

    /// Total buffers handed out
    pub fn total_acquired(&self) -> u64 {
        self.metrics.acquired.load(Ordering::Relaxed)
    }

    /// Total buffers given back
    pub fn total_released(&self) -> u64 {
        self.metrics.released.load(Ordering::Relaxed)
    }

    /// Fraction of acquires served without allocating (1.0 when unused)
    pub fn hit_rate(&self) -> f64 {
        let hits = self.metrics.hits.load(Ordering::Relaxed);
        let misses = self.metrics.misses.load(Ordering::Relaxed);
        match hits + misses {
            0 => 1.0,
            total => hits as f64 / total as f64,
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(1024, 64 * 1024)
    }
}
