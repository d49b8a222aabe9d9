use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use crossbeam_queue::{ArrayQueue, SegQueue};
use tracing::trace;

/// Idle buffers waiting to be checked out again.
enum IdleBuffers {
    Bounded(ArrayQueue<Vec<u8>>),
    Unbounded(SegQueue<Vec<u8>>),
}

impl IdleBuffers {
    fn pop(&self) -> Option<Vec<u8>> {
        match self {
            IdleBuffers::Bounded(queue) => queue.pop(),
            IdleBuffers::Unbounded(queue) => queue.pop(),
        }
    }

    /// Returns the buffer back if the idle set is full.
    fn push(&self, buffer: Vec<u8>) -> Result<(), Vec<u8>> {
        match self {
            IdleBuffers::Bounded(queue) => queue.push(buffer),
            IdleBuffers::Unbounded(queue) => {
                queue.push(buffer);
                Ok(())
            }
        }
    }

    fn len(&self) -> usize {
        match self {
            IdleBuffers::Bounded(queue) => queue.len(),
            IdleBuffers::Unbounded(queue) => queue.len(),
        }
    }
}

/// A lock-free pool of fixed-size byte buffers.
///
/// The pool is safe to share between any number of producers and consumers. One instance is created when the
/// message center is built and passed to every component that needs buffers.
pub struct BufferPool {
    buffer_size: usize,
    max_buffers: Option<usize>,
    idle: IdleBuffers,
    allocated: AtomicU64,
    checked_out: AtomicU64,
    checked_in: AtomicU64,
    dropped: AtomicU64,
    dropped_size_mismatch: AtomicU64,
}

/// Snapshot of a pool's allocation counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferPoolStats {
    /// Buffers allocated because no idle buffer was available.
    pub allocated: u64,
    /// Calls to checkout.
    pub checked_out: u64,
    /// Buffers accepted back into the idle set.
    pub checked_in: u64,
    /// Correctly sized buffers discarded because the idle set was full.
    pub dropped: u64,
    /// Released buffers discarded because their length did not match the pool.
    pub dropped_size_mismatch: u64,
    /// Buffers currently idle.
    pub idle: usize,
}

impl BufferPoolStats {
    /// Buffers checked out and not yet returned.
    pub fn outstanding(&self) -> u64 {
        self.checked_out
            .saturating_sub(self.checked_in)
            .saturating_sub(self.dropped)
    }
}

impl BufferPool {
    /// Creates a pool of `buffer_size` byte buffers retaining at most `max_buffers` idle buffers.
    ///
    /// `None` retains every released buffer. `Some(0)` retains none.
    pub fn new(buffer_size: usize, max_buffers: Option<usize>) -> Self {
        let idle = match max_buffers {
            Some(0) => IdleBuffers::Bounded(ArrayQueue::new(1)),
            Some(max) => IdleBuffers::Bounded(ArrayQueue::new(max)),
            None => IdleBuffers::Unbounded(SegQueue::new()),
        };

        BufferPool {
            buffer_size,
            max_buffers,
            idle,
            allocated: AtomicU64::new(0),
            checked_out: AtomicU64::new(0),
            checked_in: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            dropped_size_mismatch: AtomicU64::new(0),
        }
    }

    /// Size in bytes of every buffer handed out by this pool.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Maximum number of idle buffers retained, if bounded.
    pub fn max_buffers(&self) -> Option<usize> {
        self.max_buffers
    }

    /// Checks out a buffer, allocating one if none is idle.
    ///
    /// The returned buffer always has a length of exactly [`buffer_size`](Self::buffer_size). Reused buffers are
    /// not zeroed.
    pub fn checkout(&self) -> Vec<u8> {
        self.checked_out.fetch_add(1, Ordering::Relaxed);
        match self.idle.pop() {
            Some(buffer) => buffer,
            None => {
                self.allocated.fetch_add(1, Ordering::Relaxed);
                vec![0u8; self.buffer_size]
            }
        }
    }

    /// Checks out enough buffers to hold `total_bytes`.
    pub fn checkout_many(&self, total_bytes: usize) -> Vec<Vec<u8>> {
        let count = total_bytes.div_ceil(self.buffer_size);
        (0..count).map(|_| self.checkout()).collect()
    }

    /// Returns a buffer to the pool.
    ///
    /// Buffers whose length differs from the pool's buffer size are discarded, as are buffers released while the
    /// idle set is already at its bound.
    pub fn release(&self, buffer: Vec<u8>) {
        if buffer.len() != self.buffer_size {
            self.dropped_size_mismatch.fetch_add(1, Ordering::Relaxed);
            trace!(
                len = buffer.len(),
                buffer_size = self.buffer_size,
                "discarding foreign-sized buffer"
            );
            return;
        }

        if self.max_buffers == Some(0) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        match self.idle.push(buffer) {
            Ok(()) => {
                self.checked_in.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Returns every buffer to the pool.
    pub fn release_many<I>(&self, buffers: I)
    where
        I: IntoIterator<Item = Vec<u8>>,
    {
        for buffer in buffers {
            self.release(buffer);
        }
    }

    /// Number of idle buffers.
    pub fn idle_count(&self) -> usize {
        self.idle.len()
    }

    /// Snapshot of the pool's counters.
    pub fn stats(&self) -> BufferPoolStats {
        BufferPoolStats {
            allocated: self.allocated.load(Ordering::Relaxed),
            checked_out: self.checked_out.load(Ordering::Relaxed),
            checked_in: self.checked_in.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            dropped_size_mismatch: self.dropped_size_mismatch.load(Ordering::Relaxed),
            idle: self.idle.len(),
        }
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("buffer_size", &self.buffer_size)
            .field("max_buffers", &self.max_buffers)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use super::*;

    #[test]
    fn checkout_returns_buffers_of_pool_size() {
        let pool = BufferPool::new(256, None);
        let buffer = pool.checkout();
        assert_eq!(buffer.len(), 256);
        assert_eq!(pool.stats().allocated, 1);
        assert_eq!(pool.stats().outstanding(), 1);
    }

    #[test]
    fn bounded_pool_caps_idle_buffers() {
        let pool = BufferPool::new(256, Some(2));
        let buffers: Vec<_> = (0..3).map(|_| pool.checkout()).collect();
        pool.release_many(buffers);

        let stats = pool.stats();
        assert_eq!(pool.idle_count(), 2);
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.checked_in, 2);
        assert_eq!(stats.allocated, 3);
        assert_eq!(stats.outstanding(), 0);
    }

    #[test]
    fn released_buffers_are_reused() {
        let pool = BufferPool::new(64, None);
        let mut buffer = pool.checkout();
        buffer[0] = 42;
        pool.release(buffer);

        let buffer = pool.checkout();
        assert_eq!(buffer[0], 42);
        assert_eq!(pool.stats().allocated, 1);
    }

    #[test]
    fn foreign_sized_buffers_are_never_pooled() {
        let pool = BufferPool::new(64, None);
        pool.release(vec![7u8; 63]);
        pool.release(vec![7u8; 65]);
        pool.release(Vec::new());

        let stats = pool.stats();
        assert_eq!(stats.dropped_size_mismatch, 3);
        assert_eq!(pool.idle_count(), 0);

        for _ in 0..4 {
            assert_eq!(pool.checkout().len(), 64);
        }
    }

    #[test]
    fn zero_bound_retains_nothing() {
        let pool = BufferPool::new(32, Some(0));
        let buffer = pool.checkout();
        pool.release(buffer);
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.stats().dropped, 1);
        assert_eq!(pool.stats().outstanding(), 0);
    }

    #[test]
    fn checkout_many_rounds_up() {
        let pool = BufferPool::new(100, None);
        assert_eq!(pool.checkout_many(0).len(), 0);
        assert_eq!(pool.checkout_many(1).len(), 1);
        assert_eq!(pool.checkout_many(100).len(), 1);
        assert_eq!(pool.checkout_many(101).len(), 2);
        assert_eq!(pool.checkout_many(1000).len(), 10);
    }

    #[test]
    fn counters_balance_under_mixed_sequences() {
        let pool = BufferPool::new(16, Some(3));
        let mut held = Vec::new();
        let mut max_outstanding = 0;

        for step in 0..200u32 {
            if step % 3 == 0 || held.is_empty() {
                held.push(pool.checkout());
            } else {
                pool.release(held.pop().unwrap());
            }
            let stats = pool.stats();
            assert_eq!(stats.outstanding(), held.len() as u64);
            max_outstanding = max_outstanding.max(held.len() as u64);
            assert!(stats.allocated - stats.dropped <= max_outstanding + 3);
            assert!(stats.idle <= 3);
        }
    }

    #[test]
    fn concurrent_checkout_and_release() {
        let pool = Arc::new(BufferPool::new(128, Some(64)));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                thread::spawn(move || {
                    for _ in 0..1000 {
                        let buffers = pool.checkout_many(512);
                        assert_eq!(buffers.len(), 4);
                        pool.release_many(buffers);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let stats = pool.stats();
        assert_eq!(stats.checked_out, 8 * 1000 * 4);
        assert_eq!(stats.outstanding(), 0);
        assert!(stats.idle <= 64);
    }
}
