use std::{fmt, mem, sync::Arc};

use bytes::Bytes;

use super::wire::WireWrite;
use crate::buffer::{BufferPool, Segment, SegmentList};

/// Appends primitive values into a growing list of pooled buffers.
///
/// Bytes are written into the current buffer until it is full, then a new one is checked out, so a large header or
/// body never needs one contiguous allocation. Completed buffers can be handed to the socket as they are.
pub struct FrameBuilder {
    pool: Arc<BufferPool>,
    completed: SegmentList,
    current: Vec<u8>,
    position: usize,
}

impl FrameBuilder {
    /// Creates an empty builder drawing buffers from `pool`.
    pub fn new(pool: Arc<BufferPool>) -> Self {
        FrameBuilder {
            pool,
            completed: SegmentList::new(),
            current: Vec::new(),
            position: 0,
        }
    }

    /// Number of bytes written so far.
    pub fn len(&self) -> usize {
        self.completed.len() + self.position
    }

    /// Whether nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends a byte array, referencing it directly when it is larger than a pooled buffer.
    ///
    /// Arrays of at most one buffer are copied. That includes arrays exactly one buffer long, which would otherwise
    /// be indistinguishable from pooled memory.
    pub fn append_bytes(&mut self, bytes: Bytes) {
        if bytes.len() > self.pool.buffer_size() {
            self.flush_current();
            self.completed.push(Segment::external(bytes));
        } else {
            self.write_raw(&bytes);
        }
    }

    /// Appends already encoded segments without copying them.
    pub fn append_segments(&mut self, segments: SegmentList) {
        self.flush_current();
        self.completed.extend(segments);
    }

    /// Flushes the partial buffer and returns every written byte in order.
    pub fn into_segments(mut self) -> SegmentList {
        self.flush_current();
        mem::take(&mut self.completed)
    }

    /// Returns all constituent pooled buffers to the pool, discarding the contents.
    pub fn release(self) {
        drop(self);
    }

    fn flush_current(&mut self) {
        if self.current.is_empty() {
            return;
        }
        let buffer = mem::take(&mut self.current);
        let position = mem::take(&mut self.position);
        if position == 0 {
            self.pool.release(buffer);
        } else {
            self.completed
                .push(Segment::pooled_range(Arc::new(buffer), 0..position));
        }
    }
}

impl WireWrite for FrameBuilder {
    fn write_raw(&mut self, mut bytes: &[u8]) {
        while !bytes.is_empty() {
            if self.position == self.current.len() {
                self.flush_current();
                self.current = self.pool.checkout();
            }
            let n = (self.current.len() - self.position).min(bytes.len());
            self.current[self.position..self.position + n].copy_from_slice(&bytes[..n]);
            self.position += n;
            bytes = &bytes[n..];
        }
    }
}

impl Drop for FrameBuilder {
    fn drop(&mut self) {
        if !self.current.is_empty() {
            self.pool.release(mem::take(&mut self.current));
        }
        mem::take(&mut self.completed).release(&self.pool);
    }
}

impl fmt::Debug for FrameBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameBuilder")
            .field("len", &self.len())
            .field("completed_segments", &self.completed.segments().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(buffer_size: usize) -> Arc<BufferPool> {
        Arc::new(BufferPool::new(buffer_size, None))
    }

    #[test]
    fn writes_spill_across_buffers() {
        let pool = pool(4);
        let mut builder = FrameBuilder::new(pool.clone());
        builder.write_u64(0x0807_0605_0403_0201);
        builder.write_u8(9);
        assert_eq!(builder.len(), 9);

        let segments = builder.into_segments();
        assert_eq!(segments.segments().len(), 3);
        assert_eq!(segments.to_vec(), [1, 2, 3, 4, 5, 6, 7, 8, 9]);

        segments.release(&pool);
        assert_eq!(pool.stats().outstanding(), 0);
    }

    #[test]
    fn large_arrays_are_referenced_not_copied() {
        let pool = pool(8);
        let mut builder = FrameBuilder::new(pool.clone());
        builder.write_u8(1);
        builder.append_bytes(Bytes::from(vec![2u8; 20]));
        builder.write_u8(3);

        let segments = builder.into_segments();
        let kinds: Vec<_> = segments.segments().iter().map(Segment::is_pooled).collect();
        assert_eq!(kinds, [true, false, true]);
        assert_eq!(segments.len(), 22);
        assert_eq!(pool.stats().checked_out, 2);
    }

    #[test]
    fn arrays_exactly_one_buffer_long_are_copied() {
        let pool = pool(8);
        let mut builder = FrameBuilder::new(pool.clone());
        builder.append_bytes(Bytes::from(vec![5u8; 8]));

        let segments = builder.into_segments();
        assert!(segments.segments().iter().all(Segment::is_pooled));
        assert_eq!(segments.to_vec(), vec![5u8; 8]);
    }

    #[test]
    fn append_segments_preserves_order() {
        let pool = pool(16);
        let mut builder = FrameBuilder::new(pool.clone());
        builder.write_raw(b"head");
        builder.append_segments(SegmentList::from(b"-body-".to_vec()));
        builder.write_raw(b"tail");
        assert_eq!(builder.into_segments().to_vec(), b"head-body-tail");
    }

    #[test]
    fn dropped_builder_returns_buffers() {
        let pool = pool(4);
        let mut builder = FrameBuilder::new(pool.clone());
        builder.write_raw(&[0u8; 10]);
        builder.release();

        let stats = pool.stats();
        assert_eq!(stats.checked_out, 3);
        assert_eq!(stats.outstanding(), 0);
    }
}
