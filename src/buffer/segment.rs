use std::{fmt, io::IoSlice, ops::Range, sync::Arc};

use bytes::Bytes;

use super::BufferPool;

#[derive(Clone)]
enum Backing {
    /// A buffer checked out from a [`BufferPool`].
    Pooled(Arc<Vec<u8>>),
    /// Memory owned outside the pool. Never returned to it.
    External(Bytes),
}

/// A view over a range of a pooled or external buffer.
#[derive(Clone)]
pub struct Segment {
    backing: Backing,
    offset: usize,
    len: usize,
}

impl Segment {
    /// Wraps a whole pooled buffer.
    pub fn pooled(buffer: Vec<u8>) -> Self {
        let len = buffer.len();
        Segment {
            backing: Backing::Pooled(Arc::new(buffer)),
            offset: 0,
            len,
        }
    }

    /// Views `range` of a shared pooled buffer.
    pub(crate) fn pooled_range(buffer: Arc<Vec<u8>>, range: Range<usize>) -> Self {
        debug_assert!(range.end <= buffer.len());
        Segment {
            backing: Backing::Pooled(buffer),
            offset: range.start,
            len: range.len(),
        }
    }

    /// Wraps memory that must never be handed to a pool.
    pub fn external(bytes: Bytes) -> Self {
        let len = bytes.len();
        Segment {
            backing: Backing::External(bytes),
            offset: 0,
            len,
        }
    }

    /// Number of bytes in the view.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the view is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether the view is backed by a pooled buffer.
    pub fn is_pooled(&self) -> bool {
        matches!(self.backing, Backing::Pooled(_))
    }

    /// The viewed bytes.
    pub fn as_slice(&self) -> &[u8] {
        let range = self.offset..self.offset + self.len;
        match &self.backing {
            Backing::Pooled(buffer) => &buffer[range],
            Backing::External(bytes) => &bytes[range],
        }
    }

    /// A narrower view over the same buffer.
    ///
    /// # Panics
    ///
    /// Panics if `start + len` exceeds this view.
    pub fn slice(&self, start: usize, len: usize) -> Segment {
        assert!(
            start + len <= self.len,
            "slice {}..{} out of bounds for segment of length {}",
            start,
            start + len,
            self.len
        );
        Segment {
            backing: self.backing.clone(),
            offset: self.offset + start,
            len,
        }
    }

    /// Recovers the underlying pooled buffer if this is its last view.
    fn into_pooled_buffer(self) -> Option<Vec<u8>> {
        match self.backing {
            Backing::Pooled(buffer) => Arc::try_unwrap(buffer).ok(),
            Backing::External(_) => None,
        }
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment")
            .field("pooled", &self.is_pooled())
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish()
    }
}

/// An ordered list of segments forming one logical byte range.
#[derive(Clone, Default)]
pub struct SegmentList {
    segments: Vec<Segment>,
    len: usize,
}

impl SegmentList {
    /// Creates an empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a segment. Empty segments are skipped.
    pub fn push(&mut self, segment: Segment) {
        if segment.is_empty() {
            return;
        }
        self.len += segment.len();
        self.segments.push(segment);
    }

    /// Appends every segment of `other`.
    pub fn extend(&mut self, other: SegmentList) {
        for segment in other.segments {
            self.push(segment);
        }
    }

    /// Total number of bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the list holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The segments in order.
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Iterates the viewed byte slices in order.
    pub fn chunks(&self) -> impl Iterator<Item = &[u8]> {
        self.segments.iter().map(Segment::as_slice)
    }

    /// Borrowed I/O slices suitable for vectored writes.
    pub fn io_slices(&self) -> Vec<IoSlice<'_>> {
        self.chunks().map(IoSlice::new).collect()
    }

    /// Copies every byte into one contiguous vector.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len);
        for chunk in self.chunks() {
            out.extend_from_slice(chunk);
        }
        out
    }

    /// Copies bytes starting at `offset` into `dst`.
    ///
    /// Returns the number of bytes copied, which is short only if the list ends first.
    pub fn copy_to_slice(&self, mut offset: usize, dst: &mut [u8]) -> usize {
        let mut written = 0;
        for segment in &self.segments {
            if written == dst.len() {
                break;
            }
            if offset >= segment.len() {
                offset -= segment.len();
                continue;
            }
            let src = &segment.as_slice()[offset..];
            let n = src.len().min(dst.len() - written);
            dst[written..written + n].copy_from_slice(&src[..n]);
            written += n;
            offset = 0;
        }
        written
    }

    /// A zero-copy view over `len` bytes starting at `offset`.
    ///
    /// # Panics
    ///
    /// Panics if the range exceeds the list.
    pub fn slice(&self, mut offset: usize, len: usize) -> SegmentList {
        assert!(
            offset + len <= self.len,
            "slice {}..{} out of bounds for segment list of length {}",
            offset,
            offset + len,
            self.len
        );
        let mut out = SegmentList::new();
        let mut remaining = len;
        for segment in &self.segments {
            if remaining == 0 {
                break;
            }
            if offset >= segment.len() {
                offset -= segment.len();
                continue;
            }
            let n = (segment.len() - offset).min(remaining);
            out.push(segment.slice(offset, n));
            remaining -= n;
            offset = 0;
        }
        out
    }

    /// Copies the bytes into freshly checked out pooled buffers.
    pub fn deep_copy(&self, pool: &BufferPool) -> SegmentList {
        let mut out = SegmentList::new();
        let mut copied = 0;
        while copied < self.len {
            let mut buffer = pool.checkout();
            let n = self.copy_to_slice(copied, &mut buffer);
            out.push(Segment::pooled_range(Arc::new(buffer), 0..n));
            copied += n;
        }
        out
    }

    /// Gives every pooled buffer no longer viewed elsewhere back to `pool`.
    pub fn release(self, pool: &BufferPool) {
        for segment in self.segments {
            if let Some(buffer) = segment.into_pooled_buffer() {
                pool.release(buffer);
            }
        }
    }
}

impl From<Bytes> for SegmentList {
    fn from(bytes: Bytes) -> Self {
        let mut list = SegmentList::new();
        list.push(Segment::external(bytes));
        list
    }
}

impl From<Vec<u8>> for SegmentList {
    fn from(bytes: Vec<u8>) -> Self {
        SegmentList::from(Bytes::from(bytes))
    }
}

impl fmt::Debug for SegmentList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegmentList")
            .field("segments", &self.segments.len())
            .field("len", &self.len)
            .finish()
    }
}
