//! Pooled fixed-size byte buffers and zero-copy views over them.
//!
//! A [`BufferPool`] hands out `Vec<u8>` buffers of one fixed length. Outbound frames and the inbound receive buffer
//! are both built from these buffers and exposed as a [`SegmentList`]: an ordered list of [`Segment`] views that
//! together form one logically contiguous byte range without ever being copied into a single allocation.
//!
//! Ownership replaces the aliasing rules a pooled allocator usually needs: a pooled segment is reference counted,
//! and its buffer only goes back to the pool when the last view over it is released. A buffer can therefore never
//! be handed to a new borrower while a previous one still reads from it.

mod pool;
mod segment;

pub use pool::{BufferPool, BufferPoolStats};
pub use segment::{Segment, SegmentList};
