use super::wire::WireRead;
use crate::{
    buffer::{Segment, SegmentList},
    error::{GatewayError, Result},
};

/// Reads primitive values across the segments of a [`SegmentList`].
#[derive(Debug)]
pub struct SegmentCursor<'a> {
    segments: &'a [Segment],
    index: usize,
    offset: usize,
    remaining: usize,
}

impl<'a> SegmentCursor<'a> {
    /// Creates a cursor positioned at the first byte of `list`.
    pub fn new(list: &'a SegmentList) -> Self {
        SegmentCursor {
            segments: list.segments(),
            index: 0,
            offset: 0,
            remaining: list.len(),
        }
    }
}

impl WireRead for SegmentCursor<'_> {
    fn read_raw(&mut self, dst: &mut [u8]) -> Result<()> {
        if dst.len() > self.remaining {
            return Err(GatewayError::MalformedFrame(format!(
                "unexpected end of data: needed {} bytes, {} left",
                dst.len(),
                self.remaining
            )));
        }

        let mut written = 0;
        while written < dst.len() {
            let segment = self.segments[self.index].as_slice();
            let n = (segment.len() - self.offset).min(dst.len() - written);
            dst[written..written + n].copy_from_slice(&segment[self.offset..self.offset + n]);
            written += n;
            self.offset += n;
            if self.offset == segment.len() {
                self.index += 1;
                self.offset = 0;
            }
        }
        self.remaining -= dst.len();
        Ok(())
    }

    fn remaining(&self) -> usize {
        self.remaining
    }
}
