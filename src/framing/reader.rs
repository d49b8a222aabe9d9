use std::{collections::VecDeque, fmt, io, sync::Arc};

use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::trace;

use super::{Frame, FRAME_PREFIX_LEN};
use crate::{
    buffer::{BufferPool, Segment, SegmentList},
    config::GatewayClientConfig,
    error::{GatewayError, Result},
    message::Message,
};

/// Sizing and limits for a [`FrameReader`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameReaderSettings {
    /// Capacity kept between messages.
    pub sustained_size: usize,
    /// Capacity doubles until it reaches this size.
    pub grow_max: usize,
    /// Past `grow_max`, capacity grows by this many bytes at a time.
    pub grow_block: usize,
    /// Largest header a frame may declare.
    pub max_header_size: usize,
    /// Largest body a frame may declare.
    pub max_body_size: usize,
    /// Copy decoded bodies into fresh buffers instead of viewing the receive buffer.
    pub forwarding: bool,
}

impl From<&GatewayClientConfig> for FrameReaderSettings {
    fn from(config: &GatewayClientConfig) -> Self {
        FrameReaderSettings {
            sustained_size: config.receive_buffer_sustained_size,
            grow_max: config.receive_buffer_grow_max,
            grow_block: config.receive_buffer_grow_block,
            max_header_size: config.max_header_size,
            max_body_size: config.max_body_size,
            forwarding: config.forwarding_reads,
        }
    }
}

impl Default for FrameReaderSettings {
    fn default() -> Self {
        FrameReaderSettings::from(&GatewayClientConfig::default())
    }
}

/// Incrementally decodes frames from bytes received in arbitrary chunks.
///
/// The receive buffer is a run of pooled buffers addressed by two offsets: `receive_offset`, the number of bytes
/// written by the socket, and `decode_offset`, the number of bytes consumed by decoded frames. Both are relative to
/// the start of the first buffer. Decoded frames view the buffers they were received into, so a buffer that is still
/// viewed is copied out of before it is written to again.
pub struct FrameReader {
    pool: Arc<BufferPool>,
    settings: FrameReaderSettings,
    buffers: VecDeque<Arc<Vec<u8>>>,
    receive_offset: usize,
    decode_offset: usize,
}

impl FrameReader {
    /// Creates a reader holding its sustained capacity.
    pub fn new(pool: Arc<BufferPool>, settings: FrameReaderSettings) -> Self {
        let mut reader = FrameReader {
            pool,
            settings,
            buffers: VecDeque::new(),
            receive_offset: 0,
            decode_offset: 0,
        };
        reader.top_up();
        reader
    }

    /// Total bytes the receive buffer can hold.
    pub fn capacity(&self) -> usize {
        self.buffers.len() * self.pool.buffer_size()
    }

    /// Bytes received but not yet decoded.
    pub fn buffered(&self) -> usize {
        self.receive_offset - self.decode_offset
    }

    /// Writable space following the received bytes.
    ///
    /// The slice is never empty. Report how much of it was filled with [`advance`](Self::advance).
    pub fn receive_buffer(&mut self) -> &mut [u8] {
        if self.receive_offset == self.capacity() {
            let required = self.capacity() + 1;
            self.grow_to(required);
        }
        let buffer_size = self.pool.buffer_size();
        let index = self.receive_offset / buffer_size;
        let position = self.receive_offset % buffer_size;

        if Arc::get_mut(&mut self.buffers[index]).is_none() {
            // Still viewed by a decoded frame: continue in a private copy.
            let mut fresh = self.pool.checkout();
            fresh[..position].copy_from_slice(&self.buffers[index][..position]);
            self.buffers[index] = Arc::new(fresh);
        }
        let buffer = Arc::make_mut(&mut self.buffers[index]);
        &mut buffer[position..]
    }

    /// Marks `n` bytes of the last [`receive_buffer`](Self::receive_buffer) as received.
    pub fn advance(&mut self, n: usize) {
        debug_assert!(self.receive_offset + n <= self.capacity());
        self.receive_offset += n;
    }

    /// Copies `bytes` into the receive buffer.
    pub fn extend_from_slice(&mut self, mut bytes: &[u8]) {
        while !bytes.is_empty() {
            let buffer = self.receive_buffer();
            let n = buffer.len().min(bytes.len());
            buffer[..n].copy_from_slice(&bytes[..n]);
            self.advance(n);
            bytes = &bytes[n..];
        }
    }

    /// Performs one read from `reader` into the receive buffer. Returns 0 at end of stream.
    pub async fn fill_from<R>(&mut self, reader: &mut R) -> io::Result<usize>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let buffer = self.receive_buffer();
        let n = reader.read(buffer).await?;
        self.advance(n);
        Ok(n)
    }

    /// Decodes the next frame if all of its bytes have been received.
    ///
    /// `Ok(None)` means more bytes are needed. Nothing received so far is discarded in that case.
    pub fn try_decode_frame(&mut self) -> Result<Option<Frame>> {
        let available = self.buffered();
        if available < FRAME_PREFIX_LEN {
            return Ok(None);
        }

        let mut prefix = [0u8; FRAME_PREFIX_LEN];
        self.copy_out(self.decode_offset, &mut prefix);
        let header_len = i32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]);
        let body_len = i32::from_le_bytes([prefix[4], prefix[5], prefix[6], prefix[7]]);
        let (header_len, body_len) = match (usize::try_from(header_len), usize::try_from(body_len)) {
            (Ok(header_len), Ok(body_len)) => (header_len, body_len),
            _ => {
                return Err(GatewayError::MalformedFrame(format!(
                    "negative frame length (header {header_len}, body {body_len})"
                )))
            }
        };
        if header_len > self.settings.max_header_size {
            return Err(GatewayError::MessageTooLarge {
                size: header_len,
                max: self.settings.max_header_size,
            });
        }
        if body_len > self.settings.max_body_size {
            return Err(GatewayError::MessageTooLarge {
                size: body_len,
                max: self.settings.max_body_size,
            });
        }

        let total = FRAME_PREFIX_LEN + header_len + body_len;
        let required = self.decode_offset + total;
        if required > self.capacity() {
            self.grow_to(required);
        }
        if available < total {
            return Ok(None);
        }

        let start = self.decode_offset + FRAME_PREFIX_LEN;
        let header = self.view(start, header_len);
        let mut body = self.view(start + header_len, body_len);
        if self.settings.forwarding {
            body = body.deep_copy(&self.pool);
        }

        self.decode_offset += total;
        self.trim();
        Ok(Some(Frame { header, body }))
    }

    /// Decodes the next message if all of its bytes have been received.
    pub fn try_decode_message(&mut self) -> Result<Option<Message>> {
        match self.try_decode_frame()? {
            Some(frame) => Message::from_frame(frame, &self.pool).map(Some),
            None => Ok(None),
        }
    }

    /// Discards everything received, keeping the sustained capacity.
    pub fn reset(&mut self) {
        self.release_buffers();
        self.receive_offset = 0;
        self.decode_offset = 0;
        self.top_up();
    }

    fn sustained_buffers(&self) -> usize {
        self.settings
            .sustained_size
            .div_ceil(self.pool.buffer_size())
            .max(1)
    }

    fn grow_to(&mut self, required: usize) {
        let buffer_size = self.pool.buffer_size();
        let mut capacity = self.capacity();
        while capacity < required {
            capacity = if capacity < self.settings.grow_max {
                (capacity * 2).max(buffer_size)
            } else {
                capacity + self.settings.grow_block.max(buffer_size)
            };
        }
        let target = capacity.div_ceil(buffer_size);
        while self.buffers.len() < target {
            self.buffers.push_back(Arc::new(self.pool.checkout()));
        }
        trace!(capacity = self.capacity(), "grew receive buffer");
    }

    fn top_up(&mut self) {
        let sustained = self.sustained_buffers();
        while self.buffers.len() < sustained {
            self.buffers.push_back(Arc::new(self.pool.checkout()));
        }
    }

    /// Drops buffers fully consumed by decoding and shrinks back toward the sustained size.
    fn trim(&mut self) {
        let buffer_size = self.pool.buffer_size();
        let consumed = self.decode_offset / buffer_size;
        for _ in 0..consumed {
            if let Some(buffer) = self.buffers.pop_front() {
                self.release_buffer(buffer);
            }
        }
        self.decode_offset -= consumed * buffer_size;
        self.receive_offset -= consumed * buffer_size;

        let keep = self
            .receive_offset
            .div_ceil(buffer_size)
            .max(self.sustained_buffers());
        let shrinking = self.buffers.len() > keep;
        while self.buffers.len() > keep {
            if let Some(buffer) = self.buffers.pop_back() {
                self.release_buffer(buffer);
            }
        }
        if shrinking {
            trace!(capacity = self.capacity(), "shrank receive buffer");
        }
        self.top_up();
    }

    fn release_buffer(&self, buffer: Arc<Vec<u8>>) {
        // A buffer still viewed by a decoded frame goes back to the pool when that view is released.
        if let Ok(buffer) = Arc::try_unwrap(buffer) {
            self.pool.release(buffer);
        }
    }

    fn release_buffers(&mut self) {
        while let Some(buffer) = self.buffers.pop_front() {
            self.release_buffer(buffer);
        }
    }

    fn copy_out(&self, offset: usize, dst: &mut [u8]) {
        let buffer_size = self.pool.buffer_size();
        let mut index = offset / buffer_size;
        let mut position = offset % buffer_size;
        let mut written = 0;
        while written < dst.len() {
            let n = (buffer_size - position).min(dst.len() - written);
            dst[written..written + n].copy_from_slice(&self.buffers[index][position..position + n]);
            written += n;
            index += 1;
            position = 0;
        }
    }

    fn view(&self, offset: usize, len: usize) -> SegmentList {
        let buffer_size = self.pool.buffer_size();
        let mut list = SegmentList::new();
        let mut index = offset / buffer_size;
        let mut position = offset % buffer_size;
        let mut remaining = len;
        while remaining > 0 {
            let n = (buffer_size - position).min(remaining);
            list.push(Segment::pooled_range(
                self.buffers[index].clone(),
                position..position + n,
            ));
            remaining -= n;
            index += 1;
            position = 0;
        }
        list
    }
}

impl Drop for FrameReader {
    fn drop(&mut self) {
        self.release_buffers();
    }
}

impl fmt::Debug for FrameReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameReader")
            .field("capacity", &self.capacity())
            .field("receive_offset", &self.receive_offset)
            .field("decode_offset", &self.decode_offset)
            .finish()
    }
}
