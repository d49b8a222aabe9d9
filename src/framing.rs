//! Length-prefixed message frames built from pooled buffers.
//!
//! Every message is sent as one frame:
//!
//! ```text
//! [i32 header length][i32 body length][header bytes][body bytes]
//! ```
//!
//! Integers are little-endian. Frames are assembled by a [`FrameBuilder`] into a list of pooled segments, so completed
//! buffers go to the socket as they are, and decoded incrementally by a [`FrameReader`] which tolerates any split of
//! the incoming byte stream.

use std::sync::Arc;

mod builder;
mod cursor;
mod reader;
mod wire;

pub use builder::FrameBuilder;
pub use cursor::SegmentCursor;
pub use reader::{FrameReader, FrameReaderSettings};
pub use wire::{WireRead, WireWrite};

use crate::{
    buffer::{BufferPool, SegmentList},
    error::{GatewayError, Result},
    message::{Body, BodySerializer, Message},
};

/// Size of the two length fields preceding every frame.
pub const FRAME_PREFIX_LEN: usize = 8;

/// The undecoded parts of one received frame.
#[derive(Debug, Clone, Default)]
pub struct Frame {
    /// Header bytes.
    pub header: SegmentList,
    /// Body bytes.
    pub body: SegmentList,
}

impl Frame {
    /// Releases both parts to `pool`.
    pub fn release(self, pool: &BufferPool) {
        self.header.release(pool);
        self.body.release(pool);
    }
}

/// Encodes `message` into a complete frame.
///
/// Raw bodies are referenced, not copied. Object bodies are serialized with `serializer`; a failure leaves nothing
/// checked out of the pool and is reported as [`GatewayError::Serialization`].
pub fn encode_message(
    message: &Message,
    pool: &Arc<BufferPool>,
    serializer: &dyn BodySerializer,
) -> Result<SegmentList> {
    let mut header = FrameBuilder::new(pool.clone());
    message.headers().encode(&mut header);

    let body = match message.body() {
        Body::Empty => SegmentList::new(),
        Body::Raw(raw) => raw.clone(),
        Body::Object(object) => {
            let mut body = FrameBuilder::new(pool.clone());
            serializer
                .serialize(object, &mut body)
                .map_err(GatewayError::Serialization)?;
            body.into_segments()
        }
    };
    let header = header.into_segments();

    let (header_len, body_len) = match (i32::try_from(header.len()), i32::try_from(body.len())) {
        (Ok(header_len), Ok(body_len)) => (header_len, body_len),
        _ => {
            let size = header.len().max(body.len());
            header.release(pool);
            body.release(pool);
            return Err(GatewayError::MessageTooLarge {
                size,
                max: i32::MAX as usize,
            });
        }
    };

    let mut frame = FrameBuilder::new(pool.clone());
    frame.write_i32(header_len);
    frame.write_i32(body_len);
    frame.append_segments(header);
    frame.append_segments(body);
    Ok(frame.into_segments())
}
