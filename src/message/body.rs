use std::{any::Any, fmt, sync::Arc};

use bytes::Bytes;

use crate::{
    buffer::SegmentList,
    error::BoxError,
    framing::{FrameBuilder, WireWrite},
};

/// A deserialized message body.
pub type BodyObject = Arc<dyn Any + Send + Sync>;

/// The body of a [`Message`](super::Message).
///
/// Exactly one representation is authoritative at a time: raw bytes as received from the wire, or the object they
/// deserialize to.
#[derive(Clone, Default)]
pub enum Body {
    /// No body.
    #[default]
    Empty,
    /// Serialized bytes, usually views into the receive buffer.
    Raw(SegmentList),
    /// A deserialized object.
    Object(BodyObject),
}

impl Body {
    /// Wraps a value as a body object.
    pub fn object<T: Any + Send + Sync>(value: T) -> Self {
        Body::Object(Arc::new(value))
    }

    /// Whether there is no body.
    pub fn is_empty(&self) -> bool {
        matches!(self, Body::Empty)
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Empty => write!(f, "Empty"),
            Body::Raw(raw) => f.debug_tuple("Raw").field(&raw.len()).finish(),
            Body::Object(_) => write!(f, "Object(..)"),
        }
    }
}

/// Converts body objects to and from bytes.
///
/// Only the framing of serialized bytes is handled by this crate; the object format is up to the implementation.
pub trait BodySerializer: Send + Sync + 'static {
    /// Appends the serialized form of `body` to `out`.
    fn serialize(&self, body: &BodyObject, out: &mut FrameBuilder) -> Result<(), BoxError>;

    /// Deserializes a body from its bytes.
    fn deserialize(&self, bytes: &SegmentList) -> Result<BodyObject, BoxError>;
}

/// Passes [`Bytes`] and `Vec<u8>` bodies through unchanged.
///
/// Deserialized bodies are always [`Bytes`]. Bodies larger than a pooled buffer are sent without being copied.
#[derive(Clone, Copy, Debug, Default)]
pub struct BytesBodySerializer;

impl BodySerializer for BytesBodySerializer {
    fn serialize(&self, body: &BodyObject, out: &mut FrameBuilder) -> Result<(), BoxError> {
        if let Some(bytes) = body.downcast_ref::<Bytes>() {
            out.append_bytes(bytes.clone());
            Ok(())
        } else if let Some(bytes) = body.downcast_ref::<Vec<u8>>() {
            out.write_raw(bytes);
            Ok(())
        } else {
            Err("unsupported body type: expected Bytes or Vec<u8>".into())
        }
    }

    fn deserialize(&self, bytes: &SegmentList) -> Result<BodyObject, BoxError> {
        Ok(Arc::new(Bytes::from(bytes.to_vec())))
    }
}
