//! The message envelope exchanged with gateways.
//!
//! A [`Message`] is a set of [`MessageHeaders`] plus an optional [`Body`]. Headers are encoded sparsely: a bitmask of
//! the fields that differ from their defaults is written first, followed by only those fields in a fixed order.
//!
//! Responses and rejections are always derived from the request they answer, see [`Message::create_response`] and
//! [`Message::create_rejection`].

use std::{fmt, time::SystemTime};

mod body;
mod headers;
mod ids;

pub use body::{Body, BodyObject, BodySerializer, BytesBodySerializer};
pub use headers::{
    Category, Direction, HeaderFlags, MessageHeaders, RejectionType, ResponseKind,
};
pub use ids::{ActivationAddress, ActivationId, CorrelationId, GrainId, GrainKind, SiloAddress};

use crate::{
    buffer::{BufferPool, SegmentList},
    error::{GatewayError, Result},
    framing::{Frame, SegmentCursor},
};

/// A request, response or one-way message.
#[derive(Clone, Default)]
pub struct Message {
    headers: MessageHeaders,
    body: Body,
    reroute_attempts: u32,
}

impl Message {
    /// Creates a message from headers and a body.
    pub fn new(headers: MessageHeaders, body: Body) -> Self {
        Message {
            headers,
            body,
            reroute_attempts: 0,
        }
    }

    /// A request to `target` with a freshly allocated correlation id.
    pub fn request(target: GrainId, body: Body) -> Self {
        Message::new(
            MessageHeaders {
                direction: Direction::Request,
                id: Some(CorrelationId::next()),
                target_grain: Some(target),
                ..Default::default()
            },
            body,
        )
    }

    /// A one-way message to `target`.
    pub fn one_way(target: GrainId, body: Body) -> Self {
        Message::new(
            MessageHeaders {
                direction: Direction::OneWay,
                id: Some(CorrelationId::next()),
                target_grain: Some(target),
                ..Default::default()
            },
            body,
        )
    }

    /// Decodes the headers of a received frame, taking ownership of its body bytes.
    ///
    /// The header segments are released to `pool` once decoded, whether or not decoding succeeds.
    pub fn from_frame(frame: Frame, pool: &BufferPool) -> Result<Self> {
        let Frame { header, body } = frame;
        let headers = MessageHeaders::decode(&mut SegmentCursor::new(&header));
        header.release(pool);
        match headers {
            Ok(headers) => {
                let body = if body.is_empty() {
                    Body::Empty
                } else {
                    Body::Raw(body)
                };
                Ok(Message::new(headers, body))
            }
            Err(err) => {
                body.release(pool);
                Err(err)
            }
        }
    }

    /// The headers.
    pub fn headers(&self) -> &MessageHeaders {
        &self.headers
    }

    /// Mutable access to the headers.
    pub fn headers_mut(&mut self) -> &mut MessageHeaders {
        &mut self.headers
    }

    /// The body in its current representation.
    pub fn body(&self) -> &Body {
        &self.body
    }

    /// Replaces the body, returning the previous one.
    pub fn set_body(&mut self, body: Body) -> Body {
        std::mem::replace(&mut self.body, body)
    }

    /// The correlation id.
    pub fn id(&self) -> Option<CorrelationId> {
        self.headers.id
    }

    /// The inbound queue this message belongs to.
    pub fn category(&self) -> Category {
        self.headers.category
    }

    /// Request, response or one-way.
    pub fn direction(&self) -> Direction {
        self.headers.direction
    }

    /// Whether this message expects a response.
    pub fn is_request(&self) -> bool {
        self.headers.direction == Direction::Request
    }

    /// Whether this is a rejection response.
    pub fn is_rejection(&self) -> bool {
        self.headers.result == ResponseKind::Rejection
    }

    /// The deserialized body, deserializing raw bytes on first access.
    ///
    /// Once deserialized the raw bytes are released to `pool` and the object becomes the authoritative body. On
    /// failure the raw bytes are kept.
    pub fn body_object(
        &mut self,
        serializer: &dyn BodySerializer,
        pool: &BufferPool,
    ) -> Result<Option<BodyObject>> {
        match &self.body {
            Body::Empty => Ok(None),
            Body::Object(object) => Ok(Some(object.clone())),
            Body::Raw(raw) => {
                let object = serializer
                    .deserialize(raw)
                    .map_err(GatewayError::Serialization)?;
                if let Body::Raw(raw) = self.set_body(Body::Object(object.clone())) {
                    raw.release(pool);
                }
                Ok(Some(object))
            }
        }
    }

    /// Derives the response to this request.
    ///
    /// Sender and target are swapped. The correlation id, read-only and interleave flags, cache invalidations,
    /// expiration and request context carry over.
    pub fn create_response(&self) -> Message {
        let request = &self.headers;
        Message::new(
            MessageHeaders {
                category: request.category,
                direction: Direction::Response,
                read_only: request.read_only,
                always_interleave: request.always_interleave,
                id: request.id,
                target_silo: request.sending_silo,
                target_grain: request.sending_grain.clone(),
                target_activation: request.sending_activation,
                sending_silo: request.target_silo,
                sending_grain: request.target_grain.clone(),
                sending_activation: request.target_activation,
                expiration: request.expiration,
                request_context: request.request_context.clone(),
                cache_invalidation: request.cache_invalidation.clone(),
                ..Default::default()
            },
            Body::Empty,
        )
    }

    /// Derives a rejection of this request.
    pub fn create_rejection(&self, rejection_type: RejectionType, info: impl Into<String>) -> Message {
        let mut response = self.create_response();
        response.headers.result = ResponseKind::Rejection;
        response.headers.rejection_type = Some(rejection_type);
        response.headers.rejection_info = Some(info.into());
        response
    }

    /// Whether `other` is a copy of this message: same sending silo and same correlation id.
    pub fn is_duplicate(&self, other: &Message) -> bool {
        self.headers.id.is_some()
            && self.headers.id == other.headers.id
            && self.headers.sending_silo == other.headers.sending_silo
    }

    /// Whether the message expired before `now`.
    pub fn is_expired(&self, now: SystemTime) -> bool {
        self.headers
            .expiration
            .is_some_and(|expiration| expiration <= now)
    }

    /// Times the message center has rerouted this message.
    pub fn reroute_attempts(&self) -> u32 {
        self.reroute_attempts
    }

    pub(crate) fn record_reroute(&mut self) -> u32 {
        self.reroute_attempts += 1;
        self.reroute_attempts
    }

    /// Releases the raw body bytes to `pool`.
    pub fn release(self, pool: &BufferPool) {
        if let Body::Raw(raw) = self.body {
            raw.release(pool);
        }
    }

    /// Takes the raw body bytes, leaving the body empty.
    pub fn take_raw_body(&mut self) -> Option<SegmentList> {
        match self.set_body(Body::Empty) {
            Body::Raw(raw) => Some(raw),
            other => {
                self.body = other;
                None
            }
        }
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("Message");
        debug
            .field("category", &self.headers.category)
            .field("direction", &self.headers.direction)
            .field("id", &self.headers.id);
        if let Some(target) = &self.headers.target_grain {
            debug.field("target_grain", target);
        }
        if let Some(silo) = &self.headers.target_silo {
            debug.field("target_silo", silo);
        }
        if self.headers.result != ResponseKind::Success {
            debug.field("result", &self.headers.result);
        }
        if let Some(rejection) = self.headers.rejection_type {
            debug.field("rejection_type", &rejection);
        }
        debug.field("body", &self.body).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use bytes::Bytes;

    use super::*;

    fn silo(port: u16) -> SiloAddress {
        SiloAddress::new(([10, 0, 0, 1], port).into(), 1)
    }

    #[test]
    fn response_swaps_addressing_and_copies_context() {
        let mut request = Message::request(GrainId::new(1, 2), Body::Empty);
        {
            let headers = request.headers_mut();
            headers.sending_grain = Some(GrainId::new_client());
            headers.sending_silo = Some(silo(1));
            headers.target_silo = Some(silo(2));
            headers.target_activation = Some(ActivationId::from_raw(5));
            headers.read_only = true;
            headers.always_interleave = true;
            headers.unordered = true;
            headers.resend_count = 3;
            headers.expiration = Some(SystemTime::UNIX_EPOCH + Duration::from_secs(60));
            headers
                .request_context
                .insert("trace".to_string(), "t-1".to_string());
        }

        let response = request.create_response();
        let (req, resp) = (request.headers(), response.headers());
        assert_eq!(resp.direction, Direction::Response);
        assert_eq!(resp.id, req.id);
        assert_eq!(resp.target_grain, req.sending_grain);
        assert_eq!(resp.target_silo, req.sending_silo);
        assert_eq!(resp.sending_grain, req.target_grain);
        assert_eq!(resp.sending_silo, req.target_silo);
        assert_eq!(resp.sending_activation, req.target_activation);
        assert!(resp.read_only && resp.always_interleave);
        assert!(!resp.unordered);
        assert_eq!(resp.resend_count, 0);
        assert_eq!(resp.expiration, req.expiration);
        assert_eq!(resp.request_context, req.request_context);
        assert_eq!(resp.result, ResponseKind::Success);
    }

    #[test]
    fn rejection_carries_type_and_info() {
        let request = Message::request(GrainId::new(1, 2), Body::Empty);
        let rejection = request.create_rejection(RejectionType::Overloaded, "try later");
        assert!(rejection.is_rejection());
        assert_eq!(
            rejection.headers().rejection_type,
            Some(RejectionType::Overloaded)
        );
        assert_eq!(rejection.headers().rejection_info.as_deref(), Some("try later"));
        assert_eq!(rejection.id(), request.id());
    }

    #[test]
    fn duplicates_match_on_sender_and_id_only() {
        let mut a = Message::request(GrainId::new(1, 2), Body::Empty);
        a.headers_mut().sending_silo = Some(silo(1));

        let mut b = a.clone();
        b.headers_mut().target_grain = Some(GrainId::new(9, 9));
        b.headers_mut().resend_count = 4;
        b.set_body(Body::object(Bytes::from_static(b"other")));
        assert!(a.is_duplicate(&b));

        let mut c = a.clone();
        c.headers_mut().sending_silo = Some(silo(2));
        assert!(!a.is_duplicate(&c));

        let d = Message::request(GrainId::new(1, 2), Body::Empty);
        assert!(!a.is_duplicate(&d));
    }

    #[test]
    fn expiration_is_inclusive() {
        let now = SystemTime::now();
        let mut message = Message::one_way(GrainId::new(1, 1), Body::Empty);
        assert!(!message.is_expired(now));
        message.headers_mut().expiration = Some(now);
        assert!(message.is_expired(now));
        assert!(!message.is_expired(now - Duration::from_secs(1)));
    }

    #[test]
    fn body_deserializes_once_and_releases_raw_bytes() {
        let pool = BufferPool::new(8, None);
        let mut raw = SegmentList::new();
        let mut buffer = pool.checkout();
        buffer[..5].copy_from_slice(b"hello");
        raw.push(crate::buffer::Segment::pooled(buffer).slice(0, 5));

        let mut message = Message::new(MessageHeaders::default(), Body::Raw(raw));
        let object = message
            .body_object(&BytesBodySerializer, &pool)
            .unwrap()
            .unwrap();
        assert_eq!(object.downcast_ref::<Bytes>().unwrap(), &b"hello"[..]);
        assert!(matches!(message.body(), Body::Object(_)));
        assert_eq!(pool.stats().outstanding(), 0);

        let again = message
            .body_object(&BytesBodySerializer, &pool)
            .unwrap()
            .unwrap();
        assert!(Arc::ptr_eq(&object, &again));
    }

    #[test]
    fn take_raw_body_leaves_objects_alone() {
        let mut message = Message::one_way(GrainId::new(1, 1), Body::object(5u8));
        assert!(message.take_raw_body().is_none());
        assert!(matches!(message.body(), Body::Object(_)));

        let mut message = Message::one_way(GrainId::new(1, 1), Body::Raw(b"xy".to_vec().into()));
        assert_eq!(message.take_raw_body().unwrap().to_vec(), b"xy");
        assert!(message.body().is_empty());
    }
}
