use std::{
    collections::BTreeMap,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use super::ids::{ActivationAddress, ActivationId, CorrelationId, GrainId, SiloAddress};
use crate::{
    error::{GatewayError, Result},
    framing::{FrameBuilder, SegmentCursor, WireRead, WireWrite},
};

bitflags! {
    /// Which header fields follow the bitmask on the wire.
    ///
    /// Bits are assigned in wire order. New fields take the next unused bit and are appended to the end of the
    /// field table.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct HeaderFlags: u32 {
        /// [`MessageHeaders::category`]
        const CATEGORY = 1 << 0;
        /// [`MessageHeaders::direction`]
        const DIRECTION = 1 << 1;
        /// [`MessageHeaders::read_only`]
        const READ_ONLY = 1 << 2;
        /// [`MessageHeaders::always_interleave`]
        const ALWAYS_INTERLEAVE = 1 << 3;
        /// [`MessageHeaders::unordered`]
        const UNORDERED = 1 << 4;
        /// [`MessageHeaders::id`]
        const ID = 1 << 5;
        /// [`MessageHeaders::resend_count`]
        const RESEND_COUNT = 1 << 6;
        /// [`MessageHeaders::forward_count`]
        const FORWARD_COUNT = 1 << 7;
        /// [`MessageHeaders::target_silo`]
        const TARGET_SILO = 1 << 8;
        /// [`MessageHeaders::target_grain`]
        const TARGET_GRAIN = 1 << 9;
        /// [`MessageHeaders::target_activation`]
        const TARGET_ACTIVATION = 1 << 10;
        /// [`MessageHeaders::sending_silo`]
        const SENDING_SILO = 1 << 11;
        /// [`MessageHeaders::sending_grain`]
        const SENDING_GRAIN = 1 << 12;
        /// [`MessageHeaders::sending_activation`]
        const SENDING_ACTIVATION = 1 << 13;
        /// [`MessageHeaders::result`]
        const RESULT = 1 << 14;
        /// [`MessageHeaders::rejection_type`]
        const REJECTION_TYPE = 1 << 15;
        /// [`MessageHeaders::rejection_info`]
        const REJECTION_INFO = 1 << 16;
        /// [`MessageHeaders::expiration`]
        const EXPIRATION = 1 << 17;
        /// [`MessageHeaders::request_context`]
        const REQUEST_CONTEXT = 1 << 18;
        /// [`MessageHeaders::cache_invalidation`]
        const CACHE_INVALIDATION = 1 << 19;
        /// [`MessageHeaders::is_new_placement`]
        const IS_NEW_PLACEMENT = 1 << 20;
    }
}

macro_rules! wire_enum {
    ($(#[$meta:meta])* $name:ident { $($(#[$vmeta:meta])* $variant:ident = $value:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[repr(u8)]
        pub enum $name {
            $($(#[$vmeta])* $variant = $value),+
        }

        impl TryFrom<u8> for $name {
            type Error = GatewayError;

            fn try_from(value: u8) -> Result<Self> {
                match value {
                    $($value => Ok($name::$variant),)+
                    _ => Err(GatewayError::MalformedFrame(format!(
                        concat!("invalid ", stringify!($name), " {}"),
                        value
                    ))),
                }
            }
        }
    };
}

wire_enum! {
    /// Which inbound queue a message is delivered to.
    #[derive(Default)]
    Category {
        /// Connectivity probes.
        Ping = 0,
        /// Runtime traffic between system actors.
        System = 1,
        /// Application traffic.
        #[default]
        Application = 2,
    }
}

wire_enum! {
    /// Whether a message expects, is, or never gets a response.
    #[derive(Default)]
    Direction {
        /// Expects a response carrying the same correlation id.
        #[default]
        Request = 0,
        /// Answers a request.
        Response = 1,
        /// Fire and forget.
        OneWay = 2,
    }
}

wire_enum! {
    /// Outcome carried by a response.
    #[derive(Default)]
    ResponseKind {
        /// The request completed.
        #[default]
        Success = 0,
        /// The request failed inside the target.
        Error = 1,
        /// The request was never processed. See [`RejectionType`].
        Rejection = 2,
    }
}

wire_enum! {
    /// Why a request was rejected.
    RejectionType {
        /// Retrying later may succeed.
        Transient = 0,
        /// The target is overloaded.
        Overloaded = 1,
        /// The request was already received.
        DuplicateRequest = 2,
        /// The request can never be delivered.
        Unrecoverable = 3,
        /// The gateway is refusing new work.
        GatewayTooBusy = 4,
    }
}

impl Category {
    /// Every category, in queue order.
    pub const ALL: [Category; 3] = [Category::Ping, Category::System, Category::Application];
}

/// Addressing, correlation and flags of a message.
///
/// Fields at their default value are not written to the wire.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MessageHeaders {
    /// Inbound queue the message is delivered to.
    pub category: Category,
    /// Request, response or one-way.
    pub direction: Direction,
    /// The request does not modify grain state.
    pub read_only: bool,
    /// The request may interleave with any other request.
    pub always_interleave: bool,
    /// The message carries no ordering requirement.
    pub unordered: bool,
    /// Correlation id.
    pub id: Option<CorrelationId>,
    /// Times the message was resent.
    pub resend_count: u32,
    /// Times the message was forwarded between silos.
    pub forward_count: u32,
    /// Silo the message is pinned to.
    pub target_silo: Option<SiloAddress>,
    /// Grain the message is addressed to.
    pub target_grain: Option<GrainId>,
    /// Activation the message is addressed to.
    pub target_activation: Option<ActivationId>,
    /// Silo the message was sent from.
    pub sending_silo: Option<SiloAddress>,
    /// Grain the message was sent from.
    pub sending_grain: Option<GrainId>,
    /// Activation the message was sent from.
    pub sending_activation: Option<ActivationId>,
    /// Outcome of a response.
    pub result: ResponseKind,
    /// Why a rejection was issued.
    pub rejection_type: Option<RejectionType>,
    /// Human readable rejection detail.
    pub rejection_info: Option<String>,
    /// Wall clock time after which the message is no longer useful.
    pub expiration: Option<SystemTime>,
    /// Ambient values propagated from request to response.
    pub request_context: BTreeMap<String, String>,
    /// Activations the receiver should drop from its caches.
    pub cache_invalidation: Vec<ActivationAddress>,
    /// The target activation was just placed.
    pub is_new_placement: bool,
}

struct HeaderField {
    flag: HeaderFlags,
    is_present: fn(&MessageHeaders) -> bool,
    encode: fn(&MessageHeaders, &mut FrameBuilder),
    decode: fn(&mut MessageHeaders, &mut SegmentCursor<'_>) -> Result<()>,
}

/// Every header field in wire order.
static HEADER_FIELDS: &[HeaderField] = &[
    HeaderField {
        flag: HeaderFlags::CATEGORY,
        is_present: |h| h.category != Category::default(),
        encode: |h, out| out.write_u8(h.category as u8),
        decode: |h, input| {
            h.category = Category::try_from(input.read_u8()?)?;
            Ok(())
        },
    },
    HeaderField {
        flag: HeaderFlags::DIRECTION,
        is_present: |h| h.direction != Direction::default(),
        encode: |h, out| out.write_u8(h.direction as u8),
        decode: |h, input| {
            h.direction = Direction::try_from(input.read_u8()?)?;
            Ok(())
        },
    },
    HeaderField {
        flag: HeaderFlags::READ_ONLY,
        is_present: |h| h.read_only,
        encode: |_, _| {},
        decode: |h, _| {
            h.read_only = true;
            Ok(())
        },
    },
    HeaderField {
        flag: HeaderFlags::ALWAYS_INTERLEAVE,
        is_present: |h| h.always_interleave,
        encode: |_, _| {},
        decode: |h, _| {
            h.always_interleave = true;
            Ok(())
        },
    },
    HeaderField {
        flag: HeaderFlags::UNORDERED,
        is_present: |h| h.unordered,
        encode: |_, _| {},
        decode: |h, _| {
            h.unordered = true;
            Ok(())
        },
    },
    HeaderField {
        flag: HeaderFlags::ID,
        is_present: |h| h.id.is_some(),
        encode: |h, out| out.write_i64(h.id.map_or(0, CorrelationId::get)),
        decode: |h, input| {
            h.id = Some(CorrelationId::from_raw(input.read_i64()?));
            Ok(())
        },
    },
    HeaderField {
        flag: HeaderFlags::RESEND_COUNT,
        is_present: |h| h.resend_count != 0,
        encode: |h, out| out.write_u32(h.resend_count),
        decode: |h, input| {
            h.resend_count = input.read_u32()?;
            Ok(())
        },
    },
    HeaderField {
        flag: HeaderFlags::FORWARD_COUNT,
        is_present: |h| h.forward_count != 0,
        encode: |h, out| out.write_u32(h.forward_count),
        decode: |h, input| {
            h.forward_count = input.read_u32()?;
            Ok(())
        },
    },
    HeaderField {
        flag: HeaderFlags::TARGET_SILO,
        is_present: |h| h.target_silo.is_some(),
        encode: |h, out| {
            if let Some(silo) = &h.target_silo {
                silo.encode(out);
            }
        },
        decode: |h, input| {
            h.target_silo = Some(SiloAddress::decode(input)?);
            Ok(())
        },
    },
    HeaderField {
        flag: HeaderFlags::TARGET_GRAIN,
        is_present: |h| h.target_grain.is_some(),
        encode: |h, out| {
            if let Some(grain) = &h.target_grain {
                grain.encode(out);
            }
        },
        decode: |h, input| {
            h.target_grain = Some(GrainId::decode(input)?);
            Ok(())
        },
    },
    HeaderField {
        flag: HeaderFlags::TARGET_ACTIVATION,
        is_present: |h| h.target_activation.is_some(),
        encode: |h, out| out.write_u128(h.target_activation.map_or(0, ActivationId::get)),
        decode: |h, input| {
            h.target_activation = Some(ActivationId::from_raw(input.read_u128()?));
            Ok(())
        },
    },
    HeaderField {
        flag: HeaderFlags::SENDING_SILO,
        is_present: |h| h.sending_silo.is_some(),
        encode: |h, out| {
            if let Some(silo) = &h.sending_silo {
                silo.encode(out);
            }
        },
        decode: |h, input| {
            h.sending_silo = Some(SiloAddress::decode(input)?);
            Ok(())
        },
    },
    HeaderField {
        flag: HeaderFlags::SENDING_GRAIN,
        is_present: |h| h.sending_grain.is_some(),
        encode: |h, out| {
            if let Some(grain) = &h.sending_grain {
                grain.encode(out);
            }
        },
        decode: |h, input| {
            h.sending_grain = Some(GrainId::decode(input)?);
            Ok(())
        },
    },
    HeaderField {
        flag: HeaderFlags::SENDING_ACTIVATION,
        is_present: |h| h.sending_activation.is_some(),
        encode: |h, out| out.write_u128(h.sending_activation.map_or(0, ActivationId::get)),
        decode: |h, input| {
            h.sending_activation = Some(ActivationId::from_raw(input.read_u128()?));
            Ok(())
        },
    },
    HeaderField {
        flag: HeaderFlags::RESULT,
        is_present: |h| h.result != ResponseKind::default(),
        encode: |h, out| out.write_u8(h.result as u8),
        decode: |h, input| {
            h.result = ResponseKind::try_from(input.read_u8()?)?;
            Ok(())
        },
    },
    HeaderField {
        flag: HeaderFlags::REJECTION_TYPE,
        is_present: |h| h.rejection_type.is_some(),
        encode: |h, out| {
            if let Some(rejection) = h.rejection_type {
                out.write_u8(rejection as u8);
            }
        },
        decode: |h, input| {
            h.rejection_type = Some(RejectionType::try_from(input.read_u8()?)?);
            Ok(())
        },
    },
    HeaderField {
        flag: HeaderFlags::REJECTION_INFO,
        is_present: |h| h.rejection_info.is_some(),
        encode: |h, out| out.write_str(h.rejection_info.as_deref().unwrap_or_default()),
        decode: |h, input| {
            h.rejection_info = Some(input.read_string()?);
            Ok(())
        },
    },
    HeaderField {
        flag: HeaderFlags::EXPIRATION,
        is_present: |h| h.expiration.is_some(),
        encode: |h, out| {
            let (secs, nanos) = h.expiration.map_or((0, 0), unix_time);
            out.write_i64(secs);
            out.write_u32(nanos);
        },
        decode: |h, input| {
            let secs = input.read_i64()?;
            let nanos = input.read_u32()?;
            h.expiration = Some(from_unix_time(secs, nanos).ok_or_else(|| {
                GatewayError::MalformedFrame(format!("invalid expiration {secs}s {nanos}ns"))
            })?);
            Ok(())
        },
    },
    HeaderField {
        flag: HeaderFlags::REQUEST_CONTEXT,
        is_present: |h| !h.request_context.is_empty(),
        encode: |h, out| {
            out.write_u32(h.request_context.len() as u32);
            for (key, value) in &h.request_context {
                out.write_str(key);
                out.write_str(value);
            }
        },
        decode: |h, input| {
            let count = input.read_u32()?;
            for _ in 0..count {
                let key = input.read_string()?;
                let value = input.read_string()?;
                h.request_context.insert(key, value);
            }
            Ok(())
        },
    },
    HeaderField {
        flag: HeaderFlags::CACHE_INVALIDATION,
        is_present: |h| !h.cache_invalidation.is_empty(),
        encode: |h, out| {
            out.write_u32(h.cache_invalidation.len() as u32);
            for address in &h.cache_invalidation {
                address.encode(out);
            }
        },
        decode: |h, input| {
            let count = input.read_u32()?;
            for _ in 0..count {
                h.cache_invalidation.push(ActivationAddress::decode(input)?);
            }
            Ok(())
        },
    },
    HeaderField {
        flag: HeaderFlags::IS_NEW_PLACEMENT,
        is_present: |h| h.is_new_placement,
        encode: |_, _| {},
        decode: |h, _| {
            h.is_new_placement = true;
            Ok(())
        },
    },
];

/// Splits `time` into whole seconds since the epoch (floored, so negative before it) and nanoseconds past them.
fn unix_time(time: SystemTime) -> (i64, u32) {
    match time.duration_since(UNIX_EPOCH) {
        Ok(after) => (
            i64::try_from(after.as_secs()).unwrap_or(i64::MAX),
            after.subsec_nanos(),
        ),
        Err(err) => {
            let before = err.duration();
            let secs = i64::try_from(before.as_secs()).unwrap_or(i64::MAX);
            match before.subsec_nanos() {
                0 => (-secs, 0),
                nanos => (-secs - 1, 1_000_000_000 - nanos),
            }
        }
    }
}

fn from_unix_time(secs: i64, nanos: u32) -> Option<SystemTime> {
    if nanos >= 1_000_000_000 {
        return None;
    }
    let whole = Duration::from_secs(secs.unsigned_abs());
    let base = if secs >= 0 {
        UNIX_EPOCH.checked_add(whole)?
    } else {
        UNIX_EPOCH.checked_sub(whole)?
    };
    base.checked_add(Duration::from_nanos(u64::from(nanos)))
}

impl MessageHeaders {
    /// The bitmask of fields that differ from their defaults.
    pub fn present_fields(&self) -> HeaderFlags {
        HEADER_FIELDS
            .iter()
            .filter(|field| (field.is_present)(self))
            .fold(HeaderFlags::empty(), |flags, field| flags | field.flag)
    }

    /// Writes the bitmask followed by every present field.
    pub fn encode(&self, out: &mut FrameBuilder) {
        let flags = self.present_fields();
        out.write_u32(flags.bits());
        for field in HEADER_FIELDS.iter().filter(|field| flags.contains(field.flag)) {
            (field.encode)(self, out);
        }
    }

    /// Reads a bitmask and the fields it names.
    pub fn decode(input: &mut SegmentCursor<'_>) -> Result<Self> {
        let bits = input.read_u32()?;
        let flags = HeaderFlags::from_bits(bits).ok_or_else(|| {
            GatewayError::MalformedFrame(format!("unknown header fields in bitmask {bits:#x}"))
        })?;

        let mut headers = MessageHeaders::default();
        for field in HEADER_FIELDS.iter().filter(|field| flags.contains(field.flag)) {
            (field.decode)(&mut headers, input)?;
        }
        if input.remaining() != 0 {
            return Err(GatewayError::MalformedFrame(format!(
                "{} trailing header bytes",
                input.remaining()
            )));
        }
        Ok(headers)
    }
}
