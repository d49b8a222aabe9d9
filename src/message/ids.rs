use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::atomic::{AtomicI64, Ordering},
};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::{GatewayError, Result},
    framing::{WireRead, WireWrite},
};

static NEXT_CORRELATION_ID: AtomicI64 = AtomicI64::new(1);

/// Pairs a request with its response.
///
/// Ids are drawn from one process-wide counter, so they increase monotonically across every message center in the
/// process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CorrelationId(i64);

impl CorrelationId {
    /// Allocates the next id.
    pub fn next() -> Self {
        CorrelationId(NEXT_CORRELATION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Wraps a raw id, for example one received from a peer.
    pub const fn from_raw(id: i64) -> Self {
        CorrelationId(id)
    }

    /// The raw id.
    pub const fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A silo endpoint qualified by the generation of the process listening on it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SiloAddress {
    /// Socket address of the silo.
    pub endpoint: SocketAddr,
    /// Distinguishes restarts of a silo on the same endpoint.
    pub generation: i32,
}

impl SiloAddress {
    /// Creates a silo address.
    pub const fn new(endpoint: SocketAddr, generation: i32) -> Self {
        SiloAddress {
            endpoint,
            generation,
        }
    }

    pub(crate) fn encode<W: WireWrite + ?Sized>(&self, out: &mut W) {
        match self.endpoint.ip() {
            IpAddr::V4(ip) => {
                out.write_u8(4);
                out.write_raw(&ip.octets());
            }
            IpAddr::V6(ip) => {
                out.write_u8(6);
                out.write_raw(&ip.octets());
            }
        }
        out.write_u16(self.endpoint.port());
        out.write_i32(self.generation);
    }

    pub(crate) fn decode<R: WireRead + ?Sized>(input: &mut R) -> Result<Self> {
        let ip = match input.read_u8()? {
            4 => IpAddr::V4(Ipv4Addr::from(input.read_array::<4>()?)),
            6 => IpAddr::V6(Ipv6Addr::from(input.read_array::<16>()?)),
            family => {
                return Err(GatewayError::MalformedFrame(format!(
                    "unknown address family {family}"
                )))
            }
        };
        let port = input.read_u16()?;
        let generation = input.read_i32()?;
        Ok(SiloAddress::new(SocketAddr::new(ip, port), generation))
    }
}

impl fmt::Display for SiloAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "S{}@{}", self.endpoint, self.generation)
    }
}

/// What a [`GrainId`] identifies.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum GrainKind {
    /// An application grain.
    Grain = 0,
    /// A per-silo system actor.
    SystemTarget = 1,
    /// A client process.
    Client = 2,
}

impl TryFrom<u8> for GrainKind {
    type Error = GatewayError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(GrainKind::Grain),
            1 => Ok(GrainKind::SystemTarget),
            2 => Ok(GrainKind::Client),
            _ => Err(GatewayError::MalformedFrame(format!(
                "unknown grain kind {value}"
            ))),
        }
    }
}

/// Identifies an addressable actor.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GrainId {
    kind: GrainKind,
    type_code: u32,
    key: u128,
    key_ext: Option<String>,
}

impl GrainId {
    /// An application grain of type `type_code` with primary key `key`.
    pub fn new(type_code: u32, key: u128) -> Self {
        GrainId {
            kind: GrainKind::Grain,
            type_code,
            key,
            key_ext: None,
        }
    }

    /// A system target of type `type_code`.
    pub fn system_target(type_code: u32, key: u128) -> Self {
        GrainId {
            kind: GrainKind::SystemTarget,
            ..GrainId::new(type_code, key)
        }
    }

    /// A fresh random client identity.
    pub fn new_client() -> Self {
        GrainId {
            kind: GrainKind::Client,
            type_code: 0,
            key: Uuid::new_v4().as_u128(),
            key_ext: None,
        }
    }

    /// Adds a string key extension.
    pub fn with_key_ext(mut self, key_ext: impl Into<String>) -> Self {
        self.key_ext = Some(key_ext.into());
        self
    }

    /// What this id identifies.
    pub fn kind(&self) -> GrainKind {
        self.kind
    }

    /// The grain type code.
    pub fn type_code(&self) -> u32 {
        self.type_code
    }

    /// The primary key.
    pub fn key(&self) -> u128 {
        self.key
    }

    /// The key extension, if any.
    pub fn key_ext(&self) -> Option<&str> {
        self.key_ext.as_deref()
    }

    /// Whether this id names a system target.
    pub fn is_system_target(&self) -> bool {
        self.kind == GrainKind::SystemTarget
    }

    /// Whether this id names a client.
    pub fn is_client(&self) -> bool {
        self.kind == GrainKind::Client
    }

    /// A hash that is stable across processes and platforms.
    ///
    /// Used to place grains into routing buckets, so it must never depend on the process's hasher seed.
    pub fn uniform_hash(&self) -> u32 {
        let mut bytes = Vec::with_capacity(32);
        self.encode(&mut bytes);
        jenkins_one_at_a_time(&bytes)
    }

    pub(crate) fn encode<W: WireWrite + ?Sized>(&self, out: &mut W) {
        out.write_u8(self.kind as u8);
        out.write_u32(self.type_code);
        out.write_u128(self.key);
        match &self.key_ext {
            Some(ext) => {
                out.write_bool(true);
                out.write_str(ext);
            }
            None => out.write_bool(false),
        }
    }

    pub(crate) fn decode<R: WireRead + ?Sized>(input: &mut R) -> Result<Self> {
        let kind = GrainKind::try_from(input.read_u8()?)?;
        let type_code = input.read_u32()?;
        let key = input.read_u128()?;
        let key_ext = if input.read_bool()? {
            Some(input.read_string()?)
        } else {
            None
        };
        Ok(GrainId {
            kind,
            type_code,
            key,
            key_ext,
        })
    }
}

impl fmt::Display for GrainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = match self.kind {
            GrainKind::Grain => "grain",
            GrainKind::SystemTarget => "sys",
            GrainKind::Client => "client",
        };
        write!(f, "{prefix}/{:x}/{:032x}", self.type_code, self.key)?;
        if let Some(ext) = &self.key_ext {
            write!(f, "+{ext}")?;
        }
        Ok(())
    }
}

fn jenkins_one_at_a_time(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0;
    for &byte in bytes {
        hash = hash.wrapping_add(byte as u32);
        hash = hash.wrapping_add(hash << 10);
        hash ^= hash >> 6;
    }
    hash = hash.wrapping_add(hash << 3);
    hash ^= hash >> 11;
    hash.wrapping_add(hash << 15)
}

/// Identifies one activation of a grain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActivationId(u128);

impl ActivationId {
    /// A fresh random activation id.
    pub fn new() -> Self {
        ActivationId(Uuid::new_v4().as_u128())
    }

    /// Wraps a raw id.
    pub const fn from_raw(id: u128) -> Self {
        ActivationId(id)
    }

    /// The raw id.
    pub const fn get(self) -> u128 {
        self.0
    }
}

impl Default for ActivationId {
    fn default() -> Self {
        ActivationId::new()
    }
}

impl fmt::Display for ActivationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{:032x}", self.0)
    }
}

/// Where an activation lives. Carried in cache invalidation headers.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActivationAddress {
    /// Hosting silo, if known.
    pub silo: Option<SiloAddress>,
    /// The activated grain.
    pub grain: GrainId,
    /// The activation, if known.
    pub activation: Option<ActivationId>,
}

impl ActivationAddress {
    pub(crate) fn encode<W: WireWrite + ?Sized>(&self, out: &mut W) {
        match &self.silo {
            Some(silo) => {
                out.write_bool(true);
                silo.encode(out);
            }
            None => out.write_bool(false),
        }
        self.grain.encode(out);
        match self.activation {
            Some(activation) => {
                out.write_bool(true);
                out.write_u128(activation.get());
            }
            None => out.write_bool(false),
        }
    }

    pub(crate) fn decode<R: WireRead + ?Sized>(input: &mut R) -> Result<Self> {
        let silo = if input.read_bool()? {
            Some(SiloAddress::decode(input)?)
        } else {
            None
        };
        let grain = GrainId::decode(input)?;
        let activation = if input.read_bool()? {
            Some(ActivationId::from_raw(input.read_u128()?))
        } else {
            None
        };
        Ok(ActivationAddress {
            silo,
            grain,
            activation,
        })
    }
}
