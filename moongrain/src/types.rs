//! Core identity types.
//!
//! These types are the vocabulary shared by every subsystem: membership
//! speaks in [`SiloAddress`], the directory maps [`GrainId`] to
//! [`GrainAddress`], and the catalog tags each activation with an
//! [`ActivationId`].
//!
//! # Design
//!
//! - `GrainType` is a u64 tag identifying a class of grains.
//! - `GrainId` is `GrainType` + a [`GrainKey`] (integer, GUID, string or
//!   compound).
//! - `SiloAddress` carries a generation so a restarted silo at the same
//!   `ip:port` never collides with its previous incarnation.
//! - All of them are immutable values; components refer to each other
//!   through these identifiers rather than through live references.

use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::placement::PlacementStrategy;

/// Identifies a specific silo incarnation in the cluster.
///
/// The `generation` distinguishes silo restarts at the same network address.
/// A stale `Dead` row for an old generation never matches the new
/// incarnation.
///
/// # Examples
///
/// ```
/// use moongrain::SiloAddress;
/// use std::net::{IpAddr, Ipv4Addr};
///
/// let silo = SiloAddress::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 11111, 1);
/// assert_eq!(silo.to_string(), "127.0.0.1:11111@1");
/// ```
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SiloAddress {
    /// IP address of the silo endpoint.
    pub ip: IpAddr,
    /// Port of the silo endpoint.
    pub port: u16,
    /// Incarnation counter (bumped on every restart).
    pub generation: u64,
}

impl SiloAddress {
    /// Create a new silo address.
    pub fn new(ip: IpAddr, port: u16, generation: u64) -> Self {
        Self {
            ip,
            port,
            generation,
        }
    }

    /// Same endpoint, new incarnation.
    pub fn with_generation(&self, generation: u64) -> Self {
        Self {
            ip: self.ip,
            port: self.port,
            generation,
        }
    }

    /// Whether `other` is the same `ip:port`, regardless of generation.
    pub fn same_endpoint(&self, other: &SiloAddress) -> bool {
        self.ip == other.ip && self.port == other.port
    }

    /// Canonical byte encoding, used for stable ring hashing.
    pub(crate) fn hash_bytes(&self) -> Vec<u8> {
        let mut bytes = match self.ip {
            IpAddr::V4(v4) => v4.octets().to_vec(),
            IpAddr::V6(v6) => v6.octets().to_vec(),
        };
        bytes.extend_from_slice(&self.port.to_le_bytes());
        bytes.extend_from_slice(&self.generation.to_le_bytes());
        bytes
    }
}

impl fmt::Display for SiloAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}@{}", self.ip, self.port, self.generation)
    }
}

/// Identifies a grain TYPE.
///
/// Stable tag for a class of grains; the runtime keeps a registry from tag
/// to factory.
///
/// ```rust
/// use moongrain::GrainType;
/// const ACCOUNT: GrainType = GrainType(0xACC0_0001);
/// ```
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize, Debug)]
pub struct GrainType(pub u64);

impl fmt::Display for GrainType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// Key of a grain instance within its type.
#[derive(Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize, Debug)]
pub enum GrainKey {
    /// Integer key.
    Integer(i64),
    /// GUID key, stored as its 128-bit value.
    Guid(u128),
    /// String key.
    String(String),
    /// Integer key with a string extension.
    CompoundInteger(i64, String),
    /// GUID key with a string extension.
    CompoundGuid(u128, String),
}

impl GrainKey {
    fn hash_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        match self {
            GrainKey::Integer(i) => {
                bytes.push(0);
                bytes.extend_from_slice(&i.to_le_bytes());
            }
            GrainKey::Guid(g) => {
                bytes.push(1);
                bytes.extend_from_slice(&g.to_le_bytes());
            }
            GrainKey::String(s) => {
                bytes.push(2);
                bytes.extend_from_slice(s.as_bytes());
            }
            GrainKey::CompoundInteger(i, ext) => {
                bytes.push(3);
                bytes.extend_from_slice(&i.to_le_bytes());
                bytes.extend_from_slice(ext.as_bytes());
            }
            GrainKey::CompoundGuid(g, ext) => {
                bytes.push(4);
                bytes.extend_from_slice(&g.to_le_bytes());
                bytes.extend_from_slice(ext.as_bytes());
            }
        }
        bytes
    }
}

impl fmt::Display for GrainKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GrainKey::Integer(i) => write!(f, "{i}"),
            GrainKey::Guid(g) => write!(f, "{g:032x}"),
            GrainKey::String(s) => write!(f, "{s}"),
            GrainKey::CompoundInteger(i, ext) => write!(f, "{i}+{ext}"),
            GrainKey::CompoundGuid(g, ext) => write!(f, "{g:032x}+{ext}"),
        }
    }
}

impl From<i64> for GrainKey {
    fn from(value: i64) -> Self {
        GrainKey::Integer(value)
    }
}

impl From<&str> for GrainKey {
    fn from(value: &str) -> Self {
        GrainKey::String(value.to_string())
    }
}

impl From<String> for GrainKey {
    fn from(value: String) -> Self {
        GrainKey::String(value)
    }
}

/// Full grain identity = type + key.
///
/// Globally unique and immutable. The directory partitions on a stable
/// hash of this value.
///
/// # Examples
///
/// ```rust
/// use moongrain::{GrainId, GrainType};
///
/// let account = GrainId::new(GrainType(0xACC0_0001), "alice");
/// assert_eq!(account.to_string(), "acc00001/alice");
/// ```
#[derive(Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize, Debug)]
pub struct GrainId {
    /// The grain class.
    pub grain_type: GrainType,
    /// The instance key.
    pub key: GrainKey,
}

impl GrainId {
    /// Create a new grain identity.
    pub fn new(grain_type: GrainType, key: impl Into<GrainKey>) -> Self {
        Self {
            grain_type,
            key: key.into(),
        }
    }

    /// Stable 64-bit hash used for ring placement.
    pub fn uniform_hash(&self) -> u64 {
        let mut bytes = self.grain_type.0.to_le_bytes().to_vec();
        bytes.extend_from_slice(&self.key.hash_bytes());
        crate::ring::stable_hash(&bytes)
    }
}

impl fmt::Display for GrainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.grain_type, self.key)
    }
}

/// Unique identifier of one activation of a grain.
///
/// A grain deactivated and later re-activated (possibly elsewhere) gets a
/// new `ActivationId`, which is how stale directory entries are told apart
/// from current ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ActivationId(pub u64);

impl ActivationId {
    /// Create an activation ID from a raw value.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Fresh random activation ID.
    pub fn random() -> Self {
        Self(rand::random())
    }
}

impl fmt::Display for ActivationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "act-{:016x}", self.0)
    }
}

/// Directory record: which activation of a grain lives on which silo.
///
/// At most one `GrainAddress` per [`GrainId`] is visible in the directory
/// at any instant. `Register` returns the existing record on conflict so
/// the caller can compare activation IDs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrainAddress {
    /// The grain identity.
    pub grain_id: GrainId,
    /// Silo hosting the activation.
    pub silo: SiloAddress,
    /// The specific activation.
    pub activation_id: ActivationId,
    /// Placement strategy the activation was created under.
    pub placement: PlacementStrategy,
}

impl GrainAddress {
    /// Create a new grain address.
    pub fn new(
        grain_id: GrainId,
        silo: SiloAddress,
        activation_id: ActivationId,
        placement: PlacementStrategy,
    ) -> Self {
        Self {
            grain_id,
            silo,
            activation_id,
            placement,
        }
    }

    /// Whether both records name the same activation.
    pub fn matches(&self, other: &GrainAddress) -> bool {
        self.grain_id == other.grain_id && self.activation_id == other.activation_id
    }
}

impl fmt::Display for GrainAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on {} ({})", self.grain_id, self.silo, self.activation_id)
    }
}
