//! Identifiers, opaque blobs and bitfields shared by both sides of a node session.

use bitflags::bitflags;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Port direction, numbered as on the wire.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Direction {
    Input = 0,
    Output = 1,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Input => write!(f, "input"),
            Direction::Output => write!(f, "output"),
        }
    }
}

/// Port id, unique per (node, direction).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PortId(pub u32);

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Server-assigned memory region id, unique within a node session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MemId(pub u32);

impl fmt::Display for MemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Sequence number correlating a server request with the client's `done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Seq(pub u32);

impl Seq {
    pub fn next(self) -> Self {
        Seq(self.0.wrapping_add(1))
    }
}

impl fmt::Display for Seq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Index into the descriptor list attached to a frame.
///
/// Descriptors never travel inside a message body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FdIndex(pub u32);

/// An opaque typed blob: props, formats, params, commands and events.
///
/// Equality is type id plus byte equality; the type system that gives the
/// bytes meaning lives outside this crate.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Pod {
    pub type_id: u32,
    pub body: Bytes,
}

impl Pod {
    pub fn new(type_id: u32, body: impl Into<Bytes>) -> Self {
        Self {
            type_id,
            body: body.into(),
        }
    }

    /// A blob with a type and no payload (e.g. a bare command).
    pub fn empty(type_id: u32) -> Self {
        Self {
            type_id,
            body: Bytes::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }
}

impl fmt::Debug for Pod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pod")
            .field("type_id", &self.type_id)
            .field("len", &self.body.len())
            .finish()
    }
}

/// Well-known node/port command ids carried in `Pod::type_id`.
pub mod command {
    pub const PAUSE: u32 = 0;
    pub const START: u32 = 1;
    pub const FLUSH: u32 = 2;
    pub const DRAIN: u32 = 3;
    pub const MARKER: u32 = 4;
    pub const CLOCK_UPDATE: u32 = 5;
}

/// Kind of memory behind an `add_mem` descriptor.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemType {
    Shm = 0,
    MemFd = 1,
    DmaBuf = 2,
}

impl MemType {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(MemType::Shm),
            1 => Some(MemType::MemFd),
            2 => Some(MemType::DmaBuf),
            _ => None,
        }
    }

    pub fn to_u32(self) -> u32 {
        self as u32
    }
}

bitflags! {
    /// Mapping permission for a shared descriptor.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct MemFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const READWRITE = Self::READ.bits() | Self::WRITE.bits();
    }
}

bitflags! {
    /// Flags on `set_format`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct FormatFlags: u32 {
        /// Probe only: validate and reply, leave state alone.
        const TEST_ONLY = 1 << 0;
        const FIXATE = 1 << 1;
        const NEAREST = 1 << 2;
    }
}

bitflags! {
    /// Fields present in a node `update`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct NodeChange: u32 {
        const MAX_INPUTS = 1 << 0;
        const MAX_OUTPUTS = 1 << 1;
        const PROPS = 1 << 2;
    }
}

bitflags! {
    /// Fields present in a `port_update`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct PortChange: u32 {
        const POSSIBLE_FORMATS = 1 << 0;
        const FORMAT = 1 << 1;
        const PARAMS = 1 << 2;
        const INFO = 1 << 3;
    }
}

bitflags! {
    /// Port capabilities advertised in `PortInfo`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct PortFlags: u32 {
        const REMOVABLE = 1 << 0;
        const OPTIONAL = 1 << 1;
        const CAN_ALLOC_BUFFERS = 1 << 2;
        const CAN_USE_BUFFERS = 1 << 3;
        const IN_PLACE = 1 << 4;
        const NO_REF = 1 << 5;
        const LIVE = 1 << 6;
        const PHYSICAL = 1 << 7;
        const TERMINAL = 1 << 8;
    }
}

/// Port capability descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PortInfo {
    pub flags: PortFlags,
    pub rate: u32,
    pub props: Option<Pod>,
}
