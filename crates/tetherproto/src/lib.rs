//! tetherproto - Wire types for the tether client-node control channel
//!
//! A client process owns a media node; the graph server drives it over a
//! Unix stream socket. This crate defines what crosses that socket:
//!
//! - **Client methods** (`ClientMethod`): `done`, `update`, `port_update`,
//!   `event`, `destroy`
//! - **Server events** (`ServerEvent`): acknowledged requests that carry a
//!   `Seq` and expect exactly one `done`, and unacknowledged notifications
//!   (`add_mem`, `transport`, `port_command`, `event`)
//! - **TETH01 frames** (`NodeFrame`): fixed 16-byte header plus a MsgPack or
//!   JSON body, with any descriptors riding alongside as SCM_RIGHTS
//!
//! Props, formats, params and commands are opaque `Pod` blobs. Nothing in this
//! crate interprets them beyond type id and byte equality.
//!
//! ## Example
//!
//! ```
//! use tetherproto::{ClientMethod, ContentType, NodeFrame, Seq};
//!
//! let frame = NodeFrame::method(&ClientMethod::Done { seq: Seq(3), res: 0 }, ContentType::MsgPack)?;
//! let bytes = frame.to_bytes();
//! assert_eq!(&bytes[..6], b"TETH01");
//! # Ok::<(), tetherproto::FrameError>(())
//! ```

pub mod buffer;
pub mod frame;
pub mod messages;
pub mod types;
pub mod wire;

pub use buffer::{BufferDesc, BufferLayout, DataDesc, MetaDesc, MetaKind};
pub use frame::{
    ContentType, FrameError, FrameKind, NodeFrame, DEFAULT_MAX_BODY, HEADER_LEN, PROTOCOL_VERSION,
};
pub use messages::{event, method, AckedEvent, ClientMethod, OpKind, ServerEvent, UnackedEvent};
pub use types::{
    command, Direction, FdIndex, FormatFlags, MemFlags, MemId, MemType, NodeChange, Pod,
    PortChange, PortFlags, PortId, PortInfo, Seq,
};
pub use wire::{JsonFormat, MsgPackFormat, WireFormat};
