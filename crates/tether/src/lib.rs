//! Tether: client-node protocol bridge
//!
//! Lets a process outside the media graph server own a node. The server
//! drives port negotiation over a control channel; buffers live in shared
//! memory the server hands over; per-cycle scheduling runs over a separate
//! real-time transport so the control path never sits in the audio loop.
//!
//! - **Control** (`channel`, `session`): TETH01 frames over a Unix stream
//!   socket, descriptors as SCM_RIGHTS
//! - **Client state** (`node`): ports, formats, params, buffers, the
//!   seq/`done` contract
//! - **Server state** (`proxy`): request builder and acknowledged-state mirror
//! - **Memory** (`mem`, `buffers`): mapped regions and validated buffer
//!   catalogs
//! - **Transport** (`transport`): activation rings, eventfd doorbells, the
//!   real-time thread
//!
//! Custom processing plugs in through `NodeHandler`.

pub mod buffers;
pub mod channel;
pub mod error;
pub mod handler;
pub mod mem;
pub mod node;
pub mod port;
pub mod proxy;
pub mod session;
pub mod tracker;
pub mod transport;

pub use buffers::{Buffer, BufferCatalog, BufferHandle};
pub use channel::{ChannelReader, ChannelWriter, ControlChannel};
pub use error::{NodeError, Result, Violation};
pub use handler::{AcceptAll, NodeHandler};
pub use mem::{AddOutcome, MemKey, MemRegion, MemoryRegistry};
pub use node::{ClientNode, Fault};
pub use port::{Port, PortState, PortUpdate};
pub use proxy::{NodeProxy, ProxyPort, Request};
pub use session::{ClientHandle, ClientSession, ServerSession};
pub use tracker::{Completion, Resolved, SeqTracker};
pub use transport::{
    ActivationRecord, Doorbell, Processor, RecordKind, RingId, RtLoop, Transport, TransportArea,
    TransportOffer, Wake,
};
