//! Client methods and server events of the client-node protocol.
//!
//! Each variant has a fixed opcode. Server events come in two shapes:
//! `Acked` events carry a sequence number and must be answered by exactly one
//! `done`; `Unacked` events take effect on receipt and are never answered.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::buffer::BufferDesc;
use crate::types::{
    Direction, FdIndex, FormatFlags, MemFlags, MemId, NodeChange, Pod, PortChange, PortId,
    PortInfo, Seq,
};

/// Method opcodes (client → server).
pub mod method {
    pub const DONE: u16 = 0;
    pub const UPDATE: u16 = 1;
    pub const PORT_UPDATE: u16 = 2;
    pub const EVENT: u16 = 3;
    pub const DESTROY: u16 = 4;
    pub const NUM: u16 = 5;
}

/// Event opcodes (server → client).
pub mod event {
    pub const SET_PROPS: u16 = 0;
    pub const EVENT: u16 = 1;
    pub const ADD_PORT: u16 = 2;
    pub const REMOVE_PORT: u16 = 3;
    pub const SET_FORMAT: u16 = 4;
    pub const SET_PARAM: u16 = 5;
    pub const ADD_MEM: u16 = 6;
    pub const USE_BUFFERS: u16 = 7;
    pub const NODE_COMMAND: u16 = 8;
    pub const PORT_COMMAND: u16 = 9;
    pub const TRANSPORT: u16 = 10;
    pub const NUM: u16 = 11;
}

/// Messages the client sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientMethod {
    /// Completion of the server request `seq`; `res` is 0 or a negative code.
    Done { seq: Seq, res: i32 },
    Update {
        change_mask: NodeChange,
        max_input_ports: u32,
        max_output_ports: u32,
        props: Option<Pod>,
    },
    PortUpdate {
        direction: Direction,
        port_id: PortId,
        change_mask: PortChange,
        possible_formats: Vec<Pod>,
        format: Option<Pod>,
        params: Vec<Pod>,
        info: Option<PortInfo>,
    },
    Event { event: Pod },
    Destroy,
}

impl ClientMethod {
    pub fn opcode(&self) -> u16 {
        match self {
            ClientMethod::Done { .. } => method::DONE,
            ClientMethod::Update { .. } => method::UPDATE,
            ClientMethod::PortUpdate { .. } => method::PORT_UPDATE,
            ClientMethod::Event { .. } => method::EVENT,
            ClientMethod::Destroy => method::DESTROY,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ClientMethod::Done { .. } => "done",
            ClientMethod::Update { .. } => "update",
            ClientMethod::PortUpdate { .. } => "port_update",
            ClientMethod::Event { .. } => "event",
            ClientMethod::Destroy => "destroy",
        }
    }
}

/// The kind of an acknowledged server request, kept by the completion tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpKind {
    SetProps,
    AddPort,
    RemovePort,
    SetFormat,
    SetParam,
    UseBuffers,
    NodeCommand,
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OpKind::SetProps => "set_props",
            OpKind::AddPort => "add_port",
            OpKind::RemovePort => "remove_port",
            OpKind::SetFormat => "set_format",
            OpKind::SetParam => "set_param",
            OpKind::UseBuffers => "use_buffers",
            OpKind::NodeCommand => "node_command",
        };
        f.write_str(name)
    }
}

/// Server requests that expect a `done`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AckedEvent {
    SetProps {
        props: Pod,
    },
    AddPort {
        direction: Direction,
        port_id: PortId,
    },
    RemovePort {
        direction: Direction,
        port_id: PortId,
    },
    /// `format: None` clears the port's format.
    SetFormat {
        direction: Direction,
        port_id: PortId,
        flags: FormatFlags,
        format: Option<Pod>,
    },
    SetParam {
        direction: Direction,
        port_id: PortId,
        param: Pod,
    },
    UseBuffers {
        direction: Direction,
        port_id: PortId,
        buffers: Vec<BufferDesc>,
    },
    NodeCommand {
        command: Pod,
    },
}

impl AckedEvent {
    pub fn kind(&self) -> OpKind {
        match self {
            AckedEvent::SetProps { .. } => OpKind::SetProps,
            AckedEvent::AddPort { .. } => OpKind::AddPort,
            AckedEvent::RemovePort { .. } => OpKind::RemovePort,
            AckedEvent::SetFormat { .. } => OpKind::SetFormat,
            AckedEvent::SetParam { .. } => OpKind::SetParam,
            AckedEvent::UseBuffers { .. } => OpKind::UseBuffers,
            AckedEvent::NodeCommand { .. } => OpKind::NodeCommand,
        }
    }

    pub fn opcode(&self) -> u16 {
        match self {
            AckedEvent::SetProps { .. } => event::SET_PROPS,
            AckedEvent::AddPort { .. } => event::ADD_PORT,
            AckedEvent::RemovePort { .. } => event::REMOVE_PORT,
            AckedEvent::SetFormat { .. } => event::SET_FORMAT,
            AckedEvent::SetParam { .. } => event::SET_PARAM,
            AckedEvent::UseBuffers { .. } => event::USE_BUFFERS,
            AckedEvent::NodeCommand { .. } => event::NODE_COMMAND,
        }
    }

    /// The port this request targets, if any.
    pub fn port(&self) -> Option<(Direction, PortId)> {
        match self {
            AckedEvent::AddPort { direction, port_id }
            | AckedEvent::RemovePort { direction, port_id }
            | AckedEvent::SetFormat {
                direction, port_id, ..
            }
            | AckedEvent::SetParam {
                direction, port_id, ..
            }
            | AckedEvent::UseBuffers {
                direction, port_id, ..
            } => Some((*direction, *port_id)),
            AckedEvent::SetProps { .. } | AckedEvent::NodeCommand { .. } => None,
        }
    }
}

/// Server notifications that take effect immediately and are never answered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum UnackedEvent {
    Event {
        event: Pod,
    },
    AddMem {
        direction: Direction,
        port_id: PortId,
        mem_id: MemId,
        /// Raw `MemType` number; unknown values are a channel error.
        mem_type: u32,
        fd: FdIndex,
        flags: MemFlags,
        offset: u32,
        size: u32,
    },
    PortCommand {
        direction: Direction,
        port_id: PortId,
        command: Pod,
    },
    Transport {
        readfd: FdIndex,
        writefd: FdIndex,
        memfd: FdIndex,
        offset: u32,
        size: u32,
    },
}

impl UnackedEvent {
    pub fn opcode(&self) -> u16 {
        match self {
            UnackedEvent::Event { .. } => event::EVENT,
            UnackedEvent::AddMem { .. } => event::ADD_MEM,
            UnackedEvent::PortCommand { .. } => event::PORT_COMMAND,
            UnackedEvent::Transport { .. } => event::TRANSPORT,
        }
    }

    /// Number of descriptors that must accompany this event.
    pub fn fd_count(&self) -> usize {
        match self {
            UnackedEvent::AddMem { .. } => 1,
            UnackedEvent::Transport { .. } => 3,
            UnackedEvent::Event { .. } | UnackedEvent::PortCommand { .. } => 0,
        }
    }
}

/// Messages the server sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerEvent {
    Acked { seq: Seq, request: AckedEvent },
    Unacked(UnackedEvent),
}

impl ServerEvent {
    pub fn acked(seq: Seq, request: AckedEvent) -> Self {
        ServerEvent::Acked { seq, request }
    }

    pub fn opcode(&self) -> u16 {
        match self {
            ServerEvent::Acked { request, .. } => request.opcode(),
            ServerEvent::Unacked(event) => event.opcode(),
        }
    }

    pub fn seq(&self) -> Option<Seq> {
        match self {
            ServerEvent::Acked { seq, .. } => Some(*seq),
            ServerEvent::Unacked(_) => None,
        }
    }

    pub fn fd_count(&self) -> usize {
        match self {
            ServerEvent::Acked { .. } => 0,
            ServerEvent::Unacked(event) => event.fd_count(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::Acked { request, .. } => match request {
                AckedEvent::SetProps { .. } => "set_props",
                AckedEvent::AddPort { .. } => "add_port",
                AckedEvent::RemovePort { .. } => "remove_port",
                AckedEvent::SetFormat { .. } => "set_format",
                AckedEvent::SetParam { .. } => "set_param",
                AckedEvent::UseBuffers { .. } => "use_buffers",
                AckedEvent::NodeCommand { .. } => "node_command",
            },
            ServerEvent::Unacked(event) => match event {
                UnackedEvent::Event { .. } => "event",
                UnackedEvent::AddMem { .. } => "add_mem",
                UnackedEvent::PortCommand { .. } => "port_command",
                UnackedEvent::Transport { .. } => "transport",
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_opcodes_are_fixed() {
        assert_eq!(
            ClientMethod::Done {
                seq: Seq(1),
                res: 0
            }
            .opcode(),
            0
        );
        assert_eq!(ClientMethod::Destroy.opcode(), 4);
        assert_eq!(method::NUM, 5);
    }

    #[test]
    fn event_opcodes_are_fixed() {
        let add_port = ServerEvent::acked(
            Seq(1),
            AckedEvent::AddPort {
                direction: Direction::Output,
                port_id: PortId(0),
            },
        );
        assert_eq!(add_port.opcode(), 2);
        assert_eq!(add_port.seq(), Some(Seq(1)));

        let transport = ServerEvent::Unacked(UnackedEvent::Transport {
            readfd: FdIndex(0),
            writefd: FdIndex(1),
            memfd: FdIndex(2),
            offset: 0,
            size: 8192,
        });
        assert_eq!(transport.opcode(), 10);
        assert_eq!(transport.seq(), None);
        assert_eq!(transport.fd_count(), 3);
        assert_eq!(event::NUM, 11);
    }

    #[test]
    fn acked_port_context() {
        let req = AckedEvent::SetParam {
            direction: Direction::Input,
            port_id: PortId(3),
            param: Pod::empty(1),
        };
        assert_eq!(req.port(), Some((Direction::Input, PortId(3))));
        assert_eq!(req.kind(), OpKind::SetParam);
        assert_eq!(
            AckedEvent::NodeCommand {
                command: Pod::empty(0)
            }
            .port(),
            None
        );
    }
}
