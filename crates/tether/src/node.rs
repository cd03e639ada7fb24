//! ClientNode - client-side protocol state of one node session
//!
//! Purely synchronous: `handle_event` applies one server event and returns the
//! methods to send back, in order. The session loop owns the socket.
//!
//! Every acknowledged event yields exactly one `done`, after any other reply
//! it produces (a handler's `port_update` on `add_port` goes first). An `Err`
//! from `handle_event` means the session is over; its `replies` still go out
//! before teardown.

use std::collections::BTreeMap;
use std::os::fd::OwnedFd;
use std::sync::Arc;
use tetherconf::TetherConfig;
use tetherproto::{
    command, AckedEvent, ClientMethod, Direction, FdIndex, MemType, NodeChange, Pod, PortId,
    ServerEvent, Seq, UnackedEvent,
};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::buffers::{Buffer, BufferHandle};
use crate::error::{NodeError, Result, Violation};
use crate::handler::NodeHandler;
use crate::mem::{MemKey, MemoryRegistry};
use crate::port::{Port, PortState, PortUpdate};
use crate::tracker::SeqTracker;
use crate::transport::Transport;

/// A session-ending error plus the replies owed before the session closes.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct Fault {
    pub error: NodeError,
    pub replies: Vec<ClientMethod>,
}

impl From<NodeError> for Fault {
    fn from(error: NodeError) -> Self {
        Self {
            error,
            replies: Vec::new(),
        }
    }
}

impl From<Violation> for Fault {
    fn from(v: Violation) -> Self {
        Self::from(NodeError::from(v))
    }
}

type PortMap = BTreeMap<(Direction, PortId), Port>;

fn port_entry(ports: &mut PortMap, direction: Direction, port_id: PortId) -> Result<&mut Port> {
    ports
        .get_mut(&(direction, port_id))
        .ok_or_else(|| Violation::UnknownPort { direction, port_id }.into())
}

fn port_update_method(direction: Direction, port_id: PortId, update: PortUpdate) -> ClientMethod {
    ClientMethod::PortUpdate {
        direction,
        port_id,
        change_mask: update.change_mask,
        possible_formats: update.possible_formats,
        format: update.format,
        params: update.params,
        info: update.info,
    }
}

#[derive(Debug)]
pub struct ClientNode<H> {
    handler: H,
    max_input_ports: u32,
    max_output_ports: u32,
    /// Highest maximum ever announced per direction. The server owns the real
    /// limit; a shrink it rejected must not make us refuse its `add_port`.
    input_ceiling: u32,
    output_ceiling: u32,
    props: Option<Pod>,
    running: bool,
    ports: PortMap,
    mem: MemoryRegistry,
    tracker: SeqTracker,
    transport: Option<Arc<Transport>>,
    transport_changed: bool,
    allow_renegotiation: bool,
    destroyed: bool,
}

impl<H: NodeHandler> ClientNode<H> {
    pub fn new(handler: H, config: &TetherConfig) -> Self {
        Self {
            handler,
            max_input_ports: 0,
            max_output_ports: 0,
            input_ceiling: 0,
            output_ceiling: 0,
            props: None,
            running: false,
            ports: BTreeMap::new(),
            mem: MemoryRegistry::new(),
            tracker: SeqTracker::new(config.session.seq_base),
            transport: None,
            transport_changed: false,
            allow_renegotiation: config.transport.allow_renegotiation,
            destroyed: false,
        }
    }

    /// Set the local port capacity without announcing it.
    pub fn with_max_ports(mut self, inputs: u32, outputs: u32) -> Self {
        self.max_input_ports = inputs;
        self.max_output_ports = outputs;
        self.input_ceiling = inputs;
        self.output_ceiling = outputs;
        self
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    pub fn max_ports(&self, direction: Direction) -> u32 {
        match direction {
            Direction::Input => self.max_input_ports,
            Direction::Output => self.max_output_ports,
        }
    }

    /// Most ports of `direction` this node will accept from the server.
    pub fn port_ceiling(&self, direction: Direction) -> u32 {
        match direction {
            Direction::Input => self.input_ceiling,
            Direction::Output => self.output_ceiling,
        }
    }

    pub fn props(&self) -> Option<&Pod> {
        self.props.as_ref()
    }

    /// Whether the last node command was `Start`.
    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    pub fn port(&self, direction: Direction, port_id: PortId) -> Option<&Port> {
        self.ports.get(&(direction, port_id))
    }

    /// `None` when the port is absent or was removed.
    pub fn port_state(&self, direction: Direction, port_id: PortId) -> Option<PortState> {
        self.port(direction, port_id).map(Port::state)
    }

    pub fn ports(&self) -> impl Iterator<Item = &Port> {
        self.ports.values()
    }

    pub fn mem(&self) -> &MemoryRegistry {
        &self.mem
    }

    /// Acknowledged requests received but not yet answered.
    pub fn pending_requests(&self) -> usize {
        self.tracker.pending_len()
    }

    pub fn transport(&self) -> Option<&Arc<Transport>> {
        self.transport.as_ref()
    }

    /// The transport, if it was established or replaced since the last call.
    pub fn take_new_transport(&mut self) -> Option<Arc<Transport>> {
        if std::mem::take(&mut self.transport_changed) {
            self.transport.clone()
        } else {
            None
        }
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.destroyed {
            return Err(Violation::AfterDestroy.into());
        }
        Ok(())
    }

    /// Apply one server event; returns the methods to send, in order.
    pub fn handle_event(
        &mut self,
        event: ServerEvent,
        fds: Vec<OwnedFd>,
    ) -> std::result::Result<Vec<ClientMethod>, Fault> {
        self.ensure_alive()?;
        let name = event.name();
        debug!("event {}", name);
        match event {
            ServerEvent::Acked { seq, request } => self.handle_acked(seq, request),
            ServerEvent::Unacked(event) => {
                self.handle_unacked(event, fds).map_err(|e| {
                    error!("{} failed, closing channel: {}", name, e);
                    Fault::from(e)
                })?;
                Ok(Vec::new())
            }
        }
    }

    fn handle_acked(
        &mut self,
        seq: Seq,
        request: AckedEvent,
    ) -> std::result::Result<Vec<ClientMethod>, Fault> {
        let kind = request.kind();
        self.tracker.observe(seq, kind, request.port())?;

        let mut replies = Vec::new();
        let result = self.apply(request, &mut replies);
        let res = match &result {
            Ok(()) => 0,
            Err(e) => {
                warn!("{} seq {} refused: {}", kind, seq, e);
                e.code()
            }
        };

        self.tracker.complete(seq, res)?;
        replies.push(ClientMethod::Done { seq, res });

        match result {
            Err(error) if error.is_fatal() => {
                error!("{} seq {} is fatal: {}", kind, seq, error);
                Err(Fault { error, replies })
            }
            _ => Ok(replies),
        }
    }

    fn apply(&mut self, request: AckedEvent, replies: &mut Vec<ClientMethod>) -> Result<()> {
        match request {
            AckedEvent::SetProps { props } => {
                self.handler.set_props(&props)?;
                self.props = Some(props);
            }
            AckedEvent::AddPort { direction, port_id } => {
                self.add_port(direction, port_id, replies)?;
            }
            AckedEvent::RemovePort { direction, port_id } => {
                let mut port = self
                    .ports
                    .remove(&(direction, port_id))
                    .ok_or(Violation::UnknownPort { direction, port_id })?;
                port.release(&mut self.mem);
                self.handler.remove_port(direction, port_id);
                info!("{}:{} removed", direction, port_id);
            }
            AckedEvent::SetFormat {
                direction,
                port_id,
                flags,
                format,
            } => {
                let port = port_entry(&mut self.ports, direction, port_id)?;
                if let Some(f) = &format {
                    port.check_format(f)?;
                }
                self.handler
                    .set_format(direction, port_id, flags, format.as_ref())?;
                port.set_format(flags, format, &mut self.mem)?;
                debug!("{}:{} now {}", direction, port_id, port.state());
            }
            AckedEvent::SetParam {
                direction,
                port_id,
                param,
            } => {
                let port = port_entry(&mut self.ports, direction, port_id)?;
                self.handler.set_param(direction, port_id, &param)?;
                port.set_param(param);
            }
            AckedEvent::UseBuffers {
                direction,
                port_id,
                buffers,
            } => {
                let port = port_entry(&mut self.ports, direction, port_id)?;
                port.use_buffers(buffers.clone(), &mut self.mem)?;
                if let Err(e) = self.handler.use_buffers(direction, port_id, &buffers) {
                    port.use_buffers(Vec::new(), &mut self.mem)?;
                    return Err(e);
                }
                debug!(
                    "{}:{} has {} buffer(s), {}",
                    direction,
                    port_id,
                    buffers.len(),
                    port.state()
                );
            }
            AckedEvent::NodeCommand { command } => {
                self.handler.node_command(&command)?;
                match command.type_id {
                    command::START => self.running = true,
                    command::PAUSE => self.running = false,
                    _ => {}
                }
            }
        }
        Ok(())
    }

    fn add_port(
        &mut self,
        direction: Direction,
        port_id: PortId,
        replies: &mut Vec<ClientMethod>,
    ) -> Result<()> {
        if let Some(mut old) = self.ports.remove(&(direction, port_id)) {
            warn!("{}:{} added again, starting over", direction, port_id);
            old.release(&mut self.mem);
            self.handler.remove_port(direction, port_id);
        }

        let live = self.ports.keys().filter(|(d, _)| *d == direction).count() as u32;
        let max = self.port_ceiling(direction);
        if live >= max {
            return Err(Violation::PortLimit {
                direction,
                max,
                live,
            }
            .into());
        }

        let advert = self.handler.add_port(direction, port_id)?;
        let mut port = Port::new(direction, port_id);
        if let Some(update) = advert.filter(|u| !u.is_empty()) {
            port.apply_update(&update);
            replies.push(port_update_method(direction, port_id, update));
        }
        info!("{}:{} added, {}", direction, port_id, port.state());
        self.ports.insert((direction, port_id), port);
        Ok(())
    }

    fn handle_unacked(&mut self, event: UnackedEvent, fds: Vec<OwnedFd>) -> Result<()> {
        let mut fds: Vec<Option<OwnedFd>> = fds.into_iter().map(Some).collect();
        let mut take = |idx: FdIndex| -> Result<OwnedFd> {
            fds.get_mut(idx.0 as usize)
                .and_then(Option::take)
                .ok_or_else(|| Violation::BadDescriptor(idx.0).into())
        };

        match event {
            UnackedEvent::Event { event } => self.handler.event(&event),
            UnackedEvent::AddMem {
                direction,
                port_id,
                mem_id,
                mem_type,
                fd,
                flags,
                offset,
                size,
            } => {
                let mem_type =
                    MemType::from_u32(mem_type).ok_or(Violation::UnknownMemType(mem_type))?;
                port_entry(&mut self.ports, direction, port_id)?;
                let fd = take(fd)?;
                self.mem.add(
                    MemKey::new(direction, port_id, mem_id),
                    mem_type,
                    fd,
                    flags,
                    offset,
                    size,
                )?;
            }
            UnackedEvent::PortCommand {
                direction,
                port_id,
                command,
            } => {
                port_entry(&mut self.ports, direction, port_id)?;
                self.handler.port_command(direction, port_id, &command)?;
            }
            UnackedEvent::Transport {
                readfd,
                writefd,
                memfd,
                offset,
                size,
            } => {
                if self.transport.is_some() && !self.allow_renegotiation {
                    return Err(Violation::TransportRenegotiation.into());
                }
                let (readfd, writefd, memfd) = (take(readfd)?, take(writefd)?, take(memfd)?);
                // The old area stays mapped until the new one validated.
                let transport = Transport::attach_client(readfd, writefd, memfd, offset, size)?;
                match self.transport.replace(Arc::new(transport)) {
                    Some(_) => info!("transport renegotiated ({} bytes)", size),
                    None => info!("transport established ({} bytes)", size),
                }
                self.transport_changed = true;
            }
        }
        Ok(())
    }

    /// Announce new capacity and/or props. Unmasked fields are ignored.
    ///
    /// The announced maximum is only a proposal: growing raises the ceiling
    /// right away, shrinking leaves it for the server to enforce (or reject).
    pub fn update(
        &mut self,
        change_mask: NodeChange,
        max_input_ports: u32,
        max_output_ports: u32,
        props: Option<Pod>,
    ) -> Result<ClientMethod> {
        self.ensure_alive()?;
        if change_mask.contains(NodeChange::MAX_INPUTS) {
            self.max_input_ports = max_input_ports;
            self.input_ceiling = self.input_ceiling.max(max_input_ports);
        }
        if change_mask.contains(NodeChange::MAX_OUTPUTS) {
            self.max_output_ports = max_output_ports;
            self.output_ceiling = self.output_ceiling.max(max_output_ports);
        }
        if change_mask.contains(NodeChange::PROPS) {
            self.props = props.clone();
        }
        Ok(ClientMethod::Update {
            change_mask,
            max_input_ports,
            max_output_ports,
            props,
        })
    }

    /// Propose new negotiable state for a port the server added.
    pub fn port_update(
        &mut self,
        direction: Direction,
        port_id: PortId,
        update: PortUpdate,
    ) -> Result<ClientMethod> {
        self.ensure_alive()?;
        let port = port_entry(&mut self.ports, direction, port_id)?;
        port.apply_update(&update);
        Ok(port_update_method(direction, port_id, update))
    }

    pub fn event(&mut self, event: Pod) -> Result<ClientMethod> {
        self.ensure_alive()?;
        Ok(ClientMethod::Event { event })
    }

    /// End the session. Every later operation fails with `AfterDestroy`.
    pub fn destroy(&mut self) -> Result<ClientMethod> {
        self.ensure_alive()?;
        self.teardown();
        Ok(ClientMethod::Destroy)
    }

    /// Drop all session state (peer gone, or after `destroy`).
    pub fn teardown(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        self.tracker.cancel_all();
        for port in self.ports.values_mut() {
            port.release(&mut self.mem);
        }
        self.ports.clear();
        self.mem.clear();
        self.transport = None;
        self.transport_changed = false;
        info!("node session torn down");
    }

    pub fn buffer_handle(
        &self,
        direction: Direction,
        port_id: PortId,
        index: u32,
    ) -> Option<BufferHandle> {
        self.port(direction, port_id)?.buffers().handle(index)
    }

    fn resolve(&self, handle: &BufferHandle) -> Result<&Buffer> {
        self.port(handle.direction, handle.port_id)
            .ok_or(NodeError::StaleBuffer)?
            .buffers()
            .resolve(handle)
    }

    /// Metadata bytes of a buffer.
    pub fn buffer_meta(&self, handle: &BufferHandle) -> Result<&[u8]> {
        let buffer = self.resolve(handle)?;
        let region = self
            .mem
            .get(&buffer.meta_key())
            .ok_or(NodeError::StaleBuffer)?;
        region.slice(buffer.desc.offset, buffer.desc.size)
    }

    /// Payload bytes of data chunk `n`.
    pub fn buffer_data(&self, handle: &BufferHandle, n: usize) -> Result<&[u8]> {
        let buffer = self.resolve(handle)?;
        let (key, data) = buffer
            .data_key(n)
            .zip(buffer.desc.layout.datas.get(n))
            .ok_or(NodeError::StaleBuffer)?;
        let region = self.mem.get(&key).ok_or(NodeError::StaleBuffer)?;
        region.slice(data.offset, data.size)
    }

    /// Write into data chunk `n` at `offset` within the chunk.
    pub fn write_buffer_data(
        &mut self,
        handle: &BufferHandle,
        n: usize,
        offset: u32,
        bytes: &[u8],
    ) -> Result<()> {
        let buffer = self.resolve(handle)?;
        let (key, data) = buffer
            .data_key(n)
            .zip(buffer.desc.layout.datas.get(n).copied())
            .ok_or(NodeError::StaleBuffer)?;

        let end = u64::from(offset) + bytes.len() as u64;
        if end > u64::from(data.size) {
            return Err(NodeError::OutOfBounds {
                mem_id: data.mem_id,
                offset: u64::from(offset),
                size: bytes.len() as u64,
                extent: u64::from(data.size),
            });
        }
        let region = self.mem.get_mut(&key).ok_or(NodeError::StaleBuffer)?;
        region.write(data.offset + offset, bytes)
    }
}
