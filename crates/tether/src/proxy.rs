//! NodeProxy - the server's view of one client node
//!
//! Builds outgoing events and keeps a mirror of the state the client has
//! acknowledged. Nothing in the mirror changes until the matching `done`
//! comes back with 0; a refused request leaves it as it was (a refused
//! `add_port` frees the reserved id).

use std::collections::{BTreeMap, HashMap};
use tetherconf::{PortShrinkPolicy, TetherConfig};
use tetherproto::{
    command, AckedEvent, BufferDesc, ClientMethod, Direction, FdIndex, FormatFlags, MemFlags,
    MemId, MemType, NodeChange, Pod, PortChange, PortId, PortInfo, ServerEvent, Seq,
    UnackedEvent,
};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::error::{NodeError, Result, Violation};
use crate::port::PortState;
use crate::tracker::{Completion, SeqTracker};

/// An acknowledged event ready to send, plus its completion.
#[derive(Debug)]
pub struct Request {
    pub event: ServerEvent,
    pub done: oneshot::Receiver<Completion>,
}

impl Request {
    pub fn seq(&self) -> Option<Seq> {
        self.event.seq()
    }
}

/// Server-side mirror of one client port.
#[derive(Debug, Clone, PartialEq)]
pub struct ProxyPort {
    pub direction: Direction,
    pub id: PortId,
    /// `add_port` was confirmed.
    pub acked: bool,
    pub state: PortState,
    pub possible_formats: Vec<Pod>,
    /// Last format the client suggested in a `port_update`.
    pub proposed_format: Option<Pod>,
    pub format: Option<Pod>,
    pub params: BTreeMap<u32, Pod>,
    pub info: Option<PortInfo>,
    pub buffers: usize,
}

impl ProxyPort {
    fn new(direction: Direction, id: PortId) -> Self {
        Self {
            direction,
            id,
            acked: false,
            state: PortState::Added,
            possible_formats: Vec::new(),
            proposed_format: None,
            format: None,
            params: BTreeMap::new(),
            info: None,
            buffers: 0,
        }
    }

    fn settle(&mut self) {
        self.state = if self.format.is_some() && self.buffers > 0 {
            PortState::Configured
        } else if self.format.is_none() && self.possible_formats.is_empty() {
            PortState::Added
        } else {
            PortState::NegotiatingFormat
        };
    }
}

pub struct NodeProxy {
    tracker: SeqTracker,
    inflight: HashMap<Seq, AckedEvent>,
    ports: BTreeMap<(Direction, PortId), ProxyPort>,
    max_input_ports: u32,
    max_output_ports: u32,
    props: Option<Pod>,
    running: bool,
    shrink_policy: PortShrinkPolicy,
    next_mem: u32,
    destroyed: bool,
}

impl NodeProxy {
    pub fn new(config: &TetherConfig) -> Self {
        Self {
            tracker: SeqTracker::new(config.session.seq_base),
            inflight: HashMap::new(),
            ports: BTreeMap::new(),
            max_input_ports: 0,
            max_output_ports: 0,
            props: None,
            running: false,
            shrink_policy: config.session.port_shrink_policy,
            next_mem: 0,
            destroyed: false,
        }
    }

    pub fn max_ports(&self, direction: Direction) -> u32 {
        match direction {
            Direction::Input => self.max_input_ports,
            Direction::Output => self.max_output_ports,
        }
    }

    pub fn props(&self) -> Option<&Pod> {
        self.props.as_ref()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    pub fn port(&self, direction: Direction, port_id: PortId) -> Option<&ProxyPort> {
        self.ports.get(&(direction, port_id))
    }

    pub fn ports(&self) -> impl Iterator<Item = &ProxyPort> {
        self.ports.values()
    }

    /// Requests sent but not yet answered.
    pub fn pending_len(&self) -> usize {
        self.tracker.pending_len()
    }

    fn live(&self, direction: Direction) -> u32 {
        self.ports.keys().filter(|(d, _)| *d == direction).count() as u32
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.destroyed {
            return Err(Violation::AfterDestroy.into());
        }
        Ok(())
    }

    fn ensure_port(&self, direction: Direction, port_id: PortId) -> Result<()> {
        if self.ports.contains_key(&(direction, port_id)) {
            Ok(())
        } else {
            Err(Violation::UnknownPort { direction, port_id }.into())
        }
    }

    fn request(&mut self, request: AckedEvent) -> Result<Request> {
        self.ensure_alive()?;
        let (seq, done) = self.tracker.issue_waiting(request.kind(), request.port());
        self.inflight.insert(seq, request.clone());
        debug!("issue {} seq {}", request.kind(), seq);
        Ok(Request {
            event: ServerEvent::acked(seq, request),
            done,
        })
    }

    /// Add a port with the lowest free id in `direction`.
    pub fn add_port(&mut self, direction: Direction) -> Result<(PortId, Request)> {
        self.ensure_alive()?;
        let max = self.max_ports(direction);
        let live = self.live(direction);
        if live >= max {
            return Err(Violation::PortLimit {
                direction,
                max,
                live,
            }
            .into());
        }
        let port_id = (0..max)
            .map(PortId)
            .find(|id| !self.ports.contains_key(&(direction, *id)))
            .ok_or(Violation::PortLimit {
                direction,
                max,
                live,
            })?;

        // Reserve the id now so a second add_port cannot pick it.
        self.ports
            .insert((direction, port_id), ProxyPort::new(direction, port_id));
        let request = self.request(AckedEvent::AddPort { direction, port_id })?;
        Ok((port_id, request))
    }

    pub fn remove_port(&mut self, direction: Direction, port_id: PortId) -> Result<Request> {
        self.ensure_port(direction, port_id)?;
        self.request(AckedEvent::RemovePort { direction, port_id })
    }

    pub fn set_format(
        &mut self,
        direction: Direction,
        port_id: PortId,
        flags: FormatFlags,
        format: Option<Pod>,
    ) -> Result<Request> {
        self.ensure_port(direction, port_id)?;
        self.request(AckedEvent::SetFormat {
            direction,
            port_id,
            flags,
            format,
        })
    }

    pub fn set_param(
        &mut self,
        direction: Direction,
        port_id: PortId,
        param: Pod,
    ) -> Result<Request> {
        self.ensure_port(direction, port_id)?;
        self.request(AckedEvent::SetParam {
            direction,
            port_id,
            param,
        })
    }

    pub fn use_buffers(
        &mut self,
        direction: Direction,
        port_id: PortId,
        buffers: Vec<BufferDesc>,
    ) -> Result<Request> {
        self.ensure_port(direction, port_id)?;
        self.request(AckedEvent::UseBuffers {
            direction,
            port_id,
            buffers,
        })
    }

    pub fn set_props(&mut self, props: Pod) -> Result<Request> {
        self.request(AckedEvent::SetProps { props })
    }

    pub fn node_command(&mut self, command: Pod) -> Result<Request> {
        self.request(AckedEvent::NodeCommand { command })
    }

    /// Register a region with a fresh id. The descriptor travels as index 0.
    pub fn add_mem(
        &mut self,
        direction: Direction,
        port_id: PortId,
        mem_type: MemType,
        flags: MemFlags,
        offset: u32,
        size: u32,
    ) -> Result<(MemId, ServerEvent)> {
        self.ensure_alive()?;
        self.ensure_port(direction, port_id)?;
        let mem_id = MemId(self.next_mem);
        self.next_mem = self.next_mem.wrapping_add(1);
        Ok((
            mem_id,
            ServerEvent::Unacked(UnackedEvent::AddMem {
                direction,
                port_id,
                mem_id,
                mem_type: mem_type.to_u32(),
                fd: FdIndex(0),
                flags,
                offset,
                size,
            }),
        ))
    }

    pub fn port_command(
        &mut self,
        direction: Direction,
        port_id: PortId,
        command: Pod,
    ) -> Result<ServerEvent> {
        self.ensure_alive()?;
        self.ensure_port(direction, port_id)?;
        Ok(ServerEvent::Unacked(UnackedEvent::PortCommand {
            direction,
            port_id,
            command,
        }))
    }

    pub fn event(&mut self, event: Pod) -> Result<ServerEvent> {
        self.ensure_alive()?;
        Ok(ServerEvent::Unacked(UnackedEvent::Event { event }))
    }

    /// Descriptors travel as `readfd`, `writefd`, `memfd` at indices 0..3.
    pub fn transport(&mut self, offset: u32, size: u32) -> Result<ServerEvent> {
        self.ensure_alive()?;
        Ok(ServerEvent::Unacked(UnackedEvent::Transport {
            readfd: FdIndex(0),
            writefd: FdIndex(1),
            memfd: FdIndex(2),
            offset,
            size,
        }))
    }

    /// Apply one client method. Returns follow-up requests the caller must
    /// send (forced port removals after a shrinking `update`).
    pub fn handle_method(&mut self, method: ClientMethod) -> Result<Vec<Request>> {
        self.ensure_alive()?;
        match method {
            ClientMethod::Done { seq, res } => {
                let resolved = self.tracker.complete(seq, res)?;
                let request = self.inflight.remove(&seq);
                match (request, res) {
                    (Some(request), 0) => self.confirm(request),
                    (Some(request), _) => {
                        warn!("{} seq {} refused with {}", resolved.kind, seq, res);
                        self.refused(request);
                    }
                    (None, _) => {}
                }
                Ok(Vec::new())
            }
            ClientMethod::Update {
                change_mask,
                max_input_ports,
                max_output_ports,
                props,
            } => self.update(change_mask, max_input_ports, max_output_ports, props),
            ClientMethod::PortUpdate {
                direction,
                port_id,
                change_mask,
                possible_formats,
                format,
                params,
                info,
            } => {
                let Some(port) = self.ports.get_mut(&(direction, port_id)) else {
                    warn!("port_update for unknown {}:{}", direction, port_id);
                    return Err(Violation::UnknownPort { direction, port_id }.into());
                };
                if change_mask.contains(PortChange::POSSIBLE_FORMATS) {
                    port.possible_formats = possible_formats;
                }
                if change_mask.contains(PortChange::FORMAT) {
                    port.proposed_format = format;
                }
                if change_mask.contains(PortChange::PARAMS) {
                    port.params = params.into_iter().map(|p| (p.type_id, p)).collect();
                }
                if change_mask.contains(PortChange::INFO) {
                    port.info = info;
                }
                port.settle();
                debug!("{}:{} updated, {}", direction, port_id, port.state);
                Ok(Vec::new())
            }
            ClientMethod::Event { .. } => Ok(Vec::new()),
            ClientMethod::Destroy => {
                info!("client destroyed the node");
                self.cancel_all();
                Ok(Vec::new())
            }
        }
    }

    fn update(
        &mut self,
        mask: NodeChange,
        max_input_ports: u32,
        max_output_ports: u32,
        props: Option<Pod>,
    ) -> Result<Vec<Request>> {
        let mut wanted = Vec::new();
        if mask.contains(NodeChange::MAX_INPUTS) {
            wanted.push((Direction::Input, max_input_ports));
        }
        if mask.contains(NodeChange::MAX_OUTPUTS) {
            wanted.push((Direction::Output, max_output_ports));
        }

        if self.shrink_policy == PortShrinkPolicy::Reject {
            // Nothing applies if any direction would strand live ports.
            for &(direction, max) in &wanted {
                let live = self.live(direction);
                if live > max {
                    warn!(
                        "update would shrink {} ports to {} below {} live, rejected",
                        direction, max, live
                    );
                    return Err(Violation::PortLimit {
                        direction,
                        max,
                        live,
                    }
                    .into());
                }
            }
        }

        let mut removals = Vec::new();
        for (direction, max) in wanted {
            match direction {
                Direction::Input => self.max_input_ports = max,
                Direction::Output => self.max_output_ports = max,
            }
            let excess: Vec<PortId> = self
                .ports
                .keys()
                .filter(|(d, id)| *d == direction && id.0 >= max)
                .map(|(_, id)| *id)
                .collect();
            for port_id in excess {
                info!("{}:{} above new maximum {}, removing", direction, port_id, max);
                removals.push(self.remove_port(direction, port_id)?);
            }
        }
        if mask.contains(NodeChange::PROPS) {
            self.props = props;
        }
        Ok(removals)
    }

    fn confirm(&mut self, request: AckedEvent) {
        match request {
            AckedEvent::AddPort { direction, port_id } => {
                if let Some(port) = self.ports.get_mut(&(direction, port_id)) {
                    port.acked = true;
                    info!("{}:{} confirmed, {}", direction, port_id, port.state);
                }
            }
            AckedEvent::RemovePort { direction, port_id } => {
                self.ports.remove(&(direction, port_id));
                info!("{}:{} removed", direction, port_id);
            }
            AckedEvent::SetFormat {
                direction,
                port_id,
                flags,
                format,
            } => {
                if flags.contains(FormatFlags::TEST_ONLY) {
                    return;
                }
                if let Some(port) = self.ports.get_mut(&(direction, port_id)) {
                    port.format = format;
                    port.buffers = 0;
                    port.settle();
                }
            }
            AckedEvent::SetParam {
                direction,
                port_id,
                param,
            } => {
                if let Some(port) = self.ports.get_mut(&(direction, port_id)) {
                    if param.is_empty() {
                        port.params.remove(&param.type_id);
                    } else {
                        port.params.insert(param.type_id, param);
                    }
                }
            }
            AckedEvent::UseBuffers {
                direction,
                port_id,
                buffers,
            } => {
                if let Some(port) = self.ports.get_mut(&(direction, port_id)) {
                    port.buffers = buffers.len();
                    port.settle();
                    info!("{}:{} has {} buffer(s), {}", direction, port_id, port.buffers, port.state);
                }
            }
            AckedEvent::SetProps { props } => self.props = Some(props),
            AckedEvent::NodeCommand { command } => match command.type_id {
                command::START => self.running = true,
                command::PAUSE => self.running = false,
                _ => {}
            },
        }
    }

    fn refused(&mut self, request: AckedEvent) {
        if let AckedEvent::AddPort { direction, port_id } = request {
            if self.ports.get(&(direction, port_id)).is_some_and(|p| !p.acked) {
                self.ports.remove(&(direction, port_id));
            }
        }
    }

    /// Mark the node gone and cancel every waiter.
    pub fn cancel_all(&mut self) -> usize {
        self.destroyed = true;
        self.inflight.clear();
        self.tracker.cancel_all()
    }
}

impl std::fmt::Debug for NodeProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeProxy")
            .field("ports", &self.ports.len())
            .field("pending", &self.tracker.pending_len())
            .field("destroyed", &self.destroyed)
            .finish()
    }
}

/// Map a completion to the caller-facing result.
pub fn completion_result(completion: Completion) -> std::result::Result<(), NodeError> {
    match completion {
        Completion::Done(0) => Ok(()),
        Completion::Done(res) => Err(NodeError::Refused(res)),
        Completion::Cancelled => Err(NodeError::Cancelled),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn proxy(policy: PortShrinkPolicy) -> NodeProxy {
        let mut config = TetherConfig::default();
        config.session.port_shrink_policy = policy;
        let mut proxy = NodeProxy::new(&config);
        proxy
            .handle_method(ClientMethod::Update {
                change_mask: NodeChange::MAX_INPUTS | NodeChange::MAX_OUTPUTS,
                max_input_ports: 0,
                max_output_ports: 4,
                props: None,
            })
            .unwrap();
        proxy
    }

    fn done(seq: Seq, res: i32) -> ClientMethod {
        ClientMethod::Done { seq, res }
    }

    fn add_out(proxy: &mut NodeProxy) -> PortId {
        let (id, req) = proxy.add_port(Direction::Output).unwrap();
        proxy.handle_method(done(req.seq().unwrap(), 0)).unwrap();
        id
    }

    #[test]
    fn add_port_picks_lowest_free_id() {
        let mut proxy = proxy(PortShrinkPolicy::Reject);
        let (a, ra) = proxy.add_port(Direction::Output).unwrap();
        let (b, _) = proxy.add_port(Direction::Output).unwrap();
        assert_eq!((a, b), (PortId(0), PortId(1)));

        // Refusing the first frees its id.
        proxy.handle_method(done(ra.seq().unwrap(), -22)).unwrap();
        assert!(proxy.port(Direction::Output, PortId(0)).is_none());
        let (c, _) = proxy.add_port(Direction::Output).unwrap();
        assert_eq!(c, PortId(0));
    }

    #[test]
    fn add_port_respects_capacity() {
        let mut proxy = proxy(PortShrinkPolicy::Reject);
        let err = proxy.add_port(Direction::Input).unwrap_err();
        assert!(matches!(err.violation(), Some(Violation::PortLimit { max: 0, .. })));
        assert!(!err.is_fatal());
    }

    #[tokio::test]
    async fn done_wakes_the_waiter_with_its_result() {
        let mut proxy = proxy(PortShrinkPolicy::Reject);
        let port = add_out(&mut proxy);
        let req = proxy
            .set_format(
                Direction::Output,
                port,
                FormatFlags::empty(),
                Some(Pod::new(3, &b"x"[..])),
            )
            .unwrap();
        proxy.handle_method(done(req.seq().unwrap(), -1)).unwrap();
        assert_eq!(req.done.await.unwrap(), Completion::Done(-1));

        // Refused: the mirror did not move.
        assert!(proxy.port(Direction::Output, port).unwrap().format.is_none());
    }

    #[test]
    fn second_done_is_rejected() {
        let mut proxy = proxy(PortShrinkPolicy::Reject);
        let (_, req) = proxy.add_port(Direction::Output).unwrap();
        let seq = req.seq().unwrap();
        proxy.handle_method(done(seq, 0)).unwrap();
        let err = proxy.handle_method(done(seq, 0)).unwrap_err();
        assert_eq!(err.violation(), Some(Violation::UnknownSeq(seq)));
        assert!(err.is_fatal());
    }

    #[test]
    fn reject_policy_keeps_old_maximum() {
        let mut proxy = proxy(PortShrinkPolicy::Reject);
        add_out(&mut proxy);
        add_out(&mut proxy);
        let err = proxy
            .handle_method(ClientMethod::Update {
                change_mask: NodeChange::MAX_OUTPUTS,
                max_input_ports: 0,
                max_output_ports: 1,
                props: None,
            })
            .unwrap_err();
        assert!(!err.is_fatal());
        assert_eq!(proxy.max_ports(Direction::Output), 4);
        assert_eq!(proxy.ports().count(), 2);
    }

    #[test]
    fn force_remove_drops_highest_ports() {
        let mut proxy = proxy(PortShrinkPolicy::ForceRemove);
        for _ in 0..3 {
            add_out(&mut proxy);
        }
        let removals = proxy
            .handle_method(ClientMethod::Update {
                change_mask: NodeChange::MAX_OUTPUTS,
                max_input_ports: 0,
                max_output_ports: 1,
                props: None,
            })
            .unwrap();
        let targets: Vec<_> = removals
            .iter()
            .map(|r| match &r.event {
                ServerEvent::Acked {
                    request: AckedEvent::RemovePort { port_id, .. },
                    ..
                } => *port_id,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(targets, vec![PortId(1), PortId(2)]);
        assert_eq!(proxy.max_ports(Direction::Output), 1);

        for r in removals {
            proxy.handle_method(done(r.seq().unwrap(), 0)).unwrap();
        }
        assert_eq!(proxy.ports().count(), 1);
    }

    #[test]
    fn masked_update_ignores_other_fields() {
        let mut proxy = proxy(PortShrinkPolicy::Reject);
        proxy
            .handle_method(ClientMethod::Update {
                change_mask: NodeChange::empty(),
                max_input_ports: 9,
                max_output_ports: 0,
                props: Some(Pod::empty(1)),
            })
            .unwrap();
        assert_eq!(proxy.max_ports(Direction::Input), 0);
        assert_eq!(proxy.max_ports(Direction::Output), 4);
        assert!(proxy.props().is_none());
    }

    #[test]
    fn port_update_on_unknown_port_is_not_fatal() {
        let mut proxy = proxy(PortShrinkPolicy::Reject);
        let err = proxy
            .handle_method(ClientMethod::PortUpdate {
                direction: Direction::Output,
                port_id: PortId(3),
                change_mask: PortChange::POSSIBLE_FORMATS,
                possible_formats: vec![Pod::empty(3)],
                format: None,
                params: Vec::new(),
                info: None,
            })
            .unwrap_err();
        assert!(!err.is_fatal());
    }

    #[test]
    fn mirror_follows_confirmed_negotiation() {
        let mut proxy = proxy(PortShrinkPolicy::Reject);
        let port = add_out(&mut proxy);
        let format = Pod::new(3, &b"F32LE"[..]);
        proxy
            .handle_method(ClientMethod::PortUpdate {
                direction: Direction::Output,
                port_id: port,
                change_mask: PortChange::POSSIBLE_FORMATS,
                possible_formats: vec![format.clone()],
                format: None,
                params: Vec::new(),
                info: None,
            })
            .unwrap();
        assert_eq!(
            proxy.port(Direction::Output, port).unwrap().state,
            PortState::NegotiatingFormat
        );

        let req = proxy
            .set_format(Direction::Output, port, FormatFlags::empty(), Some(format))
            .unwrap();
        proxy.handle_method(done(req.seq().unwrap(), 0)).unwrap();
        let req = proxy
            .use_buffers(
                Direction::Output,
                port,
                vec![BufferDesc {
                    mem_id: MemId(0),
                    offset: 0,
                    size: 64,
                    layout: Default::default(),
                }],
            )
            .unwrap();
        proxy.handle_method(done(req.seq().unwrap(), 0)).unwrap();
        assert_eq!(
            proxy.port(Direction::Output, port).unwrap().state,
            PortState::Configured
        );
    }

    #[tokio::test]
    async fn destroy_cancels_pending() {
        let mut proxy = proxy(PortShrinkPolicy::Reject);
        let (_, req) = proxy.add_port(Direction::Output).unwrap();
        proxy.handle_method(ClientMethod::Destroy).unwrap();
        assert_eq!(req.done.await.unwrap(), Completion::Cancelled);
        assert!(matches!(
            proxy.set_props(Pod::empty(0)).unwrap_err().violation(),
            Some(Violation::AfterDestroy)
        ));
    }
}
