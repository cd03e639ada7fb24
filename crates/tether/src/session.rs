//! Node sessions - the async loops around `ClientNode` and `NodeProxy`
//!
//! `ClientSession` reads server events, feeds them to the node and writes the
//! replies back in order. It restarts the real-time loop whenever a transport
//! is established.
//!
//! `ServerSession` exposes request/response calls over a `NodeProxy`. A
//! background task reads client methods; callers await their own `done`.

use std::os::fd::{AsFd, BorrowedFd};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tetherconf::TetherConfig;
use tetherproto::{
    BufferDesc, ClientMethod, Direction, FormatFlags, MemFlags, MemId, MemType, NodeChange, Pod,
    PortId, ServerEvent,
};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::channel::{ChannelReader, ChannelWriter, ControlChannel};
use crate::error::{NodeError, Result};
use crate::handler::NodeHandler;
use crate::node::ClientNode;
use crate::port::PortUpdate;
use crate::proxy::{completion_result, NodeProxy, Request};
use crate::tracker::Completion;
use crate::transport::{RtLoop, Transport, TransportOffer};

/// Client-initiated operations, queued into a running `ClientSession`.
#[derive(Debug)]
enum ClientOp {
    Update {
        change_mask: NodeChange,
        max_input_ports: u32,
        max_output_ports: u32,
        props: Option<Pod>,
    },
    PortUpdate {
        direction: Direction,
        port_id: PortId,
        update: PortUpdate,
    },
    Event(Pod),
    Destroy,
}

type OpReply = oneshot::Sender<Result<()>>;

/// Cloneable handle for driving a running `ClientSession`.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    ops: mpsc::Sender<(ClientOp, OpReply)>,
}

impl ClientHandle {
    async fn call(&self, op: ClientOp) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.ops
            .send((op, tx))
            .await
            .map_err(|_| NodeError::Destroyed)?;
        rx.await.map_err(|_| NodeError::Destroyed)?
    }

    pub async fn update(
        &self,
        change_mask: NodeChange,
        max_input_ports: u32,
        max_output_ports: u32,
        props: Option<Pod>,
    ) -> Result<()> {
        self.call(ClientOp::Update {
            change_mask,
            max_input_ports,
            max_output_ports,
            props,
        })
        .await
    }

    pub async fn port_update(
        &self,
        direction: Direction,
        port_id: PortId,
        update: PortUpdate,
    ) -> Result<()> {
        self.call(ClientOp::PortUpdate {
            direction,
            port_id,
            update,
        })
        .await
    }

    pub async fn event(&self, event: Pod) -> Result<()> {
        self.call(ClientOp::Event(event)).await
    }

    pub async fn destroy(&self) -> Result<()> {
        self.call(ClientOp::Destroy).await
    }
}

pub struct ClientSession<H> {
    node: ClientNode<H>,
    reader: ChannelReader,
    writer: ChannelWriter,
    rt: Option<RtLoop>,
    rt_fault: Option<oneshot::Receiver<NodeError>>,
    wait_timeout: Duration,
    shutdown_tx: broadcast::Sender<()>,
    ops_tx: mpsc::Sender<(ClientOp, OpReply)>,
    ops_rx: mpsc::Receiver<(ClientOp, OpReply)>,
}

async fn rt_fault(rx: &mut Option<oneshot::Receiver<NodeError>>) -> NodeError {
    match rx {
        Some(rx) => match rx.await {
            Ok(e) => e,
            // Loop exited cleanly and dropped its sender.
            Err(_) => std::future::pending().await,
        },
        None => std::future::pending().await,
    }
}

impl<H: NodeHandler> ClientSession<H> {
    pub fn new(channel: ControlChannel, node: ClientNode<H>, config: &TetherConfig) -> Self {
        let (reader, writer) = channel.split();
        let (shutdown_tx, _) = broadcast::channel(1);
        let (ops_tx, ops_rx) = mpsc::channel(16);
        Self {
            node,
            reader,
            writer,
            rt: None,
            rt_fault: None,
            wait_timeout: config.transport.wait_timeout(),
            shutdown_tx,
            ops_tx,
            ops_rx,
        }
    }

    pub fn node(&self) -> &ClientNode<H> {
        &self.node
    }

    pub fn node_mut(&mut self) -> &mut ClientNode<H> {
        &mut self.node
    }

    pub fn handle(&self) -> ClientHandle {
        ClientHandle {
            ops: self.ops_tx.clone(),
        }
    }

    /// Sending on this ends the session with a `destroy`.
    pub fn shutdown_signal(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Announce capacity before `run`, usually the first thing a client says.
    pub async fn announce(
        &mut self,
        max_input_ports: u32,
        max_output_ports: u32,
        props: Option<Pod>,
    ) -> Result<()> {
        let mut mask = NodeChange::MAX_INPUTS | NodeChange::MAX_OUTPUTS;
        if props.is_some() {
            mask |= NodeChange::PROPS;
        }
        let method = self
            .node
            .update(mask, max_input_ports, max_output_ports, props)?;
        self.writer.send_method(&method).await
    }

    /// Serve until the server closes, a fault, or shutdown. Returns the node
    /// (torn down) for inspection.
    pub async fn run(mut self) -> Result<ClientNode<H>> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        info!("client session running");

        let result = loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("shutdown requested, destroying node");
                    self.send_destroy().await;
                    break Ok(());
                }

                err = rt_fault(&mut self.rt_fault) => {
                    error!("real-time loop faulted: {}", err);
                    self.send_destroy().await;
                    break Err(err);
                }

                Some((op, reply)) = self.ops_rx.recv() => {
                    let destroy = matches!(op, ClientOp::Destroy);
                    let outcome = self.client_op(op).await;
                    let _ = reply.send(outcome);
                    if destroy {
                        break Ok(());
                    }
                }

                received = self.reader.recv_event() => {
                    match received {
                        Ok(Some((event, fds))) => {
                            if let Err(e) = self.dispatch(event, fds).await {
                                break Err(e);
                            }
                        }
                        Ok(None) => {
                            info!("server closed the control channel");
                            break Ok(());
                        }
                        Err(e) => {
                            error!("control channel failed: {}", e);
                            break Err(e);
                        }
                    }
                }
            }
        };

        self.node.teardown();
        self.stop_rt();
        result.map(|()| self.node)
    }

    async fn dispatch(&mut self, event: ServerEvent, fds: Vec<std::os::fd::OwnedFd>) -> Result<()> {
        match self.node.handle_event(event, fds) {
            Ok(replies) => {
                for reply in &replies {
                    self.writer.send_method(reply).await?;
                }
                self.refresh_rt()
            }
            Err(fault) => {
                for reply in &fault.replies {
                    if let Err(e) = self.writer.send_method(reply).await {
                        warn!("could not deliver reply before teardown: {}", e);
                        break;
                    }
                }
                self.send_destroy().await;
                Err(fault.error)
            }
        }
    }

    async fn client_op(&mut self, op: ClientOp) -> Result<()> {
        let method = match op {
            ClientOp::Update {
                change_mask,
                max_input_ports,
                max_output_ports,
                props,
            } => self
                .node
                .update(change_mask, max_input_ports, max_output_ports, props)?,
            ClientOp::PortUpdate {
                direction,
                port_id,
                update,
            } => self.node.port_update(direction, port_id, update)?,
            ClientOp::Event(event) => self.node.event(event)?,
            ClientOp::Destroy => self.node.destroy()?,
        };
        debug!("sending {}", method.name());
        self.writer.send_method(&method).await
    }

    /// Best-effort `destroy` on the way out.
    async fn send_destroy(&mut self) {
        if self.node.is_destroyed() {
            return;
        }
        if let Ok(method) = self.node.destroy() {
            if let Err(e) = self.writer.send_method(&method).await {
                debug!("destroy not delivered: {}", e);
            }
        }
    }

    fn refresh_rt(&mut self) -> Result<()> {
        let Some(transport) = self.node.take_new_transport() else {
            return Ok(());
        };
        self.stop_rt();
        let Some(processor) = self.node.handler_mut().processor() else {
            debug!("handler has no processor, transport left idle");
            return Ok(());
        };
        let (tx, rx) = oneshot::channel();
        self.rt = Some(RtLoop::spawn(
            transport,
            processor,
            self.wait_timeout,
            Some(tx),
        )?);
        self.rt_fault = Some(rx);
        Ok(())
    }

    fn stop_rt(&mut self) {
        self.rt_fault = None;
        if let Some(rt) = self.rt.take() {
            if let Err(e) = rt.stop() {
                warn!("rt loop stop: {}", e);
            }
        }
    }
}

/// Client events held for `next_event`; newer ones are dropped when full.
pub const EVENT_QUEUE: usize = 64;

fn lock(proxy: &Mutex<NodeProxy>) -> MutexGuard<'_, NodeProxy> {
    proxy.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct ServerSession {
    proxy: Arc<Mutex<NodeProxy>>,
    writer: Arc<tokio::sync::Mutex<ChannelWriter>>,
    events: mpsc::Receiver<Pod>,
    reader: JoinHandle<Result<()>>,
    done_timeout: Duration,
    ring_capacity: u32,
}

async fn read_methods(
    mut reader: ChannelReader,
    proxy: Arc<Mutex<NodeProxy>>,
    writer: Arc<tokio::sync::Mutex<ChannelWriter>>,
    events: mpsc::Sender<Pod>,
) -> Result<()> {
    loop {
        let method = match reader.recv_method().await {
            Ok(Some(method)) => method,
            Ok(None) => {
                info!("client closed the control channel");
                lock(&proxy).cancel_all();
                return Ok(());
            }
            Err(e) => {
                error!("control channel failed: {}", e);
                lock(&proxy).cancel_all();
                return Err(e);
            }
        };
        debug!("method {}", method.name());

        let destroy = matches!(method, ClientMethod::Destroy);
        // Never wait on the application here: `done` replies queue behind us.
        if let ClientMethod::Event { event } = &method {
            match events.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(event)) => {
                    warn!("client event queue full, dropping type {}", event.type_id)
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!("client event dropped, nobody listening")
                }
            }
        }

        // Writer first: follow-ups must go out in the order they were issued.
        let mut w = writer.lock().await;
        let handled = lock(&proxy).handle_method(method);
        match handled {
            Ok(followups) => {
                for request in followups {
                    w.send_event(&request.event, &[]).await?;
                }
            }
            Err(e) if !e.is_fatal() => warn!("client method ignored: {}", e),
            Err(e) => {
                error!("session fault: {}", e);
                lock(&proxy).cancel_all();
                return Err(e);
            }
        }
        if destroy {
            return Ok(());
        }
    }
}

impl ServerSession {
    pub fn spawn(channel: ControlChannel, config: &TetherConfig) -> Self {
        let (reader, writer) = channel.split();
        let proxy = Arc::new(Mutex::new(NodeProxy::new(config)));
        let writer = Arc::new(tokio::sync::Mutex::new(writer));
        let (events_tx, events) = mpsc::channel(EVENT_QUEUE);
        let reader = tokio::spawn(read_methods(
            reader,
            proxy.clone(),
            writer.clone(),
            events_tx,
        ));
        Self {
            proxy,
            writer,
            events,
            reader,
            done_timeout: config.session.done_timeout(),
            ring_capacity: config.transport.ring_capacity,
        }
    }

    /// Current mirror of the client node.
    pub fn proxy(&self) -> MutexGuard<'_, NodeProxy> {
        lock(&self.proxy)
    }

    /// Next opaque event from the client; `None` once the session ended.
    pub async fn next_event(&mut self) -> Option<Pod> {
        self.events.recv().await
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(&mut NodeProxy) -> Result<(T, Request)>,
    ) -> Result<T> {
        let (value, done) = {
            let mut w = self.writer.lock().await;
            let (value, request) = build(&mut lock(&self.proxy))?;
            w.send_event(&request.event, &[]).await?;
            (value, request.done)
        };
        self.await_done(done).await?;
        Ok(value)
    }

    async fn await_done(&self, done: oneshot::Receiver<Completion>) -> Result<()> {
        match tokio::time::timeout(self.done_timeout, done).await {
            Ok(Ok(completion)) => completion_result(completion),
            Ok(Err(_)) => Err(NodeError::Cancelled),
            Err(_) => {
                error!("no done within {:?}, faulting session", self.done_timeout);
                lock(&self.proxy).cancel_all();
                Err(NodeError::Timeout)
            }
        }
    }

    async fn notify<T>(
        &self,
        build: impl FnOnce(&mut NodeProxy) -> Result<(T, ServerEvent)>,
        fds: &[BorrowedFd<'_>],
    ) -> Result<T> {
        let mut w = self.writer.lock().await;
        let (value, event) = build(&mut lock(&self.proxy))?;
        w.send_event(&event, fds).await?;
        Ok(value)
    }

    pub async fn add_port(&self, direction: Direction) -> Result<PortId> {
        self.request(|p| p.add_port(direction)).await
    }

    pub async fn remove_port(&self, direction: Direction, port_id: PortId) -> Result<()> {
        self.request(|p| p.remove_port(direction, port_id).map(|r| ((), r)))
            .await
    }

    pub async fn set_format(
        &self,
        direction: Direction,
        port_id: PortId,
        flags: FormatFlags,
        format: Option<Pod>,
    ) -> Result<()> {
        self.request(|p| {
            p.set_format(direction, port_id, flags, format)
                .map(|r| ((), r))
        })
        .await
    }

    pub async fn set_param(&self, direction: Direction, port_id: PortId, param: Pod) -> Result<()> {
        self.request(|p| p.set_param(direction, port_id, param).map(|r| ((), r)))
            .await
    }

    pub async fn use_buffers(
        &self,
        direction: Direction,
        port_id: PortId,
        buffers: Vec<BufferDesc>,
    ) -> Result<()> {
        self.request(|p| p.use_buffers(direction, port_id, buffers).map(|r| ((), r)))
            .await
    }

    pub async fn set_props(&self, props: Pod) -> Result<()> {
        self.request(|p| p.set_props(props).map(|r| ((), r))).await
    }

    pub async fn node_command(&self, command: Pod) -> Result<()> {
        self.request(|p| p.node_command(command).map(|r| ((), r)))
            .await
    }

    /// Register `fd` as a region of the port and return its id.
    #[allow(clippy::too_many_arguments)]
    pub async fn add_mem(
        &self,
        direction: Direction,
        port_id: PortId,
        mem_type: MemType,
        flags: MemFlags,
        fd: BorrowedFd<'_>,
        offset: u32,
        size: u32,
    ) -> Result<MemId> {
        self.notify(
            |p| p.add_mem(direction, port_id, mem_type, flags, offset, size),
            &[fd],
        )
        .await
    }

    pub async fn port_command(
        &self,
        direction: Direction,
        port_id: PortId,
        command: Pod,
    ) -> Result<()> {
        self.notify(
            |p| p.port_command(direction, port_id, command).map(|e| ((), e)),
            &[],
        )
        .await
    }

    pub async fn event(&self, event: Pod) -> Result<()> {
        self.notify(|p| p.event(event).map(|e| ((), e)), &[]).await
    }

    /// Hand the client its end of a transport created with
    /// `Transport::create_server`.
    pub async fn transport(&self, offer: &TransportOffer) -> Result<()> {
        let fds = [
            offer.readfd.as_fd(),
            offer.writefd.as_fd(),
            offer.memfd.as_fd(),
        ];
        self.notify(
            |p| p.transport(offer.offset, offer.size).map(|e| ((), e)),
            &fds,
        )
        .await
    }

    /// Create a transport sized by `transport.ring_capacity`, hand the client
    /// its end and return ours.
    pub async fn establish_transport(&self) -> Result<Transport> {
        let (transport, offer) = Transport::create_server(self.ring_capacity)?;
        self.transport(&offer).await?;
        debug!("transport offered, {} records per ring", self.ring_capacity);
        Ok(transport)
    }

    /// Wait for the client to destroy the node or hang up.
    pub async fn closed(self) -> Result<()> {
        self.reader
            .await
            .map_err(|e| NodeError::Transport(format!("reader task: {e}")))?
    }
}
