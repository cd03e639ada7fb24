//! The processing implementation behind a client node.
//!
//! `ClientNode` owns protocol state; a `NodeHandler` owns whatever actually
//! produces or consumes media. Each hook runs before the node commits the
//! matching state change, so returning an error refuses the request and the
//! server sees the error's code in `done`.

use tetherproto::{BufferDesc, Direction, FormatFlags, Pod, PortId};

use crate::error::NodeError;
use crate::port::PortUpdate;
use crate::transport::Processor;

pub trait NodeHandler: Send + 'static {
    fn set_props(&mut self, _props: &Pod) -> Result<(), NodeError> {
        Ok(())
    }

    /// A port was added. The returned update (if any) is sent to the server
    /// ahead of the `done`, typically to advertise possible formats.
    fn add_port(
        &mut self,
        _direction: Direction,
        _port_id: PortId,
    ) -> Result<Option<PortUpdate>, NodeError> {
        Ok(None)
    }

    fn remove_port(&mut self, _direction: Direction, _port_id: PortId) {}

    /// Called after the format passed the advertised-set check.
    fn set_format(
        &mut self,
        _direction: Direction,
        _port_id: PortId,
        _flags: FormatFlags,
        _format: Option<&Pod>,
    ) -> Result<(), NodeError> {
        Ok(())
    }

    fn set_param(
        &mut self,
        _direction: Direction,
        _port_id: PortId,
        _param: &Pod,
    ) -> Result<(), NodeError> {
        Ok(())
    }

    /// Called after the buffers validated and were installed.
    fn use_buffers(
        &mut self,
        _direction: Direction,
        _port_id: PortId,
        _buffers: &[BufferDesc],
    ) -> Result<(), NodeError> {
        Ok(())
    }

    fn node_command(&mut self, _command: &Pod) -> Result<(), NodeError> {
        Ok(())
    }

    fn port_command(
        &mut self,
        _direction: Direction,
        _port_id: PortId,
        _command: &Pod,
    ) -> Result<(), NodeError> {
        Ok(())
    }

    /// Opaque server notification.
    fn event(&mut self, _event: &Pod) {}

    /// Real-time hook, asked for each time a transport is established.
    /// `None` leaves the transport without a consumer thread.
    fn processor(&mut self) -> Option<Box<dyn Processor>> {
        None
    }
}

/// A handler that accepts everything and advertises nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

impl NodeHandler for AcceptAll {}
