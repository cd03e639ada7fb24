//! Real-time transport channel
//!
//! One shared area holding two activation rings plus two doorbells, set up by
//! the `transport` event. After setup, per-cycle scheduling goes through here
//! and never touches the control channel.
//!
//! The server lays out the area and creates both doorbells
//! (`Transport::create_server`); the client maps what it was sent
//! (`Transport::attach_client`). `readfd` wakes the client, `writefd` wakes the
//! server.

pub mod area;
pub mod doorbell;
pub mod rt;

pub use area::{ActivationRecord, RecordKind, RingId, TransportArea};
pub use doorbell::{Doorbell, Wake};
pub use rt::{Processor, RtLoop};

use memmap2::MmapOptions;
use std::fs::File;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;
use tracing::debug;

use crate::error::{NodeError, Result};

/// Which end of the transport this is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Server,
}

/// Descriptors the server sends with a `transport` event.
#[derive(Debug)]
pub struct TransportOffer {
    /// Client waits on this; server signals it.
    pub readfd: OwnedFd,
    /// Client signals this; server waits on it.
    pub writefd: OwnedFd,
    pub memfd: OwnedFd,
    pub offset: u32,
    pub size: u32,
}

#[derive(Debug)]
pub struct Transport {
    area: TransportArea,
    side: Side,
    /// Rung by the peer when our inbound ring has records.
    wait: Doorbell,
    /// Rung by us when the peer's inbound ring has records.
    wake: Doorbell,
}

fn memfd(name: &'static [u8], len: usize) -> Result<File> {
    // SAFETY: `name` is NUL-terminated static data.
    let raw = unsafe { libc::memfd_create(name.as_ptr().cast(), libc::MFD_CLOEXEC) };
    if raw < 0 {
        return Err(NodeError::resource(
            "memfd_create",
            std::io::Error::last_os_error(),
        ));
    }
    // SAFETY: memfd_create just returned this descriptor.
    let file = File::from(unsafe { OwnedFd::from_raw_fd(raw) });
    file.set_len(len as u64)
        .map_err(|e| NodeError::resource("size transport area", e))?;
    Ok(file)
}

impl Transport {
    /// Create and lay out a new area with two doorbells.
    ///
    /// Returns the server end plus the descriptors to send to the client.
    pub fn create_server(capacity: u32) -> Result<(Self, TransportOffer)> {
        let size = area::required_size(capacity);
        let file = memfd(b"tether-transport\0", size)?;
        let map = MmapOptions::new()
            .len(size)
            .map_raw(&file)
            .map_err(|e| NodeError::resource("map transport area", e))?;
        let area = TransportArea::init(map, capacity)?;

        let to_client = Doorbell::eventfd().map_err(|e| NodeError::resource("eventfd", e))?;
        let to_server = Doorbell::eventfd().map_err(|e| NodeError::resource("eventfd", e))?;

        let offer = TransportOffer {
            readfd: to_client
                .try_clone_fd()
                .map_err(|e| NodeError::resource("dup doorbell", e))?,
            writefd: to_server
                .try_clone_fd()
                .map_err(|e| NodeError::resource("dup doorbell", e))?,
            memfd: OwnedFd::from(file),
            offset: 0,
            size: size as u32,
        };
        debug!("transport area {} bytes, {} records per ring", size, capacity);

        Ok((
            Self {
                area,
                side: Side::Server,
                wait: to_server,
                wake: to_client,
            },
            offer,
        ))
    }

    /// Map and validate an area received from the server.
    pub fn attach_client(
        readfd: OwnedFd,
        writefd: OwnedFd,
        memfd: OwnedFd,
        offset: u32,
        size: u32,
    ) -> Result<Self> {
        let file = File::from(memfd);
        let map = MmapOptions::new()
            .offset(u64::from(offset))
            .len(size as usize)
            .map_raw(&file)
            .map_err(|e| NodeError::resource("map transport area", e))?;
        let area = TransportArea::attach(map)?;

        let wait = Doorbell::from_fd(readfd).map_err(|e| NodeError::resource("readfd", e))?;
        let wake = Doorbell::from_fd(writefd).map_err(|e| NodeError::resource("writefd", e))?;

        Ok(Self {
            area,
            side: Side::Client,
            wait,
            wake,
        })
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn area(&self) -> &TransportArea {
        &self.area
    }

    fn inbound(&self) -> RingId {
        match self.side {
            Side::Client => RingId::ToClient,
            Side::Server => RingId::ToServer,
        }
    }

    fn outbound(&self) -> RingId {
        match self.side {
            Side::Client => RingId::ToServer,
            Side::Server => RingId::ToClient,
        }
    }

    /// Queue a record for the peer without waking it.
    pub fn push(&self, record: ActivationRecord) -> Result<()> {
        self.area.push(self.outbound(), record)
    }

    /// Wake the peer.
    pub fn notify(&self) -> Result<()> {
        self.wake.signal()
    }

    /// Queue a record and wake the peer.
    pub fn send(&self, record: ActivationRecord) -> Result<()> {
        self.push(record)?;
        self.notify()
    }

    /// Next record from the peer, if any.
    pub fn recv(&self) -> Option<ActivationRecord> {
        self.area.pop(self.inbound())
    }

    pub fn pending(&self) -> u32 {
        self.area.len(self.inbound())
    }

    /// Block until the peer rings or `timeout` passes. Does not drain.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<Wake> {
        self.wait.wait(timeout)
    }

    /// Clear pending wakes before rescanning.
    pub fn drain_wakes(&self) -> Result<u64> {
        self.wait.drain()
    }

    pub(crate) fn wait_fd(&self) -> RawFd {
        self.wait.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_and_client_share_rings() {
        let (server, offer) = Transport::create_server(16).unwrap();
        let client = Transport::attach_client(
            offer.readfd,
            offer.writefd,
            offer.memfd,
            offer.offset,
            offer.size,
        )
        .unwrap();
        assert_eq!(client.area().capacity(), 16);

        server
            .send(ActivationRecord::new(RecordKind::ProcessInput, 1, 0))
            .unwrap();
        assert_eq!(
            client.wait(Some(Duration::from_secs(1))).unwrap(),
            Wake::Signalled
        );
        client.drain_wakes().unwrap();
        let rec = client.recv().unwrap();
        assert_eq!(rec.kind(), Some(RecordKind::ProcessInput));
        assert_eq!(rec.port_id, 1);

        client
            .send(ActivationRecord::new(RecordKind::ReuseBuffer, 1, 0))
            .unwrap();
        assert_eq!(
            server.wait(Some(Duration::from_secs(1))).unwrap(),
            Wake::Signalled
        );
        assert_eq!(server.recv().unwrap().kind(), Some(RecordKind::ReuseBuffer));
        assert!(server.recv().is_none());
    }

    #[test]
    fn attach_rejects_truncated_offer() {
        let (_server, offer) = Transport::create_server(16).unwrap();
        let err = Transport::attach_client(offer.readfd, offer.writefd, offer.memfd, 0, 64)
            .unwrap_err();
        assert!(matches!(err, NodeError::Transport(_)));
    }
}
