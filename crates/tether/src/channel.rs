//! Control channel - TETH01 frames over a Unix stream socket
//!
//! Descriptors ride as `SCM_RIGHTS` ancillary data on the first write of the
//! frame that announces them. The reader queues whatever descriptors arrive
//! and each decoded frame claims `n_fds` from the front of the queue, so
//! frames and descriptors stay paired as long as both are ordered.

use bytes::BytesMut;
use std::collections::VecDeque;
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::path::Path;
use std::sync::Arc;
use tetherconf::SessionConfig;
use tetherproto::{ClientMethod, ContentType, FrameError, NodeFrame, ServerEvent};
use tokio::io::Interest;
use tokio::net::UnixStream;
use tracing::{trace, warn};

use crate::error::{NodeError, Result, Violation};

const READ_CHUNK: usize = 16 * 1024;

fn cmsg_space(n_fds: usize) -> usize {
    let payload = (n_fds * std::mem::size_of::<RawFd>()) as u32;
    // SAFETY: pure arithmetic macro.
    unsafe { libc::CMSG_SPACE(payload) as usize }
}

fn send_with_fds(sock: RawFd, data: &[u8], fds: &[RawFd]) -> io::Result<usize> {
    let mut iov = libc::iovec {
        iov_base: data.as_ptr() as *mut libc::c_void,
        iov_len: data.len(),
    };
    // SAFETY: an all-zero msghdr is a valid empty header.
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;

    // u64 backing keeps the control buffer aligned for cmsghdr.
    let space = if fds.is_empty() { 0 } else { cmsg_space(fds.len()) };
    let mut control = vec![0u64; space.div_ceil(8)];
    if !fds.is_empty() {
        msg.msg_control = control.as_mut_ptr().cast();
        msg.msg_controllen = space as _;
        // SAFETY: msg_control points at `space` zeroed bytes, enough for one
        // header plus `fds.len()` descriptors.
        unsafe {
            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len =
                libc::CMSG_LEN((fds.len() * std::mem::size_of::<RawFd>()) as u32) as _;
            std::ptr::copy_nonoverlapping(
                fds.as_ptr(),
                libc::CMSG_DATA(cmsg).cast::<RawFd>(),
                fds.len(),
            );
        }
    }

    // SAFETY: msg and everything it points at outlive the call.
    let n = unsafe { libc::sendmsg(sock, &msg, libc::MSG_NOSIGNAL) };
    drop(control);
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

fn recv_with_fds(
    sock: RawFd,
    buf: &mut [u8],
    queue: &mut VecDeque<OwnedFd>,
    max_fds: usize,
) -> io::Result<usize> {
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr().cast(),
        iov_len: buf.len(),
    };
    let space = cmsg_space(max_fds.max(1));
    let mut control = vec![0u64; space.div_ceil(8)];
    // SAFETY: an all-zero msghdr is a valid empty header.
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr().cast();
    msg.msg_controllen = space as _;

    // SAFETY: msg and everything it points at outlive the call.
    let n = unsafe { libc::recvmsg(sock, &mut msg, libc::MSG_CMSG_CLOEXEC) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    // Take ownership of every descriptor before looking at flags, so none leak.
    // SAFETY: the kernel filled msg_control; CMSG_* walk only within it.
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let data = libc::CMSG_DATA(cmsg).cast::<RawFd>();
                let bytes = (*cmsg).cmsg_len as usize - libc::CMSG_LEN(0) as usize;
                for i in 0..bytes / std::mem::size_of::<RawFd>() {
                    let raw = std::ptr::read_unaligned(data.add(i));
                    queue.push_back(OwnedFd::from_raw_fd(raw));
                }
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    if msg.msg_flags & libc::MSG_CTRUNC != 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("more than {max_fds} descriptors in one message"),
        ));
    }
    Ok(n as usize)
}

/// A connected, not yet split, control channel.
#[derive(Debug)]
pub struct ControlChannel {
    stream: UnixStream,
    max_body: usize,
    max_fds: usize,
}

impl ControlChannel {
    pub fn new(stream: UnixStream, config: &SessionConfig) -> Self {
        Self {
            stream,
            max_body: config.max_frame_bytes,
            max_fds: config.max_fds,
        }
    }

    /// Two connected ends, for tests and in-process nodes.
    pub fn pair(config: &SessionConfig) -> Result<(Self, Self)> {
        let (a, b) = UnixStream::pair()?;
        Ok((Self::new(a, config), Self::new(b, config)))
    }

    pub async fn connect(path: impl AsRef<Path>, config: &SessionConfig) -> Result<Self> {
        let stream = UnixStream::connect(path.as_ref()).await?;
        Ok(Self::new(stream, config))
    }

    pub fn split(self) -> (ChannelReader, ChannelWriter) {
        let stream = Arc::new(self.stream);
        (
            ChannelReader {
                stream: stream.clone(),
                rx: BytesMut::with_capacity(READ_CHUNK),
                scratch: vec![0u8; READ_CHUNK],
                fds: VecDeque::new(),
                max_body: self.max_body,
                max_fds: self.max_fds,
            },
            ChannelWriter {
                stream,
                content_type: ContentType::MsgPack,
                buf: BytesMut::new(),
            },
        )
    }
}

pub struct ChannelReader {
    stream: Arc<UnixStream>,
    rx: BytesMut,
    scratch: Vec<u8>,
    fds: VecDeque<OwnedFd>,
    max_body: usize,
    max_fds: usize,
}

impl ChannelReader {
    /// Next whole frame, or `None` on a clean close between frames.
    async fn next_frame(&mut self) -> Result<Option<NodeFrame>> {
        loop {
            if let Some(frame) = NodeFrame::decode(&mut self.rx, self.max_body)? {
                trace!("frame opcode {} ({} fds)", frame.opcode, frame.n_fds);
                return Ok(Some(frame));
            }

            let sock = self.stream.as_raw_fd();
            let n = self
                .stream
                .async_io(Interest::READABLE, || {
                    recv_with_fds(sock, &mut self.scratch, &mut self.fds, self.max_fds)
                })
                .await?;
            if n == 0 {
                if self.rx.is_empty() {
                    return Ok(None);
                }
                return Err(NodeError::Transport(format!(
                    "peer closed with {} bytes of a partial frame",
                    self.rx.len()
                )));
            }
            self.rx.extend_from_slice(&self.scratch[..n]);
        }
    }

    fn claim(&mut self, n: u8) -> Result<Vec<OwnedFd>> {
        let n = usize::from(n);
        if self.fds.len() < n {
            return Err(Violation::BadDescriptor(self.fds.len() as u32).into());
        }
        Ok(self.fds.drain(..n).collect())
    }

    /// Next server event with the descriptors it announced.
    pub async fn recv_event(&mut self) -> Result<Option<(ServerEvent, Vec<OwnedFd>)>> {
        let Some(frame) = self.next_frame().await? else {
            return Ok(None);
        };
        let event = frame.to_event()?;
        let fds = self.claim(frame.n_fds)?;
        Ok(Some((event, fds)))
    }

    /// Next client method. Methods never carry descriptors.
    pub async fn recv_method(&mut self) -> Result<Option<ClientMethod>> {
        let Some(frame) = self.next_frame().await? else {
            return Ok(None);
        };
        if !self.fds.is_empty() {
            warn!("dropping {} unexpected descriptor(s)", self.fds.len());
            self.fds.clear();
        }
        Ok(Some(frame.to_method()?))
    }
}

pub struct ChannelWriter {
    stream: Arc<UnixStream>,
    content_type: ContentType,
    buf: BytesMut,
}

impl ChannelWriter {
    /// Body encoding for outgoing frames. MsgPack unless changed.
    pub fn set_content_type(&mut self, content_type: ContentType) {
        self.content_type = content_type;
    }

    pub async fn send_method(&mut self, method: &ClientMethod) -> Result<()> {
        let frame = NodeFrame::method(method, self.content_type)?;
        self.send_frame(&frame, &[]).await
    }

    /// Send an event; `fds` must match what the event indexes.
    pub async fn send_event(&mut self, event: &ServerEvent, fds: &[BorrowedFd<'_>]) -> Result<()> {
        if fds.len() != event.fd_count() {
            return Err(FrameError::FdCountMismatch {
                header: u8::try_from(fds.len()).unwrap_or(u8::MAX),
                needed: event.fd_count(),
            }
            .into());
        }
        let frame = NodeFrame::event(event, self.content_type)?;
        self.send_frame(&frame, fds).await
    }

    async fn send_frame(&mut self, frame: &NodeFrame, fds: &[BorrowedFd<'_>]) -> Result<()> {
        self.buf.clear();
        frame.encode(&mut self.buf);
        let raw: Vec<RawFd> = fds.iter().map(AsRawFd::as_raw_fd).collect();
        let sock = self.stream.as_raw_fd();

        let mut sent = 0;
        while sent < self.buf.len() {
            let data = &self.buf[sent..];
            let attach: &[RawFd] = if sent == 0 { &raw } else { &[] };
            let n = self
                .stream
                .async_io(Interest::WRITABLE, || send_with_fds(sock, data, attach))
                .await?;
            if n == 0 {
                return Err(io::Error::from(io::ErrorKind::WriteZero).into());
            }
            sent += n;
        }
        trace!("sent opcode {} ({} bytes, {} fds)", frame.opcode, sent, raw.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Seek, SeekFrom, Write};
    use std::os::fd::AsFd;
    use tetherproto::{AckedEvent, Direction, FdIndex, MemFlags, MemId, PortId, Seq, UnackedEvent};

    fn add_mem() -> ServerEvent {
        ServerEvent::Unacked(UnackedEvent::AddMem {
            direction: Direction::Output,
            port_id: PortId(0),
            mem_id: MemId(3),
            mem_type: 0,
            fd: FdIndex(0),
            flags: MemFlags::READWRITE,
            offset: 0,
            size: 4096,
        })
    }

    #[tokio::test]
    async fn methods_cross_in_order() {
        let config = SessionConfig::default();
        let (a, b) = ControlChannel::pair(&config).unwrap();
        let (_, mut tx) = a.split();
        let (mut rx, _) = b.split();

        tx.send_method(&ClientMethod::Done { seq: Seq(1), res: 0 })
            .await
            .unwrap();
        tx.send_method(&ClientMethod::Destroy).await.unwrap();

        assert_eq!(
            rx.recv_method().await.unwrap(),
            Some(ClientMethod::Done { seq: Seq(1), res: 0 })
        );
        assert_eq!(rx.recv_method().await.unwrap(), Some(ClientMethod::Destroy));
    }

    #[tokio::test]
    async fn descriptors_follow_their_frame() {
        let config = SessionConfig::default();
        let (a, b) = ControlChannel::pair(&config).unwrap();
        let (_, mut tx) = a.split();
        let (mut rx, _) = b.split();

        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"shared").unwrap();

        tx.send_event(
            &ServerEvent::acked(
                Seq(1),
                AckedEvent::AddPort {
                    direction: Direction::Output,
                    port_id: PortId(0),
                },
            ),
            &[],
        )
        .await
        .unwrap();
        tx.send_event(&add_mem(), &[file.as_fd()]).await.unwrap();

        let (first, fds) = rx.recv_event().await.unwrap().unwrap();
        assert_eq!(first.seq(), Some(Seq(1)));
        assert!(fds.is_empty());

        let (second, mut fds) = rx.recv_event().await.unwrap().unwrap();
        assert_eq!(second, add_mem());
        assert_eq!(fds.len(), 1);

        // Same open file on the other side.
        let mut received = std::fs::File::from(fds.remove(0));
        received.seek(SeekFrom::Start(0)).unwrap();
        let mut text = String::new();
        received.read_to_string(&mut text).unwrap();
        assert_eq!(text, "shared");
    }

    #[tokio::test]
    async fn descriptor_count_must_match_event() {
        let config = SessionConfig::default();
        let (a, _b) = ControlChannel::pair(&config).unwrap();
        let (_, mut tx) = a.split();
        let err = tx.send_event(&add_mem(), &[]).await.unwrap_err();
        assert!(matches!(err, NodeError::Frame(FrameError::FdCountMismatch { .. })));
    }

    #[tokio::test]
    async fn clean_close_ends_the_stream() {
        let config = SessionConfig::default();
        let (a, b) = ControlChannel::pair(&config).unwrap();
        drop(a);
        let (mut rx, _) = b.split();
        assert!(rx.recv_event().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn garbage_is_a_frame_error() {
        let config = SessionConfig::default();
        let (a, b) = std::os::unix::net::UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        b.set_nonblocking(true).unwrap();
        let mut raw = a;
        raw.write_all(b"NOTTETHER0000000").unwrap();

        let channel = ControlChannel::new(UnixStream::from_std(b).unwrap(), &config);
        let (mut rx, _) = channel.split();
        let err = rx.recv_event().await.unwrap_err();
        assert!(matches!(err, NodeError::Frame(FrameError::InvalidProtocol)));
    }
}
