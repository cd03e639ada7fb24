//! Real-time loop - a dedicated thread draining the inbound ring
//!
//! Never runs on the control channel's runtime. Each wake (signal, timeout or
//! spurious) drains the doorbell, then drains the ring completely before
//! blocking again, so a lost or coalesced wake only delays work until the
//! next one.

use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use super::doorbell::{poll, Doorbell};
use super::{ActivationRecord, Transport};
use crate::error::{NodeError, Result};

/// Per-record processing hook, run on the real-time thread.
pub trait Processor: Send + 'static {
    /// Handle one record from the peer; a returned record goes back to it.
    fn process(&mut self, record: ActivationRecord) -> Option<ActivationRecord>;

    /// The liveness timeout passed without a wake.
    fn idle(&mut self) {}
}

impl<F> Processor for F
where
    F: FnMut(ActivationRecord) -> Option<ActivationRecord> + Send + 'static,
{
    fn process(&mut self, record: ActivationRecord) -> Option<ActivationRecord> {
        self(record)
    }
}

pub struct RtLoop {
    stop: Doorbell,
    thread: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for RtLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtLoop")
            .field("running", &self.thread.is_some())
            .finish()
    }
}

impl RtLoop {
    /// Start the loop. A fatal transport error is reported on `on_fault`.
    pub fn spawn(
        transport: Arc<Transport>,
        mut processor: Box<dyn Processor>,
        wait_timeout: Duration,
        on_fault: Option<oneshot::Sender<NodeError>>,
    ) -> Result<Self> {
        let stop = Doorbell::eventfd().map_err(|e| NodeError::resource("eventfd", e))?;
        let stop_peer = Doorbell::from_fd(
            stop.try_clone_fd()
                .map_err(|e| NodeError::resource("dup stop fd", e))?,
        )
        .map_err(|e| NodeError::resource("stop fd", e))?;

        let thread = std::thread::Builder::new()
            .name("tether-rt".to_string())
            .spawn(move || {
                info!("rt loop started ({:?} side)", transport.side());
                match run(&transport, &stop_peer, processor.as_mut(), wait_timeout) {
                    Ok(()) => info!("rt loop stopped"),
                    Err(e) => {
                        error!("rt loop failed: {}", e);
                        if let Some(tx) = on_fault {
                            let _ = tx.send(e);
                        }
                    }
                }
            })
            .map_err(|e| NodeError::resource("spawn rt thread", e))?;

        Ok(Self {
            stop,
            thread: Some(thread),
        })
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop and join the thread.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        self.stop.signal()?;
        thread
            .join()
            .map_err(|_| NodeError::Transport("rt thread panicked".to_string()))
    }
}

impl Drop for RtLoop {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!("rt loop shutdown: {}", e);
        }
    }
}

fn run(
    transport: &Transport,
    stop: &Doorbell,
    processor: &mut dyn Processor,
    wait_timeout: Duration,
) -> Result<()> {
    const BROKEN: libc::c_short = libc::POLLERR | libc::POLLHUP | libc::POLLNVAL;

    loop {
        let mut fds = [
            libc::pollfd {
                fd: transport.wait_fd(),
                events: libc::POLLIN,
                revents: 0,
            },
            libc::pollfd {
                fd: stop.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            },
        ];
        let ready = poll(&mut fds, Some(wait_timeout))?;

        if fds[1].revents != 0 {
            return Ok(());
        }
        if fds[0].revents & BROKEN != 0 {
            return Err(NodeError::Transport(format!(
                "doorbell revents {:#x}",
                fds[0].revents
            )));
        }

        if ready == 0 {
            warn!("no transport activity for {:?}", wait_timeout);
            processor.idle();
        } else {
            transport.drain_wakes()?;
        }

        let mut replied = 0usize;
        while let Some(record) = transport.recv() {
            let Some(reply) = processor.process(record) else {
                continue;
            };
            match transport.push(reply) {
                Ok(()) => replied += 1,
                Err(NodeError::RingFull) => warn!("outbound ring full, dropping {:?}", reply),
                Err(e) => return Err(e),
            }
        }
        if replied > 0 {
            debug!("rt loop queued {} record(s)", replied);
            transport.notify()?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{RecordKind, Wake};

    fn echo(record: ActivationRecord) -> Option<ActivationRecord> {
        match record.kind() {
            Some(RecordKind::ProcessOutput) => Some(ActivationRecord::new(
                RecordKind::HaveOutput,
                record.port_id,
                record.buffer_id,
            )),
            _ => None,
        }
    }

    fn pair() -> (Transport, Transport) {
        let (server, offer) = Transport::create_server(8).unwrap();
        let client = Transport::attach_client(
            offer.readfd,
            offer.writefd,
            offer.memfd,
            offer.offset,
            offer.size,
        )
        .unwrap();
        (server, client)
    }

    #[test]
    fn answers_every_record_in_a_burst() {
        let (server, client) = pair();
        let rt = RtLoop::spawn(
            Arc::new(client),
            Box::new(echo),
            Duration::from_secs(5),
            None,
        )
        .unwrap();

        // Several pushes, one wake.
        for i in 0..5 {
            server
                .push(ActivationRecord::new(RecordKind::ProcessOutput, 0, i))
                .unwrap();
        }
        server.notify().unwrap();

        let mut got = Vec::new();
        while got.len() < 5 {
            assert_eq!(
                server.wait(Some(Duration::from_secs(2))).unwrap(),
                Wake::Signalled
            );
            server.drain_wakes().unwrap();
            while let Some(rec) = server.recv() {
                got.push(rec.buffer_id);
            }
        }
        assert_eq!(got, vec![0, 1, 2, 3, 4]);

        rt.stop().unwrap();
    }

    #[test]
    fn rescans_on_timeout_without_a_wake() {
        let (server, client) = pair();
        // Record lands without a signal; the liveness timeout picks it up.
        server
            .push(ActivationRecord::new(RecordKind::ProcessOutput, 2, 9))
            .unwrap();

        let rt = RtLoop::spawn(
            Arc::new(client),
            Box::new(echo),
            Duration::from_millis(20),
            None,
        )
        .unwrap();

        assert_eq!(
            server.wait(Some(Duration::from_secs(2))).unwrap(),
            Wake::Signalled
        );
        assert_eq!(server.recv().unwrap().buffer_id, 9);
        drop(rt);
    }

    #[test]
    fn stop_joins_promptly() {
        let (_server, client) = pair();
        let rt = RtLoop::spawn(
            Arc::new(client),
            Box::new(echo),
            Duration::from_secs(60),
            None,
        )
        .unwrap();
        assert!(rt.is_running());
        rt.stop().unwrap();
    }
}
