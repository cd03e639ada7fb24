//! Sequence/completion tracker
//!
//! Pairs every acknowledged server request with exactly one `done`. The server
//! side allocates sequence numbers with `issue`; the client side records the
//! ones it receives with `observe`. Either way `complete` resolves entries
//! strictly oldest first, because the control channel is ordered and `done`
//! replies come back in receive order.

use std::collections::VecDeque;
use tetherproto::{Direction, OpKind, PortId, Seq};
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::Violation;

/// How a tracked request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The peer answered; 0 or a negative code.
    Done(i32),
    /// The session was destroyed first.
    Cancelled,
}

/// A resolved entry, handed back to the caller of `complete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolved {
    pub seq: Seq,
    pub kind: OpKind,
    pub port: Option<(Direction, PortId)>,
    pub res: i32,
}

#[derive(Debug)]
struct Pending {
    seq: Seq,
    kind: OpKind,
    port: Option<(Direction, PortId)>,
    waiter: Option<oneshot::Sender<Completion>>,
}

#[derive(Debug)]
pub struct SeqTracker {
    next: Seq,
    pending: VecDeque<Pending>,
}

impl SeqTracker {
    pub fn new(base: u32) -> Self {
        Self {
            next: Seq(base),
            pending: VecDeque::new(),
        }
    }

    pub fn is_pending(&self, seq: Seq) -> bool {
        self.pending.iter().any(|p| p.seq == seq)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn oldest(&self) -> Option<Seq> {
        self.pending.front().map(|p| p.seq)
    }

    fn allocate(&mut self) -> Seq {
        // Wrapping is fine; a value still pending is never handed out twice.
        let mut seq = self.next;
        while self.is_pending(seq) {
            seq = seq.next();
        }
        self.next = seq.next();
        seq
    }

    /// Allocate the next sequence number for an outgoing request.
    pub fn issue(&mut self, kind: OpKind, port: Option<(Direction, PortId)>) -> Seq {
        let seq = self.allocate();
        self.pending.push_back(Pending {
            seq,
            kind,
            port,
            waiter: None,
        });
        seq
    }

    /// Like `issue`, plus a receiver that resolves when the entry does.
    pub fn issue_waiting(
        &mut self,
        kind: OpKind,
        port: Option<(Direction, PortId)>,
    ) -> (Seq, oneshot::Receiver<Completion>) {
        let seq = self.allocate();
        let (tx, rx) = oneshot::channel();
        self.pending.push_back(Pending {
            seq,
            kind,
            port,
            waiter: Some(tx),
        });
        (seq, rx)
    }

    /// Record a sequence number chosen by the peer.
    pub fn observe(
        &mut self,
        seq: Seq,
        kind: OpKind,
        port: Option<(Direction, PortId)>,
    ) -> Result<(), Violation> {
        if self.is_pending(seq) {
            return Err(Violation::DuplicateSeq(seq));
        }
        self.pending.push_back(Pending {
            seq,
            kind,
            port,
            waiter: None,
        });
        Ok(())
    }

    /// Resolve `seq` with `res`. Only the oldest pending entry may resolve.
    pub fn complete(&mut self, seq: Seq, res: i32) -> Result<Resolved, Violation> {
        match self.pending.front() {
            Some(front) if front.seq == seq => {}
            Some(front) if self.is_pending(seq) => {
                return Err(Violation::OutOfOrderDone {
                    seq,
                    oldest: front.seq,
                });
            }
            _ => return Err(Violation::UnknownSeq(seq)),
        }

        let Some(entry) = self.pending.pop_front() else {
            return Err(Violation::UnknownSeq(seq));
        };
        debug!("seq {} ({}) done: {}", seq, entry.kind, res);
        if let Some(waiter) = entry.waiter {
            // The waiter may have given up (timeout); the entry still resolves.
            let _ = waiter.send(Completion::Done(res));
        }
        Ok(Resolved {
            seq,
            kind: entry.kind,
            port: entry.port,
            res,
        })
    }

    /// Drop every pending entry, waking waiters with `Cancelled`.
    pub fn cancel_all(&mut self) -> usize {
        let n = self.pending.len();
        for entry in self.pending.drain(..) {
            if let Some(waiter) = entry.waiter {
                let _ = waiter.send(Completion::Cancelled);
            }
        }
        if n > 0 {
            debug!("cancelled {} pending request(s)", n);
        }
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PORT: Option<(Direction, PortId)> = Some((Direction::Output, PortId(0)));

    #[test]
    fn issue_starts_at_base_and_advances() {
        let mut t = SeqTracker::new(1);
        assert_eq!(t.issue(OpKind::AddPort, PORT), Seq(1));
        assert_eq!(t.issue(OpKind::SetFormat, PORT), Seq(2));
        assert_eq!(t.oldest(), Some(Seq(1)));
    }

    #[test]
    fn exactly_one_done_per_seq() {
        let mut t = SeqTracker::new(1);
        let seq = t.issue(OpKind::AddPort, PORT);
        let resolved = t.complete(seq, 0).unwrap();
        assert_eq!(resolved.kind, OpKind::AddPort);
        assert_eq!(resolved.port, PORT);

        assert_eq!(t.complete(seq, 0), Err(Violation::UnknownSeq(seq)));
    }

    #[test]
    fn unknown_seq_is_rejected() {
        let mut t = SeqTracker::new(1);
        assert_eq!(t.complete(Seq(40), 0), Err(Violation::UnknownSeq(Seq(40))));
    }

    #[test]
    fn done_must_come_in_order() {
        let mut t = SeqTracker::new(1);
        let a = t.issue(OpKind::AddPort, PORT);
        let b = t.issue(OpKind::SetParam, PORT);
        assert_eq!(
            t.complete(b, 0),
            Err(Violation::OutOfOrderDone { seq: b, oldest: a })
        );
        assert!(t.complete(a, 0).is_ok());
        assert!(t.complete(b, 0).is_ok());
        assert_eq!(t.pending_len(), 0);
    }

    #[test]
    fn wrap_skips_pending_values() {
        let mut t = SeqTracker::new(u32::MAX);
        let first = t.issue(OpKind::AddPort, PORT);
        assert_eq!(first, Seq(u32::MAX));
        assert_eq!(t.issue(OpKind::AddPort, PORT), Seq(0));

        // Force the counter back onto a pending value.
        t.next = Seq(u32::MAX);
        assert_eq!(t.issue(OpKind::AddPort, PORT), Seq(1));
    }

    #[test]
    fn observe_rejects_duplicates() {
        let mut t = SeqTracker::new(1);
        t.observe(Seq(5), OpKind::SetProps, None).unwrap();
        assert_eq!(
            t.observe(Seq(5), OpKind::SetProps, None),
            Err(Violation::DuplicateSeq(Seq(5)))
        );
    }

    #[tokio::test]
    async fn waiters_see_result() {
        let mut t = SeqTracker::new(1);
        let (seq, rx) = t.issue_waiting(OpKind::UseBuffers, PORT);
        t.complete(seq, -22).unwrap();
        assert_eq!(rx.await.unwrap(), Completion::Done(-22));
    }

    #[tokio::test]
    async fn cancel_all_wakes_everyone() {
        let mut t = SeqTracker::new(1);
        let (_, a) = t.issue_waiting(OpKind::AddPort, PORT);
        let (_, b) = t.issue_waiting(OpKind::NodeCommand, None);
        assert_eq!(t.cancel_all(), 2);
        assert_eq!(a.await.unwrap(), Completion::Cancelled);
        assert_eq!(b.await.unwrap(), Completion::Cancelled);
        assert_eq!(t.pending_len(), 0);
    }
}
