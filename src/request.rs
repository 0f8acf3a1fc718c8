use std::collections::VecDeque;

use crate::error::{MountError, Result};
use crate::reply::Responder;
use crate::wire::MountOpcode;

/// One attribute change issued during a setattr chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetattrStep {
    Chmod(u32),
    Trunc(u64),
    Touch,
}

impl SetattrStep {
    pub fn opcode(&self) -> MountOpcode {
        match self {
            SetattrStep::Chmod(_) => MountOpcode::Chmod,
            SetattrStep::Trunc(_) => MountOpcode::Trunc,
            SetattrStep::Touch => MountOpcode::Touch,
        }
    }
}

/// Operation state kept while a remote call is in flight, together with the
/// kernel reply that will complete it.
pub enum Pending<R> {
    Lookup {
        parent: u64,
        name: String,
        reply: R,
    },
    Getattr {
        ino: u64,
        reply: R,
    },
    /// `remaining` steps follow the one in flight; the chain ends with a Stat.
    Setattr {
        ino: u64,
        remaining: VecDeque<SetattrStep>,
        reply: R,
    },
    Open {
        ino: u64,
        flags: i32,
        reply: R,
    },
    Read {
        ino: u64,
        size: u32,
        reply: R,
    },
    /// `offset` is `None` for appends, whose end is only known remotely.
    Write {
        ino: u64,
        /// None for appends
        offset: Option<u64>,
        len: u64,
        reply: R,
    },
    Create {
        parent: u64,
        name: String,
        /// Remote path, needed to close the file if the parent is revoked
        path: String,
        flags: i32,
        reply: R,
    },
    Mkdir {
        parent: u64,
        name: String,
        reply: R,
    },
    Unlink {
        parent: u64,
        name: String,
        reply: R,
    },
    Rename {
        parent: u64,
        name: String,
        newparent: u64,
        newname: String,
        reply: R,
    },
    Opendir {
        ino: u64,
        reply: R,
    },
    Readdir {
        fh: u64,
        ino: u64,
        cookie: i64,
        reply: R,
    },
    /// Fire-and-forget message; the agent's reply only keeps the queue aligned.
    Notify,
}

impl<R: Responder> Pending<R> {
    /// Answer the held kernel request with `errno`.
    pub fn fail(self, errno: i32) {
        match self {
            Pending::Lookup { reply, .. }
            | Pending::Getattr { reply, .. }
            | Pending::Setattr { reply, .. }
            | Pending::Open { reply, .. }
            | Pending::Read { reply, .. }
            | Pending::Write { reply, .. }
            | Pending::Create { reply, .. }
            | Pending::Mkdir { reply, .. }
            | Pending::Unlink { reply, .. }
            | Pending::Rename { reply, .. }
            | Pending::Opendir { reply, .. }
            | Pending::Readdir { reply, .. } => reply.error(errno),
            Pending::Notify => {}
        }
    }
}

pub struct Req<R> {
    pub seq: u32,
    pub opcode: MountOpcode,
    pub pending: Pending<R>,
}

/// Outstanding remote calls in send order. The connection is a single
/// ordered stream, so the head is always the next reply's owner.
pub struct RequestQueue<R> {
    reqs: VecDeque<Req<R>>,
    next_seq: u32,
}

impl<R: Responder> RequestQueue<R> {
    pub fn new() -> Self {
        Self {
            reqs: VecDeque::new(),
            next_seq: 0,
        }
    }

    /// Reserve the sequence number for the next message.
    pub fn next_seq(&self) -> u32 {
        self.next_seq
    }

    pub fn push(&mut self, opcode: MountOpcode, pending: Pending<R>) -> u32 {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        self.reqs.push_back(Req {
            seq,
            opcode,
            pending,
        });
        seq
    }

    /// Take the head for a reply carrying `seq`. Anything other than the
    /// head's sequence number means the stream is out of step.
    pub fn pop(&mut self, seq: u32) -> Result<Req<R>> {
        match self.reqs.front() {
            Some(head) if head.seq == seq => {}
            Some(head) => {
                return Err(MountError::Protocol(format!(
                    "reply for request {} while {} ({:?}) is outstanding",
                    seq, head.seq, head.opcode
                )))
            }
            None => {
                return Err(MountError::Protocol(format!(
                    "reply for request {} with nothing outstanding",
                    seq
                )))
            }
        }
        self.reqs
            .pop_front()
            .ok_or_else(|| MountError::Protocol("request queue underflow".to_string()))
    }

    /// Fail every outstanding request with `errno`, in send order.
    pub fn drain(&mut self, errno: i32) -> usize {
        let count = self.reqs.len();
        for req in self.reqs.drain(..) {
            log::debug!("failing request {} ({:?}) with {}", req.seq, req.opcode, errno);
            req.pending.fail(errno);
        }
        count
    }

    pub fn len(&self) -> usize {
        self.reqs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reqs.is_empty()
    }
}

impl<R: Responder> Default for RequestQueue<R> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{Outcome, Recorder};

    #[test]
    fn test_fifo_pop_in_send_order() {
        let rec = Recorder::new();
        let mut queue = RequestQueue::new();
        let a = queue.push(
            MountOpcode::Stat,
            Pending::Getattr {
                ino: 2,
                reply: rec.reply(),
            },
        );
        let b = queue.push(MountOpcode::Close, Pending::Notify);
        assert_eq!((a, b), (0, 1));

        assert!(queue.pop(b).is_err(), "second reply cannot overtake the first");
        assert_eq!(queue.pop(a).unwrap().opcode, MountOpcode::Stat);
        assert_eq!(queue.pop(b).unwrap().opcode, MountOpcode::Close);
        assert!(queue.pop(2).is_err());
    }

    #[test]
    fn test_drain_answers_every_request() {
        let rec = Recorder::new();
        let mut queue = RequestQueue::new();
        for ino in 2..5 {
            queue.push(
                MountOpcode::Stat,
                Pending::Getattr {
                    ino,
                    reply: rec.reply(),
                },
            );
        }
        queue.push(MountOpcode::Closedir, Pending::Notify);

        assert_eq!(queue.drain(libc::ENOTCONN), 4);
        assert!(queue.is_empty());
        assert_eq!(rec.outcomes(), vec![Outcome::Error(libc::ENOTCONN); 3]);
        rec.assert_all_answered();
    }

    #[test]
    fn test_sequence_wraps() {
        let mut queue: RequestQueue<crate::test_support::RecordedReply> = RequestQueue::new();
        queue.next_seq = u32::MAX;
        assert_eq!(queue.push(MountOpcode::Close, Pending::Notify), u32::MAX);
        assert_eq!(queue.next_seq(), 0);
    }
}
