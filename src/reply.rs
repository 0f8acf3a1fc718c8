//! Kernel completion side of a FUSE request.
//!
//! Every handler in the bridge receives a [`Responder`] and must consume it
//! exactly once, either immediately (fast path) or after the remote reply
//! arrives. Consuming `self` makes a double reply impossible; fuser answers
//! `EIO` for a reply that is dropped unanswered.

use std::time::Duration;

use fuser::{
    FileAttr, FileType, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry,
    ReplyOpen, ReplyWrite,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub ino: u64,
    /// Cookie the kernel passes back to continue after this entry
    pub offset: i64,
    pub kind: FileType,
    pub name: String,
}

pub trait Responder: Send + Sized + 'static {
    fn error(self, errno: i32);
    fn ok(self);
    fn entry(self, ttl: &Duration, attr: &FileAttr, generation: u64);
    fn attr(self, ttl: &Duration, attr: &FileAttr);
    fn data(self, data: &[u8]);
    fn written(self, size: u32);
    fn opened(self, fh: u64, flags: u32);
    fn created(self, ttl: &Duration, attr: &FileAttr, generation: u64, fh: u64, flags: u32);
    /// Emit entries in order until the kernel buffer is full and finish the
    /// reply. Returns how many entries were accepted.
    fn directory(self, entries: &[DirEntry]) -> usize;
}

/// The fuser reply object held for one kernel request.
pub enum KernelReply {
    Entry(ReplyEntry),
    Attr(ReplyAttr),
    Data(ReplyData),
    Write(ReplyWrite),
    Open(ReplyOpen),
    Create(ReplyCreate),
    Directory(ReplyDirectory),
    Empty(ReplyEmpty),
}

impl KernelReply {
    fn kind(&self) -> &'static str {
        match self {
            KernelReply::Entry(_) => "entry",
            KernelReply::Attr(_) => "attr",
            KernelReply::Data(_) => "data",
            KernelReply::Write(_) => "write",
            KernelReply::Open(_) => "open",
            KernelReply::Create(_) => "create",
            KernelReply::Directory(_) => "directory",
            KernelReply::Empty(_) => "empty",
        }
    }

    fn mismatch(self, wanted: &str) {
        log::error!("{} reply issued on a {} request", wanted, self.kind());
        self.error(libc::EIO);
    }
}

impl Responder for KernelReply {
    fn error(self, errno: i32) {
        match self {
            KernelReply::Entry(r) => r.error(errno),
            KernelReply::Attr(r) => r.error(errno),
            KernelReply::Data(r) => r.error(errno),
            KernelReply::Write(r) => r.error(errno),
            KernelReply::Open(r) => r.error(errno),
            KernelReply::Create(r) => r.error(errno),
            KernelReply::Directory(r) => r.error(errno),
            KernelReply::Empty(r) => r.error(errno),
        }
    }

    fn ok(self) {
        match self {
            KernelReply::Empty(r) => r.ok(),
            KernelReply::Directory(r) => r.ok(),
            other => other.mismatch("empty"),
        }
    }

    fn entry(self, ttl: &Duration, attr: &FileAttr, generation: u64) {
        match self {
            KernelReply::Entry(r) => r.entry(ttl, attr, generation),
            other => other.mismatch("entry"),
        }
    }

    fn attr(self, ttl: &Duration, attr: &FileAttr) {
        match self {
            KernelReply::Attr(r) => r.attr(ttl, attr),
            other => other.mismatch("attr"),
        }
    }

    fn data(self, data: &[u8]) {
        match self {
            KernelReply::Data(r) => r.data(data),
            other => other.mismatch("data"),
        }
    }

    fn written(self, size: u32) {
        match self {
            KernelReply::Write(r) => r.written(size),
            other => other.mismatch("write"),
        }
    }

    fn opened(self, fh: u64, flags: u32) {
        match self {
            KernelReply::Open(r) => r.opened(fh, flags),
            other => other.mismatch("open"),
        }
    }

    fn created(self, ttl: &Duration, attr: &FileAttr, generation: u64, fh: u64, flags: u32) {
        match self {
            KernelReply::Create(r) => r.created(ttl, attr, generation, fh, flags),
            other => other.mismatch("create"),
        }
    }

    fn directory(self, entries: &[DirEntry]) -> usize {
        match self {
            KernelReply::Directory(mut r) => {
                let mut accepted = 0;
                for entry in entries {
                    if r.add(entry.ino, entry.offset, entry.kind, &entry.name) {
                        break;
                    }
                    accepted += 1;
                }
                r.ok();
                accepted
            }
            other => {
                other.mismatch("directory");
                0
            }
        }
    }
}
