use std::ffi::OsStr;

use crossbeam_channel::Sender;
use fuser::{
    Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyOpen, ReplyWrite, Request, TimeOrNow,
};

use crate::mount::Event;
use crate::mount_ops::FuseCall;
use crate::reply::KernelReply;

/// FUSE session adapter. Runs on fuser's session thread and hands every
/// request to the mount's event loop together with its reply object; the
/// loop answers it, now or once the agent replies.
pub struct MountFs {
    events: Sender<Event<KernelReply>>,
    max_read: u32,
}

impl MountFs {
    pub fn new(events: Sender<Event<KernelReply>>, max_read: u32) -> Self {
        Self { events, max_read }
    }

    fn forward(&self, call: FuseCall<KernelReply>) {
        if let Err(e) = self.events.send(Event::Fuse(call)) {
            if let Event::Fuse(call) = e.into_inner() {
                call.fail(libc::ENOTCONN);
            }
        }
    }
}

fn utf8_name(name: &OsStr) -> Option<String> {
    name.to_str().map(str::to_string)
}

impl Filesystem for MountFs {
    fn init(&mut self, _req: &Request, config: &mut KernelConfig) -> Result<(), libc::c_int> {
        if let Err(nearest) = config.set_max_write(self.max_read) {
            log::debug!("kernel max_write capped at {}", nearest);
            let _ = config.set_max_write(nearest);
        }
        if let Err(nearest) = config.set_max_readahead(self.max_read) {
            let _ = config.set_max_readahead(nearest);
        }
        // Requests are serialized on the agent connection anyway.
        let _ = config.set_max_background(1);
        Ok(())
    }

    fn destroy(&mut self) {
        let _ = self.events.send(Event::SessionEnded);
    }

    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(name) = utf8_name(name) else {
            reply.error(libc::ENOENT);
            return;
        };
        self.forward(FuseCall::Lookup {
            parent,
            name,
            reply: KernelReply::Entry(reply),
        });
    }

    fn forget(&mut self, _req: &Request, ino: u64, nlookup: u64) {
        let _ = self.events.send(Event::Fuse(FuseCall::Forget { ino, nlookup }));
    }

    fn getattr(&mut self, _req: &Request, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        self.forward(FuseCall::Getattr {
            ino,
            reply: KernelReply::Attr(reply),
        });
    }

    fn setattr(
        &mut self,
        _req: &Request,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<std::time::SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<std::time::SystemTime>,
        _chgtime: Option<std::time::SystemTime>,
        _bkuptime: Option<std::time::SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        self.forward(FuseCall::Setattr {
            ino,
            mode,
            uid,
            gid,
            size,
            touch: atime.is_some() || mtime.is_some(),
            reply: KernelReply::Attr(reply),
        });
    }

    fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        self.forward(FuseCall::Open {
            ino,
            flags,
            reply: KernelReply::Open(reply),
        });
    }

    fn read(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock: Option<u64>,
        reply: ReplyData,
    ) {
        self.forward(FuseCall::Read {
            ino,
            fh,
            offset,
            size,
            reply: KernelReply::Data(reply),
        });
    }

    fn write(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        self.forward(FuseCall::Write {
            ino,
            fh,
            offset,
            data: data.to_vec(),
            reply: KernelReply::Write(reply),
        });
    }

    fn flush(&mut self, _req: &Request, ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        self.forward(FuseCall::Flush {
            ino,
            fh,
            reply: KernelReply::Empty(reply),
        });
    }

    fn release(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        self.forward(FuseCall::Release {
            ino,
            fh,
            reply: KernelReply::Empty(reply),
        });
    }

    fn opendir(&mut self, _req: &Request, ino: u64, _flags: i32, reply: ReplyOpen) {
        self.forward(FuseCall::Opendir {
            ino,
            reply: KernelReply::Open(reply),
        });
    }

    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        reply: ReplyDirectory,
    ) {
        self.forward(FuseCall::Readdir {
            ino,
            fh,
            offset,
            reply: KernelReply::Directory(reply),
        });
    }

    fn releasedir(&mut self, _req: &Request, ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        self.forward(FuseCall::Releasedir {
            ino,
            fh,
            reply: KernelReply::Empty(reply),
        });
    }

    fn create(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let Some(name) = utf8_name(name) else {
            reply.error(libc::EINVAL);
            return;
        };
        self.forward(FuseCall::Create {
            parent,
            name,
            mode: mode & !umask,
            flags,
            reply: KernelReply::Create(reply),
        });
    }

    fn mkdir(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        let Some(name) = utf8_name(name) else {
            reply.error(libc::EINVAL);
            return;
        };
        self.forward(FuseCall::Mkdir {
            parent,
            name,
            mode: mode & !umask,
            reply: KernelReply::Entry(reply),
        });
    }

    fn unlink(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(name) = utf8_name(name) else {
            reply.error(libc::ENOENT);
            return;
        };
        self.forward(FuseCall::Unlink {
            parent,
            name,
            reply: KernelReply::Empty(reply),
        });
    }

    fn rmdir(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(name) = utf8_name(name) else {
            reply.error(libc::ENOENT);
            return;
        };
        self.forward(FuseCall::Rmdir {
            parent,
            name,
            reply: KernelReply::Empty(reply),
        });
    }

    fn rename(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        let (Some(name), Some(newname)) = (utf8_name(name), utf8_name(newname)) else {
            reply.error(libc::EINVAL);
            return;
        };
        self.forward(FuseCall::Rename {
            parent,
            name,
            newparent,
            newname,
            flags,
            reply: KernelReply::Empty(reply),
        });
    }
}
