//! Kernel-facing operation handlers. Each one either answers from the
//! local tables or queues a remote request that holds the reply until the
//! agent answers.

use std::collections::VecDeque;

use crate::config::MAX_NAME;
use crate::mount::{MountTask, OpenHandle};
use crate::reply::{DirEntry, Responder};
use crate::request::{Pending, SetattrStep};
use crate::transport::Transport;
use crate::wire::MountOpcode;

/// One FUSE callback with its arguments and the reply it must consume.
pub enum FuseCall<R> {
    Lookup {
        parent: u64,
        name: String,
        reply: R,
    },
    Forget {
        ino: u64,
        nlookup: u64,
    },
    Getattr {
        ino: u64,
        reply: R,
    },
    Setattr {
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        /// atime or mtime was set
        touch: bool,
        reply: R,
    },
    Open {
        ino: u64,
        flags: i32,
        reply: R,
    },
    Read {
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        reply: R,
    },
    Write {
        ino: u64,
        fh: u64,
        offset: i64,
        data: Vec<u8>,
        reply: R,
    },
    Flush {
        ino: u64,
        fh: u64,
        reply: R,
    },
    Release {
        ino: u64,
        fh: u64,
        reply: R,
    },
    Opendir {
        ino: u64,
        reply: R,
    },
    Readdir {
        ino: u64,
        fh: u64,
        offset: i64,
        reply: R,
    },
    Releasedir {
        ino: u64,
        fh: u64,
        reply: R,
    },
    Create {
        parent: u64,
        name: String,
        mode: u32,
        flags: i32,
        reply: R,
    },
    Mkdir {
        parent: u64,
        name: String,
        mode: u32,
        reply: R,
    },
    Unlink {
        parent: u64,
        name: String,
        reply: R,
    },
    Rmdir {
        parent: u64,
        name: String,
        reply: R,
    },
    Rename {
        parent: u64,
        name: String,
        newparent: u64,
        newname: String,
        flags: u32,
        reply: R,
    },
}

impl<R: Responder> FuseCall<R> {
    pub fn fail(self, errno: i32) {
        match self {
            FuseCall::Forget { .. } => {}
            FuseCall::Lookup { reply, .. }
            | FuseCall::Getattr { reply, .. }
            | FuseCall::Setattr { reply, .. }
            | FuseCall::Open { reply, .. }
            | FuseCall::Read { reply, .. }
            | FuseCall::Write { reply, .. }
            | FuseCall::Flush { reply, .. }
            | FuseCall::Release { reply, .. }
            | FuseCall::Opendir { reply, .. }
            | FuseCall::Readdir { reply, .. }
            | FuseCall::Releasedir { reply, .. }
            | FuseCall::Create { reply, .. }
            | FuseCall::Mkdir { reply, .. }
            | FuseCall::Unlink { reply, .. }
            | FuseCall::Rmdir { reply, .. }
            | FuseCall::Rename { reply, .. } => reply.error(errno),
        }
    }
}

impl<R: Responder, T: Transport> MountTask<R, T> {
    pub(crate) fn execute(&mut self, call: FuseCall<R>) {
        match call {
            FuseCall::Lookup {
                parent,
                name,
                reply,
            } => self.lookup(parent, name, reply),
            FuseCall::Forget { ino, nlookup } => self.inodes.unref(ino, nlookup),
            FuseCall::Getattr { ino, reply } => self.getattr(ino, reply),
            FuseCall::Setattr {
                ino,
                mode,
                uid,
                gid,
                size,
                touch,
                reply,
            } => self.setattr(ino, mode, uid, gid, size, touch, reply),
            FuseCall::Open { ino, flags, reply } => self.open(ino, flags, reply),
            FuseCall::Read {
                ino,
                fh,
                offset,
                size,
                reply,
            } => self.read(ino, fh, offset, size, reply),
            FuseCall::Write {
                ino,
                fh,
                offset,
                data,
                reply,
            } => self.write(ino, fh, offset, &data, reply),
            FuseCall::Flush { fh, reply, .. } => {
                if self.handles.contains_key(&fh) {
                    reply.ok();
                } else {
                    reply.error(libc::EBADF);
                }
            }
            FuseCall::Release { fh, reply, .. } => self.release(fh, reply),
            FuseCall::Opendir { ino, reply } => self.opendir(ino, reply),
            FuseCall::Readdir {
                ino,
                fh,
                offset,
                reply,
            } => self.readdir(ino, fh, offset, reply),
            FuseCall::Releasedir { ino, fh, reply } => self.releasedir(ino, fh, reply),
            FuseCall::Create {
                parent,
                name,
                mode,
                flags,
                reply,
            } => self.create(parent, name, mode, flags, reply),
            FuseCall::Mkdir {
                parent,
                name,
                mode,
                reply,
            } => self.mkdir(parent, name, mode, reply),
            FuseCall::Unlink {
                parent,
                name,
                reply,
            } => self.remove(MountOpcode::Unlink, parent, name, reply),
            FuseCall::Rmdir {
                parent,
                name,
                reply,
            } => self.remove(MountOpcode::Rmdir, parent, name, reply),
            FuseCall::Rename {
                parent,
                name,
                newparent,
                newname,
                flags,
                reply,
            } => self.rename(parent, name, newparent, newname, flags, reply),
        }
    }

    /// Checks shared by every call that creates or removes `name` in
    /// `parent`. Returns the errno to fail with.
    fn check_entry_change(&self, parent: u64, name: &str) -> Result<(), i32> {
        if self.read_only {
            return Err(libc::EROFS);
        }
        if name.len() > MAX_NAME {
            return Err(libc::ENAMETOOLONG);
        }
        let Some(dir) = self.inodes.get(parent) else {
            return Err(libc::ESTALE);
        };
        if !dir.is_dir {
            return Err(libc::ENOTDIR);
        }
        // The synthetic root of a file mount only ever holds the file.
        if !dir.is_remote {
            return Err(libc::EPERM);
        }
        Ok(())
    }

    fn lookup(&mut self, parent: u64, name: String, reply: R) {
        if name.len() > MAX_NAME {
            reply.error(libc::ENAMETOOLONG);
            return;
        }
        let Some(dir) = self.inodes.get(parent) else {
            log::warn!("lookup of '{}' in unknown inode {}", name, parent);
            reply.error(libc::ESTALE);
            return;
        };
        if !dir.is_dir {
            reply.error(libc::ENOTDIR);
            return;
        }
        let dir_is_remote = dir.is_remote;

        let path = match self.inodes.lookup_child(parent, &name) {
            Some(ino) => {
                if let Some(attr) = self.inodes.fresh_attr(ino, self.attr_ttl()) {
                    self.inodes.add_lookup(ino);
                    reply.entry(&self.attr_ttl(), &self.make_attr(ino, &attr), 0);
                    return;
                }
                self.inodes.path(ino)
            }
            None if !dir_is_remote => {
                reply.error(libc::ENOENT);
                return;
            }
            None => self.inodes.child_path(parent, &name),
        };
        let Some(path) = path else {
            reply.error(libc::ESTALE);
            return;
        };
        let pending = Pending::Lookup {
            parent,
            name,
            reply,
        };
        self.send_request(MountOpcode::Lookup, &path, pending, |_| {}, &[]);
    }

    fn getattr(&mut self, ino: u64, reply: R) {
        let Some(inode) = self.inodes.get(ino) else {
            reply.error(libc::ESTALE);
            return;
        };
        if !inode.is_remote {
            reply.attr(&self.entry_ttl(), &self.synthetic_dir_attr());
            return;
        }
        if let Some(attr) = self.inodes.fresh_attr(ino, self.attr_ttl()) {
            reply.attr(&self.attr_ttl(), &self.make_attr(ino, &attr));
            return;
        }
        self.send_stat(ino, reply);
    }

    pub(crate) fn send_stat(&mut self, ino: u64, reply: R) {
        let Some(path) = self.inodes.path(ino) else {
            reply.error(libc::ESTALE);
            return;
        };
        self.send_request(
            MountOpcode::Stat,
            &path,
            Pending::Getattr { ino, reply },
            |_| {},
            &[],
        );
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        touch: bool,
        reply: R,
    ) {
        let Some(inode) = self.inodes.get(ino) else {
            reply.error(libc::ESTALE);
            return;
        };
        if uid.is_some_and(|u| u != self.uid) || gid.is_some_and(|g| g != self.gid) {
            reply.error(libc::EPERM);
            return;
        }
        if !inode.is_remote {
            reply.attr(&self.entry_ttl(), &self.synthetic_dir_attr());
            return;
        }

        let mut steps: VecDeque<SetattrStep> = VecDeque::new();
        if let Some(mode) = mode {
            steps.push_back(SetattrStep::Chmod(mode & 0o7777));
        }
        if let Some(size) = size {
            steps.push_back(SetattrStep::Trunc(size));
        }
        if touch {
            steps.push_back(SetattrStep::Touch);
        }

        let Some(first) = steps.pop_front() else {
            self.getattr(ino, reply);
            return;
        };
        if self.read_only {
            reply.error(libc::EROFS);
            return;
        }
        self.inodes.clear_attr(ino);
        self.send_setattr_step(ino, first, steps, reply);
    }

    /// Issue one link of a setattr chain; the rest follow as each reply
    /// arrives.
    pub(crate) fn send_setattr_step(
        &mut self,
        ino: u64,
        step: SetattrStep,
        remaining: VecDeque<SetattrStep>,
        reply: R,
    ) {
        let Some(path) = self.inodes.path(ino) else {
            reply.error(libc::ESTALE);
            return;
        };
        let pending = Pending::Setattr {
            ino,
            remaining,
            reply,
        };
        self.send_request(
            step.opcode(),
            &path,
            pending,
            |m| match step {
                SetattrStep::Chmod(mode) => {
                    m.add_number(mode);
                }
                SetattrStep::Trunc(size) => {
                    m.add_number64(size);
                }
                SetattrStep::Touch => {}
            },
            &[],
        );
    }

    fn open(&mut self, ino: u64, flags: i32, reply: R) {
        let Some(inode) = self.inodes.get(ino) else {
            reply.error(libc::ESTALE);
            return;
        };
        if inode.is_dir {
            reply.error(libc::EISDIR);
            return;
        }
        let writing = flags & libc::O_ACCMODE != libc::O_RDONLY || flags & libc::O_TRUNC != 0;
        if writing && self.read_only {
            reply.error(libc::EROFS);
            return;
        }
        let Some(path) = self.inodes.path(ino) else {
            reply.error(libc::ESTALE);
            return;
        };
        self.send_request(
            MountOpcode::Open,
            &path,
            Pending::Open { ino, flags, reply },
            |m| {
                m.add_number(flags as u32);
            },
            &[],
        );
    }

    /// Register a new open file handle against `ino`.
    pub(crate) fn open_handle(&mut self, ino: u64, flags: i32) -> u64 {
        let fh = self.alloc_fh();
        self.handles.insert(
            fh,
            OpenHandle {
                ino,
                append: flags & libc::O_APPEND != 0,
            },
        );
        self.inodes.attach_handle(ino, fh);
        self.report_open();
        fh
    }

    fn read(&mut self, ino: u64, fh: u64, offset: i64, size: u32, reply: R) {
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        if !self.handles.contains_key(&fh) {
            reply.error(libc::EBADF);
            return;
        }
        let Some(path) = self.inodes.get(ino).and_then(|_| self.inodes.path(ino)) else {
            reply.error(libc::ESTALE);
            return;
        };
        let size = size.min(self.config.max_read);
        self.send_request(
            MountOpcode::Read,
            &path,
            Pending::Read { ino, size, reply },
            |m| {
                m.add_number64(u64::from(size)).add_number64(offset as u64);
            },
            &[],
        );
    }

    fn write(&mut self, ino: u64, fh: u64, offset: i64, data: &[u8], reply: R) {
        if self.read_only {
            reply.error(libc::EROFS);
            return;
        }
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        let Some(handle) = self.handles.get(&fh).copied() else {
            reply.error(libc::EBADF);
            return;
        };
        let Some(path) = self.inodes.get(ino).and_then(|_| self.inodes.path(ino)) else {
            reply.error(libc::ESTALE);
            return;
        };

        let (opcode, end) = if handle.append {
            (MountOpcode::Append, None)
        } else {
            (MountOpcode::Write, Some(offset as u64))
        };
        let pending = Pending::Write {
            ino,
            offset: end,
            len: data.len() as u64,
            reply,
        };
        self.send_request(
            opcode,
            &path,
            pending,
            |m| {
                m.add_number64(offset as u64);
            },
            data,
        );
    }

    fn release(&mut self, fh: u64, reply: R) {
        let Some(handle) = self.handles.remove(&fh) else {
            log::warn!("release of unknown handle {}", fh);
            reply.ok();
            return;
        };
        // Resolve before detaching: the last handle may release the inode.
        let path = self.inodes.path(handle.ino);
        self.inodes.detach_handle(handle.ino, fh);
        if let Some(path) = path {
            self.send_notify(MountOpcode::Close, &path);
        }
        self.report_close();
        reply.ok();
    }

    fn opendir(&mut self, ino: u64, reply: R) {
        let Some(inode) = self.inodes.get(ino) else {
            reply.error(libc::ESTALE);
            return;
        };
        if !inode.is_dir {
            reply.error(libc::ENOTDIR);
            return;
        }
        if !inode.is_remote {
            let fh = self.seensets.create(ino);
            self.report_open();
            reply.opened(fh, 0);
            return;
        }
        let Some(path) = self.inodes.path(ino) else {
            reply.error(libc::ESTALE);
            return;
        };
        self.send_request(
            MountOpcode::Opendir,
            &path,
            Pending::Opendir { ino, reply },
            |_| {},
            &[],
        );
    }

    fn readdir(&mut self, ino: u64, fh: u64, offset: i64, reply: R) {
        let Some(set) = self.seensets.get_mut(fh) else {
            reply.error(libc::EBADF);
            return;
        };
        if offset == 0 {
            set.reset();
        }
        let complete = set.is_complete();
        let Some(dir) = self.inodes.get(ino) else {
            reply.error(libc::ESTALE);
            return;
        };

        if !dir.is_remote {
            self.readdir_synthetic(ino, offset, reply);
            return;
        }
        if complete {
            reply.directory(&[]);
            return;
        }
        self.send_readdir(fh, ino, offset, reply);
    }

    pub(crate) fn send_readdir(&mut self, fh: u64, ino: u64, cookie: i64, reply: R) {
        let Some(path) = self.inodes.path(ino) else {
            reply.error(libc::ESTALE);
            return;
        };
        let budget = u64::from(self.config.readdir_page);
        let pending = Pending::Readdir {
            fh,
            ino,
            cookie,
            reply,
        };
        self.send_request(
            MountOpcode::Readdir,
            &path,
            pending,
            |m| {
                m.add_number64(budget).add_number64(cookie as u64);
            },
            &[],
        );
    }

    /// Listing of the local directory holding a single-file mount.
    fn readdir_synthetic(&mut self, ino: u64, offset: i64, reply: R) {
        let mut entries = vec![
            DirEntry {
                ino,
                offset: 1,
                kind: fuser::FileType::Directory,
                name: ".".to_string(),
            },
            DirEntry {
                ino,
                offset: 2,
                kind: fuser::FileType::Directory,
                name: "..".to_string(),
            },
        ];
        if let Some(map) = self.inodes.dirmap(ino) {
            for (name, &child) in map {
                let kind = match self.inodes.get(child) {
                    Some(c) if c.is_dir => fuser::FileType::Directory,
                    _ => fuser::FileType::RegularFile,
                };
                entries.push(DirEntry {
                    ino: child,
                    offset: entries.len() as i64 + 1,
                    kind,
                    name: name.clone(),
                });
            }
        }
        let skip = (offset.max(0) as usize).min(entries.len());
        reply.directory(&entries[skip..]);
    }

    fn releasedir(&mut self, ino: u64, fh: u64, reply: R) {
        let Some(set) = self.seensets.destroy(fh) else {
            log::warn!("releasedir of unknown handle {}", fh);
            reply.ok();
            return;
        };
        self.report_close();

        let Some(dir) = self.inodes.get(ino) else {
            reply.ok();
            return;
        };
        if !dir.is_remote {
            reply.ok();
            return;
        }

        if set.is_complete() {
            // The listing saw everything the agent has; anything else we
            // still map was deleted remotely.
            let gone: Vec<String> = self
                .inodes
                .dirmap(ino)
                .map(|map| {
                    map.iter()
                        .filter(|(name, child)| {
                            !set.contains(name)
                                && self
                                    .inodes
                                    .get(**child)
                                    .is_some_and(|c| c.handles.is_empty())
                        })
                        .map(|(name, _)| name.clone())
                        .collect()
                })
                .unwrap_or_default();
            for name in gone {
                log::debug!("pruning '{}' from directory {}", name, ino);
                self.inodes.invalidate(ino, &name);
            }
        }

        if let Some(path) = self.inodes.path(ino) {
            self.send_notify(MountOpcode::Closedir, &path);
        }
        reply.ok();
    }

    fn create(&mut self, parent: u64, name: String, mode: u32, flags: i32, reply: R) {
        if let Err(errno) = self.check_entry_change(parent, &name) {
            reply.error(errno);
            return;
        }
        if flags & libc::O_EXCL != 0 && self.inodes.lookup_child(parent, &name).is_some() {
            reply.error(libc::EEXIST);
            return;
        }
        let Some(path) = self.inodes.child_path(parent, &name) else {
            reply.error(libc::ESTALE);
            return;
        };
        let pending = Pending::Create {
            parent,
            name,
            path: path.clone(),
            flags,
            reply,
        };
        self.send_request(
            MountOpcode::Create,
            &path,
            pending,
            |m| {
                m.add_number(mode & 0o7777).add_number(flags as u32);
            },
            &[],
        );
    }

    fn mkdir(&mut self, parent: u64, name: String, mode: u32, reply: R) {
        if let Err(errno) = self.check_entry_change(parent, &name) {
            reply.error(errno);
            return;
        }
        if self.inodes.lookup_child(parent, &name).is_some() {
            reply.error(libc::EEXIST);
            return;
        }
        let Some(path) = self.inodes.child_path(parent, &name) else {
            reply.error(libc::ESTALE);
            return;
        };
        let pending = Pending::Mkdir {
            parent,
            name,
            reply,
        };
        self.send_request(
            MountOpcode::Mkdir,
            &path,
            pending,
            |m| {
                m.add_number(mode & 0o7777);
            },
            &[],
        );
    }

    fn remove(&mut self, opcode: MountOpcode, parent: u64, name: String, reply: R) {
        if let Err(errno) = self.check_entry_change(parent, &name) {
            reply.error(errno);
            return;
        }
        let Some(path) = self.inodes.child_path(parent, &name) else {
            reply.error(libc::ESTALE);
            return;
        };
        let pending = Pending::Unlink {
            parent,
            name,
            reply,
        };
        self.send_request(opcode, &path, pending, |_| {}, &[]);
    }

    fn rename(
        &mut self,
        parent: u64,
        name: String,
        newparent: u64,
        newname: String,
        flags: u32,
        reply: R,
    ) {
        // RENAME_NOREPLACE and RENAME_EXCHANGE have no remote counterpart.
        if flags != 0 {
            reply.error(libc::EINVAL);
            return;
        }
        if let Err(errno) = self
            .check_entry_change(parent, &name)
            .and_then(|_| self.check_entry_change(newparent, &newname))
        {
            reply.error(errno);
            return;
        }
        let (Some(from), Some(to)) = (
            self.inodes.child_path(parent, &name),
            self.inodes.child_path(newparent, &newname),
        ) else {
            reply.error(libc::ESTALE);
            return;
        };
        let pending = Pending::Rename {
            parent,
            name,
            newparent,
            newname,
            reply,
        };
        self.send_request(
            MountOpcode::Rename,
            &from,
            pending,
            |m| {
                m.add_string(&to);
            },
            &[],
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MountConfig;
    use crate::inode::ROOT_INO;
    use crate::mount::MountState;
    use crate::test_support::{dir_attr, file_attr, Outcome, Recorder, ScriptedAgent};

    fn create(agent: &mut ScriptedAgent, rec: &Recorder, name: &str) -> (u64, u64) {
        agent.call(FuseCall::Create {
            parent: ROOT_INO,
            name: name.to_string(),
            mode: 0o644,
            flags: libc::O_CREAT | libc::O_WRONLY,
            reply: rec.reply(),
        });
        let req = agent.reply_attr(file_attr(0));
        assert_eq!(req.opcode, MountOpcode::Create);
        assert_eq!(req.path, name);
        match rec.last() {
            Some(Outcome::Created { ino, fh }) => (ino, fh),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_create_write_rename_lookup_keeps_identity() {
        let mut agent = ScriptedAgent::mounted(MountConfig::default());
        let rec = Recorder::new();

        let (ino, fh) = create(&mut agent, &rec, "a.txt");
        assert_eq!(agent.task.users(), 1);

        agent.call(FuseCall::Write {
            ino,
            fh,
            offset: 0,
            data: b"hi".to_vec(),
            reply: rec.reply(),
        });
        let req = agent.reply(0, |m| {
            m.add_number64(2);
        });
        assert_eq!(req.opcode, MountOpcode::Write);
        let mut fields = req.fields();
        assert_eq!(fields.parse_number64().unwrap(), 0);
        assert_eq!(fields.remaining(), b"hi");
        assert_eq!(rec.last(), Some(Outcome::Written(2)));

        agent.call(FuseCall::Release {
            ino,
            fh,
            reply: rec.reply(),
        });
        assert_eq!(rec.last(), Some(Outcome::Ok));
        assert_eq!(agent.reply_ok().opcode, MountOpcode::Close);
        assert_eq!(agent.task.users(), 0);

        agent.call(FuseCall::Rename {
            parent: ROOT_INO,
            name: "a.txt".to_string(),
            newparent: ROOT_INO,
            newname: "b.txt".to_string(),
            flags: 0,
            reply: rec.reply(),
        });
        let req = agent.reply_ok();
        assert_eq!(req.opcode, MountOpcode::Rename);
        assert_eq!(req.path, "a.txt");
        assert_eq!(req.fields().parse_string().unwrap(), "b.txt");

        agent.call(FuseCall::Lookup {
            parent: ROOT_INO,
            name: "b.txt".to_string(),
            reply: rec.reply(),
        });
        assert!(agent.outstanding().is_empty(), "lookup went to the network");
        assert_eq!(
            rec.last(),
            Some(Outcome::Entry {
                ino,
                kind: fuser::FileType::RegularFile,
                size: 2
            })
        );
        agent.task.inodes().verify().unwrap();
        rec.assert_all_answered();
    }

    #[test]
    fn test_lookup_miss_goes_remote_once() {
        let mut agent = ScriptedAgent::mounted(MountConfig::default());
        let rec = Recorder::new();
        agent.call(FuseCall::Lookup {
            parent: ROOT_INO,
            name: "src".to_string(),
            reply: rec.reply(),
        });
        assert_eq!(rec.answered(), 0);
        let req = agent.reply_attr(dir_attr());
        assert_eq!(req.opcode, MountOpcode::Lookup);
        assert_eq!(req.path, "src");

        let ino = match rec.last() {
            Some(Outcome::Entry { ino, kind, .. }) => {
                assert_eq!(kind, fuser::FileType::Directory);
                ino
            }
            other => panic!("unexpected {:?}", other),
        };

        agent.call(FuseCall::Lookup {
            parent: ino,
            name: "main.rs".to_string(),
            reply: rec.reply(),
        });
        assert_eq!(agent.peek().path, "src/main.rs");
        agent.reply_error(libc::ENOENT);
        assert_eq!(rec.last(), Some(Outcome::Error(libc::ENOENT)));
        rec.assert_all_answered();
    }

    #[test]
    fn test_remote_enoent_invalidates_mapped_name() {
        let mut agent = ScriptedAgent::mounted(MountConfig {
            attr_timeout_secs: 0.0,
            ..Default::default()
        });
        let rec = Recorder::new();
        agent.call(FuseCall::Lookup {
            parent: ROOT_INO,
            name: "gone".to_string(),
            reply: rec.reply(),
        });
        agent.reply_attr(file_attr(1));
        let Some(Outcome::Entry { ino, .. }) = rec.last() else {
            panic!("lookup failed");
        };

        // Zero attr timeout: the second lookup must revalidate.
        agent.call(FuseCall::Lookup {
            parent: ROOT_INO,
            name: "gone".to_string(),
            reply: rec.reply(),
        });
        agent.reply_error(libc::ENOENT);
        assert_eq!(agent.task.inodes().lookup_child(ROOT_INO, "gone"), None);

        agent.call(FuseCall::Getattr {
            ino,
            reply: rec.reply(),
        });
        assert_eq!(rec.last(), Some(Outcome::Error(libc::ESTALE)));
        agent.task.inodes().verify().unwrap();
    }

    #[test]
    fn test_unknown_inode_is_stale() {
        let mut agent = ScriptedAgent::mounted(MountConfig::default());
        let rec = Recorder::new();
        agent.call(FuseCall::Getattr {
            ino: 999,
            reply: rec.reply(),
        });
        agent.call(FuseCall::Open {
            ino: 999,
            flags: libc::O_RDONLY,
            reply: rec.reply(),
        });
        assert_eq!(rec.outcomes(), vec![Outcome::Error(libc::ESTALE); 2]);
        assert!(agent.outstanding().is_empty());
    }

    #[test]
    fn test_read_only_rejects_mutations() {
        let mut agent = ScriptedAgent::mounted(MountConfig {
            read_only: true,
            ..Default::default()
        });
        let rec = Recorder::new();
        agent.call(FuseCall::Mkdir {
            parent: ROOT_INO,
            name: "d".to_string(),
            mode: 0o755,
            reply: rec.reply(),
        });
        agent.call(FuseCall::Unlink {
            parent: ROOT_INO,
            name: "a".to_string(),
            reply: rec.reply(),
        });
        agent.call(FuseCall::Setattr {
            ino: ROOT_INO,
            mode: Some(0o700),
            uid: None,
            gid: None,
            size: None,
            touch: false,
            reply: rec.reply(),
        });
        assert_eq!(rec.outcomes(), vec![Outcome::Error(libc::EROFS); 3]);
        assert!(agent.outstanding().is_empty());
    }

    #[test]
    fn test_setattr_chains_steps_then_stats() {
        let mut agent = ScriptedAgent::mounted(MountConfig::default());
        let rec = Recorder::new();
        let (ino, _fh) = create(&mut agent, &rec, "a.txt");

        agent.call(FuseCall::Setattr {
            ino,
            mode: Some(0o600),
            uid: None,
            gid: None,
            size: Some(5),
            touch: true,
            reply: rec.reply(),
        });
        let chmod = agent.reply_ok();
        assert_eq!(chmod.opcode, MountOpcode::Chmod);
        assert_eq!(chmod.fields().parse_number().unwrap(), 0o600);
        let trunc = agent.reply_ok();
        assert_eq!(trunc.opcode, MountOpcode::Trunc);
        assert_eq!(trunc.fields().parse_number64().unwrap(), 5);
        assert_eq!(agent.reply_ok().opcode, MountOpcode::Touch);

        let mut attr = file_attr(5);
        attr.mode = libc::S_IFREG | 0o600;
        assert_eq!(agent.reply_attr(attr).opcode, MountOpcode::Stat);
        assert_eq!(
            rec.last(),
            Some(Outcome::Attr {
                ino,
                kind: fuser::FileType::RegularFile,
                size: 5,
                perm: 0o600
            })
        );
        rec.assert_all_answered();
    }

    #[test]
    fn test_setattr_failure_stops_chain() {
        let mut agent = ScriptedAgent::mounted(MountConfig::default());
        let rec = Recorder::new();
        let (ino, _fh) = create(&mut agent, &rec, "a.txt");

        agent.call(FuseCall::Setattr {
            ino,
            mode: Some(0o600),
            uid: None,
            gid: None,
            size: Some(0),
            touch: false,
            reply: rec.reply(),
        });
        agent.reply_error(libc::EACCES);
        assert_eq!(rec.last(), Some(Outcome::Error(libc::EACCES)));
        assert!(agent.outstanding().is_empty());
    }

    #[test]
    fn test_setattr_ownership_change_is_refused() {
        let mut agent = ScriptedAgent::mounted(MountConfig::default());
        let rec = Recorder::new();
        let uid = agent.task.uid;
        agent.call(FuseCall::Setattr {
            ino: ROOT_INO,
            mode: None,
            uid: Some(uid.wrapping_add(1)),
            gid: None,
            size: None,
            touch: false,
            reply: rec.reply(),
        });
        assert_eq!(rec.last(), Some(Outcome::Error(libc::EPERM)));
    }

    #[test]
    fn test_append_handle_uses_append_opcode() {
        let mut agent = ScriptedAgent::mounted(MountConfig::default());
        let rec = Recorder::new();
        agent.call(FuseCall::Lookup {
            parent: ROOT_INO,
            name: "log".to_string(),
            reply: rec.reply(),
        });
        agent.reply_attr(file_attr(10));
        let Some(Outcome::Entry { ino, .. }) = rec.last() else {
            panic!("lookup failed");
        };

        agent.call(FuseCall::Open {
            ino,
            flags: libc::O_WRONLY | libc::O_APPEND,
            reply: rec.reply(),
        });
        let open = agent.reply_ok();
        assert_eq!(
            open.fields().parse_number().unwrap(),
            (libc::O_WRONLY | libc::O_APPEND) as u32
        );
        let Some(Outcome::Opened(fh)) = rec.last() else {
            panic!("open failed");
        };

        agent.call(FuseCall::Write {
            ino,
            fh,
            offset: 10,
            data: b"more".to_vec(),
            reply: rec.reply(),
        });
        let req = agent.reply(0, |m| {
            m.add_number64(4);
        });
        assert_eq!(req.opcode, MountOpcode::Append);
        assert_eq!(rec.last(), Some(Outcome::Written(4)));
    }

    #[test]
    fn test_read_larger_than_requested_is_eio() {
        let mut agent = ScriptedAgent::mounted(MountConfig::default());
        let rec = Recorder::new();
        let (ino, fh) = create(&mut agent, &rec, "a.txt");

        agent.call(FuseCall::Read {
            ino,
            fh,
            offset: 0,
            size: 4,
            reply: rec.reply(),
        });
        let req = agent.reply(0, |m| {
            m.add_bytes(b"toolong");
        });
        let mut fields = req.fields();
        assert_eq!(fields.parse_number64().unwrap(), 4);
        assert_eq!(fields.parse_number64().unwrap(), 0);
        assert_eq!(rec.last(), Some(Outcome::Error(libc::EIO)));
        assert!(agent.task.state().is_active());

        agent.call(FuseCall::Read {
            ino,
            fh,
            offset: 2,
            size: 4,
            reply: rec.reply(),
        });
        agent.reply(0, |m| {
            m.add_bytes(b"ok");
        });
        assert_eq!(rec.last(), Some(Outcome::Data(b"ok".to_vec())));
    }

    #[test]
    fn test_bad_handles_and_names() {
        let mut agent = ScriptedAgent::mounted(MountConfig::default());
        let rec = Recorder::new();
        agent.call(FuseCall::Read {
            ino: ROOT_INO,
            fh: 42,
            offset: 0,
            size: 1,
            reply: rec.reply(),
        });
        agent.call(FuseCall::Flush {
            ino: ROOT_INO,
            fh: 42,
            reply: rec.reply(),
        });
        agent.call(FuseCall::Lookup {
            parent: ROOT_INO,
            name: "x".repeat(MAX_NAME + 1),
            reply: rec.reply(),
        });
        agent.call(FuseCall::Rename {
            parent: ROOT_INO,
            name: "a".to_string(),
            newparent: ROOT_INO,
            newname: "b".to_string(),
            flags: libc::RENAME_NOREPLACE,
            reply: rec.reply(),
        });
        assert_eq!(
            rec.outcomes(),
            vec![
                Outcome::Error(libc::EBADF),
                Outcome::Error(libc::EBADF),
                Outcome::Error(libc::ENAMETOOLONG),
                Outcome::Error(libc::EINVAL),
            ]
        );
    }

    #[test]
    fn test_unlink_and_rmdir_update_dirmap() {
        let mut agent = ScriptedAgent::mounted(MountConfig::default());
        let rec = Recorder::new();
        agent.call(FuseCall::Mkdir {
            parent: ROOT_INO,
            name: "d".to_string(),
            mode: 0o755,
            reply: rec.reply(),
        });
        let req = agent.reply_attr(dir_attr());
        assert_eq!(req.fields().parse_number().unwrap(), 0o755);
        let (_ino, fh) = create(&mut agent, &rec, "f");

        agent.call(FuseCall::Unlink {
            parent: ROOT_INO,
            name: "f".to_string(),
            reply: rec.reply(),
        });
        assert_eq!(agent.reply_ok().opcode, MountOpcode::Unlink);
        agent.call(FuseCall::Rmdir {
            parent: ROOT_INO,
            name: "d".to_string(),
            reply: rec.reply(),
        });
        assert_eq!(agent.reply_ok().opcode, MountOpcode::Rmdir);

        assert_eq!(agent.task.inodes().lookup_child(ROOT_INO, "f"), None);
        assert_eq!(agent.task.inodes().lookup_child(ROOT_INO, "d"), None);
        agent.task.inodes().verify().unwrap();

        // The open handle still works after unlink.
        agent.call(FuseCall::Flush {
            ino: 0,
            fh,
            reply: rec.reply(),
        });
        assert_eq!(rec.last(), Some(Outcome::Ok));
    }

    #[test]
    fn test_cancel_answers_everything_in_flight() {
        let mut agent = ScriptedAgent::mounted(MountConfig::default());
        let rec = Recorder::new();
        for name in ["a", "b", "c"] {
            agent.call(FuseCall::Lookup {
                parent: ROOT_INO,
                name: name.to_string(),
                reply: rec.reply(),
            });
        }
        agent.reply_attr(file_attr(1));
        assert_eq!(rec.answered(), 1);

        agent.task.cancel();
        assert_eq!(agent.task.state(), MountState::Unmounting);
        assert_eq!(rec.answered(), 3);
        assert_eq!(
            &rec.outcomes()[1..],
            &[Outcome::Error(libc::ENOTCONN), Outcome::Error(libc::ENOTCONN)]
        );

        agent.call(FuseCall::Getattr {
            ino: ROOT_INO,
            reply: rec.reply(),
        });
        assert_eq!(rec.last(), Some(Outcome::Error(libc::ENOTCONN)));
        rec.assert_all_answered();
    }

    #[test]
    fn test_file_mount_root_is_local() {
        let mut agent = ScriptedAgent::mounted_file(MountConfig::default());
        let rec = Recorder::new();

        agent.call(FuseCall::Getattr {
            ino: ROOT_INO,
            reply: rec.reply(),
        });
        agent.call(FuseCall::Lookup {
            parent: ROOT_INO,
            name: "other".to_string(),
            reply: rec.reply(),
        });
        agent.call(FuseCall::Create {
            parent: ROOT_INO,
            name: "new".to_string(),
            mode: 0o644,
            flags: libc::O_CREAT,
            reply: rec.reply(),
        });
        assert!(agent.outstanding().is_empty());
        let outcomes = rec.outcomes();
        assert!(matches!(
            outcomes[0],
            Outcome::Attr {
                ino: ROOT_INO,
                kind: fuser::FileType::Directory,
                ..
            }
        ));
        assert_eq!(outcomes[1], Outcome::Error(libc::ENOENT));
        assert_eq!(outcomes[2], Outcome::Error(libc::EPERM));

        agent.call(FuseCall::Lookup {
            parent: ROOT_INO,
            name: "project".to_string(),
            reply: rec.reply(),
        });
        let req = agent.reply_attr(file_attr(3));
        assert_eq!(req.path, "");
        assert!(matches!(rec.last(), Some(Outcome::Entry { size: 3, .. })));
    }
}
