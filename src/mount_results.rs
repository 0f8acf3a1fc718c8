//! Completion of queued requests from the agent's result frames.

use fuser::FileType;

use crate::config::MAX_NAME;
use crate::error::{MountError, Result};
use crate::mount::MountTask;
use crate::reply::{DirEntry, Responder};
use crate::request::Pending;
use crate::transport::Transport;
use crate::wire::{MountOpcode, RemoteAttr, Unmarshaler};

/// Names the agent may hand back in a listing.
pub(crate) fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_NAME
        && name != "."
        && name != ".."
        && !name.bytes().any(|b| b == b'/' || b < 0x20 || b == 0x7f)
}

/// Hand back the parsed value, or fail the held reply with EIO and
/// propagate the protocol error.
fn parsed<V, R: Responder>(value: Result<V>, reply: R) -> Result<(V, R)> {
    match value {
        Ok(v) => Ok((v, reply)),
        Err(e) => {
            reply.error(libc::EIO);
            Err(e)
        }
    }
}

struct Listed {
    name: String,
    is_dir: bool,
    cookie: u64,
}

fn parse_page(unm: &mut Unmarshaler<'_>) -> Result<(bool, Vec<Listed>)> {
    let last = unm.parse_number()? != 0;
    let mut entries = Vec::new();
    while unm.remaining_len() > 0 {
        let mode = unm.parse_number()?;
        let cookie = unm.parse_number64()?;
        let name = unm.parse_string()?;
        entries.push(Listed {
            name,
            is_dir: mode & libc::S_IFMT == libc::S_IFDIR,
            cookie,
        });
    }
    Ok((last, entries))
}

impl<R: Responder, T: Transport> MountTask<R, T> {
    /// A RUNNING-status frame: complete the request at the head of the
    /// queue.
    pub(crate) fn handle_result(&mut self, unm: &mut Unmarshaler<'_>) -> Result<()> {
        let seq = unm.parse_number()?;
        let errno = unm.parse_number()? as i32;
        let req = self.queue.pop(seq)?;
        log::debug!(
            "mount {}: <- #{} {:?} errno {}",
            self.task_id,
            seq,
            req.opcode,
            errno
        );

        if errno != 0 {
            self.result_error(req.opcode, req.pending, errno);
            return Ok(());
        }

        match req.pending {
            Pending::Lookup {
                parent,
                name,
                reply,
            } => {
                let (attr, reply) = parsed(RemoteAttr::parse(unm), reply)?;
                if self.inodes.get(parent).is_none() {
                    reply.error(libc::ESTALE);
                    return Ok(());
                }
                let ino = self.inodes.add_inode(parent, &name, attr.is_dir());
                self.inodes.set_attr(ino, attr);
                self.inodes.add_lookup(ino);
                reply.entry(&self.attr_ttl(), &self.make_attr(ino, &attr), 0);
            }
            Pending::Getattr { ino, reply } => {
                let (attr, reply) = parsed(RemoteAttr::parse(unm), reply)?;
                self.inodes.set_attr(ino, attr);
                reply.attr(&self.attr_ttl(), &self.make_attr(ino, &attr));
            }
            Pending::Setattr {
                ino,
                mut remaining,
                reply,
            } => match remaining.pop_front() {
                Some(step) => self.send_setattr_step(ino, step, remaining, reply),
                None => self.send_stat(ino, reply),
            },
            Pending::Open { ino, flags, reply } => {
                if self.inodes.get(ino).is_none() {
                    // Keep the agent's open count balanced.
                    if let Some(path) = self.inodes.path(ino) {
                        self.send_notify(MountOpcode::Close, &path);
                    }
                    reply.error(libc::ESTALE);
                    return Ok(());
                }
                if flags & libc::O_TRUNC != 0 {
                    self.inodes.clear_attr(ino);
                }
                let fh = self.open_handle(ino, flags);
                reply.opened(fh, 0);
            }
            Pending::Read { ino, size, reply } => {
                let data = unm.remaining();
                if data.len() > size as usize {
                    log::warn!(
                        "mount {}: read of inode {} returned {} bytes for {} requested",
                        self.task_id,
                        ino,
                        data.len(),
                        size
                    );
                    reply.error(libc::EIO);
                    return Ok(());
                }
                reply.data(data);
            }
            Pending::Write {
                ino,
                offset,
                len,
                reply,
            } => {
                let (written, reply) = parsed(unm.parse_number64(), reply)?;
                if written > len {
                    reply.error(libc::EIO);
                    return Err(MountError::Protocol(format!(
                        "write of {} bytes reported {} written",
                        len, written
                    )));
                }
                match offset {
                    Some(offset) => self.inodes.note_write(ino, offset.saturating_add(written)),
                    None => self.inodes.clear_attr(ino),
                }
                reply.written(written.min(u64::from(u32::MAX)) as u32);
            }
            Pending::Create {
                parent,
                name,
                path,
                flags,
                reply,
            } => {
                let (attr, reply) = parsed(RemoteAttr::parse(unm), reply)?;
                if self.inodes.get(parent).is_none() {
                    // The agent opened the new file; close it again.
                    self.send_notify(MountOpcode::Close, &path);
                    reply.error(libc::ESTALE);
                    return Ok(());
                }
                let ino = self.inodes.add_inode(parent, &name, false);
                self.inodes.set_attr(ino, attr);
                self.inodes.add_lookup(ino);
                let fh = self.open_handle(ino, flags);
                reply.created(&self.attr_ttl(), &self.make_attr(ino, &attr), 0, fh, 0);
            }
            Pending::Mkdir {
                parent,
                name,
                reply,
            } => {
                let (attr, reply) = parsed(RemoteAttr::parse(unm), reply)?;
                if self.inodes.get(parent).is_none() {
                    reply.error(libc::ESTALE);
                    return Ok(());
                }
                let ino = self.inodes.add_inode(parent, &name, true);
                self.inodes.set_attr(ino, attr);
                self.inodes.add_lookup(ino);
                reply.entry(&self.attr_ttl(), &self.make_attr(ino, &attr), 0);
            }
            Pending::Unlink {
                parent,
                name,
                reply,
            } => {
                self.inodes.unlink(parent, &name);
                reply.ok();
            }
            Pending::Rename {
                parent,
                name,
                newparent,
                newname,
                reply,
            } => {
                self.inodes.rename(parent, &name, newparent, &newname);
                reply.ok();
            }
            Pending::Opendir { ino, reply } => {
                let fh = self.seensets.create(ino);
                self.report_open();
                reply.opened(fh, 0);
            }
            Pending::Readdir {
                fh,
                ino,
                cookie,
                reply,
            } => {
                let (page, reply) = parsed(parse_page(unm), reply)?;
                self.readdir_result(fh, ino, cookie, page, reply);
            }
            Pending::Notify => {}
        }
        Ok(())
    }

    fn result_error(&mut self, opcode: MountOpcode, pending: Pending<R>, errno: i32) {
        match pending {
            Pending::Lookup {
                parent,
                name,
                reply,
            } => {
                if errno == libc::ENOENT && self.inodes.invalidate(parent, &name).is_some() {
                    log::debug!("'{}' vanished from directory {}", name, parent);
                }
                reply.error(errno);
            }
            Pending::Getattr { ino, reply } => {
                if errno == libc::ENOENT {
                    let linked = self
                        .inodes
                        .get(ino)
                        .filter(|i| i.linked)
                        .map(|i| (i.parent, i.name.clone()));
                    if let Some((parent, name)) = linked {
                        self.inodes.invalidate(parent, &name);
                    }
                }
                reply.error(errno);
            }
            Pending::Notify => {
                log::debug!("mount {}: {:?} failed with {}", self.task_id, opcode, errno);
            }
            other => other.fail(errno),
        }
    }

    fn readdir_result(
        &mut self,
        fh: u64,
        ino: u64,
        cookie: i64,
        page: (bool, Vec<Listed>),
        reply: R,
    ) {
        let (last, listed) = page;
        let Some(set) = self.seensets.get(fh) else {
            reply.error(libc::EBADF);
            return;
        };
        if self.inodes.get(ino).is_none() {
            reply.error(libc::ESTALE);
            return;
        }

        let next_cookie = listed.last().map(|l| l.cookie as i64);
        let mut fresh: Vec<Listed> = Vec::new();
        for entry in listed {
            if !valid_name(&entry.name) {
                log::debug!("skipping invalid name {:?}", entry.name);
                continue;
            }
            if set.contains(&entry.name) || fresh.iter().any(|f| f.name == entry.name) {
                continue;
            }
            fresh.push(entry);
        }

        if fresh.is_empty() {
            match next_cookie {
                // Whole page already returned: ask for the next one.
                Some(next) if !last && next != cookie => {
                    self.send_readdir(fh, ino, next, reply);
                }
                _ => {
                    if last {
                        if let Some(set) = self.seensets.get_mut(fh) {
                            set.mark_complete();
                        }
                    } else {
                        log::warn!(
                            "mount {}: empty listing page for {}, ending stream",
                            self.task_id,
                            ino
                        );
                    }
                    reply.directory(&[]);
                }
            }
            return;
        }

        let entries: Vec<DirEntry> = fresh
            .iter()
            .map(|entry| DirEntry {
                ino: self.inodes.add_inode(ino, &entry.name, entry.is_dir),
                offset: entry.cookie as i64,
                kind: if entry.is_dir {
                    FileType::Directory
                } else {
                    FileType::RegularFile
                },
                name: entry.name.clone(),
            })
            .collect();
        let accepted = reply.directory(&entries);

        if let Some(set) = self.seensets.get_mut(fh) {
            for entry in &entries[..accepted] {
                set.insert(&entry.name);
            }
            if last && accepted == entries.len() {
                set.mark_complete();
            }
        }
    }
}
