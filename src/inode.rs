use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use crate::wire::RemoteAttr;

pub const ROOT_INO: u64 = 1;

/// Child name to inode number within one directory. The table owns the
/// inodes; entries here are indices into it.
pub type Dirmap = BTreeMap<String, u64>;

#[derive(Debug, Clone, Copy)]
struct CachedAttr {
    attr: RemoteAttr,
    fetched: Instant,
}

#[derive(Debug, Clone)]
pub struct Inode {
    pub ino: u64,
    pub parent: u64,
    /// Last known leaf name
    pub name: String,
    pub is_dir: bool,
    pub is_remote: bool,
    pub is_invalid: bool,
    /// Kernel lookup references plus one while linked into a Dirmap
    pub refcount: u64,
    pub linked: bool,
    /// Open file handles issued against this inode
    pub handles: Vec<u64>,
    attr: Option<CachedAttr>,
}

impl Inode {
    fn new(ino: u64, parent: u64, name: &str, is_dir: bool, is_remote: bool) -> Self {
        Self {
            ino,
            parent,
            name: name.to_string(),
            is_dir,
            is_remote,
            is_invalid: false,
            refcount: 0,
            linked: false,
            handles: Vec::new(),
            attr: None,
        }
    }
}

pub struct InodeTable {
    next_ino: u64,
    inodes: HashMap<u64, Inode>,
    dirs: HashMap<u64, Dirmap>,
    /// Inode standing for the remote source root; its own name is not part
    /// of remote paths.
    remote_root: u64,
}

impl InodeTable {
    /// Table for a directory source: the mount root is the remote root.
    pub fn new() -> Self {
        let mut root = Inode::new(ROOT_INO, ROOT_INO, "", true, true);
        root.refcount = 1;

        let mut inodes = HashMap::new();
        inodes.insert(ROOT_INO, root);
        let mut dirs = HashMap::new();
        dirs.insert(ROOT_INO, Dirmap::new());

        Self {
            next_ino: ROOT_INO + 1,
            inodes,
            dirs,
            remote_root: ROOT_INO,
        }
    }

    /// Table for a single-file source: a synthetic root directory holding
    /// one remote entry called `name`.
    pub fn new_file_mount(name: &str) -> Self {
        let mut table = Self::new();
        if let Some(root) = table.inodes.get_mut(&ROOT_INO) {
            root.is_remote = false;
        }
        let ino = table.add_inode(ROOT_INO, name, false);
        table.remote_root = ino;
        table
    }

    pub fn remote_root(&self) -> u64 {
        self.remote_root
    }

    /// Live, non-revoked inode.
    pub fn get(&self, ino: u64) -> Option<&Inode> {
        self.inodes.get(&ino).filter(|i| !i.is_invalid)
    }

    pub fn get_mut(&mut self, ino: u64) -> Option<&mut Inode> {
        self.inodes.get_mut(&ino).filter(|i| !i.is_invalid)
    }

    /// Any inode still in the table, including revoked ones.
    pub fn get_any(&self, ino: u64) -> Option<&Inode> {
        self.inodes.get(&ino)
    }

    pub fn contains(&self, ino: u64) -> bool {
        self.inodes.contains_key(&ino)
    }

    pub fn len(&self) -> usize {
        self.inodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inodes.is_empty()
    }

    pub fn dirmap(&self, dir: u64) -> Option<&Dirmap> {
        self.dirs.get(&dir)
    }

    pub fn lookup_child(&self, dir: u64, name: &str) -> Option<u64> {
        self.dirs.get(&dir)?.get(name).copied()
    }

    /// Allocate a fresh identity, registered in the table only.
    pub fn create_inode(&mut self, parent: u64, name: &str, is_dir: bool, is_remote: bool) -> u64 {
        let ino = self.next_ino;
        self.next_ino += 1;
        self.inodes
            .insert(ino, Inode::new(ino, parent, name, is_dir, is_remote));
        if is_dir {
            self.dirs.entry(ino).or_default();
        }
        ino
    }

    /// Map `name` in `dir` to an inode, creating a remote one if the name is
    /// not mapped yet. An existing mapping is returned unchanged.
    pub fn add_inode(&mut self, dir: u64, name: &str, is_dir: bool) -> u64 {
        if let Some(ino) = self.lookup_child(dir, name) {
            self.set_kind(ino, is_dir);
            return ino;
        }
        let ino = self.create_inode(dir, name, is_dir, true);
        self.link(dir, name, ino);
        ino
    }

    /// The remote entry may have been replaced by one of the other type.
    fn set_kind(&mut self, ino: u64, is_dir: bool) {
        if let Some(inode) = self.inodes.get_mut(&ino) {
            if inode.is_dir != is_dir {
                inode.is_dir = is_dir;
                inode.attr = None;
                if is_dir {
                    self.dirs.entry(ino).or_default();
                }
            }
        }
    }

    fn link(&mut self, dir: u64, name: &str, ino: u64) {
        if let Some(inode) = self.inodes.get_mut(&ino) {
            inode.parent = dir;
            inode.name = name.to_string();
            inode.linked = true;
            inode.refcount += 1;
        }
        self.dirs.entry(dir).or_default().insert(name.to_string(), ino);
    }

    /// Remove `name` from `dir`, dropping the link reference.
    fn detach(&mut self, dir: u64, name: &str, revoke: bool) -> Option<u64> {
        let ino = self.dirs.get_mut(&dir)?.remove(name)?;
        if let Some(inode) = self.inodes.get_mut(&ino) {
            inode.linked = false;
            if revoke {
                inode.is_invalid = true;
            }
        }
        self.unref(ino, 1);
        Some(ino)
    }

    /// Record one more kernel reference (successful lookup/create/mkdir reply).
    pub fn add_lookup(&mut self, ino: u64) {
        if let Some(inode) = self.inodes.get_mut(&ino) {
            inode.refcount += 1;
        }
    }

    /// Move an entry, keeping its inode identity. A different inode already
    /// mapped at the destination is displaced and revoked.
    pub fn rename(&mut self, old_dir: u64, old_name: &str, new_dir: u64, new_name: &str) -> Option<u64> {
        let ino = self.lookup_child(old_dir, old_name)?;
        if old_dir == new_dir && old_name == new_name {
            return Some(ino);
        }

        // The link reference moves with the entry.
        self.dirs.get_mut(&old_dir)?.remove(old_name);
        if let Some(displaced) = self.lookup_child(new_dir, new_name) {
            if displaced != ino {
                self.detach(new_dir, new_name, true);
            }
        }

        if let Some(inode) = self.inodes.get_mut(&ino) {
            inode.parent = new_dir;
            inode.name = new_name.to_string();
        }
        self.dirs
            .entry(new_dir)
            .or_default()
            .insert(new_name.to_string(), ino);
        Some(ino)
    }

    /// Remove a directory entry after the remote side deleted it.
    pub fn unlink(&mut self, dir: u64, name: &str) -> Option<u64> {
        self.detach(dir, name, false)
    }

    /// Remove a directory entry the remote side no longer reports and revoke
    /// its inode so queued requests against it fail with ESTALE.
    pub fn invalidate(&mut self, dir: u64, name: &str) -> Option<u64> {
        self.detach(dir, name, true)
    }

    /// Kernel FORGET: drop `count` references, releasing the inode once it is
    /// neither referenced nor open.
    pub fn unref(&mut self, ino: u64, count: u64) {
        if ino == ROOT_INO {
            return;
        }
        let release = match self.inodes.get_mut(&ino) {
            Some(inode) => {
                inode.refcount = inode.refcount.saturating_sub(count);
                inode.refcount == 0 && inode.handles.is_empty()
            }
            None => false,
        };
        if release {
            self.release(ino);
        }
    }

    fn release(&mut self, ino: u64) {
        let Some(inode) = self.inodes.remove(&ino) else {
            return;
        };
        if inode.linked {
            if let Some(map) = self.dirs.get_mut(&inode.parent) {
                if map.get(&inode.name) == Some(&ino) {
                    map.remove(&inode.name);
                }
            }
        }
        if let Some(children) = self.dirs.remove(&ino) {
            for child in children.into_values() {
                if let Some(c) = self.inodes.get_mut(&child) {
                    c.linked = false;
                    c.is_invalid = true;
                }
                self.unref(child, 1);
            }
        }
        log::trace!("released inode {} ({})", ino, inode.name);
    }

    pub fn attach_handle(&mut self, ino: u64, fh: u64) {
        if let Some(inode) = self.inodes.get_mut(&ino) {
            inode.handles.push(fh);
        }
    }

    /// Forget an open handle; returns false if it was not registered.
    pub fn detach_handle(&mut self, ino: u64, fh: u64) -> bool {
        let (found, release) = match self.inodes.get_mut(&ino) {
            Some(inode) => match inode.handles.iter().position(|&h| h == fh) {
                Some(pos) => {
                    inode.handles.swap_remove(pos);
                    (true, inode.refcount == 0 && inode.handles.is_empty())
                }
                None => (false, false),
            },
            None => (false, false),
        };
        if release {
            self.release(ino);
        }
        found
    }

    /// Remote path of `ino` relative to the source root; `None` if the inode
    /// or one of its ancestors is gone or not backed by the agent.
    pub fn path(&self, ino: u64) -> Option<String> {
        let mut parts = Vec::new();
        let mut cur = ino;
        loop {
            let inode = self.inodes.get(&cur)?;
            if !inode.is_remote {
                return None;
            }
            if cur == self.remote_root {
                break;
            }
            if inode.name.is_empty() {
                return None;
            }
            // Unlinked-but-open inodes keep their last name.
            parts.push(inode.name.as_str());
            cur = inode.parent;
        }
        parts.reverse();
        Some(parts.join("/"))
    }

    /// Remote path of `name` inside directory `dir`.
    pub fn child_path(&self, dir: u64, name: &str) -> Option<String> {
        let base = self.path(dir)?;
        Some(if base.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", base, name)
        })
    }

    pub fn set_attr(&mut self, ino: u64, attr: RemoteAttr) {
        if let Some(inode) = self.inodes.get_mut(&ino) {
            inode.is_dir = attr.is_dir();
            inode.attr = Some(CachedAttr {
                attr,
                fetched: Instant::now(),
            });
            if inode.is_dir {
                self.dirs.entry(ino).or_default();
            }
        }
    }

    /// A write ending at `end` succeeded; grow the cached size to match.
    pub fn note_write(&mut self, ino: u64, end: u64) {
        if let Some(cached) = self.inodes.get_mut(&ino).and_then(|i| i.attr.as_mut()) {
            cached.attr.size = cached.attr.size.max(end);
            cached.attr.mtime = std::time::SystemTime::now();
        }
    }

    pub fn clear_attr(&mut self, ino: u64) {
        if let Some(inode) = self.inodes.get_mut(&ino) {
            inode.attr = None;
        }
    }

    /// Cached attributes younger than `ttl`.
    pub fn fresh_attr(&self, ino: u64, ttl: Duration) -> Option<RemoteAttr> {
        let cached = self.get(ino)?.attr?;
        (cached.fetched.elapsed() < ttl).then_some(cached.attr)
    }

    /// Drop everything except the root, returning every handle that was open.
    pub fn clear(&mut self) -> Vec<u64> {
        let handles = self
            .inodes
            .values()
            .flat_map(|i| i.handles.iter().copied())
            .collect();
        self.inodes.retain(|&ino, _| ino == ROOT_INO);
        self.dirs.clear();
        self.dirs.insert(ROOT_INO, Dirmap::new());
        handles
    }

    /// Check the Dirmap invariants: every mapped name points at a live,
    /// non-revoked, referenced inode whose parent and name agree.
    pub fn verify(&self) -> std::result::Result<(), String> {
        for (dir, map) in &self.dirs {
            for (name, ino) in map {
                let inode = self
                    .inodes
                    .get(ino)
                    .ok_or_else(|| format!("{}/{} -> missing inode {}", dir, name, ino))?;
                if inode.is_invalid {
                    return Err(format!("{}/{} -> revoked inode {}", dir, name, ino));
                }
                if inode.refcount == 0 {
                    return Err(format!("{}/{} -> unreferenced inode {}", dir, name, ino));
                }
                if inode.parent != *dir || inode.name != *name || !inode.linked {
                    return Err(format!(
                        "{}/{} -> inode {} claims {}/{}",
                        dir, name, ino, inode.parent, inode.name
                    ));
                }
            }
        }
        Ok(())
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}
