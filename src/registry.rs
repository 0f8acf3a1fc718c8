use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_channel::Sender;
use parking_lot::Mutex;
use serde::Serialize;

use crate::error::{MountError, Result};
use crate::mount::Event;
use crate::reply::KernelReply;

/// Key identifying one remote source: the same source on the same server in
/// the same mode is mounted at most once.
pub fn mount_id(read_only: bool, server: &str, source: &str) -> String {
    format!("{}:{}:{}", if read_only { "ro" } else { "rw" }, server, source)
}

pub struct MountEntry {
    pub task_id: u64,
    pub mountpoint: PathBuf,
    /// What the user opens: the mount point, or the file inside it
    pub opened_path: PathBuf,
    pub events: Sender<Event<KernelReply>>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MountSummary {
    pub mount_id: String,
    pub task_id: u64,
    pub mountpoint: PathBuf,
    pub opened_path: PathBuf,
}

/// Active mounts of this process. The runtime directory holding generated
/// mount points is set up with the first mount and removed with the last.
pub struct MountRegistry {
    runtime_dir: PathBuf,
    mounts: Mutex<HashMap<String, MountEntry>>,
    next_task: AtomicU64,
}

impl MountRegistry {
    pub fn new(runtime_dir: PathBuf) -> Self {
        Self {
            runtime_dir,
            mounts: Mutex::new(HashMap::new()),
            next_task: AtomicU64::new(1),
        }
    }

    /// Per-user default location for generated mount points.
    pub fn default_runtime_dir() -> PathBuf {
        match std::env::var_os("XDG_RUNTIME_DIR") {
            Some(dir) => PathBuf::from(dir).join("remotemount"),
            None => std::env::temp_dir().join(format!(
                "remotemount-{}",
                nix::unistd::getuid().as_raw()
            )),
        }
    }

    pub fn runtime_dir(&self) -> &Path {
        &self.runtime_dir
    }

    fn mounts_dir(&self) -> PathBuf {
        self.runtime_dir.join("mounts")
    }

    /// Task ids are unique across processes talking to the same agent.
    pub fn next_task_id(&self) -> u64 {
        let pid = u64::from(std::process::id());
        (pid << 32) | self.next_task.fetch_add(1, Ordering::SeqCst)
    }

    pub fn mount_dir(&self, task_id: u64) -> PathBuf {
        self.mounts_dir().join(format!("{:016x}", task_id))
    }

    pub fn create_mount_dir(&self, task_id: u64) -> Result<PathBuf> {
        let dir = self.mount_dir(task_id);
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Path of an existing mount of `mount_id`, re-arming its idle timer.
    pub fn reuse(&self, mount_id: &str) -> Option<PathBuf> {
        let mounts = self.mounts.lock();
        let entry = mounts.get(mount_id)?;
        if entry.events.send(Event::Touch).is_err() {
            return None;
        }
        log::info!("reusing mount {} at {:?}", mount_id, entry.opened_path);
        Some(entry.opened_path.clone())
    }

    pub fn register(&self, mount_id: &str, entry: MountEntry) -> Result<()> {
        let mut mounts = self.mounts.lock();
        if mounts.contains_key(mount_id) {
            return Err(MountError::AlreadyMounted(mount_id.to_string()));
        }
        if mounts.is_empty() {
            self.init()?;
        }
        log::info!("registered mount {} (task {})", mount_id, entry.task_id);
        mounts.insert(mount_id.to_string(), entry);
        Ok(())
    }

    /// Record where the mount ended up once the kernel mount exists.
    pub fn set_opened_path(&self, mount_id: &str, path: &Path) {
        if let Some(entry) = self.mounts.lock().get_mut(mount_id) {
            entry.opened_path = path.to_path_buf();
        }
    }

    pub fn unregister(&self, mount_id: &str) -> Option<MountEntry> {
        let (entry, last) = {
            let mut mounts = self.mounts.lock();
            let entry = mounts.remove(mount_id)?;
            (entry, mounts.is_empty())
        };
        log::info!("unregistered mount {}", mount_id);
        if last {
            self.teardown();
        }
        Some(entry)
    }

    pub fn cancel(&self, mount_id: &str) -> Result<()> {
        let mounts = self.mounts.lock();
        let entry = mounts
            .get(mount_id)
            .ok_or_else(|| MountError::NotMounted(mount_id.to_string()))?;
        entry
            .events
            .send(Event::Cancel)
            .map_err(|_| MountError::NotMounted(mount_id.to_string()))
    }

    pub fn list(&self) -> Vec<MountSummary> {
        let mut list: Vec<_> = self
            .mounts
            .lock()
            .iter()
            .map(|(id, entry)| MountSummary {
                mount_id: id.clone(),
                task_id: entry.task_id,
                mountpoint: entry.mountpoint.clone(),
                opened_path: entry.opened_path.clone(),
            })
            .collect();
        list.sort_by(|a, b| a.mount_id.cmp(&b.mount_id));
        list
    }

    pub fn len(&self) -> usize {
        self.mounts.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.mounts.lock().is_empty()
    }

    fn init(&self) -> Result<()> {
        let dir = self.mounts_dir();
        fs::create_dir_all(&dir)?;
        // Leftovers from a previous run that died without unmounting.
        for entry in fs::read_dir(&dir)?.flatten() {
            if fs::remove_dir(entry.path()).is_ok() {
                log::debug!("removed stale mount point {:?}", entry.path());
            }
        }
        Ok(())
    }

    fn teardown(&self) {
        let dir = self.mounts_dir();
        if let Err(e) = fs::remove_dir(&dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::warn!("failed to remove {:?}: {}", dir, e);
            }
        } else {
            log::info!("last mount removed, cleaned up {:?}", dir);
        }
    }
}
