//! The mount task: owns the tables and the request queue for one mounted
//! remote source, and drives its lifecycle from events delivered by the
//! kernel session, the agent connection and the idle timer.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use fuser::{FileAttr, FileType};

use crate::config::MountConfig;
use crate::error::{MountError, Result};
use crate::inode::{InodeTable, ROOT_INO};
use crate::mount_ops::FuseCall;
use crate::reply::Responder;
use crate::request::{Pending, RequestQueue};
use crate::seenset::SeensetRegistry;
use crate::transport::{Transport, TransportEvent};
use crate::wire::{
    Frame, Marshaler, MountOpcode, RemoteAttr, Unmarshaler, HEADER_SIZE, START_FLAG_ISDIR,
    START_FLAG_READONLY, STATUS_ERROR, STATUS_FINISHED, STATUS_RUNNING, STATUS_STARTING,
    TASK_CANCEL, TASK_INPUT, TASK_OUTPUT, TASK_START_RO, TASK_START_RW,
};

pub(crate) const BLOCK_SIZE: u32 = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountState {
    Starting,
    Mounted,
    /// Mounted with no open handles and the idle timer armed
    IdleWatched,
    Unmounting,
    Unmounted,
}

impl MountState {
    /// Accepting filesystem requests.
    pub fn is_active(&self) -> bool {
        matches!(self, MountState::Mounted | MountState::IdleWatched)
    }

    fn is_down(&self) -> bool {
        matches!(self, MountState::Unmounting | MountState::Unmounted)
    }
}

/// Snapshot handed to the status display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountStatus {
    pub state: MountState,
    pub text: &'static str,
    pub users: u32,
    pub sent: u64,
    pub received: u64,
    pub pending: usize,
}

/// Receiver of user-visible progress and failures.
pub trait TaskObserver: Send {
    fn status_changed(&self, _status: &MountStatus) {}

    /// The mount failed in a way the user should hear about.
    fn failed(&self, _message: &str) {}
}

/// Observer that only writes to the log.
pub struct LogObserver;

impl TaskObserver for LogObserver {
    fn status_changed(&self, status: &MountStatus) {
        log::debug!(
            "status {:?} '{}': {} users, {} sent, {} received, {} pending",
            status.state,
            status.text,
            status.users,
            status.sent,
            status.received,
            status.pending
        );
    }

    fn failed(&self, message: &str) {
        log::error!("mount failed: {}", message);
    }
}

/// Everything the event loop feeds into a mount.
pub enum Event<R> {
    Fuse(FuseCall<R>),
    Transport(TransportEvent),
    Cancel,
    /// Someone asked for this mount again; re-arm the idle timer
    Touch,
    /// The kernel session went away
    SessionEnded,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct OpenHandle {
    pub ino: u64,
    pub append: bool,
}

pub struct MountTask<R: Responder, T: Transport> {
    pub(crate) task_id: u64,
    source: String,
    pub(crate) config: MountConfig,
    pub(crate) read_only: bool,
    is_dir: bool,
    state: MountState,
    status_text: &'static str,
    status_dirty: bool,
    transport: T,
    pub(crate) inodes: InodeTable,
    pub(crate) seensets: SeensetRegistry,
    pub(crate) queue: RequestQueue<R>,
    pub(crate) handles: HashMap<u64, OpenHandle>,
    next_fh: u64,
    backlog: VecDeque<FuseCall<R>>,
    throttles: u32,
    users: u32,
    idle_deadline: Option<Instant>,
    sent: u64,
    received: u64,
    pub(crate) uid: u32,
    pub(crate) gid: u32,
    observer: Box<dyn TaskObserver>,
}

impl<R: Responder, T: Transport> MountTask<R, T> {
    pub fn new(
        task_id: u64,
        source: &str,
        config: MountConfig,
        transport: T,
        observer: Box<dyn TaskObserver>,
    ) -> Self {
        Self {
            task_id,
            source: source.to_string(),
            read_only: config.read_only,
            config,
            is_dir: true,
            state: MountState::Starting,
            status_text: "Starting",
            status_dirty: true,
            transport,
            inodes: InodeTable::new(),
            seensets: SeensetRegistry::new(),
            queue: RequestQueue::new(),
            handles: HashMap::new(),
            next_fh: 1,
            backlog: VecDeque::new(),
            throttles: 0,
            users: 0,
            idle_deadline: None,
            sent: 0,
            received: 0,
            uid: nix::unistd::getuid().as_raw(),
            gid: nix::unistd::getgid().as_raw(),
            observer,
        }
    }

    pub fn task_id(&self) -> u64 {
        self.task_id
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn state(&self) -> MountState {
        self.state
    }

    pub fn is_dir(&self) -> bool {
        self.is_dir
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    pub fn users(&self) -> u32 {
        self.users
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn inodes(&self) -> &InodeTable {
        &self.inodes
    }

    pub fn status(&self) -> MountStatus {
        MountStatus {
            state: self.state,
            text: self.status_text,
            users: self.users,
            sent: self.sent,
            received: self.received,
            pending: self.queue.len(),
        }
    }

    /// Last path component of the source, used as the file name of a
    /// single-file mount.
    pub fn leaf_name(&self) -> &str {
        self.source
            .rsplit('/')
            .find(|part| !part.is_empty())
            .unwrap_or("file")
    }

    /// Path the user should open: the mount point itself for directory
    /// sources, the single entry inside it for file sources.
    pub fn mounted_path(&self, mountpoint: &Path) -> PathBuf {
        if self.is_dir {
            mountpoint.to_path_buf()
        } else {
            mountpoint.join(self.leaf_name())
        }
    }

    /// Ask the agent to open the source.
    pub fn start(&mut self) -> Result<()> {
        let command = if self.read_only {
            TASK_START_RO
        } else {
            TASK_START_RW
        };
        let mut m = Marshaler::new(command);
        m.add_number64(self.task_id).add_string(&self.source);
        let frame = m.finish();

        log::info!(
            "mount {}: starting {} ({})",
            self.task_id,
            self.source,
            if self.read_only { "ro" } else { "rw" }
        );
        if let Err(e) = self.transport.send(&frame) {
            self.state = MountState::Unmounted;
            self.set_status("Failed");
            return Err(e.into());
        }
        self.sent += frame.len() as u64;
        self.status_dirty = true;
        Ok(())
    }

    pub fn handle_event(&mut self, event: Event<R>) {
        match event {
            Event::Fuse(call) => self.dispatch(call),
            Event::Transport(TransportEvent::Frame(frame)) => self.handle_frame(frame),
            Event::Transport(TransportEvent::Throttle(on)) => self.handle_throttle(on),
            Event::Transport(TransportEvent::Disconnected) => self.handle_disconnect(),
            Event::Cancel => self.cancel(),
            Event::Touch => self.touch(),
            Event::SessionEnded => {
                if !self.state.is_down() {
                    log::info!("mount {}: kernel session ended", self.task_id);
                    self.unmount(MountError::Cancelled);
                }
            }
        }
    }

    pub fn handle_frame(&mut self, frame: Frame) {
        self.received += (HEADER_SIZE + frame.payload.len()) as u64;
        self.status_dirty = true;

        if let Err(e) = self.process_frame(&frame) {
            log::error!("mount {}: {}", self.task_id, e);
            self.observer.failed(&e.to_string());
            self.unmount(e);
        }
    }

    fn process_frame(&mut self, frame: &Frame) -> Result<()> {
        if frame.command != TASK_OUTPUT {
            log::debug!("mount {}: ignoring command {:#x}", self.task_id, frame.command);
            return Ok(());
        }
        let mut unm = Unmarshaler::new(&frame.payload);
        let task_id = unm.parse_number64()?;
        if task_id != self.task_id {
            log::debug!("mount {}: ignoring frame for task {}", self.task_id, task_id);
            return Ok(());
        }
        if self.state.is_down() {
            log::debug!("mount {}: late frame after teardown", self.task_id);
            return Ok(());
        }

        match unm.parse_number()? {
            STATUS_STARTING => self.handle_start(unm.parse_number()?),
            STATUS_RUNNING => self.handle_result(&mut unm),
            STATUS_ERROR => {
                let code = unm.parse_number()?;
                let message = unm.parse_string()?;
                Err(MountError::Remote(format!("{} (code {})", message, code)))
            }
            STATUS_FINISHED => {
                log::info!("mount {}: agent finished the task", self.task_id);
                self.unmount(MountError::Disconnected);
                Ok(())
            }
            other => Err(MountError::Protocol(format!("unknown task status {}", other))),
        }
    }

    fn handle_start(&mut self, flags: u32) -> Result<()> {
        if self.state != MountState::Starting {
            return Err(MountError::Protocol("duplicate start reply".to_string()));
        }
        if flags & START_FLAG_READONLY != 0 && !self.read_only {
            log::info!("mount {}: agent forces read-only", self.task_id);
            self.read_only = true;
        }
        self.is_dir = flags & START_FLAG_ISDIR != 0;
        self.inodes = if self.is_dir {
            InodeTable::new()
        } else {
            InodeTable::new_file_mount(self.leaf_name())
        };

        log::info!(
            "mount {}: {} {} is mounted",
            self.task_id,
            if self.is_dir { "directory" } else { "file" },
            self.source
        );
        self.state = MountState::Mounted;
        self.enter_idle();
        Ok(())
    }

    /// Apply the current throttle state to a kernel request.
    pub fn dispatch(&mut self, call: FuseCall<R>) {
        if !self.state.is_active() {
            call.fail(libc::ENOTCONN);
            return;
        }
        if self.throttles > 0 || !self.backlog.is_empty() {
            self.backlog.push_back(call);
            return;
        }
        self.execute(call);
    }

    pub fn handle_throttle(&mut self, throttled: bool) {
        if throttled {
            self.throttles += 1;
            log::debug!("mount {}: throttled", self.task_id);
            return;
        }
        self.throttles = self.throttles.saturating_sub(1);
        if self.throttles > 0 {
            return;
        }
        log::debug!(
            "mount {}: unthrottled, replaying {}",
            self.task_id,
            self.backlog.len()
        );
        while self.throttles == 0 && self.state.is_active() {
            match self.backlog.pop_front() {
                Some(call) => self.execute(call),
                None => break,
            }
        }
    }

    pub fn handle_disconnect(&mut self) {
        if self.state.is_down() {
            return;
        }
        self.observer.failed("connection to the remote agent was lost");
        self.unmount(MountError::Disconnected);
    }

    pub fn cancel(&mut self) {
        if self.state.is_down() {
            return;
        }
        log::info!("mount {}: cancelled", self.task_id);
        self.unmount(MountError::Cancelled);
    }

    /// Re-arm a running idle timer.
    pub fn touch(&mut self) {
        if self.idle_deadline.is_some() {
            if let Some(window) = self.config.idle_window() {
                self.idle_deadline = Some(Instant::now() + window);
            }
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.idle_deadline
    }

    pub fn on_timer(&mut self, now: Instant) {
        let Some(deadline) = self.idle_deadline else {
            return;
        };
        if now < deadline || self.users > 0 || self.state != MountState::IdleWatched {
            return;
        }
        log::info!("mount {}: idle timeout", self.task_id);
        self.unmount(MountError::Cancelled);
        self.set_status("Timed Out");
    }

    fn enter_idle(&mut self) {
        self.set_status("Idle");
        if let Some(window) = self.config.idle_window() {
            self.state = MountState::IdleWatched;
            self.idle_deadline = Some(Instant::now() + window);
        }
    }

    pub(crate) fn report_open(&mut self) {
        self.users += 1;
        if self.users == 1 {
            self.idle_deadline = None;
            if self.state == MountState::IdleWatched {
                self.state = MountState::Mounted;
            }
            self.set_status("In Use");
        }
    }

    pub(crate) fn report_close(&mut self) {
        if self.users == 0 {
            return;
        }
        self.users -= 1;
        if self.users == 0 && self.state.is_active() {
            self.enter_idle();
        }
    }

    /// Tear the mount down, answering every held kernel request with the
    /// errno for `reason`.
    pub fn unmount(&mut self, reason: MountError) {
        if self.state.is_down() {
            return;
        }
        let errno = reason.errno();
        log::info!("mount {}: unmounting ({})", self.task_id, reason);
        self.state = MountState::Unmounting;
        self.idle_deadline = None;

        let failed = self.queue.drain(errno);
        let backlog = self.backlog.len();
        for call in self.backlog.drain(..) {
            call.fail(errno);
        }
        if failed + backlog > 0 {
            log::debug!(
                "mount {}: failed {} pending and {} queued requests",
                self.task_id,
                failed,
                backlog
            );
        }

        if !matches!(reason, MountError::Disconnected) {
            let mut m = Marshaler::new(TASK_CANCEL);
            m.add_number64(self.task_id);
            let frame = m.finish();
            if self.transport.send(&frame).is_ok() {
                self.sent += frame.len() as u64;
            }
        }
        self.transport.shutdown();

        self.inodes.clear();
        self.handles.clear();
        self.seensets.clear();
        self.users = 0;
        self.set_status("Unmounting");
    }

    /// The kernel mount is gone.
    pub fn finish_unmount(&mut self) {
        if self.state == MountState::Unmounting {
            self.state = MountState::Unmounted;
            if self.status_text == "Unmounting" {
                self.set_status("Unmounted");
            }
            self.status_dirty = true;
        }
    }

    fn set_status(&mut self, text: &'static str) {
        self.status_text = text;
        self.status_dirty = true;
    }

    /// Push a coalesced status update to the observer.
    pub fn flush_status(&mut self) {
        if self.status_dirty {
            self.status_dirty = false;
            self.observer.status_changed(&self.status());
        }
    }

    pub(crate) fn alloc_fh(&mut self) -> u64 {
        let fh = self.next_fh;
        self.next_fh += 1;
        fh
    }

    /// Queue `pending` and send its request. Returns the sequence number.
    pub(crate) fn send_request(
        &mut self,
        opcode: MountOpcode,
        path: &str,
        pending: Pending<R>,
        fields: impl FnOnce(&mut Marshaler),
        payload: &[u8],
    ) -> u32 {
        let seq = self.queue.push(opcode, pending);
        let mut m = Marshaler::new(TASK_INPUT);
        m.add_number64(self.task_id)
            .add_number(seq)
            .add_number(opcode as u32)
            .add_string(path);
        fields(&mut m);
        m.add_bytes(payload);
        let frame = m.finish();

        log::debug!("mount {}: -> #{} {:?} '{}'", self.task_id, seq, opcode, path);
        match self.transport.send(&frame) {
            Ok(()) => {
                self.sent += frame.len() as u64;
                self.status_dirty = true;
            }
            Err(e) => {
                log::error!("mount {}: send failed: {}", self.task_id, e);
                self.handle_disconnect();
            }
        }
        seq
    }

    /// Send a request whose answer only keeps the queue aligned.
    pub(crate) fn send_notify(&mut self, opcode: MountOpcode, path: &str) {
        self.send_request(opcode, path, Pending::Notify, |_| {}, &[]);
    }

    pub(crate) fn make_attr(&self, ino: u64, attr: &RemoteAttr) -> FileAttr {
        let kind = if attr.is_dir() {
            FileType::Directory
        } else {
            FileType::RegularFile
        };
        FileAttr {
            ino,
            size: attr.size,
            blocks: attr.size.div_ceil(u64::from(BLOCK_SIZE)),
            atime: attr.atime,
            mtime: attr.mtime,
            ctime: attr.ctime,
            crtime: attr.ctime,
            kind,
            perm: (attr.mode & 0o777) as u16,
            nlink: 1,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: BLOCK_SIZE,
            flags: 0,
        }
    }

    /// Attributes of the local directory that holds a single-file mount.
    pub(crate) fn synthetic_dir_attr(&self) -> FileAttr {
        let now = SystemTime::now();
        FileAttr {
            ino: ROOT_INO,
            size: 0,
            blocks: 0,
            atime: now,
            mtime: now,
            ctime: now,
            crtime: now,
            kind: FileType::Directory,
            perm: if self.read_only { 0o555 } else { 0o755 },
            nlink: 2,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: BLOCK_SIZE,
            flags: 0,
        }
    }

    pub(crate) fn attr_ttl(&self) -> Duration {
        self.config.attr_ttl()
    }

    pub(crate) fn entry_ttl(&self) -> Duration {
        self.config.entry_ttl()
    }
}
