//! Recording kernel replies and an in-memory transport for driving the
//! bridge without a kernel or an agent.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use fuser::{FileAttr, FileType};
use parking_lot::Mutex;

use crate::config::MountConfig;
use crate::mount::{LogObserver, MountStatus, MountTask, TaskObserver};
use crate::mount_ops::FuseCall;
use crate::reply::{DirEntry, Responder};
use crate::transport::Transport;
use crate::wire::{
    Frame, Marshaler, MountOpcode, RemoteAttr, Unmarshaler, HEADER_SIZE, START_FLAG_ISDIR,
    STATUS_RUNNING, STATUS_STARTING, TASK_INPUT, TASK_OUTPUT,
};

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Error(i32),
    Ok,
    Entry { ino: u64, kind: FileType, size: u64 },
    Attr { ino: u64, kind: FileType, size: u64, perm: u16 },
    Data(Vec<u8>),
    Written(u32),
    Opened(u64),
    Created { ino: u64, fh: u64 },
    Directory(Vec<(String, u64, i64)>),
}

#[derive(Default)]
struct RecorderState {
    issued: usize,
    dropped: usize,
    outcomes: Vec<Outcome>,
    dir_capacity: Option<usize>,
}

#[derive(Clone, Default)]
pub struct Recorder {
    state: Arc<Mutex<RecorderState>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a kernel readdir buffer that holds at most `n` entries.
    pub fn with_dir_capacity(n: usize) -> Self {
        let rec = Self::new();
        rec.state.lock().dir_capacity = Some(n);
        rec
    }

    pub fn reply(&self) -> RecordedReply {
        self.state.lock().issued += 1;
        RecordedReply {
            state: Some(self.state.clone()),
        }
    }

    pub fn outcomes(&self) -> Vec<Outcome> {
        self.state.lock().outcomes.clone()
    }

    pub fn last(&self) -> Option<Outcome> {
        self.state.lock().outcomes.last().cloned()
    }

    pub fn answered(&self) -> usize {
        self.state.lock().outcomes.len()
    }

    /// Every reply handed out was answered exactly once.
    pub fn assert_all_answered(&self) {
        let state = self.state.lock();
        assert_eq!(state.dropped, 0, "replies dropped without an answer");
        assert_eq!(
            state.issued,
            state.outcomes.len(),
            "issued {} replies, answered {}",
            state.issued,
            state.outcomes.len()
        );
    }
}

pub struct RecordedReply {
    state: Option<Arc<Mutex<RecorderState>>>,
}

impl RecordedReply {
    fn record(mut self, outcome: Outcome) {
        if let Some(state) = self.state.take() {
            state.lock().outcomes.push(outcome);
        }
    }
}

impl Drop for RecordedReply {
    fn drop(&mut self) {
        if let Some(state) = self.state.take() {
            state.lock().dropped += 1;
        }
    }
}

impl Responder for RecordedReply {
    fn error(self, errno: i32) {
        self.record(Outcome::Error(errno));
    }

    fn ok(self) {
        self.record(Outcome::Ok);
    }

    fn entry(self, _ttl: &Duration, attr: &FileAttr, _generation: u64) {
        self.record(Outcome::Entry {
            ino: attr.ino,
            kind: attr.kind,
            size: attr.size,
        });
    }

    fn attr(self, _ttl: &Duration, attr: &FileAttr) {
        self.record(Outcome::Attr {
            ino: attr.ino,
            kind: attr.kind,
            size: attr.size,
            perm: attr.perm,
        });
    }

    fn data(self, data: &[u8]) {
        self.record(Outcome::Data(data.to_vec()));
    }

    fn written(self, size: u32) {
        self.record(Outcome::Written(size));
    }

    fn opened(self, fh: u64, _flags: u32) {
        self.record(Outcome::Opened(fh));
    }

    fn created(self, _ttl: &Duration, attr: &FileAttr, _generation: u64, fh: u64, _flags: u32) {
        self.record(Outcome::Created { ino: attr.ino, fh });
    }

    fn directory(self, entries: &[DirEntry]) -> usize {
        let capacity = self
            .state
            .as_ref()
            .and_then(|s| s.lock().dir_capacity)
            .unwrap_or(usize::MAX);
        let accepted: Vec<_> = entries
            .iter()
            .take(capacity)
            .map(|e| (e.name.clone(), e.ino, e.offset))
            .collect();
        let count = accepted.len();
        self.record(Outcome::Directory(accepted));
        count
    }
}

/// Frames captured from the bridge, shared with the test body.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    pub sent: Arc<Mutex<Vec<Vec<u8>>>>,
    pub broken: Arc<Mutex<bool>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.sent.lock().clone()
    }

    pub fn take(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut *self.sent.lock())
    }

    /// Decoded task requests sent so far, draining the capture.
    pub fn take_requests(&self) -> Vec<SentRequest> {
        self.take()
            .into_iter()
            .filter_map(|frame| SentRequest::parse(&frame))
            .collect()
    }

    pub fn break_pipe(&self) {
        *self.broken.lock() = true;
    }
}

impl Transport for MemoryTransport {
    fn send(&mut self, frame: &[u8]) -> io::Result<()> {
        if *self.broken.lock() {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        self.sent.lock().push(frame.to_vec());
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SentRequest {
    pub seq: u32,
    pub opcode: MountOpcode,
    pub path: String,
    /// Opcode fields and trailing payload after the path
    pub rest: Vec<u8>,
}

impl SentRequest {
    pub fn parse(frame: &[u8]) -> Option<Self> {
        let command = u32::from_le_bytes(frame[0..4].try_into().ok()?);
        if command != TASK_INPUT {
            return None;
        }
        let mut unm = Unmarshaler::new(&frame[HEADER_SIZE..]);
        unm.parse_number64().ok()?;
        let seq = unm.parse_number().ok()?;
        let opcode = MountOpcode::try_from(unm.parse_number().ok()?).ok()?;
        let path = unm.parse_string().ok()?;
        Some(Self {
            seq,
            opcode,
            path,
            rest: unm.remaining().to_vec(),
        })
    }

    pub fn fields(&self) -> Unmarshaler<'_> {
        Unmarshaler::new(&self.rest)
    }
}

pub fn starting_frame(task_id: u64, flags: u32) -> Frame {
    let mut m = Marshaler::new(TASK_OUTPUT);
    m.add_number64(task_id)
        .add_number(STATUS_STARTING)
        .add_number(flags);
    to_frame(m)
}

/// A running-status reply for request `seq`.
pub fn result_frame(task_id: u64, seq: u32, errno: u32, body: impl FnOnce(&mut Marshaler)) -> Frame {
    let mut m = Marshaler::new(TASK_OUTPUT);
    m.add_number64(task_id)
        .add_number(STATUS_RUNNING)
        .add_number(seq)
        .add_number(errno);
    body(&mut m);
    to_frame(m)
}

pub fn to_frame(m: Marshaler) -> Frame {
    let bytes = m.finish();
    Frame {
        command: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
        payload: bytes[HEADER_SIZE..].to_vec(),
    }
}

pub fn file_attr(size: u64) -> RemoteAttr {
    RemoteAttr {
        mode: libc::S_IFREG | 0o644,
        size,
        atime: std::time::UNIX_EPOCH,
        mtime: std::time::UNIX_EPOCH,
        ctime: std::time::UNIX_EPOCH,
    }
}

pub fn dir_attr() -> RemoteAttr {
    RemoteAttr {
        mode: libc::S_IFDIR | 0o755,
        ..file_attr(4096)
    }
}

pub const TASK_ID: u64 = 77;

/// Observer capturing everything the mount reports.
#[derive(Clone, Default)]
pub struct RecordingObserver {
    pub statuses: Arc<Mutex<Vec<MountStatus>>>,
    pub failures: Arc<Mutex<Vec<String>>>,
}

impl TaskObserver for RecordingObserver {
    fn status_changed(&self, status: &MountStatus) {
        self.statuses.lock().push(status.clone());
    }

    fn failed(&self, message: &str) {
        self.failures.lock().push(message.to_string());
    }
}

/// A mounted task plus the agent side of its connection. Requests are
/// answered in the order the task sent them.
pub struct ScriptedAgent {
    pub task: MountTask<RecordedReply, MemoryTransport>,
    pub transport: MemoryTransport,
    outstanding: VecDeque<SentRequest>,
}

impl ScriptedAgent {
    /// Directory mount of `/remote/project`, already past the handshake.
    pub fn mounted(config: MountConfig) -> Self {
        Self::with_flags(config, START_FLAG_ISDIR)
    }

    /// Single-file mount of `/remote/project`.
    pub fn mounted_file(config: MountConfig) -> Self {
        Self::with_flags(config, 0)
    }

    pub fn with_flags(config: MountConfig, flags: u32) -> Self {
        let transport = MemoryTransport::new();
        let mut task = MountTask::new(
            TASK_ID,
            "/remote/project",
            config,
            transport.clone(),
            Box::new(LogObserver),
        );
        task.start().unwrap();
        task.handle_frame(starting_frame(TASK_ID, flags));
        transport.take();
        Self {
            task,
            transport,
            outstanding: VecDeque::new(),
        }
    }

    fn collect(&mut self) {
        self.outstanding.extend(self.transport.take_requests());
    }

    /// Requests sent and not yet answered.
    pub fn outstanding(&mut self) -> Vec<SentRequest> {
        self.collect();
        self.outstanding.iter().cloned().collect()
    }

    /// Oldest unanswered request.
    pub fn peek(&mut self) -> SentRequest {
        self.collect();
        self.outstanding
            .front()
            .cloned()
            .expect("no outstanding request")
    }

    /// Answer the oldest unanswered request.
    pub fn reply(&mut self, errno: u32, body: impl FnOnce(&mut Marshaler)) -> SentRequest {
        self.collect();
        let req = self
            .outstanding
            .pop_front()
            .expect("no outstanding request");
        self.task
            .handle_frame(result_frame(TASK_ID, req.seq, errno, body));
        req
    }

    pub fn reply_ok(&mut self) -> SentRequest {
        self.reply(0, |_| {})
    }

    pub fn reply_attr(&mut self, attr: RemoteAttr) -> SentRequest {
        self.reply(0, |m| attr.marshal(m))
    }

    pub fn reply_error(&mut self, errno: i32) -> SentRequest {
        self.reply(errno as u32, |_| {})
    }

    /// Answer a Readdir with one page of `(name, is_dir, cookie)` entries.
    pub fn reply_page(&mut self, last: bool, entries: &[(&str, bool, u64)]) -> SentRequest {
        let entries: Vec<(String, bool, u64)> = entries
            .iter()
            .map(|(n, d, c)| (n.to_string(), *d, *c))
            .collect();
        self.reply(0, move |m| {
            m.add_number(u32::from(last));
            for (name, is_dir, cookie) in &entries {
                let mode = if *is_dir {
                    libc::S_IFDIR | 0o755
                } else {
                    libc::S_IFREG | 0o644
                };
                m.add_number(mode).add_number64(*cookie).add_string(name);
            }
        })
    }

    /// Feed every FUSE call in order.
    pub fn call(&mut self, call: FuseCall<RecordedReply>) {
        self.task.dispatch(call);
    }
}
