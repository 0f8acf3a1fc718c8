//! Framing and field encoding for the task channel shared with the remote
//! agent.
//!
//! Every frame is an 8-byte header (`command`, `length`, both little-endian
//! u32) followed by `length` payload bytes. Task payloads begin with the
//! 64-bit task id. Strings are NUL terminated and zero padded to a 4-byte
//! boundary so numeric fields after them stay aligned.

use std::io::{self, Read};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::{MountError, Result};

pub const HEADER_SIZE: usize = 8;
pub const MAX_FRAME: usize = 16 << 20;

pub const TASK_START_RW: u32 = 0x100;
pub const TASK_START_RO: u32 = 0x101;
pub const TASK_INPUT: u32 = 0x102;
pub const TASK_OUTPUT: u32 = 0x103;
pub const TASK_CANCEL: u32 = 0x104;

pub const STATUS_STARTING: u32 = 0;
pub const STATUS_RUNNING: u32 = 1;
pub const STATUS_ERROR: u32 = 2;
pub const STATUS_FINISHED: u32 = 3;

pub const START_FLAG_READONLY: u32 = 1;
pub const START_FLAG_ISDIR: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MountOpcode {
    Lookup = 1,
    Stat = 2,
    Open = 3,
    Read = 4,
    Write = 5,
    Append = 6,
    Close = 7,
    Create = 8,
    Chmod = 9,
    Trunc = 10,
    Touch = 11,
    Opendir = 12,
    Readdir = 13,
    Closedir = 14,
    Mkdir = 15,
    Unlink = 16,
    Rmdir = 17,
    Rename = 18,
}

impl TryFrom<u32> for MountOpcode {
    type Error = MountError;

    fn try_from(value: u32) -> Result<Self> {
        use MountOpcode::*;
        Ok(match value {
            1 => Lookup,
            2 => Stat,
            3 => Open,
            4 => Read,
            5 => Write,
            6 => Append,
            7 => Close,
            8 => Create,
            9 => Chmod,
            10 => Trunc,
            11 => Touch,
            12 => Opendir,
            13 => Readdir,
            14 => Closedir,
            15 => Mkdir,
            16 => Unlink,
            17 => Rmdir,
            18 => Rename,
            _ => return Err(MountError::Protocol(format!("unknown opcode {}", value))),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: u32,
    pub payload: Vec<u8>,
}

/// Builds one outbound frame.
pub struct Marshaler {
    buf: Vec<u8>,
}

impl Marshaler {
    pub fn new(command: u32) -> Self {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(&command.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        Self { buf }
    }

    pub fn add_number(&mut self, value: u32) -> &mut Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn add_number64(&mut self, value: u64) -> &mut Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn add_string(&mut self, value: &str) -> &mut Self {
        self.buf.extend_from_slice(value.as_bytes());
        let padding = 4 - (value.len() & 3);
        self.buf.extend(std::iter::repeat(0u8).take(padding));
        self
    }

    /// Appends unframed trailing bytes; must be the last field.
    pub fn add_bytes(&mut self, value: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(value);
        self
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.len() == HEADER_SIZE
    }

    pub fn finish(mut self) -> Vec<u8> {
        let length = (self.buf.len() - HEADER_SIZE) as u32;
        self.buf[4..8].copy_from_slice(&length.to_le_bytes());
        self.buf
    }
}

/// Cursor over a received payload. Every parse failure is a protocol error.
pub struct Unmarshaler<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Unmarshaler<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.data.len() - self.pos < n {
            return Err(MountError::Protocol(format!(
                "truncated payload: wanted {} bytes at offset {}, have {}",
                n,
                self.pos,
                self.data.len() - self.pos
            )));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn parse_number(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn parse_number64(&mut self) -> Result<u64> {
        let bytes = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(raw))
    }

    pub fn parse_string(&mut self) -> Result<String> {
        let rest = &self.data[self.pos..];
        let nul = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| MountError::Protocol("unterminated string".to_string()))?;
        let value = std::str::from_utf8(&rest[..nul])
            .map_err(|e| MountError::Protocol(format!("invalid string: {}", e)))?
            .to_string();
        let consumed = (nul / 4 + 1) * 4;
        self.take(consumed.min(rest.len()))?;
        Ok(value)
    }

    pub fn remaining(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    pub fn remaining_len(&self) -> usize {
        self.data.len() - self.pos
    }
}

/// Reads whole frames from a byte stream.
pub struct FrameReader<R> {
    inner: R,
}

impl<R: Read> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Returns `Ok(None)` on a clean end of stream between frames.
    pub fn read_frame(&mut self) -> io::Result<Option<Frame>> {
        let mut header = [0u8; HEADER_SIZE];
        let mut filled = 0;
        while filled < HEADER_SIZE {
            match self.inner.read(&mut header[filled..]) {
                Ok(0) if filled == 0 => return Ok(None),
                Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }

        let command = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let length = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
        if length > MAX_FRAME {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame of {} bytes exceeds limit", length),
            ));
        }

        let mut payload = vec![0u8; length];
        self.inner.read_exact(&mut payload)?;
        Ok(Some(Frame { command, payload }))
    }
}

/// Stat-like attribute block sent by the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteAttr {
    pub mode: u32,
    pub size: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
}

impl RemoteAttr {
    pub fn is_dir(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFDIR
    }

    pub fn parse(unm: &mut Unmarshaler<'_>) -> Result<Self> {
        let mode = unm.parse_number()?;
        let size = unm.parse_number64()?;
        let atime = parse_time(unm)?;
        let mtime = parse_time(unm)?;
        let ctime = parse_time(unm)?;
        Ok(Self {
            mode,
            size,
            atime,
            mtime,
            ctime,
        })
    }

    pub fn marshal(&self, m: &mut Marshaler) {
        m.add_number(self.mode).add_number64(self.size);
        for time in [self.atime, self.mtime, self.ctime] {
            let (secs, nsecs) = match time.duration_since(UNIX_EPOCH) {
                Ok(since) => (since.as_secs() as i64, since.subsec_nanos()),
                Err(e) => {
                    let before = e.duration();
                    match before.subsec_nanos() {
                        0 => (-(before.as_secs() as i64), 0),
                        n => (-(before.as_secs() as i64) - 1, 1_000_000_000 - n),
                    }
                }
            };
            m.add_number64(secs as u64).add_number(nsecs);
        }
    }
}

/// Seconds are a signed `time_t`; pre-1970 files are legitimate.
fn parse_time(unm: &mut Unmarshaler<'_>) -> Result<SystemTime> {
    let secs = unm.parse_number64()? as i64;
    let nsecs = unm.parse_number()? % 1_000_000_000;
    let whole = if secs >= 0 {
        UNIX_EPOCH.checked_add(Duration::from_secs(secs as u64))
    } else {
        UNIX_EPOCH.checked_sub(Duration::from_secs(secs.unsigned_abs()))
    };
    whole
        .and_then(|t| t.checked_add(Duration::from_nanos(u64::from(nsecs))))
        .ok_or_else(|| MountError::Protocol(format!("timestamp {}.{} out of range", secs, nsecs)))
}
