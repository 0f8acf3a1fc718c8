use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::wire::{Frame, FrameReader};

/// Outbound half of the connection to the remote agent.
pub trait Transport: Send {
    /// Queue one complete frame for delivery, in order.
    fn send(&mut self, frame: &[u8]) -> io::Result<()>;

    fn shutdown(&mut self) {}
}

/// Everything the connection reports back to the mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Frame(Frame),
    /// The outbound queue crossed a watermark
    Throttle(bool),
    Disconnected,
}

/// Byte streams the agent connection can run over.
pub trait DuplexStream: Read + Write + Send + Sized + 'static {
    fn try_clone_stream(&self) -> io::Result<Self>;
    fn shutdown_stream(&self);
}

impl DuplexStream for UnixStream {
    fn try_clone_stream(&self) -> io::Result<Self> {
        self.try_clone()
    }

    fn shutdown_stream(&self) {
        let _ = self.shutdown(std::net::Shutdown::Both);
    }
}

impl DuplexStream for TcpStream {
    fn try_clone_stream(&self) -> io::Result<Self> {
        self.try_clone()
    }

    fn shutdown_stream(&self) {
        let _ = self.shutdown(std::net::Shutdown::Both);
    }
}

#[derive(Default)]
struct Level {
    queued: usize,
    throttled: bool,
}

/// Outbound queue depth. Edges are reported while the lock is held, so
/// Throttle(true) and Throttle(false) always reach the mount alternately.
struct Watermarks {
    level: Mutex<Level>,
    high: usize,
    low: usize,
    events: Sender<TransportEvent>,
}

impl Watermarks {
    fn new(high: usize, low: usize, events: Sender<TransportEvent>) -> Self {
        Self {
            level: Mutex::new(Level::default()),
            high: high.max(1),
            low: low.min(high),
            events,
        }
    }

    fn queue(&self, len: usize) {
        let mut level = self.level.lock();
        level.queued += len;
        if level.queued > self.high && !level.throttled {
            level.throttled = true;
            let _ = self.events.send(TransportEvent::Throttle(true));
        }
    }

    fn written(&self, len: usize) {
        let mut level = self.level.lock();
        level.queued = level.queued.saturating_sub(len);
        if level.queued <= self.low && level.throttled {
            level.throttled = false;
            let _ = self.events.send(TransportEvent::Throttle(false));
        }
    }

    fn queued(&self) -> usize {
        self.level.lock().queued
    }
}

/// Agent connection over a byte stream, with a reader thread turning
/// inbound frames into [`TransportEvent`]s and a writer thread draining the
/// outbound queue. Queue depth above the high watermark raises throttle;
/// draining below the low watermark clears it.
pub struct StreamTransport<S: DuplexStream> {
    outbound: Option<Sender<Vec<u8>>>,
    marks: Arc<Watermarks>,
    _stream: S,
}

impl<S: DuplexStream> StreamTransport<S> {
    pub fn spawn(stream: S, high: usize, low: usize) -> io::Result<(Self, Receiver<TransportEvent>)> {
        let (events_tx, events_rx) = unbounded();
        let (out_tx, out_rx) = unbounded::<Vec<u8>>();
        let marks = Arc::new(Watermarks::new(high, low, events_tx.clone()));

        let reader = stream.try_clone_stream()?;
        let reader_events = events_tx.clone();
        thread::Builder::new()
            .name("agent-reader".to_string())
            .spawn(move || {
                let mut frames = FrameReader::new(reader);
                loop {
                    match frames.read_frame() {
                        Ok(Some(frame)) => {
                            if reader_events.send(TransportEvent::Frame(frame)).is_err() {
                                break;
                            }
                        }
                        Ok(None) => {
                            log::info!("agent closed the connection");
                            let _ = reader_events.send(TransportEvent::Disconnected);
                            break;
                        }
                        Err(e) => {
                            log::error!("agent read failed: {}", e);
                            let _ = reader_events.send(TransportEvent::Disconnected);
                            break;
                        }
                    }
                }
            })?;

        let mut writer = stream.try_clone_stream()?;
        let writer_marks = marks.clone();
        let writer_events = events_tx.clone();
        thread::Builder::new()
            .name("agent-writer".to_string())
            .spawn(move || {
                for frame in out_rx {
                    if let Err(e) = writer.write_all(&frame).and_then(|_| writer.flush()) {
                        log::error!("agent write failed: {}", e);
                        writer.shutdown_stream();
                        let _ = writer_events.send(TransportEvent::Disconnected);
                        break;
                    }
                    writer_marks.written(frame.len());
                }
                // Outbound queue closed: everything queued has been written.
                writer.shutdown_stream();
            })?;

        Ok((
            Self {
                outbound: Some(out_tx),
                marks,
                _stream: stream,
            },
            events_rx,
        ))
    }

    pub fn queued(&self) -> usize {
        self.marks.queued()
    }
}

impl<S: DuplexStream> Transport for StreamTransport<S> {
    fn send(&mut self, frame: &[u8]) -> io::Result<()> {
        let outbound = self
            .outbound
            .as_ref()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;

        // Count the frame before the writer can see it.
        self.marks.queue(frame.len());

        outbound
            .send(frame.to_vec())
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))
    }

    fn shutdown(&mut self) {
        // Dropping the sender lets the writer flush what is queued, then
        // close the stream.
        self.outbound.take();
    }
}
