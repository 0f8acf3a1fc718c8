//! Runs one mount: a dedicated thread owns the [`MountTask`] and services
//! kernel requests, agent frames and the idle timer from a single
//! `select!`, so no table is ever shared between threads.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam_channel::{select, unbounded, Receiver, Sender};
use fuser::{BackgroundSession, MountOption};

use crate::config::MountConfig;
use crate::error::{MountError, Result};
use crate::fs::MountFs;
use crate::mount::{Event, MountState, MountTask, TaskObserver};
use crate::registry::{mount_id, MountEntry, MountRegistry};
use crate::reply::KernelReply;
use crate::transport::{DuplexStream, StreamTransport, TransportEvent};

/// What the user asked to mount.
#[derive(Debug, Clone)]
pub struct MountRequest {
    /// Name of the agent's host, part of the mount identity
    pub server: String,
    pub source: String,
    /// Generated under the runtime directory when absent
    pub mountpoint: Option<PathBuf>,
    pub config: MountConfig,
}

pub enum Started {
    /// The source was already mounted; this is its path.
    Reused(PathBuf),
    Spawned(MountHandle),
}

pub struct MountHandle {
    pub mount_id: String,
    pub task_id: u64,
    pub mountpoint: PathBuf,
    events: Sender<Event<KernelReply>>,
    thread: JoinHandle<()>,
}

impl MountHandle {
    pub fn cancel(&self) {
        let _ = self.events.send(Event::Cancel);
    }

    /// Block until the mount is gone.
    pub fn join(self) {
        if self.thread.join().is_err() {
            log::error!("mount thread for {} panicked", self.mount_id);
        }
    }
}

/// Start mounting `request.source` over the agent connection `stream`.
pub fn start_mount<S: DuplexStream>(
    registry: Arc<MountRegistry>,
    stream: S,
    request: MountRequest,
    observer: Box<dyn TaskObserver>,
) -> Result<Started> {
    let id = mount_id(request.config.read_only, &request.server, &request.source);
    if let Some(path) = registry.reuse(&id) {
        return Ok(Started::Reused(path));
    }

    let task_id = registry.next_task_id();
    let (mountpoint, owns_dir) = match request.mountpoint {
        Some(path) => {
            fs::create_dir_all(&path)?;
            (path, false)
        }
        None => (registry.create_mount_dir(task_id)?, true),
    };

    let (transport, transport_rx) = StreamTransport::spawn(
        stream,
        request.config.throttle_high_water,
        request.config.throttle_low_water,
    )?;
    let (events_tx, events_rx) = unbounded();
    let mut task = MountTask::new(task_id, &request.source, request.config, transport, observer);
    if let Err(e) = task.start() {
        if owns_dir {
            let _ = fs::remove_dir(&mountpoint);
        }
        return Err(e);
    }

    let entry = MountEntry {
        task_id,
        mountpoint: mountpoint.clone(),
        opened_path: mountpoint.clone(),
        events: events_tx.clone(),
    };
    if let Err(e) = registry.register(&id, entry) {
        task.cancel();
        if owns_dir {
            let _ = fs::remove_dir(&mountpoint);
        }
        return Err(e);
    }

    let driver = MountDriver {
        task,
        registry: registry.clone(),
        mount_id: id.clone(),
        mountpoint: mountpoint.clone(),
        owns_dir,
        events_tx: events_tx.clone(),
        events_rx,
        transport_rx,
        session: None,
    };
    let thread = match thread::Builder::new()
        .name(format!("mount-{:x}", task_id))
        .spawn(move || driver.run())
    {
        Ok(thread) => thread,
        Err(e) => {
            registry.unregister(&id);
            return Err(e.into());
        }
    };

    Ok(Started::Spawned(MountHandle {
        mount_id: id,
        task_id,
        mountpoint,
        events: events_tx,
        thread,
    }))
}

struct MountDriver<S: DuplexStream> {
    task: MountTask<KernelReply, StreamTransport<S>>,
    registry: Arc<MountRegistry>,
    mount_id: String,
    mountpoint: PathBuf,
    owns_dir: bool,
    events_tx: Sender<Event<KernelReply>>,
    events_rx: Receiver<Event<KernelReply>>,
    transport_rx: Receiver<TransportEvent>,
    session: Option<BackgroundSession>,
}

impl<S: DuplexStream> MountDriver<S> {
    fn run(mut self) {
        loop {
            let timer = match self.task.next_deadline() {
                Some(deadline) => crossbeam_channel::at(deadline),
                None => crossbeam_channel::never(),
            };
            select! {
                recv(self.transport_rx) -> event => match event {
                    Ok(event) => self.task.handle_event(Event::Transport(event)),
                    Err(_) => self.task.handle_disconnect(),
                },
                recv(self.events_rx) -> event => {
                    if let Ok(event) = event {
                        self.task.handle_event(event);
                    }
                }
                recv(timer) -> _ => self.task.on_timer(Instant::now()),
            }

            self.sync_kernel();
            self.task.flush_status();
            if self.task.state() == MountState::Unmounted {
                break;
            }
        }
        log::info!("mount {} finished", self.mount_id);
    }

    /// Bring the kernel mount in line with the task state.
    fn sync_kernel(&mut self) {
        match self.task.state() {
            MountState::Mounted | MountState::IdleWatched if self.session.is_none() => {
                if let Err(e) = self.mount_kernel() {
                    log::error!("mount {}: kernel mount failed: {}", self.mount_id, e);
                    self.task.unmount(e);
                    self.teardown();
                }
            }
            MountState::Unmounting => self.teardown(),
            _ => {}
        }
    }

    fn mount_kernel(&mut self) -> Result<()> {
        let config = &self.task.config;
        let fs = MountFs::new(self.events_tx.clone(), config.max_read);
        let mut options = vec![MountOption::FSName(config.fsname.clone())];
        if self.task.read_only() {
            options.push(MountOption::RO);
        }

        log::info!(
            "mount {}: mounting {} at {:?}",
            self.mount_id,
            self.task.source(),
            self.mountpoint
        );
        let session = fuser::spawn_mount2(fs, &self.mountpoint, &options).map_err(MountError::Io)?;
        self.session = Some(session);

        let opened = self.task.mounted_path(&self.mountpoint);
        self.registry.set_opened_path(&self.mount_id, &opened);
        if let Some(command) = self.task.config.open_with.clone() {
            launch(&command, &opened);
        }
        Ok(())
    }

    fn teardown(&mut self) {
        // Dropping the session unmounts; fuser's session thread is left to
        // wind down on its own.
        if let Some(session) = self.session.take() {
            drop(session);
            log::info!("mount {}: unmounted {:?}", self.mount_id, self.mountpoint);
        }
        // Answer what is already queued. Calls forwarded after the driver
        // exits find the channel closed and fail with ENOTCONN in MountFs.
        while let Ok(event) = self.events_rx.try_recv() {
            self.task.handle_event(event);
        }
        if self.owns_dir {
            if let Err(e) = fs::remove_dir(&self.mountpoint) {
                log::warn!("failed to remove mount point {:?}: {}", self.mountpoint, e);
            }
        }
        self.registry.unregister(&self.mount_id);
        self.task.finish_unmount();
    }
}

/// Open `path` with the configured command, e.g. `"xdg-open"` or
/// `"code --new-window"`.
fn launch(command: &str, path: &Path) {
    let mut parts = command.split_whitespace();
    let Some(program) = parts.next() else {
        return;
    };
    match Command::new(program).args(parts).arg(path).spawn() {
        Ok(child) => log::info!("launched {} (pid {}) on {:?}", program, child.id(), path),
        Err(e) => log::warn!("failed to launch {}: {}", program, e),
    }
}
