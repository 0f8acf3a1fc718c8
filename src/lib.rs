pub mod config;
pub mod error;
pub mod fs;
pub mod inode;
pub mod mount;
pub mod mount_ops;
mod mount_results;
pub mod registry;
pub mod reply;
pub mod request;
pub mod seenset;
pub mod session;
pub mod transport;
pub mod wire;

#[cfg(test)]
mod test_support;

pub use config::MountConfig;
pub use error::{MountError, Result};
pub use mount::{Event, LogObserver, MountState, MountStatus, MountTask, TaskObserver};
pub use mount_ops::FuseCall;
pub use registry::{mount_id, MountRegistry, MountSummary};
pub use reply::{DirEntry, KernelReply, Responder};
pub use session::{start_mount, MountHandle, MountRequest, Started};
pub use transport::{StreamTransport, Transport, TransportEvent};
