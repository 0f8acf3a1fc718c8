use thiserror::Error;

#[derive(Error, Debug)]
pub enum MountError {
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("connection to remote agent lost")]
    Disconnected,

    #[error("mount cancelled")]
    Cancelled,

    #[error("stale inode: {0}")]
    Stale(u64),

    #[error("mount not active: {0}")]
    NotMounted(String),

    #[error("already mounted: {0}")]
    AlreadyMounted(String),

    #[error("remote error: {0}")]
    Remote(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("nix error: {0}")]
    Nix(#[from] nix::Error),
}

impl MountError {
    /// Errno handed to the kernel for requests failed because of this error.
    pub fn errno(&self) -> i32 {
        match self {
            MountError::Protocol(_) | MountError::Remote(_) | MountError::Json(_) => libc::EIO,
            MountError::Disconnected | MountError::Cancelled | MountError::NotMounted(_) => {
                libc::ENOTCONN
            }
            MountError::Stale(_) => libc::ESTALE,
            MountError::AlreadyMounted(_) => libc::EBUSY,
            MountError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            MountError::Nix(e) => *e as i32,
        }
    }
}

pub type Result<T> = std::result::Result<T, MountError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(MountError::Protocol("x".into()).errno(), libc::EIO);
        assert_eq!(MountError::Disconnected.errno(), libc::ENOTCONN);
        assert_eq!(MountError::Cancelled.errno(), libc::ENOTCONN);
        assert_eq!(MountError::Stale(7).errno(), libc::ESTALE);
        let io = std::io::Error::from_raw_os_error(libc::EACCES);
        assert_eq!(MountError::Io(io).errno(), libc::EACCES);
        assert_eq!(MountError::Nix(nix::Error::ENOENT).errno(), libc::ENOENT);
    }
}
