use nix::errno::Errno;

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("invalid spawn request: {0}")]
    InvalidRequest(String),

    #[error("os error: {0}")]
    Os(#[from] Errno),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SpawnError {
    /// The OS error number behind this error, if any.
    ///
    /// `Os` carries the errno verbatim; `Io` reports whatever the standard
    /// library recorded.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Self::InvalidRequest(_) => None,
            Self::Os(errno) => Some(*errno as i32),
            Self::Io(e) => e.raw_os_error(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SpawnError>;
