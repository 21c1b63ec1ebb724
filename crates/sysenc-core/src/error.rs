use thiserror::Error;

pub type SysencResult<T> = Result<T, SysencError>;

#[derive(Debug, Error)]
pub enum SysencError {
    /// Open/seek/read/write failure on physical media or a container file
    #[error("device error: {0}")]
    Device(String),

    #[error("invalid buffer size: expected {expected} bytes, got {actual}")]
    InvalidBufferSize { expected: usize, actual: usize },

    #[error("wrong password, PIM or PRF, or not a sysenc volume")]
    WrongPassword,

    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// Dynamic disks, multiple extended partitions, non-standard partition tables
    #[error("unsupported drive layout: {0}")]
    UnsupportedLayout(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Cancelled by a progress callback
    #[error("operation cancelled")]
    Cancelled,

    /// Stopped by an explicit abort request
    #[error("operation aborted")]
    Aborted,

    /// Fingerprint, checksum or backup comparison failure
    #[error("integrity mismatch: {0}")]
    IntegrityMismatch(String),

    #[error("drive {0} is busy: another operation is already running")]
    Busy(u32),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SysencError {
    /// Shorthand for a device error carrying context about the failed step.
    pub fn device(context: impl std::fmt::Display, err: impl std::fmt::Display) -> Self {
        SysencError::Device(format!("{context}: {err}"))
    }

    /// True for the two ways an operation can be stopped on request.
    pub fn is_interruption(&self) -> bool {
        matches!(self, SysencError::Cancelled | SysencError::Aborted)
    }
}
