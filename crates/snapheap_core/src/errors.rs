use thiserror::Error;

#[derive(Debug, Error)]
pub enum SnapError {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    SerdeJson(#[from] serde_json::Error),

    #[error("Persist: {0}")]
    Persist(#[from] tempfile::PersistError),

    #[error("Bad header: {0}")]
    BadHeader(String),

    #[error("Archive full: request of {requested} bytes at used={used} exceeds max={max}")]
    Capacity { requested: u64, used: u64, max: u64 },

    #[error("Unsupported kind: {0}")]
    Unsupported(&'static str),

    #[error("mmap at {addr:#x} failed: {source}")]
    MapFailed { addr: u64, source: std::io::Error },

    #[error("mmap relocated: requested {requested:#x}, got {actual:#x}")]
    Relocated { requested: u64, actual: u64 },

    #[error("Sentinel shifts disagree")]
    ShiftMismatch,

    #[error("Type reference {found:#x} does not match live descriptor {expected:#x}")]
    TypeMismatch { found: u64, expected: u64 },

    #[error("Corrupt archive: {0}")]
    Corrupt(String),

    #[error("{0} deferred entries left without a reconstructor")]
    DeferredUnresolved(usize),

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Build abandoned after an earlier failure")]
    Abandoned,
}

pub type Result<T> = std::result::Result<T, SnapError>;
