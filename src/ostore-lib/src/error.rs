use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("not enough targets: have {actual}, need {required}")]
    InsufficientTargets { actual: usize, required: usize },
    #[error("out of space: {0}")]
    OutOfSpace(String),
    #[error("I/O error: {0}")]
    Io(String),
    #[error("aborted: {0}")]
    Aborted(String),
    #[error("expired: {0}")]
    Expired(String),
    #[error("corrupted metadata: {0}")]
    CorruptedMeta(String),
    #[error("checksum mismatch: {0}")]
    BadChecksum(String),
    #[error("not enough slices to restore: {0}")]
    NotEnoughSlices(String),
    #[error("EC disabled: {0}")]
    EcDisabled(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("invalid parameter: {0}")]
    InvalidParam(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("internal error: {0}")]
    Internal(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err.to_string())
    }
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, StoreError::Aborted(_))
    }
}
