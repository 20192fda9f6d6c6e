use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("region access out of bounds (offset {offset}, len {len}, capacity {capacity})")]
    OutOfBounds {
        offset: usize,
        len: usize,
        capacity: usize,
    },
    #[error("storage backend failure: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("invalid schedule: {0}")]
    InvalidSchedule(&'static str),
    #[error("all {capacity} schedule slots are in use")]
    CapacityExceeded { capacity: usize },
    #[error("slot index {index} out of range (capacity {capacity})")]
    IndexOutOfRange { index: usize, capacity: usize },
    #[error("failed to persist schedules: {0}")]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("license transport failure: {0}")]
pub struct TransportError(pub String);

/// Failure of a remote license check. Neither variant is authoritative:
/// the cached verdict must be left untouched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("license request failed: {0}")]
    Transport(String),
    #[error("malformed license response: {0}")]
    MalformedResponse(String),
}

impl From<TransportError> for ValidationError {
    fn from(err: TransportError) -> Self {
        Self::Transport(err.0)
    }
}

/// Failure reported by an output pin or network link adapter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct PortError(pub String);
