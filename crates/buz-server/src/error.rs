use buz_shared::{ErrorReason, ProtocolError, UploadId, UserId};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChunkError {
    #[error("Unknown or expired transfer: {0}")]
    UnknownTransfer(UploadId),

    #[error("Part index {index} outside 0..{total}")]
    IndexOutOfRange { index: u32, total: u32 },

    #[error("Transfer total must be positive")]
    InvalidTotal,

    #[error("Transfer incomplete: {received} of {total} parts")]
    Incomplete { received: usize, total: u32 },
}

/// Everything that can go wrong while handling one inbound frame. None of
/// these close the connection; they are reported back as `error{reason}`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Login required")]
    NotAuthenticated,

    #[error("No target group given and none joined")]
    NoGroup,

    #[error(transparent)]
    Chunk(#[from] ChunkError),

    #[error("User {0} has no live connection")]
    UserOffline(UserId),
}

impl RelayError {
    pub fn reason(&self) -> ErrorReason {
        match self {
            RelayError::Protocol(e) => e.reason(),
            RelayError::NotAuthenticated => ErrorReason::NotAuthenticated,
            RelayError::NoGroup => ErrorReason::NoGroup,
            RelayError::Chunk(ChunkError::UnknownTransfer(_)) => ErrorReason::UnknownUpload,
            RelayError::Chunk(ChunkError::IndexOutOfRange { .. }) => {
                ErrorReason::InvalidChunkIndex
            }
            RelayError::Chunk(ChunkError::InvalidTotal) => ErrorReason::InvalidPayload,
            RelayError::Chunk(ChunkError::Incomplete { .. }) => ErrorReason::AssemblyFailed,
            RelayError::UserOffline(_) => ErrorReason::UserOffline,
        }
    }
}
