use thiserror::Error;

use crate::protocol::ErrorReason;

/// Why an inbound frame could not be turned into a [`ClientMessage`](crate::protocol::ClientMessage).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Frame too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },

    #[error("Invalid JSON: {0}")]
    InvalidJson(String),

    #[error("Envelope is not an object with a string `type`")]
    MissingType,

    #[error("Unknown message type: {0}")]
    UnknownType(String),

    #[error("Missing or invalid field `{field}` in {kind}")]
    InvalidField {
        kind: &'static str,
        field: &'static str,
    },
}

impl ProtocolError {
    pub fn reason(&self) -> ErrorReason {
        match self {
            ProtocolError::TooLarge { .. } => ErrorReason::MessageTooLarge,
            ProtocolError::InvalidJson(_) => ErrorReason::InvalidJson,
            ProtocolError::MissingType | ProtocolError::InvalidField { .. } => {
                ErrorReason::InvalidPayload
            }
            ProtocolError::UnknownType(_) => ErrorReason::UnknownType,
        }
    }
}
