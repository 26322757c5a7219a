// Types and wire protocol shared by the BUZ push-to-talk relay and its clients.

pub mod constants;
pub mod error;
pub mod protocol;
pub mod types;

pub use error::ProtocolError;
pub use protocol::{ClientMessage, ErrorReason, ServerMessage, SignalKind};
pub use types::{GroupName, UploadId, UserId};
