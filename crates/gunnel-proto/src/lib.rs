//! Wire protocol for gunnel tunnels.
//!
//! Every control and data stream speaks the same framed protocol: a 5-byte
//! header (1 byte message kind, 4 bytes big-endian payload length) followed
//! by the payload. Payload layouts are fixed byte-for-byte so that any
//! implementation of the protocol can interoperate.

pub mod codec;
pub mod messages;

pub use codec::{Frame, HEADER_SIZE, MAX_PAYLOAD_SIZE};
pub use messages::{Message, MessageKind, Protocol, Register, RegisterResp};

use thiserror::Error;

/// Protocol-level errors.
#[derive(Debug, Error)]
pub enum ProtoError {
    /// Payload shorter than its layout requires, or truncated mid-field.
    #[error("malformed frame: {0}")]
    MalformedFrame(&'static str),

    /// Frame advertises a payload larger than the accepted maximum.
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),

    /// Message kind byte outside the known 1..=8 range. Readers log a
    /// warning and drop the frame rather than treating this as fatal.
    #[error("unknown message type: {0}")]
    UnknownType(u8),

    /// A length-prefixed string field does not fit its prefix.
    #[error("field `{0}` exceeds the length prefix")]
    FieldTooLong(&'static str),

    /// A string field is not valid UTF-8.
    #[error("field `{0}` is not valid UTF-8")]
    InvalidUtf8(&'static str),
}
