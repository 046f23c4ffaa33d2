//! Protocol message types and their byte-exact payload layouts.
//!
//! Multibyte integers are big-endian. Short identifiers (subdomain, host,
//! token, reason) use a 1-byte length prefix; free-form messages and the
//! stream-scoped subdomain fields use a 4-byte prefix.

use crate::codec::{put_lstr32, put_lstr8, Frame, PayloadReader, HEADER_SIZE};
use crate::ProtoError;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Backend protocol declared at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Tcp,
}

impl Default for Protocol {
    fn default() -> Self {
        Protocol::Http
    }
}

impl Protocol {
    pub fn as_byte(self) -> u8 {
        match self {
            Protocol::Http => 0,
            Protocol::Tcp => 1,
        }
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Protocol::Http),
            1 => Some(Protocol::Tcp),
            _ => None,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Http => write!(f, "http"),
            Protocol::Tcp => write!(f, "tcp"),
        }
    }
}

/// Stable wire identifiers for the message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    Register = 1,
    RegisterResp = 2,
    Disconnect = 3,
    Heartbeat = 4,
    Error = 5,
    BeginStream = 6,
    EndStream = 7,
    ConnectionReady = 8,
}

impl MessageKind {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(MessageKind::Register),
            2 => Some(MessageKind::RegisterResp),
            3 => Some(MessageKind::Disconnect),
            4 => Some(MessageKind::Heartbeat),
            5 => Some(MessageKind::Error),
            6 => Some(MessageKind::BeginStream),
            7 => Some(MessageKind::EndStream),
            8 => Some(MessageKind::ConnectionReady),
            _ => None,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageKind::Register => "Register",
            MessageKind::RegisterResp => "RegisterResp",
            MessageKind::Disconnect => "Disconnect",
            MessageKind::Heartbeat => "Heartbeat",
            MessageKind::Error => "Error",
            MessageKind::BeginStream => "BeginStream",
            MessageKind::EndStream => "EndStream",
            MessageKind::ConnectionReady => "ConnectionReady",
        };
        write!(f, "{name}")
    }
}

/// Backend registration sent by the agent on the control stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Register {
    pub subdomain: String,
    pub host: String,
    pub port: u32,
    pub protocol: Protocol,
    /// Shared secret; always encoded, may be empty. Older peers omit the
    /// field entirely, which decodes as "".
    pub token: String,
}

/// Hub reply to a `Register`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterResp {
    pub success: bool,
    /// Canonical subdomain as accepted by the hub.
    pub subdomain: String,
    pub message: String,
}

/// A decoded protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Register(Register),
    RegisterResp(RegisterResp),
    Disconnect { reason: String },
    Heartbeat { message: String },
    Error { message: String },
    BeginStream { subdomain: String },
    EndStream { subdomain: String },
    ConnectionReady { subdomain: String },
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Register(_) => MessageKind::Register,
            Message::RegisterResp(_) => MessageKind::RegisterResp,
            Message::Disconnect { .. } => MessageKind::Disconnect,
            Message::Heartbeat { .. } => MessageKind::Heartbeat,
            Message::Error { .. } => MessageKind::Error,
            Message::BeginStream { .. } => MessageKind::BeginStream,
            Message::EndStream { .. } => MessageKind::EndStream,
            Message::ConnectionReady { .. } => MessageKind::ConnectionReady,
        }
    }

    /// Encode header and payload as one contiguous buffer, written to the
    /// wire as a single write.
    pub fn encode(&self) -> Result<Bytes, ProtoError> {
        let mut payload = BytesMut::new();
        self.encode_payload(&mut payload)?;

        let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
        buf.put_u8(self.kind() as u8);
        buf.put_u32(payload.len() as u32);
        buf.put_slice(&payload);
        Ok(buf.freeze())
    }

    fn encode_payload(&self, buf: &mut BytesMut) -> Result<(), ProtoError> {
        match self {
            Message::Register(reg) => {
                put_lstr8(buf, "subdomain", &reg.subdomain)?;
                put_lstr8(buf, "host", &reg.host)?;
                buf.put_u32(reg.port);
                buf.put_u8(reg.protocol.as_byte());
                put_lstr8(buf, "token", &reg.token)?;
            }
            Message::RegisterResp(resp) => {
                buf.put_u8(resp.success as u8);
                put_lstr8(buf, "subdomain", &resp.subdomain)?;
                put_lstr32(buf, "message", &resp.message)?;
            }
            Message::Disconnect { reason } => put_lstr8(buf, "reason", reason)?,
            Message::Heartbeat { message } => put_lstr8(buf, "message", message)?,
            Message::Error { message } => put_lstr8(buf, "message", message)?,
            Message::BeginStream { subdomain } => put_lstr32(buf, "subdomain", subdomain)?,
            Message::EndStream { subdomain } => put_lstr32(buf, "subdomain", subdomain)?,
            Message::ConnectionReady { subdomain } => put_lstr32(buf, "subdomain", subdomain)?,
        }
        Ok(())
    }

    /// Interpret a raw frame. Unknown kind bytes surface as
    /// [`ProtoError::UnknownType`] so the caller can warn and skip.
    pub fn from_frame(frame: &Frame) -> Result<Message, ProtoError> {
        let kind = MessageKind::from_byte(frame.kind).ok_or(ProtoError::UnknownType(frame.kind))?;
        Self::decode_payload(kind, &frame.payload)
    }

    fn decode_payload(kind: MessageKind, payload: &[u8]) -> Result<Message, ProtoError> {
        let mut r = PayloadReader::new(payload);

        let msg = match kind {
            MessageKind::Register => {
                let subdomain = r.get_lstr8("subdomain")?;
                let host = r.get_lstr8("host")?;
                let port = r.get_u32("port")?;
                let protocol = Protocol::from_byte(r.get_u8("protocol")?)
                    .ok_or(ProtoError::MalformedFrame("protocol"))?;
                // Optional token tail kept for compatibility with peers
                // that predate the field.
                let token = if r.remaining() > 0 {
                    r.get_lstr8("token")?
                } else {
                    String::new()
                };
                Message::Register(Register {
                    subdomain,
                    host,
                    port,
                    protocol,
                    token,
                })
            }
            MessageKind::RegisterResp => {
                let success = r.get_u8("success")? != 0;
                let subdomain = r.get_lstr8("subdomain")?;
                let message = r.get_lstr32("message")?;
                Message::RegisterResp(RegisterResp {
                    success,
                    subdomain,
                    message,
                })
            }
            MessageKind::Disconnect => Message::Disconnect {
                reason: r.get_lstr8("reason")?,
            },
            MessageKind::Heartbeat => Message::Heartbeat {
                message: r.get_lstr8("message")?,
            },
            MessageKind::Error => Message::Error {
                message: r.get_lstr8("message")?,
            },
            MessageKind::BeginStream => Message::BeginStream {
                subdomain: r.get_lstr32("subdomain")?,
            },
            MessageKind::EndStream => Message::EndStream {
                subdomain: r.get_lstr32("subdomain")?,
            },
            MessageKind::ConnectionReady => Message::ConnectionReady {
                subdomain: r.get_lstr32("subdomain")?,
            },
        };

        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    fn round_trip(msg: Message) -> Message {
        let encoded = msg.encode().unwrap();
        let mut buf = BytesMut::from(encoded.as_ref());
        let frame = Frame::decode(&mut buf).unwrap().unwrap();
        assert!(buf.is_empty());
        Message::from_frame(&frame).unwrap()
    }

    #[test]
    fn register_round_trip() {
        let msg = Message::Register(Register {
            subdomain: "test".into(),
            host: "localhost".into(),
            port: 3000,
            protocol: Protocol::Http,
            token: "sekret".into(),
        });
        assert_eq!(round_trip(msg.clone()), msg);
    }

    #[test]
    fn register_resp_round_trip() {
        let msg = Message::RegisterResp(RegisterResp {
            success: true,
            subdomain: "test".into(),
            message: "success".into(),
        });
        assert_eq!(round_trip(msg.clone()), msg);
    }

    #[test]
    fn all_simple_kinds_round_trip() {
        let msgs = [
            Message::Disconnect {
                reason: "shutting down".into(),
            },
            Message::Heartbeat {
                message: String::new(),
            },
            Message::Error {
                message: "boom".into(),
            },
            Message::BeginStream {
                subdomain: "api".into(),
            },
            Message::EndStream {
                subdomain: "api".into(),
            },
            Message::ConnectionReady {
                subdomain: "api".into(),
            },
        ];
        for msg in msgs {
            assert_eq!(round_trip(msg.clone()), msg);
        }
    }

    #[test]
    fn register_without_token_tail_decodes_empty() {
        // Hand-build the pre-token payload: subdomain "a", host "b",
        // port 80, protocol http, no trailing token field.
        let payload = [1, b'a', 1, b'b', 0, 0, 0, 80, 0];
        let frame = Frame {
            kind: MessageKind::Register as u8,
            payload: Bytes::copy_from_slice(&payload),
        };

        match Message::from_frame(&frame).unwrap() {
            Message::Register(reg) => {
                assert_eq!(reg.subdomain, "a");
                assert_eq!(reg.host, "b");
                assert_eq!(reg.port, 80);
                assert_eq!(reg.protocol, Protocol::Http);
                assert_eq!(reg.token, "");
            }
            other => panic!("expected Register, got {other:?}"),
        }
    }

    #[test]
    fn register_resp_exact_layout() {
        let msg = Message::RegisterResp(RegisterResp {
            success: true,
            subdomain: "ab".into(),
            message: "ok".into(),
        });
        let encoded = msg.encode().unwrap();

        // header: kind=2, length=10
        assert_eq!(&encoded[..5], &[2, 0, 0, 0, 10]);
        // payload: success, lstr8 "ab", lstr32 "ok"
        assert_eq!(
            &encoded[5..],
            &[1, 2, b'a', b'b', 0, 0, 0, 2, b'o', b'k']
        );
    }

    #[test]
    fn begin_stream_exact_layout() {
        let msg = Message::BeginStream {
            subdomain: "test".into(),
        };
        let encoded = msg.encode().unwrap();
        assert_eq!(&encoded[..5], &[6, 0, 0, 0, 8]);
        assert_eq!(&encoded[5..], &[0, 0, 0, 4, b't', b'e', b's', b't']);
    }

    #[test]
    fn unknown_kind_is_reported_not_fatal() {
        let frame = Frame {
            kind: 42,
            payload: Bytes::new(),
        };
        assert!(matches!(
            Message::from_frame(&frame),
            Err(ProtoError::UnknownType(42))
        ));
    }

    #[test]
    fn truncated_payload_is_malformed() {
        // Disconnect claiming a 10-byte reason with only 2 bytes present.
        let frame = Frame {
            kind: MessageKind::Disconnect as u8,
            payload: Bytes::copy_from_slice(&[10, b'h', b'i']),
        };
        assert!(matches!(
            Message::from_frame(&frame),
            Err(ProtoError::MalformedFrame(_))
        ));
    }

    #[test]
    fn protocol_byte_mapping() {
        assert_eq!(Protocol::Http.as_byte(), 0);
        assert_eq!(Protocol::Tcp.as_byte(), 1);
        assert_eq!(Protocol::from_byte(0), Some(Protocol::Http));
        assert_eq!(Protocol::from_byte(1), Some(Protocol::Tcp));
        assert_eq!(Protocol::from_byte(7), None);
    }
}
