//! The subset of the Application Agent Protocol the BIBE driver speaks.
//!
//! Every message starts with one header byte: protocol version in the high
//! nibble, message type in the low nibble. `REGISTER` and `WELCOME` carry a
//! 16-bit EID length and the EID; the bundle-bearing types additionally
//! carry a 64-bit payload length and the payload.

use super::*;
use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec;

const VERSION: u8 = 0x1;

const TYPE_ACK: u8 = 0x0;
const TYPE_NACK: u8 = 0x1;
const TYPE_REGISTER: u8 = 0x2;
const TYPE_SENDBUNDLE: u8 = 0x3;
const TYPE_RECVBUNDLE: u8 = 0x4;
const TYPE_WELCOME: u8 = 0x7;
const TYPE_PING: u8 = 0x8;
const TYPE_SENDBIBE: u8 = 0x9;
const TYPE_RECVBIBE: u8 = 0xA;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("unsupported AAP version {0}")]
    UnsupportedVersion(u8),

    #[error("unsupported AAP message type {0:#03x}")]
    UnsupportedType(u8),

    #[error("AAP message EID is not valid UTF-8")]
    BadEid,

    #[error("AAP payload length {0} exceeds the sane maximum")]
    Oversized(u64),

    #[error(transparent)]
    Io(#[from] StdIoErrorEq),
}

/// `std::io::Error` with a `PartialEq` shim so codec errors stay comparable
/// in tests.
#[derive(Debug, Error)]
#[error(transparent)]
pub struct StdIoErrorEq(#[from] pub std::io::Error);

impl PartialEq for StdIoErrorEq {
    fn eq(&self, other: &Self) -> bool {
        self.0.kind() == other.0.kind()
    }
}

impl Eq for StdIoErrorEq {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(StdIoErrorEq(e))
    }
}

// Everything larger is treated as a framing error rather than a buffering
// request
const MAX_PAYLOAD: u64 = 1 << 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Ack,
    Nack,
    Ping,
    Register { sink: String },
    Welcome { eid: String },
    SendBundle { eid: String, payload: Bytes },
    RecvBundle { eid: String, payload: Bytes },
    SendBibe { eid: String, payload: Bytes },
    RecvBibe { eid: String, payload: Bytes },
}

/// Encodes the header of a `SENDBIBE` message whose payload will follow as
/// raw writes: header byte, EID length, EID, payload length.
pub fn send_bibe_header(eid: &str, payload_len: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + 2 + eid.len() + 8);
    out.push(VERSION << 4 | TYPE_SENDBIBE);
    out.extend_from_slice(&(eid.len() as u16).to_be_bytes());
    out.extend_from_slice(eid.as_bytes());
    out.extend_from_slice(&payload_len.to_be_bytes());
    out
}

#[derive(Debug, Default)]
pub struct Codec {}

impl codec::Decoder for Codec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, Error> {
        let Some(&header) = src.first() else {
            return Ok(None);
        };
        if header >> 4 != VERSION {
            return Err(Error::UnsupportedVersion(header >> 4));
        }

        let msg_type = header & 0x0F;
        match msg_type {
            TYPE_ACK | TYPE_NACK | TYPE_PING => {
                src.advance(1);
                Ok(Some(match msg_type {
                    TYPE_ACK => Message::Ack,
                    TYPE_NACK => Message::Nack,
                    _ => Message::Ping,
                }))
            }
            TYPE_REGISTER | TYPE_WELCOME => {
                let Some((eid, consumed)) = decode_eid(&src[1..])? else {
                    return Ok(None);
                };
                src.advance(1 + consumed);
                Ok(Some(match msg_type {
                    TYPE_REGISTER => Message::Register { sink: eid },
                    _ => Message::Welcome { eid },
                }))
            }
            TYPE_SENDBUNDLE | TYPE_RECVBUNDLE | TYPE_SENDBIBE | TYPE_RECVBIBE => {
                let Some((eid, eid_consumed)) = decode_eid(&src[1..])? else {
                    return Ok(None);
                };
                let rest = &src[1 + eid_consumed..];
                if rest.len() < 8 {
                    return Ok(None);
                }
                let payload_len = u64::from_be_bytes(rest[..8].try_into().unwrap());
                if payload_len > MAX_PAYLOAD {
                    return Err(Error::Oversized(payload_len));
                }
                if (rest.len() - 8) < payload_len as usize {
                    // Reserve for what is still to come
                    src.reserve(1 + eid_consumed + 8 + payload_len as usize - src.len());
                    return Ok(None);
                }
                src.advance(1 + eid_consumed + 8);
                let payload = src.split_to(payload_len as usize).freeze();
                Ok(Some(match msg_type {
                    TYPE_SENDBUNDLE => Message::SendBundle { eid, payload },
                    TYPE_RECVBUNDLE => Message::RecvBundle { eid, payload },
                    TYPE_SENDBIBE => Message::SendBibe { eid, payload },
                    _ => Message::RecvBibe { eid, payload },
                }))
            }
            other => Err(Error::UnsupportedType(other)),
        }
    }
}

fn decode_eid(src: &[u8]) -> Result<Option<(String, usize)>, Error> {
    if src.len() < 2 {
        return Ok(None);
    }
    let eid_len = u16::from_be_bytes(src[..2].try_into().unwrap()) as usize;
    if src.len() < 2 + eid_len {
        return Ok(None);
    }
    let eid = std::str::from_utf8(&src[2..2 + eid_len])
        .map_err(|_| Error::BadEid)?
        .to_string();
    Ok(Some((eid, 2 + eid_len)))
}

impl<'a> codec::Encoder<&'a Message> for Codec {
    type Error = Error;

    fn encode(&mut self, msg: &Message, dst: &mut BytesMut) -> Result<(), Error> {
        let (msg_type, eid, payload) = match msg {
            Message::Ack => (TYPE_ACK, None, None),
            Message::Nack => (TYPE_NACK, None, None),
            Message::Ping => (TYPE_PING, None, None),
            Message::Register { sink } => (TYPE_REGISTER, Some(sink), None),
            Message::Welcome { eid } => (TYPE_WELCOME, Some(eid), None),
            Message::SendBundle { eid, payload } => (TYPE_SENDBUNDLE, Some(eid), Some(payload)),
            Message::RecvBundle { eid, payload } => (TYPE_RECVBUNDLE, Some(eid), Some(payload)),
            Message::SendBibe { eid, payload } => (TYPE_SENDBIBE, Some(eid), Some(payload)),
            Message::RecvBibe { eid, payload } => (TYPE_RECVBIBE, Some(eid), Some(payload)),
        };

        dst.put_u8(VERSION << 4 | msg_type);
        if let Some(eid) = eid {
            dst.put_u16(eid.len() as u16);
            dst.put_slice(eid.as_bytes());
        }
        if let Some(payload) = payload {
            dst.put_u64(payload.len() as u64);
            dst.put_slice(payload);
        }
        Ok(())
    }
}

/// Encodes one message to a fresh buffer.
pub fn encode(msg: &Message) -> Bytes {
    let mut buf = BytesMut::new();
    codec::Encoder::encode(&mut Codec::default(), msg, &mut buf)
        .trace_expect("AAP encoding cannot fail");
    buf.freeze()
}
