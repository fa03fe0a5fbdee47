//! MTCP wire framing: one CBOR definite-length byte string per bundle.

use super::*;
use bytes::{Buf, BytesMut};
use thiserror::Error;
use tokio_util::codec;

const MAJOR_BYTES: u8 = 2;

// Frames larger than this are a framing error, not a buffering request
const MAX_FRAME: u64 = 1 << 32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("expected a CBOR byte string, got initial byte {0:#04x}")]
    NotAByteString(u8),

    #[error("indefinite-length byte strings are not supported")]
    IndefiniteLength,

    #[error("frame of {0} bytes exceeds the sane maximum")]
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

/// Encodes the byte-string header that precedes `len` raw bundle bytes:
/// the streaming TX path writes it ahead of the payload.
pub fn frame_header(len: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(9);
    match len {
        0..24 => out.push(MAJOR_BYTES << 5 | len as u8),
        24..=0xFF => {
            out.push(MAJOR_BYTES << 5 | 24);
            out.push(len as u8);
        }
        0x100..=0xFFFF => {
            out.push(MAJOR_BYTES << 5 | 25);
            out.extend_from_slice(&(len as u16).to_be_bytes());
        }
        0x1_0000..=0xFFFF_FFFF => {
            out.push(MAJOR_BYTES << 5 | 26);
            out.extend_from_slice(&(len as u32).to_be_bytes());
        }
        _ => {
            out.push(MAJOR_BYTES << 5 | 27);
            out.extend_from_slice(&len.to_be_bytes());
        }
    }
    out
}

#[derive(Debug, Default)]
pub struct Codec {}

impl codec::Decoder for Codec {
    type Item = Bytes;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, Error> {
        let Some(&initial) = src.first() else {
            return Ok(None);
        };
        if initial >> 5 != MAJOR_BYTES {
            return Err(Error::NotAByteString(initial));
        }

        let additional = initial & 0x1F;
        let (len, header_len) = match additional {
            0..24 => (additional as u64, 1),
            24..=27 => {
                let width = 1usize << (additional - 24);
                if src.len() < 1 + width {
                    return Ok(None);
                }
                let mut len = 0u64;
                for &byte in &src[1..1 + width] {
                    len = len << 8 | byte as u64;
                }
                (len, 1 + width)
            }
            _ => return Err(Error::IndefiniteLength),
        };
        if len > MAX_FRAME {
            return Err(Error::Oversized(len));
        }

        if src.len() < header_len + len as usize {
            src.reserve(header_len + len as usize - src.len());
            return Ok(None);
        }
        src.advance(header_len);
        Ok(Some(src.split_to(len as usize).freeze()))
    }
}

impl<'a> codec::Encoder<&'a [u8]> for Codec {
    type Error = Error;

    fn encode(&mut self, frame: &[u8], dst: &mut BytesMut) -> Result<(), Error> {
        dst.extend_from_slice(&frame_header(frame.len() as u64));
        dst.extend_from_slice(frame);
        Ok(())
    }
}
