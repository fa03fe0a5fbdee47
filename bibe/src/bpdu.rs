//! BIBE protocol data units: one encapsulated bundle with its framing.
//!
//! A BPDU is the CBOR array `[transmission-id, retransmission-time,
//! encapsulated-bundle]` with the bundle as a definite-length byte string.
//! Only the handful of CBOR shapes the BPDU uses are implemented here.

use super::*;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("truncated BPDU")]
    Truncated,

    #[error("unexpected CBOR item (initial byte {0:#04x})")]
    UnexpectedItem(u8),

    #[error("BPDU length field does not match the payload")]
    LengthMismatch,
}

#[derive(Debug, PartialEq, Eq)]
pub struct Bpdu {
    pub transmission_id: u64,
    pub retransmission_time: u64,
    pub bundle: Bytes,
}

const MAJOR_UINT: u8 = 0;
const MAJOR_BYTES: u8 = 2;
const MAJOR_ARRAY: u8 = 4;

fn encode_head(out: &mut Vec<u8>, major: u8, value: u64) {
    let major = major << 5;
    match value {
        0..24 => out.push(major | value as u8),
        24..=0xFF => {
            out.push(major | 24);
            out.push(value as u8);
        }
        0x100..=0xFFFF => {
            out.push(major | 25);
            out.extend_from_slice(&(value as u16).to_be_bytes());
        }
        0x1_0000..=0xFFFF_FFFF => {
            out.push(major | 26);
            out.extend_from_slice(&(value as u32).to_be_bytes());
        }
        _ => {
            out.push(major | 27);
            out.extend_from_slice(&value.to_be_bytes());
        }
    }
}

fn decode_head(src: &[u8], expected_major: u8) -> Result<(u64, &[u8]), Error> {
    let (&initial, rest) = src.split_first().ok_or(Error::Truncated)?;
    if initial >> 5 != expected_major {
        return Err(Error::UnexpectedItem(initial));
    }
    let additional = initial & 0x1F;
    let width = match additional {
        0..24 => return Ok((additional as u64, rest)),
        24 => 1,
        25 => 2,
        26 => 4,
        27 => 8,
        _ => return Err(Error::UnexpectedItem(initial)),
    };
    if rest.len() < width {
        return Err(Error::Truncated);
    }
    let mut value = 0u64;
    for &byte in &rest[..width] {
        value = value << 8 | byte as u64;
    }
    Ok((value, &rest[width..]))
}

/// Encodes the BPDU framing that precedes the raw bundle bytes on the wire.
pub fn encode_prefix(transmission_id: u64, retransmission_time: u64, bundle_len: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + 9 + 9 + 9);
    encode_head(&mut out, MAJOR_ARRAY, 3);
    encode_head(&mut out, MAJOR_UINT, transmission_id);
    encode_head(&mut out, MAJOR_UINT, retransmission_time);
    encode_head(&mut out, MAJOR_BYTES, bundle_len);
    out
}

/// Parses a complete BPDU from an AAP payload.
pub fn parse(payload: &Bytes) -> Result<Bpdu, Error> {
    let (count, rest) = decode_head(payload, MAJOR_ARRAY)?;
    if count != 3 {
        return Err(Error::UnexpectedItem(payload[0]));
    }
    let (transmission_id, rest) = decode_head(rest, MAJOR_UINT)?;
    let (retransmission_time, rest) = decode_head(rest, MAJOR_UINT)?;
    let (bundle_len, rest) = decode_head(rest, MAJOR_BYTES)?;
    if rest.len() as u64 != bundle_len {
        return Err(Error::LengthMismatch);
    }
    Ok(Bpdu {
        transmission_id,
        retransmission_time,
        bundle: payload.slice_ref(rest),
    })
}
