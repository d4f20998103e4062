// SPDX-License-Identifier: MIT
// Copyright (c) 2025 the apx authors

//! NumHeader length prefix used to delimit messages on the byte stream.
//!
//! 32-bit format: lengths below 128 are a single byte; anything larger is a
//! 4-byte big-endian word with the top bit set. This is the only format the
//! runtime negotiates (`NumHeader-Format: 32`).

use apx_core::ApxError;
use bytes::{BufMut, BytesMut};

pub const SHORT_MAX: usize = 127;
pub const LONG_FLAG: u32 = 0x8000_0000;
/// Largest encodable message length.
pub const MAX_LEN: usize = 0x7FFF_FFFF;

/// Append the length prefix for a message of `len` bytes.
pub fn encode_len(buf: &mut BytesMut, len: usize) -> Result<usize, ApxError> {
    if len <= SHORT_MAX {
        buf.put_u8(len as u8);
        Ok(1)
    } else if len <= MAX_LEN {
        buf.put_u32(LONG_FLAG | len as u32);
        Ok(4)
    } else {
        Err(ApxError::LengthError)
    }
}

/// Decode a length prefix. Returns `(message_len, prefix_len)`, or `None`
/// when more bytes are needed.
pub fn decode_len(buf: &[u8]) -> Option<(usize, usize)> {
    let first = *buf.first()?;
    if first & 0x80 == 0 {
        Some((usize::from(first), 1))
    } else if buf.len() >= 4 {
        let word = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        Some(((word & !LONG_FLAG) as usize, 4))
    } else {
        None
    }
}
