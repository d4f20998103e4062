// SPDX-License-Identifier: MIT
// Copyright (c) 2025 the apx authors

//! Address header of a RemoteFile frame.
//!
//! A frame is `[addr 2 or 4 bytes, big-endian][payload]`. The high bit of
//! the first byte selects the header size: clear means a 2-byte header with
//! a 15-bit address, set means a 4-byte header where bit 30 carries the
//! more-fragments flag and the low 30 bits carry the address.

use apx_core::ApxError;
use bytes::{BufMut, BytesMut};

/// Port-data area: 1 KiB boundary per file.
pub const PORT_DATA_START: u32 = 0x0000_0000;
pub const PORT_DATA_BOUNDARY: u32 = 0x400;
/// Definition area: 1 MiB boundary per file.
pub const DEFINITION_START: u32 = 0x0400_0000;
pub const DEFINITION_BOUNDARY: u32 = 0x10_0000;
/// User-data area: 1 MiB boundary per file.
pub const USER_DATA_START: u32 = 0x2000_0000;
pub const USER_DATA_END: u32 = 0x3FFF_FC00;
pub const USER_DATA_BOUNDARY: u32 = 0x10_0000;

/// Reserved command-message area.
pub const CMD_START_ADDR: u32 = 0x3FFF_FC00;
pub const CMD_END_ADDR: u32 = 0x3FFF_FFFF;

/// Internal flag marking an address as belonging to the peer's space.
pub const REMOTE_ADDRESS_BIT: u32 = 0x8000_0000;
/// More-fragments flag inside a 4-byte header.
pub const MORE_BIT: u32 = 0x4000_0000;
/// Wire addresses are 30 bits.
pub const ADDRESS_MASK: u32 = 0x3FFF_FFFF;

/// Marks "no address assigned yet".
pub const INVALID_ADDRESS: u32 = 0xFFFF_FFFF;

pub const LOW_ADDRESS_SIZE: usize = 2;
pub const HIGH_ADDRESS_SIZE: usize = 4;
/// Largest 2-byte-header address.
pub const LOW_ADDRESS_MAX: u32 = 0x7FFF;
/// A frame below this length is rejected outright.
pub const MIN_MSG_LEN: usize = HIGH_ADDRESS_SIZE + 1;

/// Decoded frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Msg<'a> {
    pub address: u32,
    pub more_bit: bool,
    pub payload: &'a [u8],
}

/// Size the header that `pack_header` would emit.
pub fn header_size(address: u32, more_bit: bool) -> usize {
    if address <= LOW_ADDRESS_MAX && !more_bit {
        LOW_ADDRESS_SIZE
    } else {
        HIGH_ADDRESS_SIZE
    }
}

/// Append the shortest legal header for `(address, more_bit)`.
pub fn pack_header(buf: &mut BytesMut, address: u32, more_bit: bool) -> Result<usize, ApxError> {
    if address > ADDRESS_MASK {
        return Err(ApxError::InvalidAddress);
    }
    if address <= LOW_ADDRESS_MAX && !more_bit {
        buf.put_u16(address as u16);
        Ok(LOW_ADDRESS_SIZE)
    } else {
        pack_header_long(buf, address, more_bit)
    }
}

/// Append a 4-byte header even when the short form would fit. Senders use
/// this to keep tiny payloads above the minimum frame length.
pub fn pack_header_long(
    buf: &mut BytesMut,
    address: u32,
    more_bit: bool,
) -> Result<usize, ApxError> {
    if address > ADDRESS_MASK {
        return Err(ApxError::InvalidAddress);
    }
    let mut word = REMOTE_ADDRESS_BIT | address;
    if more_bit {
        word |= MORE_BIT;
    }
    buf.put_u32(word);
    Ok(HIGH_ADDRESS_SIZE)
}

/// Decode one whole frame.
pub fn unpack(buf: &[u8]) -> Result<Msg<'_>, ApxError> {
    if buf.len() < MIN_MSG_LEN {
        return Err(ApxError::TooShort);
    }
    if buf[0] & 0x80 != 0 {
        let word = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        Ok(Msg {
            address: word & ADDRESS_MASK,
            more_bit: word & MORE_BIT != 0,
            payload: &buf[HIGH_ADDRESS_SIZE..],
        })
    } else {
        let word = u16::from_be_bytes([buf[0], buf[1]]);
        Ok(Msg {
            address: u32::from(word),
            more_bit: false,
            payload: &buf[LOW_ADDRESS_SIZE..],
        })
    }
}

/// True when the address falls in the reserved command range.
pub fn is_cmd_address(address: u32) -> bool {
    (CMD_START_ADDR..=CMD_END_ADDR).contains(&(address & ADDRESS_MASK))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_two_byte_header() {
        let mut buf = BytesMut::new();
        pack_header(&mut buf, 0x1234, false).unwrap();
        assert_eq!(&buf[..], &[0x12, 0x34]);
    }

    #[test]
    fn test_four_byte_header_at_boundary() {
        let mut buf = BytesMut::new();
        pack_header(&mut buf, 0x8000, false).unwrap();
        assert_eq!(&buf[..], &[0x80, 0x00, 0x80, 0x00]);
    }

    #[test]
    fn test_more_bit_forces_long_form() {
        let mut buf = BytesMut::new();
        pack_header(&mut buf, 0x10, true).unwrap();
        assert_eq!(&buf[..], &[0xC0, 0x00, 0x00, 0x10]);
    }

    #[test]
    fn test_round_trip() {
        for &(address, more) in &[
            (0u32, false),
            (0x7FFF, false),
            (0x7FFF, true),
            (0x8000, false),
            (0x3FFF_FFFF, true),
            (CMD_START_ADDR, false),
        ] {
            let mut buf = BytesMut::new();
            pack_header(&mut buf, address, more).unwrap();
            buf.extend_from_slice(b"payload");
            let msg = unpack(&buf).unwrap();
            assert_eq!(msg.address, address);
            assert_eq!(msg.more_bit, more);
            assert_eq!(msg.payload, b"payload");
        }
    }

    #[test]
    fn test_short_form_iff_low_address_and_no_more() {
        assert_eq!(header_size(0x7FFF, false), 2);
        assert_eq!(header_size(0x7FFF, true), 4);
        assert_eq!(header_size(0x8000, false), 4);
    }

    #[test]
    fn test_too_short() {
        assert!(matches!(unpack(&[0x12, 0x34, 0x01]), Err(ApxError::TooShort)));
    }

    #[test]
    fn test_address_out_of_range() {
        let mut buf = BytesMut::new();
        assert!(matches!(
            pack_header(&mut buf, 0x4000_0000, false),
            Err(ApxError::InvalidAddress)
        ));
    }
}
