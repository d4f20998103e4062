// SPDX-License-Identifier: MIT
// Copyright (c) 2025 the apx authors

//! Command message bodies, carried as the payload of frames addressed to
//! the reserved command area. Every multi-byte integer is little-endian.

use crate::file_info::{FileInfo, DIGEST_SIZE, MAX_FILE_NAME};
use apx_core::{ApxError, DigestType, FileType};
use bytes::{BufMut, BytesMut};

pub const CMD_TYPE_LEN: usize = 4;
/// FILE_INFO body up to and including the digest, cmd_type included.
pub const CMD_FILE_INFO_BASE_SIZE: usize = CMD_TYPE_LEN + 4 + 4 + 2 + 2 + DIGEST_SIZE;
pub const CMD_FILE_OPEN_LEN: usize = CMD_TYPE_LEN + 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CmdType {
    Ack = 0,
    Nack = 1,
    Eot = 2,
    FileInfo = 3,
    RevokeFile = 4,
    GetFileList = 8,
    GetFileInfo = 9,
    FileOpen = 10,
    FileClose = 11,
}

impl TryFrom<u32> for CmdType {
    type Error = ApxError;

    fn try_from(raw: u32) -> Result<Self, ApxError> {
        match raw {
            0 => Ok(CmdType::Ack),
            1 => Ok(CmdType::Nack),
            2 => Ok(CmdType::Eot),
            3 => Ok(CmdType::FileInfo),
            4 => Ok(CmdType::RevokeFile),
            8 => Ok(CmdType::GetFileList),
            9 => Ok(CmdType::GetFileInfo),
            10 => Ok(CmdType::FileOpen),
            11 => Ok(CmdType::FileClose),
            _ => Err(ApxError::InvalidCommand),
        }
    }
}

/// Read the leading cmd_type of a command payload.
pub fn deserialize_cmd_type(payload: &[u8]) -> Result<u32, ApxError> {
    if payload.len() < CMD_TYPE_LEN {
        return Err(ApxError::TooShort);
    }
    Ok(u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]))
}

pub fn serialize_file_info(buf: &mut BytesMut, info: &FileInfo) {
    buf.put_u32_le(CmdType::FileInfo as u32);
    buf.put_u32_le(info.address);
    buf.put_u32_le(info.length);
    buf.put_u16_le(info.file_type as u16);
    buf.put_u16_le(info.digest_type as u16);
    buf.put_slice(&info.digest);
    buf.put_slice(info.name.as_bytes());
    buf.put_u8(0);
}

pub fn deserialize_file_info(payload: &[u8]) -> Result<FileInfo, ApxError> {
    if payload.len() < CMD_FILE_INFO_BASE_SIZE + 1 {
        return Err(ApxError::TooShort);
    }
    let cmd = deserialize_cmd_type(payload)?;
    if cmd != CmdType::FileInfo as u32 {
        return Err(ApxError::InvalidCommand);
    }
    let address = read_u32_le(payload, 4);
    let length = read_u32_le(payload, 8);
    let file_type =
        FileType::from_u16(read_u16_le(payload, 12)).ok_or(ApxError::InvalidCommand)?;
    let digest_type =
        DigestType::from_u16(read_u16_le(payload, 14)).ok_or(ApxError::InvalidCommand)?;
    let mut digest = [0u8; DIGEST_SIZE];
    digest.copy_from_slice(&payload[16..16 + DIGEST_SIZE]);

    let name_bytes = &payload[CMD_FILE_INFO_BASE_SIZE..];
    let nul = name_bytes
        .iter()
        .position(|&b| b == 0)
        .ok_or(ApxError::InvalidFileName)?;
    if nul > MAX_FILE_NAME {
        return Err(ApxError::InvalidFileName);
    }
    let name =
        std::str::from_utf8(&name_bytes[..nul]).map_err(|_| ApxError::InvalidFileName)?;

    let mut info = FileInfo::with_address(name, address, length, file_type)?;
    info.set_digest(digest_type, digest);
    Ok(info)
}

pub fn serialize_file_open(buf: &mut BytesMut, address: u32) {
    buf.put_u32_le(CmdType::FileOpen as u32);
    buf.put_u32_le(address);
}

pub fn serialize_file_close(buf: &mut BytesMut, address: u32) {
    buf.put_u32_le(CmdType::FileClose as u32);
    buf.put_u32_le(address);
}

pub fn serialize_revoke_file(buf: &mut BytesMut, address: u32) {
    buf.put_u32_le(CmdType::RevokeFile as u32);
    buf.put_u32_le(address);
}

/// FILE_OPEN, FILE_CLOSE and REVOKE_FILE share the same 8-byte body.
pub fn deserialize_file_address(payload: &[u8]) -> Result<u32, ApxError> {
    if payload.len() < CMD_FILE_OPEN_LEN {
        return Err(ApxError::TooShort);
    }
    Ok(read_u32_le(payload, 4))
}

pub fn serialize_get_file_info(buf: &mut BytesMut, address: u32) {
    buf.put_u32_le(CmdType::GetFileInfo as u32);
    buf.put_u32_le(address);
}

pub fn serialize_plain(buf: &mut BytesMut, cmd: CmdType) {
    buf.put_u32_le(cmd as u32);
}

fn read_u16_le(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

fn read_u32_le(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}
