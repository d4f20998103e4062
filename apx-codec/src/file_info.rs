// SPDX-License-Identifier: MIT
// Copyright (c) 2025 the apx authors

use apx_core::{ApxError, DigestType, FileType};
use crate::header::INVALID_ADDRESS;

/// Longest file name, excluding the wire NUL terminator.
pub const MAX_FILE_NAME: usize = 63;
pub const DIGEST_SIZE: usize = 32;

/// What a file carries, derived from its name suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Definition,
    ProvideData,
    RequireData,
    UserData,
}

pub const DEFINITION_EXT: &str = ".apx";
pub const PROVIDE_DATA_EXT: &str = ".out";
pub const REQUIRE_DATA_EXT: &str = ".in";

/// Attributes of one addressable file, as exchanged in FILE_INFO commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub name: String,
    pub address: u32,
    pub length: u32,
    pub file_type: FileType,
    pub digest_type: DigestType,
    pub digest: [u8; DIGEST_SIZE],
}

impl FileInfo {
    /// New fixed-type file with no digest and no address assigned yet.
    pub fn new(name: impl Into<String>, length: u32) -> Result<Self, ApxError> {
        Self::with_address(name, INVALID_ADDRESS, length, FileType::Fixed)
    }

    pub fn with_address(
        name: impl Into<String>,
        address: u32,
        length: u32,
        file_type: FileType,
    ) -> Result<Self, ApxError> {
        let name = name.into();
        validate_name(&name)?;
        Ok(FileInfo {
            name,
            address,
            length,
            file_type,
            digest_type: DigestType::None,
            digest: [0u8; DIGEST_SIZE],
        })
    }

    pub fn kind(&self) -> FileKind {
        if self.name.ends_with(DEFINITION_EXT) {
            FileKind::Definition
        } else if self.name.ends_with(PROVIDE_DATA_EXT) {
            FileKind::ProvideData
        } else if self.name.ends_with(REQUIRE_DATA_EXT) {
            FileKind::RequireData
        } else {
            FileKind::UserData
        }
    }

    /// Node name with the kind suffix removed, when the file belongs to a
    /// node.
    pub fn base_name(&self) -> &str {
        for ext in [DEFINITION_EXT, PROVIDE_DATA_EXT, REQUIRE_DATA_EXT] {
            if let Some(stripped) = self.name.strip_suffix(ext) {
                return stripped;
            }
        }
        &self.name
    }

    pub fn has_address(&self) -> bool {
        self.address != INVALID_ADDRESS
    }

    pub fn set_digest(&mut self, digest_type: DigestType, digest: [u8; DIGEST_SIZE]) {
        self.digest_type = digest_type;
        self.digest = digest;
    }
}

fn validate_name(name: &str) -> Result<(), ApxError> {
    if name.is_empty() || name.len() > MAX_FILE_NAME {
        return Err(ApxError::InvalidFileName);
    }
    if !name.bytes().all(|b| b.is_ascii() && b != 0) {
        return Err(ApxError::InvalidFileName);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_from_suffix() {
        let apx = FileInfo::new("TestNode1.apx", 40).unwrap();
        let out = FileInfo::new("TestNode1.out", 3).unwrap();
        let ind = FileInfo::new("TestNode1.in", 2).unwrap();
        let usr = FileInfo::new("trace.log", 16).unwrap();
        assert_eq!(apx.kind(), FileKind::Definition);
        assert_eq!(out.kind(), FileKind::ProvideData);
        assert_eq!(ind.kind(), FileKind::RequireData);
        assert_eq!(usr.kind(), FileKind::UserData);
        assert_eq!(out.base_name(), "TestNode1");
        assert_eq!(usr.base_name(), "trace.log");
    }

    #[test]
    fn test_name_limits() {
        assert!(FileInfo::new("", 1).is_err());
        assert!(FileInfo::new("x".repeat(64), 1).is_err());
        assert!(FileInfo::new("x".repeat(63), 1).is_ok());
        assert!(FileInfo::new("bad\u{e9}name.out", 1).is_err());
    }
}
