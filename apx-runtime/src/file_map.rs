// SPDX-License-Identifier: MIT
// Copyright (c) 2025 the apx authors

//! Address-sorted collection of files with automatic placement.
//!
//! The 30-bit address space is partitioned into a port-data area, a
//! definition area and a user-data area, each with its own per-file
//! alignment boundary.

use crate::file::ApxFile;
use apx_codec::header::{
    DEFINITION_BOUNDARY, DEFINITION_START, PORT_DATA_BOUNDARY, PORT_DATA_START,
    USER_DATA_BOUNDARY, USER_DATA_END, USER_DATA_START,
};
use apx_codec::FileKind;
use apx_core::ApxError;

#[derive(Default)]
pub struct FileMap {
    /// Sorted by address, non-overlapping.
    files: Vec<ApxFile>,
}

impl FileMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ApxFile> {
        self.files.iter()
    }

    /// Insert a file whose address is already assigned.
    pub fn insert(&mut self, file: ApxFile) -> Result<(), ApxError> {
        if !file.info().has_address() {
            return Err(ApxError::InvalidArgument);
        }
        let address = file.address();
        let pos = self.files.partition_point(|f| f.address() <= address);
        if pos > 0 {
            let prev = &self.files[pos - 1];
            if prev.address() == address || prev.address() + prev.length() > address {
                return Err(ApxError::AddressInUse);
            }
        }
        if let Some(next) = self.files.get(pos) {
            if address + file.length() > next.address() {
                return Err(ApxError::FileTooLarge);
            }
        }
        self.files.insert(pos, file);
        Ok(())
    }

    /// Assign an address inside the area matching the file's kind, then
    /// insert. Returns the assigned address.
    pub fn auto_insert(&mut self, mut file: ApxFile) -> Result<u32, ApxError> {
        let (start, end, boundary) = match file.kind() {
            FileKind::ProvideData | FileKind::RequireData => {
                (PORT_DATA_START, DEFINITION_START, PORT_DATA_BOUNDARY)
            }
            FileKind::Definition => (DEFINITION_START, USER_DATA_START, DEFINITION_BOUNDARY),
            FileKind::UserData => (USER_DATA_START, USER_DATA_END, USER_DATA_BOUNDARY),
        };
        let address = self.place(start, end, boundary)?;
        file.set_address(address);
        self.insert(file)?;
        Ok(address)
    }

    /// Next aligned address after the last file in `[start, end)`.
    fn place(&self, start: u32, end: u32, boundary: u32) -> Result<u32, ApxError> {
        debug_assert!(boundary.is_power_of_two());
        let mut candidate = start;
        if let Some(last) = self
            .files
            .iter()
            .rev()
            .find(|f| f.address() >= start && f.address() < end)
        {
            let last_end = last.address() + last.length();
            candidate = (last_end + (boundary - 1)) & !(boundary - 1);
            if candidate >= end {
                return Err(ApxError::AddressSpaceExhausted);
            }
        }
        Ok(candidate)
    }

    pub fn find_by_address(&self, address: u32) -> Option<&ApxFile> {
        let pos = self.files.partition_point(|f| f.address() <= address);
        let file = self.files.get(pos.checked_sub(1)?)?;
        (address < file.address() + file.length()).then_some(file)
    }

    pub fn find_by_address_mut(&mut self, address: u32) -> Option<&mut ApxFile> {
        let pos = self.files.partition_point(|f| f.address() <= address);
        let file = self.files.get_mut(pos.checked_sub(1)?)?;
        (address < file.address() + file.length()).then(|| file)
    }

    pub fn find_by_name(&self, name: &str) -> Option<&ApxFile> {
        self.files.iter().find(|f| f.name() == name)
    }

    pub fn find_by_name_mut(&mut self, name: &str) -> Option<&mut ApxFile> {
        self.files.iter_mut().find(|f| f.name() == name)
    }

    pub fn remove_by_address(&mut self, address: u32) -> Option<ApxFile> {
        let pos = self.files.iter().position(|f| f.address() == address)?;
        Some(self.files.remove(pos))
    }
}
