// SPDX-License-Identifier: MIT
// Copyright (c) 2025 the apx authors

//! Reassembly of fragmented writes into one contiguous buffer.
//!
//! A connection carries at most one fragmented write at a time; fragments
//! must be address-contiguous. Any discontinuity resets the receiver.

use crate::MAX_FILE_SIZE;
use apx_codec::header::INVALID_ADDRESS;
use apx_core::ApxError;

/// A completed write, borrowed from the receiver until the next call.
#[derive(Debug, PartialEq, Eq)]
pub struct Reception<'a> {
    pub start_address: u32,
    pub data: &'a [u8],
}

pub struct FileReceiver {
    buf: Vec<u8>,
    buf_pos: usize,
    start_address: u32,
    in_progress: bool,
}

impl Default for FileReceiver {
    fn default() -> Self {
        Self::new()
    }
}

impl FileReceiver {
    pub fn new() -> Self {
        FileReceiver { buf: Vec::new(), buf_pos: 0, start_address: INVALID_ADDRESS, in_progress: false }
    }

    /// Grow the reassembly buffer to at least `size` bytes and reset state.
    pub fn reserve(&mut self, size: usize) -> Result<(), ApxError> {
        if size == 0 {
            return Err(ApxError::InvalidArgument);
        }
        if size > MAX_FILE_SIZE as usize {
            return Err(ApxError::FileTooLarge);
        }
        if size > self.buf.len() {
            self.buf.resize(size, 0);
        }
        self.reset();
        Ok(())
    }

    pub fn buffer_size(&self) -> usize {
        self.buf.len()
    }

    pub fn is_ongoing(&self) -> bool {
        self.in_progress
    }

    pub fn reset(&mut self) {
        self.start_address = INVALID_ADDRESS;
        self.buf_pos = 0;
        self.in_progress = false;
    }

    /// Feed one fragment. Returns the completed write when `more_bit` was
    /// clear, `None` while fragments are still outstanding.
    pub fn write(
        &mut self,
        address: u32,
        data: &[u8],
        more_bit: bool,
    ) -> Result<Option<Reception<'_>>, ApxError> {
        if address == INVALID_ADDRESS {
            return Err(ApxError::InvalidArgument);
        }
        if data.len() > MAX_FILE_SIZE as usize {
            return Err(ApxError::FileTooLarge);
        }
        if self.start_address == INVALID_ADDRESS {
            self.start_reception(address, data, more_bit)?;
        } else {
            self.continue_reception(address, data, more_bit)?;
        }
        if self.in_progress {
            return Ok(None);
        }
        let start_address = self.start_address;
        let len = self.buf_pos;
        self.start_address = INVALID_ADDRESS;
        self.buf_pos = 0;
        Ok(Some(Reception { start_address, data: &self.buf[..len] }))
    }

    fn start_reception(
        &mut self,
        address: u32,
        data: &[u8],
        more_bit: bool,
    ) -> Result<(), ApxError> {
        if self.buf.is_empty() {
            return Err(ApxError::MissingBuffer);
        }
        if data.len() > self.buf.len() {
            return Err(ApxError::BufferFull);
        }
        self.buf[..data.len()].copy_from_slice(data);
        self.buf_pos = data.len();
        self.start_address = address;
        self.in_progress = more_bit;
        Ok(())
    }

    fn continue_reception(
        &mut self,
        address: u32,
        data: &[u8],
        more_bit: bool,
    ) -> Result<(), ApxError> {
        let expected = self.start_address + self.buf_pos as u32;
        if address != expected {
            self.reset();
            return Err(ApxError::UnexpectedAddress);
        }
        if self.buf_pos + data.len() > self.buf.len() {
            self.reset();
            return Err(ApxError::BufferFull);
        }
        self.buf[self.buf_pos..self.buf_pos + data.len()].copy_from_slice(data);
        self.buf_pos += data.len();
        self.in_progress = more_bit;
        Ok(())
    }
}
