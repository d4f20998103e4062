// SPDX-License-Identifier: MIT
// Copyright (c) 2025 the apx authors

use apx_core::ApxError;
use std::sync::Mutex;

/// Runtime buffers of one node. Each buffer has its own lock so provide and
/// require traffic never serialize against each other; a single port update
/// holds its buffer's lock for both the byte copy and the snapshot, which
/// keeps concurrent writers from tearing each other's data.
pub struct NodeData {
    definition: Mutex<Vec<u8>>,
    require_data: Mutex<Vec<u8>>,
    provide_data: Mutex<Vec<u8>>,
}

impl NodeData {
    pub fn new(definition: Vec<u8>, require_len: usize, provide_len: usize) -> Self {
        NodeData {
            definition: Mutex::new(definition),
            require_data: Mutex::new(vec![0u8; require_len]),
            provide_data: Mutex::new(vec![0u8; provide_len]),
        }
    }

    pub fn definition_len(&self) -> usize {
        self.definition.lock().expect("definition lock").len()
    }

    pub fn read_definition(&self, offset: u32, dest: &mut [u8]) -> Result<(), ApxError> {
        read(&self.definition, offset, dest)
    }

    pub fn write_definition(&self, offset: u32, src: &[u8]) -> Result<(), ApxError> {
        write(&self.definition, offset, src)
    }

    pub fn read_require_data(&self, offset: u32, dest: &mut [u8]) -> Result<(), ApxError> {
        read(&self.require_data, offset, dest)
    }

    pub fn write_require_data(&self, offset: u32, src: &[u8]) -> Result<(), ApxError> {
        write(&self.require_data, offset, src)
    }

    pub fn read_provide_data(&self, offset: u32, dest: &mut [u8]) -> Result<(), ApxError> {
        read(&self.provide_data, offset, dest)
    }

    pub fn write_provide_data(&self, offset: u32, src: &[u8]) -> Result<(), ApxError> {
        write(&self.provide_data, offset, src)
    }

    /// Run `f` with exclusive access to the provide buffer. Used by the
    /// publish path to pack and snapshot under one lock acquisition.
    pub fn with_provide_data<R>(
        &self,
        f: impl FnOnce(&mut [u8]) -> Result<R, ApxError>,
    ) -> Result<R, ApxError> {
        let mut data = self.provide_data.lock().expect("provide lock");
        f(&mut data)
    }

    pub fn with_require_data<R>(
        &self,
        f: impl FnOnce(&mut [u8]) -> Result<R, ApxError>,
    ) -> Result<R, ApxError> {
        let mut data = self.require_data.lock().expect("require lock");
        f(&mut data)
    }
}

fn read(buf: &Mutex<Vec<u8>>, offset: u32, dest: &mut [u8]) -> Result<(), ApxError> {
    let data = buf.lock().expect("node data lock");
    let start = offset as usize;
    let end = start.checked_add(dest.len()).ok_or(ApxError::InvalidArgument)?;
    if end > data.len() {
        return Err(ApxError::InvalidArgument);
    }
    dest.copy_from_slice(&data[start..end]);
    Ok(())
}

fn write(buf: &Mutex<Vec<u8>>, offset: u32, src: &[u8]) -> Result<(), ApxError> {
    let mut data = buf.lock().expect("node data lock");
    let start = offset as usize;
    let end = start.checked_add(src.len()).ok_or(ApxError::InvalidArgument)?;
    if end > data.len() {
        return Err(ApxError::InvalidArgument);
    }
    data[start..end].copy_from_slice(src);
    Ok(())
}
