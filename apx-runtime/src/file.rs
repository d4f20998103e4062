// SPDX-License-Identifier: MIT
// Copyright (c) 2025 the apx authors

use apx_codec::{FileInfo, FileKind};
use apx_core::ApxError;
use std::fmt;
use std::sync::Arc;

/// Backing storage of a file: local files read from it to serve opens and
/// remote files write into it when peer data arrives.
pub trait FileDataSource: Send + Sync {
    fn read(&self, offset: u32, dest: &mut [u8]) -> Result<(), ApxError>;
    fn write(&self, offset: u32, data: &[u8]) -> Result<(), ApxError>;
}

/// One addressable byte range on this side of a connection.
pub struct ApxFile {
    info: FileInfo,
    kind: FileKind,
    is_open: bool,
    is_remote: bool,
    source: Option<Arc<dyn FileDataSource>>,
}

impl ApxFile {
    pub fn new_local(info: FileInfo, source: Arc<dyn FileDataSource>) -> Self {
        let kind = info.kind();
        ApxFile { info, kind, is_open: false, is_remote: false, source: Some(source) }
    }

    /// A file learned from a peer FILE_INFO. Storage attaches later, once a
    /// node or user sink claims the file.
    pub fn new_remote(info: FileInfo) -> Self {
        let kind = info.kind();
        ApxFile { info, kind, is_open: false, is_remote: true, source: None }
    }

    pub fn info(&self) -> &FileInfo {
        &self.info
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn address(&self) -> u32 {
        self.info.address
    }

    pub fn length(&self) -> u32 {
        self.info.length
    }

    pub fn kind(&self) -> FileKind {
        self.kind
    }

    pub fn is_open(&self) -> bool {
        self.is_open
    }

    pub fn is_remote(&self) -> bool {
        self.is_remote
    }

    pub fn set_open(&mut self, open: bool) {
        self.is_open = open;
    }

    pub(crate) fn set_address(&mut self, address: u32) {
        self.info.address = address;
    }

    pub fn attach_source(&mut self, source: Arc<dyn FileDataSource>) {
        self.source = Some(source);
    }

    pub fn source(&self) -> Option<Arc<dyn FileDataSource>> {
        self.source.clone()
    }

    /// Snapshot the file's current bytes.
    pub fn read_content(&self) -> Result<Vec<u8>, ApxError> {
        let source = self.source.as_ref().ok_or(ApxError::MissingBuffer)?;
        let mut content = vec![0u8; self.info.length as usize];
        source.read(0, &mut content)?;
        Ok(content)
    }

    /// Deliver bytes written by the peer at `offset`.
    pub fn write_data(&self, offset: u32, data: &[u8]) -> Result<(), ApxError> {
        if offset as usize + data.len() > self.info.length as usize {
            return Err(ApxError::BufferBoundary);
        }
        let source = self.source.as_ref().ok_or(ApxError::MissingBuffer)?;
        source.write(offset, data)
    }
}

impl fmt::Debug for ApxFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApxFile")
            .field("name", &self.info.name)
            .field("address", &self.info.address)
            .field("length", &self.info.length)
            .field("kind", &self.kind)
            .field("is_open", &self.is_open)
            .field("is_remote", &self.is_remote)
            .finish()
    }
}

/// Plain in-memory storage, used for user-data files and in tests.
pub struct MemoryFileData {
    data: std::sync::Mutex<Vec<u8>>,
}

impl MemoryFileData {
    pub fn new(len: usize) -> Arc<Self> {
        Arc::new(MemoryFileData { data: std::sync::Mutex::new(vec![0u8; len]) })
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Arc<Self> {
        Arc::new(MemoryFileData { data: std::sync::Mutex::new(bytes) })
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.data.lock().expect("file data lock").clone()
    }
}

impl FileDataSource for MemoryFileData {
    fn read(&self, offset: u32, dest: &mut [u8]) -> Result<(), ApxError> {
        let data = self.data.lock().expect("file data lock");
        let start = offset as usize;
        let end = start + dest.len();
        if end > data.len() {
            return Err(ApxError::BufferBoundary);
        }
        dest.copy_from_slice(&data[start..end]);
        Ok(())
    }

    fn write(&self, offset: u32, src: &[u8]) -> Result<(), ApxError> {
        let mut data = self.data.lock().expect("file data lock");
        let start = offset as usize;
        let end = start + src.len();
        if end > data.len() {
            return Err(ApxError::BufferBoundary);
        }
        data[start..end].copy_from_slice(src);
        Ok(())
    }
}
