// SPDX-License-Identifier: MIT
// Copyright (c) 2025 the apx authors

//! State shared between the local and remote halves of the file manager:
//! both file maps, the connection identity and the connected flag, all
//! behind one lock. Lock holders only look things up or snapshot; nothing
//! blocking happens under it.

use crate::file::{ApxFile, FileDataSource};
use crate::file_map::FileMap;
use apx_codec::header::{ADDRESS_MASK, REMOTE_ADDRESS_BIT};
use apx_codec::FileInfo;
use apx_core::{ApxError, ConnectionId};
use std::sync::{Arc, Mutex};

pub struct FileManagerShared {
    inner: Mutex<SharedState>,
}

struct SharedState {
    local: FileMap,
    remote: FileMap,
    connection_id: Option<ConnectionId>,
    is_connected: bool,
}

/// What the receive path needs to deliver a write outside the lock.
pub struct FileSnapshot {
    pub info: FileInfo,
    pub source: Option<Arc<dyn FileDataSource>>,
    pub is_remote: bool,
    pub is_open: bool,
}

impl Default for FileManagerShared {
    fn default() -> Self {
        Self::new()
    }
}

impl FileManagerShared {
    pub fn new() -> Self {
        FileManagerShared {
            inner: Mutex::new(SharedState {
                local: FileMap::new(),
                remote: FileMap::new(),
                connection_id: None,
                is_connected: false,
            }),
        }
    }

    pub fn set_connection_id(&self, id: ConnectionId) {
        self.lock().connection_id = Some(id);
    }

    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.lock().connection_id
    }

    pub fn connected(&self) {
        self.lock().is_connected = true;
    }

    pub fn disconnected(&self) {
        self.lock().is_connected = false;
    }

    pub fn is_connected(&self) -> bool {
        self.lock().is_connected
    }

    /// Insert a local file, auto-placing it when no address is assigned.
    /// Returns the file's address.
    pub fn create_local_file(&self, file: ApxFile) -> Result<u32, ApxError> {
        let mut state = self.lock();
        if state.local.find_by_name(file.name()).is_some() {
            return Err(ApxError::FileAlreadyExists);
        }
        if file.info().has_address() {
            let address = file.address();
            state.local.insert(file)?;
            Ok(address)
        } else {
            state.local.auto_insert(file)
        }
    }

    /// Register a file advertised by the peer. The peer always assigns the
    /// address.
    pub fn create_remote_file(&self, info: FileInfo) -> Result<(), ApxError> {
        if !info.has_address() {
            return Err(ApxError::InvalidAddress);
        }
        let mut state = self.lock();
        if state.remote.find_by_name(&info.name).is_some() {
            return Err(ApxError::FileAlreadyExists);
        }
        state.remote.insert(ApxFile::new_remote(info))
    }

    pub fn remove_remote_file(&self, address: u32) -> Option<FileInfo> {
        let mut state = self.lock();
        state.remote.remove_by_address(address & ADDRESS_MASK).map(|f| f.info().clone())
    }

    /// Look up by address; the top bit selects the remote map.
    pub fn snapshot_by_address(&self, address: u32) -> Option<FileSnapshot> {
        let state = self.lock();
        let masked = address & ADDRESS_MASK;
        let file = if address & REMOTE_ADDRESS_BIT != 0 {
            state.remote.find_by_address(masked)
        } else {
            state.local.find_by_address(masked)
        }?;
        Some(snapshot(file))
    }

    pub fn snapshot_local_by_name(&self, name: &str) -> Option<FileSnapshot> {
        self.lock().local.find_by_name(name).map(snapshot)
    }

    pub fn snapshot_remote_by_name(&self, name: &str) -> Option<FileSnapshot> {
        self.lock().remote.find_by_name(name).map(snapshot)
    }

    /// Mark open/closed; top bit selects the map, as in lookups.
    pub fn set_open(&self, address: u32, open: bool) -> Result<FileInfo, ApxError> {
        let mut state = self.lock();
        let masked = address & ADDRESS_MASK;
        let file = if address & REMOTE_ADDRESS_BIT != 0 {
            state.remote.find_by_address_mut(masked)
        } else {
            state.local.find_by_address_mut(masked)
        }
        .ok_or(ApxError::FileNotFound)?;
        file.set_open(open);
        Ok(file.info().clone())
    }

    pub fn attach_remote_source(
        &self,
        address: u32,
        source: Arc<dyn FileDataSource>,
    ) -> Result<(), ApxError> {
        let mut state = self.lock();
        let file = state
            .remote
            .find_by_address_mut(address & ADDRESS_MASK)
            .ok_or(ApxError::FileNotFound)?;
        file.attach_source(source);
        Ok(())
    }

    /// Snapshot every local file's info, in address order.
    pub fn local_file_infos(&self) -> Vec<FileInfo> {
        self.lock().local.iter().map(|f| f.info().clone()).collect()
    }

    pub fn remote_file_infos(&self) -> Vec<FileInfo> {
        self.lock().remote.iter().map(|f| f.info().clone()).collect()
    }

    pub fn num_local_files(&self) -> usize {
        self.lock().local.len()
    }

    pub fn num_remote_files(&self) -> usize {
        self.lock().remote.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SharedState> {
        self.inner.lock().expect("file manager lock")
    }
}

fn snapshot(file: &ApxFile) -> FileSnapshot {
    FileSnapshot {
        info: file.info().clone(),
        source: file.source(),
        is_remote: file.is_remote(),
        is_open: file.is_open(),
    }
}
