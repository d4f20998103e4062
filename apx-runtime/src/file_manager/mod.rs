// SPDX-License-Identifier: MIT
// Copyright (c) 2025 the apx authors

//! The file manager drives one side of a RemoteFile connection: it
//! advertises local files, learns about the peer's files, answers opens,
//! and routes incoming writes to whichever file owns the address.

mod shared;

pub use shared::{FileManagerShared, FileSnapshot};

use crate::allocator::Allocator;
use crate::file::{ApxFile, FileDataSource};
use crate::receiver::FileReceiver;
use crate::MAX_FILE_SIZE;
use apx_codec::command::{self, CmdType};
use apx_codec::greeting;
use apx_codec::header::{
    self, CMD_START_ADDR, HIGH_ADDRESS_SIZE, MIN_MSG_LEN, REMOTE_ADDRESS_BIT,
};
use apx_codec::FileInfo;
use apx_core::{ApxError, TransmitHandler, TransmitReservation};
use bytes::BytesMut;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, trace, warn};

/// Codec-event seam. One implementation per embedding (client node
/// manager, server connection) receives everything the peer does to us.
pub trait FileManagerEvents: Send + Sync {
    /// Peer advertised a file.
    fn remote_file_created(&self, file_manager: &Arc<FileManager>, info: &FileInfo) {
        let _ = (file_manager, info);
    }

    /// Peer asked to open one of our local files. The content has already
    /// been queued for transmission when this fires.
    fn file_open_requested(&self, info: &FileInfo) {
        let _ = info;
    }

    /// A complete write landed in a file that has no attached storage.
    fn remote_file_written(&self, info: &FileInfo, offset: u32, data: &[u8]) {
        let _ = (info, offset, data);
    }

    fn remote_file_revoked(&self, info: &FileInfo) {
        let _ = info;
    }

    /// Peer finished its file listing.
    fn end_of_transmission(&self, file_manager: &Arc<FileManager>) {
        let _ = file_manager;
    }
}

pub struct FileManager {
    shared: FileManagerShared,
    receiver: Mutex<FileReceiver>,
    transmit: Arc<dyn TransmitHandler>,
    events: Mutex<Option<Arc<dyn FileManagerEvents>>>,
    allocator: Arc<Allocator>,
    unknown_address_count: AtomicU64,
}

impl FileManager {
    pub fn new(transmit: Arc<dyn TransmitHandler>, allocator: Arc<Allocator>) -> Arc<Self> {
        Arc::new(FileManager {
            shared: FileManagerShared::new(),
            receiver: Mutex::new(FileReceiver::new()),
            transmit,
            events: Mutex::new(None),
            allocator,
            unknown_address_count: AtomicU64::new(0),
        })
    }

    /// Install the event sink. Must happen before the connection starts
    /// feeding messages.
    pub fn set_events(&self, events: Arc<dyn FileManagerEvents>) {
        *self.events.lock().expect("events lock") = Some(events);
    }

    pub fn shared(&self) -> &FileManagerShared {
        &self.shared
    }

    pub fn allocator(&self) -> &Arc<Allocator> {
        &self.allocator
    }

    pub fn unknown_address_count(&self) -> u64 {
        self.unknown_address_count.load(Ordering::Relaxed)
    }

    /// Register a local file and advertise it when already connected.
    pub fn attach_local_file(
        &self,
        info: FileInfo,
        source: Arc<dyn FileDataSource>,
    ) -> Result<u32, ApxError> {
        let file = ApxFile::new_local(info, source);
        let address = self.shared.create_local_file(file)?;
        if self.shared.is_connected() {
            if let Some(snapshot) = self.shared.snapshot_by_address(address) {
                self.send_file_info(&snapshot.info)?;
            }
        }
        Ok(address)
    }

    /// Connection is up: greet, advertise every local file, close the
    /// listing with EOT.
    pub fn connected(&self) -> Result<(), ApxError> {
        self.shared.connected();
        self.receiver.lock().expect("receiver lock").reserve(1024).ok();
        self.send_greeting()?;
        for info in self.shared.local_file_infos() {
            self.send_file_info(&info)?;
        }
        self.send_plain_cmd(CmdType::Eot)?;
        debug!(
            local_files = self.shared.num_local_files(),
            "connection up, file listing sent"
        );
        Ok(())
    }

    pub fn disconnected(&self) {
        self.shared.disconnected();
        self.receiver.lock().expect("receiver lock").reset();
    }

    /// Feed one whole message (post stream framing). `self` arrives as an
    /// Arc so events can call back into the manager.
    pub fn process_message(self: &Arc<Self>, message: &[u8]) -> Result<(), ApxError> {
        let msg = header::unpack(message)?;
        if header::is_cmd_address(msg.address) {
            self.process_cmd(msg.payload)
        } else {
            self.process_data(msg.address, msg.payload, msg.more_bit)
        }
    }

    /// Ask the peer to start sending a remote file's content.
    pub fn request_open_remote(&self, address: u32) -> Result<(), ApxError> {
        let mut payload = BytesMut::new();
        command::serialize_file_open(&mut payload, address & header::ADDRESS_MASK);
        self.send_cmd_payload(&payload)?;
        self.shared.set_open(address | REMOTE_ADDRESS_BIT, true)?;
        Ok(())
    }

    pub fn request_close_remote(&self, address: u32) -> Result<(), ApxError> {
        let mut payload = BytesMut::new();
        command::serialize_file_close(&mut payload, address & header::ADDRESS_MASK);
        self.send_cmd_payload(&payload)?;
        self.shared.set_open(address | REMOTE_ADDRESS_BIT, false)?;
        Ok(())
    }

    pub fn request_file_info(&self, address: u32) -> Result<(), ApxError> {
        let mut payload = BytesMut::new();
        command::serialize_get_file_info(&mut payload, address & header::ADDRESS_MASK);
        self.send_cmd_payload(&payload)
    }

    pub fn send_plain_cmd(&self, cmd: CmdType) -> Result<(), ApxError> {
        let mut payload = BytesMut::new();
        command::serialize_plain(&mut payload, cmd);
        self.send_cmd_payload(&payload)
    }

    pub fn send_file_info(&self, info: &FileInfo) -> Result<(), ApxError> {
        let mut payload = BytesMut::new();
        command::serialize_file_info(&mut payload, info);
        self.send_cmd_payload(&payload)
    }

    /// Write `data` into the connection's address space, fragmenting to the
    /// transport's frame budget. Used both for publishing local file
    /// changes and for serving opens.
    pub fn send_data(&self, address: u32, data: &[u8]) -> Result<(), ApxError> {
        if data.is_empty() {
            return Ok(());
        }
        let budget = self.transmit.max_frame_size().saturating_sub(HIGH_ADDRESS_SIZE);
        if budget == 0 {
            return Err(ApxError::TransmitUnavailable);
        }
        let mut offset = 0usize;
        loop {
            let remaining = data.len() - offset;
            let chunk = remaining.min(budget);
            let more = remaining > chunk;
            self.send_frame(address + offset as u32, more, &data[offset..offset + chunk])?;
            offset += chunk;
            if offset >= data.len() {
                return Ok(());
            }
        }
    }

    // ---- receive path ------------------------------------------------

    fn process_cmd(self: &Arc<Self>, payload: &[u8]) -> Result<(), ApxError> {
        let raw = match command::deserialize_cmd_type(payload) {
            Ok(raw) => raw,
            Err(_) => return self.nack_malformed("truncated command"),
        };
        let Ok(cmd) = CmdType::try_from(raw) else {
            return self.nack_malformed("unknown command type");
        };
        match cmd {
            CmdType::FileInfo => self.on_file_info(payload),
            CmdType::FileOpen => self.on_file_open(payload),
            CmdType::FileClose => self.on_file_close(payload),
            CmdType::RevokeFile => self.on_revoke_file(payload),
            CmdType::GetFileList => self.on_get_file_list(),
            CmdType::GetFileInfo => self.on_get_file_info(payload),
            CmdType::Ack => Ok(()),
            CmdType::Nack => {
                warn!("peer sent NACK");
                Ok(())
            }
            CmdType::Eot => {
                if let Some(events) = self.events() {
                    events.end_of_transmission(self);
                }
                Ok(())
            }
        }
    }

    fn on_file_info(self: &Arc<Self>, payload: &[u8]) -> Result<(), ApxError> {
        let info = match command::deserialize_file_info(payload) {
            Ok(info) => info,
            Err(_) => return self.nack_malformed("malformed FILE_INFO"),
        };
        if info.length > MAX_FILE_SIZE {
            warn!(name = %info.name, length = info.length, "rejecting oversize file");
            self.send_plain_cmd(CmdType::Nack).ok();
            return Err(ApxError::FileTooLarge);
        }
        trace!(name = %info.name, address = info.address, "remote file");
        self.shared.create_remote_file(info.clone())?;
        if let Some(events) = self.events() {
            events.remote_file_created(self, &info);
        }
        Ok(())
    }

    fn on_file_open(&self, payload: &[u8]) -> Result<(), ApxError> {
        let Ok(address) = command::deserialize_file_address(payload) else {
            return self.nack_malformed("malformed FILE_OPEN");
        };
        let info = match self.shared.set_open(address, true) {
            Ok(info) => info,
            Err(_) => {
                debug!(address, "FILE_OPEN for unknown local address");
                return self.send_plain_cmd(CmdType::Nack);
            }
        };
        let snapshot = self.shared.snapshot_by_address(address).ok_or(ApxError::FileNotFound)?;
        if let Some(source) = snapshot.source {
            let mut content = vec![0u8; info.length as usize];
            source.read(0, &mut content)?;
            self.send_data(info.address, &content)?;
        }
        if let Some(events) = self.events() {
            events.file_open_requested(&info);
        }
        Ok(())
    }

    fn on_file_close(&self, payload: &[u8]) -> Result<(), ApxError> {
        let Ok(address) = command::deserialize_file_address(payload) else {
            return self.nack_malformed("malformed FILE_CLOSE");
        };
        self.shared.set_open(address, false).map(|_| ()).or_else(|_| {
            debug!(address, "FILE_CLOSE for unknown local address");
            Ok(())
        })
    }

    fn on_revoke_file(&self, payload: &[u8]) -> Result<(), ApxError> {
        let Ok(address) = command::deserialize_file_address(payload) else {
            return self.nack_malformed("malformed REVOKE_FILE");
        };
        if let Some(info) = self.shared.remove_remote_file(address) {
            if let Some(events) = self.events() {
                events.remote_file_revoked(&info);
            }
        }
        Ok(())
    }

    fn on_get_file_list(&self) -> Result<(), ApxError> {
        for info in self.shared.local_file_infos() {
            self.send_file_info(&info)?;
        }
        self.send_plain_cmd(CmdType::Eot)
    }

    fn on_get_file_info(&self, payload: &[u8]) -> Result<(), ApxError> {
        let Ok(address) = command::deserialize_file_address(payload) else {
            return self.nack_malformed("malformed GET_FILE_INFO");
        };
        match self.shared.snapshot_by_address(address) {
            Some(snapshot) => self.send_file_info(&snapshot.info),
            None => self.send_plain_cmd(CmdType::Nack),
        }
    }

    fn process_data(
        self: &Arc<Self>,
        address: u32,
        payload: &[u8],
        more_bit: bool,
    ) -> Result<(), ApxError> {
        let mut receiver = self.receiver.lock().expect("receiver lock");
        if !receiver.is_ongoing() {
            // Size the reassembly buffer for the file the write targets, so
            // a fragmented full-file write fits.
            let needed = self
                .shared
                .snapshot_by_address(address | REMOTE_ADDRESS_BIT)
                .or_else(|| self.shared.snapshot_by_address(address))
                .map(|s| s.info.length as usize)
                .unwrap_or(0)
                .max(payload.len())
                .max(1024);
            if receiver.buffer_size() < needed {
                receiver.reserve(needed)?;
            }
        }
        let completion = match receiver.write(address, payload, more_bit) {
            Ok(completion) => completion,
            Err(ApxError::UnexpectedAddress) => {
                self.send_plain_cmd(CmdType::Nack).ok();
                return Err(ApxError::UnexpectedAddress);
            }
            Err(err) => return Err(err),
        };
        if let Some(reception) = completion {
            self.route_write(reception.start_address, reception.data)?;
        }
        Ok(())
    }

    /// Deliver one complete write. Incoming data addresses live in the
    /// peer's space, so the remote map is consulted first and the local map
    /// is the fallback; a miss in both is counted and dropped.
    fn route_write(self: &Arc<Self>, address: u32, data: &[u8]) -> Result<(), ApxError> {
        let snapshot = self
            .shared
            .snapshot_by_address(address | REMOTE_ADDRESS_BIT)
            .or_else(|| self.shared.snapshot_by_address(address));
        let Some(snapshot) = snapshot else {
            self.unknown_address_count.fetch_add(1, Ordering::Relaxed);
            trace!(address, len = data.len(), "write to unknown address dropped");
            return Ok(());
        };
        let offset = address - snapshot.info.address;
        if offset as usize + data.len() > snapshot.info.length as usize {
            return self.nack_malformed("write past end of file");
        }
        if let Some(source) = &snapshot.source {
            source.write(offset, data)?;
        } else if let Some(events) = self.events() {
            events.remote_file_written(&snapshot.info, offset, data);
        }
        Ok(())
    }

    // ---- send path ---------------------------------------------------

    fn send_greeting(&self) -> Result<(), ApxError> {
        let text = greeting::format_greeting();
        let mut reservation = self.transmit.reserve(text.len())?;
        reservation.buffer().extend_from_slice(text.as_bytes());
        reservation.commit()
    }

    fn send_frame(&self, address: u32, more: bool, payload: &[u8]) -> Result<(), ApxError> {
        let mut header_len = header::header_size(address, more);
        // Keep the whole frame at or above the minimum message length.
        if header_len + payload.len() < MIN_MSG_LEN {
            header_len = HIGH_ADDRESS_SIZE;
        }
        let mut reservation = self.transmit.reserve(header_len + payload.len())?;
        let buf = reservation.buffer();
        if header_len == HIGH_ADDRESS_SIZE {
            header::pack_header_long(buf, address, more)?;
        } else {
            header::pack_header(buf, address, more)?;
        }
        buf.extend_from_slice(payload);
        reservation.commit()
    }

    fn send_cmd_payload(&self, payload: &[u8]) -> Result<(), ApxError> {
        self.send_frame(CMD_START_ADDR, false, payload)
    }

    fn nack_malformed(&self, reason: &str) -> Result<(), ApxError> {
        warn!(reason, "malformed message from peer");
        self.send_plain_cmd(CmdType::Nack)
    }

    fn events(&self) -> Option<Arc<dyn FileManagerEvents>> {
        self.events.lock().expect("events lock").clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::MemoryFileData;
    use apx_core::{FileType, TransmitReservation};
    use std::sync::Mutex as StdMutex;

    /// Captures committed frames for inspection.
    struct TransmitSpy {
        frames: Arc<StdMutex<Vec<Vec<u8>>>>,
        max_frame: usize,
    }

    impl TransmitSpy {
        fn new(max_frame: usize) -> Arc<Self> {
            Arc::new(TransmitSpy { frames: Arc::new(StdMutex::new(Vec::new())), max_frame })
        }

        fn take(&self) -> Vec<Vec<u8>> {
            std::mem::take(&mut self.frames.lock().unwrap())
        }
    }

    struct SpyReservation {
        buf: BytesMut,
        frames: Arc<StdMutex<Vec<Vec<u8>>>>,
    }

    impl TransmitReservation for SpyReservation {
        fn buffer(&mut self) -> &mut BytesMut {
            &mut self.buf
        }

        fn commit(self: Box<Self>) -> Result<(), ApxError> {
            self.frames.lock().unwrap().push(self.buf.to_vec());
            Ok(())
        }
    }

    impl TransmitHandler for TransmitSpy {
        fn max_frame_size(&self) -> usize {
            self.max_frame
        }

        fn reserve(&self, len: usize) -> Result<Box<dyn TransmitReservation>, ApxError> {
            Ok(Box::new(SpyReservation {
                buf: BytesMut::with_capacity(len),
                frames: Arc::clone(&self.frames),
            }))
        }
    }

    fn manager_with_spy(max_frame: usize) -> (Arc<FileManager>, Arc<TransmitSpy>) {
        let spy = TransmitSpy::new(max_frame);
        let allocator = Arc::new(Allocator::new());
        let manager = FileManager::new(spy.clone(), allocator);
        (manager, spy)
    }

    #[test]
    fn test_connected_sends_greeting_then_infos_then_eot() {
        let (manager, spy) = manager_with_spy(4096);
        manager
            .attach_local_file(
                FileInfo::new("TestNode1.out", 3).unwrap(),
                MemoryFileData::new(3),
            )
            .unwrap();
        manager.connected().unwrap();
        let frames = spy.take();
        assert_eq!(frames.len(), 3);
        assert!(frames[0].starts_with(b"RMFP/1.0\n"));
        // FILE_INFO frame from the seed case: 66 bytes for this file.
        assert_eq!(frames[1].len(), 66);
        assert_eq!(&frames[1][..4], &[0xBF, 0xFF, 0xFC, 0x00]);
        // EOT: cmd address + cmd type 2.
        assert_eq!(&frames[2][4..8], &[2, 0, 0, 0]);
    }

    #[test]
    fn test_file_open_emits_content() {
        let (manager, spy) = manager_with_spy(4096);
        let storage = MemoryFileData::from_bytes(vec![0xAA, 0xBB, 0xCC]);
        let address = manager
            .attach_local_file(FileInfo::new("TestNode1.out", 3).unwrap(), storage)
            .unwrap();
        manager.connected().unwrap();
        spy.take();

        let mut open_frame = BytesMut::new();
        header::pack_header(&mut open_frame, CMD_START_ADDR, false).unwrap();
        command::serialize_file_open(&mut open_frame, address);
        manager.process_message(&open_frame).unwrap();

        let frames = spy.take();
        assert_eq!(frames.len(), 1);
        let msg = header::unpack(&frames[0]).unwrap();
        assert_eq!(msg.address, address);
        assert_eq!(msg.payload, &[0xAA, 0xBB, 0xCC]);
    }

    #[test]
    fn test_incoming_write_routed_to_remote_file() {
        let (manager, _spy) = manager_with_spy(4096);
        let info = FileInfo::with_address("Peer.in", 0x400, 4, FileType::Fixed).unwrap();
        manager.shared().create_remote_file(info).unwrap();
        let sink = MemoryFileData::new(4);
        manager.shared().attach_remote_source(0x400, sink.clone()).unwrap();

        let mut frame = BytesMut::new();
        header::pack_header_long(&mut frame, 0x401, false).unwrap();
        frame.extend_from_slice(&[7, 8]);
        manager.process_message(&frame).unwrap();
        assert_eq!(sink.snapshot(), vec![0, 7, 8, 0]);
    }

    #[test]
    fn test_unknown_address_dropped_and_counted() {
        let (manager, _spy) = manager_with_spy(4096);
        let mut frame = BytesMut::new();
        header::pack_header_long(&mut frame, 0x9000, false).unwrap();
        frame.extend_from_slice(&[1, 2, 3]);
        manager.process_message(&frame).unwrap();
        assert_eq!(manager.unknown_address_count(), 1);
    }

    #[test]
    fn test_send_data_fragments_to_frame_budget() {
        let (manager, spy) = manager_with_spy(16);
        let payload: Vec<u8> = (0..30).collect();
        manager.send_data(0x1000, &payload).unwrap();
        let frames = spy.take();
        assert!(frames.len() > 1);
        let mut reassembled = Vec::new();
        for (i, frame) in frames.iter().enumerate() {
            let msg = header::unpack(frame).unwrap();
            assert_eq!(msg.address, 0x1000 + reassembled.len() as u32);
            assert_eq!(msg.more_bit, i + 1 < frames.len());
            reassembled.extend_from_slice(msg.payload);
        }
        assert_eq!(reassembled, payload);
    }
}
