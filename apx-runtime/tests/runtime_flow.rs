// SPDX-License-Identifier: MIT
// Copyright (c) 2025 the apx authors

//! Two file managers joined by in-memory queues: advertisement, open,
//! fragmented content transfer and publish, without any socket.

use apx_codec::FileInfo;
use apx_core::{ApxError, DtlValue, TransmitHandler, TransmitReservation};
use apx_runtime::file::MemoryFileData;
use apx_runtime::{Allocator, FileManager, FileManagerEvents, NodeDefinition, NodeManager, PortDefinition};
use apx_vm::{ProgramBuilder, ProgramType, Width};
use bytes::BytesMut;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Transmit handler backed by a plain queue.
struct Pipe {
    queue: Arc<Mutex<VecDeque<Vec<u8>>>>,
    max_frame: usize,
}

struct PipeReservation {
    buf: BytesMut,
    queue: Arc<Mutex<VecDeque<Vec<u8>>>>,
}

impl TransmitReservation for PipeReservation {
    fn buffer(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    fn commit(self: Box<Self>) -> Result<(), ApxError> {
        self.queue.lock().unwrap().push_back(self.buf.to_vec());
        Ok(())
    }
}

impl TransmitHandler for Pipe {
    fn max_frame_size(&self) -> usize {
        self.max_frame
    }

    fn reserve(&self, len: usize) -> Result<Box<dyn TransmitReservation>, ApxError> {
        Ok(Box::new(PipeReservation {
            buf: BytesMut::with_capacity(len),
            queue: Arc::clone(&self.queue),
        }))
    }
}

/// Records what the peer's writes look like from the event seam.
#[derive(Default)]
struct Recorder {
    created: Mutex<Vec<FileInfo>>,
    written: Mutex<Vec<(String, u32, Vec<u8>)>>,
}

impl FileManagerEvents for Recorder {
    fn remote_file_created(&self, _fm: &Arc<FileManager>, info: &FileInfo) {
        self.created.lock().unwrap().push(info.clone());
    }

    fn remote_file_written(&self, info: &FileInfo, offset: u32, data: &[u8]) {
        self.written.lock().unwrap().push((info.name.clone(), offset, data.to_vec()));
    }
}

struct Endpoint {
    manager: Arc<FileManager>,
    outgoing: Arc<Mutex<VecDeque<Vec<u8>>>>,
    greeting_skipped: bool,
}

fn endpoint(max_frame: usize) -> Endpoint {
    let outgoing = Arc::new(Mutex::new(VecDeque::new()));
    let pipe = Arc::new(Pipe { queue: Arc::clone(&outgoing), max_frame });
    let manager = FileManager::new(pipe, Arc::new(Allocator::new()));
    Endpoint { manager, outgoing, greeting_skipped: false }
}

/// Move queued messages from `from` into `to` until both directions drain.
fn pump(a: &mut Endpoint, b: &mut Endpoint) {
    loop {
        let moved = drain_one_direction(a, b) + drain_one_direction(b, a);
        if moved == 0 {
            return;
        }
    }
}

fn drain_one_direction(from: &mut Endpoint, to: &mut Endpoint) -> usize {
    let mut moved = 0;
    loop {
        let message = from.outgoing.lock().unwrap().pop_front();
        let Some(message) = message else {
            return moved;
        };
        moved += 1;
        if !from.greeting_skipped {
            assert!(message.starts_with(b"RMFP/1.0\n"));
            from.greeting_skipped = true;
            continue;
        }
        to.manager.process_message(&message).unwrap();
    }
}

fn u16_port(name: &str) -> PortDefinition {
    PortDefinition {
        name: name.into(),
        signature: "S".into(),
        data_size: 2,
        queue_len: 0,
        is_dynamic: false,
        pack_program: ProgramBuilder::new(ProgramType::Pack, 2).uint(Width::Two).build(),
        unpack_program: ProgramBuilder::new(ProgramType::Unpack, 2).uint(Width::Two).build(),
        init_value: Some(DtlValue::u32(0)),
    }
}

#[test]
fn test_advertise_open_and_publish_between_managers() {
    let definition_text = b"APX/1.2\nN\"TestNode1\"\nP\"Speed\"S\n".to_vec();
    let mut provider = endpoint(16); // small budget forces fragmentation
    let mut consumer = endpoint(4096);

    let node_manager = NodeManager::new();
    provider.manager.set_events(node_manager.clone());
    let recorder = Arc::new(Recorder::default());
    consumer.manager.set_events(recorder.clone());

    let mut definition = NodeDefinition::new("TestNode1", definition_text.clone());
    definition.provide_ports.push(u16_port("Speed"));
    node_manager.attach_node(definition, &provider.manager).unwrap();

    provider.manager.connected().unwrap();
    consumer.manager.connected().unwrap();
    pump(&mut provider, &mut consumer);

    // Both node files were advertised.
    let created = recorder.created.lock().unwrap().clone();
    assert_eq!(created.len(), 2);
    let apx_info = created.iter().find(|i| i.name == "TestNode1.apx").unwrap().clone();
    let out_info = created.iter().find(|i| i.name == "TestNode1.out").unwrap().clone();

    // Opening the definition streams its content, fragmented by the
    // provider's 16-byte frame budget and reassembled on receipt.
    consumer.manager.request_open_remote(apx_info.address).unwrap();
    pump(&mut provider, &mut consumer);
    let written = std::mem::take(&mut *recorder.written.lock().unwrap());
    assert_eq!(written.len(), 1);
    assert_eq!(written[0].0, "TestNode1.apx");
    assert_eq!(written[0].1, 0);
    assert_eq!(written[0].2, definition_text);

    // Claim the provide-port data with a sink, open it, publish.
    let sink = MemoryFileData::new(out_info.length as usize);
    consumer.manager.shared().attach_remote_source(out_info.address, sink.clone()).unwrap();
    consumer.manager.request_open_remote(out_info.address).unwrap();
    pump(&mut provider, &mut consumer);
    assert_eq!(sink.snapshot(), vec![0, 0]);

    node_manager.publish("TestNode1", "Speed", &DtlValue::u32(0x1234)).unwrap();
    pump(&mut provider, &mut consumer);
    assert_eq!(sink.snapshot(), vec![0x34, 0x12]);

    assert_eq!(provider.manager.unknown_address_count(), 0);
    assert_eq!(consumer.manager.unknown_address_count(), 0);
}

#[test]
fn test_allocator_random_interleaving() {
    use rand::{Rng, SeedableRng};

    let allocator = Arc::new(Allocator::new());
    allocator.start();
    let mut rng = rand::rngs::StdRng::seed_from_u64(7);
    let mut live: Vec<(apx_runtime::AllocBlock, u8)> = Vec::new();

    for round in 0..2000u32 {
        if live.is_empty() || rng.gen_bool(0.6) {
            let size = rng.gen_range(1..=32usize);
            let mut block = allocator.alloc(size).unwrap();
            let tag = (round % 251) as u8;
            block.iter_mut().for_each(|b| *b = tag);
            live.push((block, tag));
        } else {
            let index = rng.gen_range(0..live.len());
            live.swap_remove(index);
        }
        // Live blocks never alias: each still carries its own fill tag.
        for (block, tag) in &live {
            assert!(block.iter().all(|b| b == tag));
        }
    }
    live.clear();
    allocator.stop();
    assert!(!allocator.is_running());
}
