// SPDX-License-Identifier: MIT
// Copyright (c) 2025 the apx authors

//! Full client/server exchange over a real TCP socket: greeting, file
//! listing, definition transfer, port routing and data delivery.

use apx_core::{ApxError, DtlValue, PortId};
use apx_runtime::node::PortDataHandler;
use apx_runtime::{Allocator, NodeDefinition, NodeManager, PortDefinition};
use apx_transport::{ApxServer, ClientConnection, ConnectTarget, DefinitionHandler};
use apx_vm::{ProgramBuilder, ProgramType, Width};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

fn u16_port(name: &str, signature: &str) -> PortDefinition {
    PortDefinition {
        name: name.into(),
        signature: signature.into(),
        data_size: 2,
        queue_len: 0,
        is_dynamic: false,
        pack_program: ProgramBuilder::new(ProgramType::Pack, 2).uint(Width::Two).build(),
        unpack_program: ProgramBuilder::new(ProgramType::Unpack, 2).uint(Width::Two).build(),
        init_value: Some(DtlValue::u32(0)),
    }
}

/// One provide port and one require port with the same signature, so the
/// server's matcher loops the published value straight back.
fn build_definition(name: &str) -> NodeDefinition {
    let mut definition =
        NodeDefinition::new(name, format!("APX/1.2\nN\"{name}\"\n").into_bytes());
    definition.provide_ports.push(u16_port("Speed", "T\"Speed\"S"));
    definition.require_ports.push(u16_port("Echo", "T\"Speed\"S"));
    definition
}

struct TestParser;

impl DefinitionHandler for TestParser {
    fn parse_definition(&self, name: &str, _text: &[u8]) -> Result<NodeDefinition, ApxError> {
        Ok(build_definition(name))
    }
}

struct Capture {
    tx: mpsc::UnboundedSender<(String, PortId, DtlValue)>,
}

impl PortDataHandler for Capture {
    fn on_require_port_data(&self, node: &str, port_id: PortId, value: &DtlValue) {
        let _ = self.tx.send((node.to_string(), port_id, value.clone()));
    }
}

#[tokio::test]
async fn test_publish_round_trips_through_server() {
    let server = ApxServer::bind("127.0.0.1:0", Arc::new(TestParser)).await.unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.serve());

    let node_manager = NodeManager::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    node_manager.set_port_data_handler(Arc::new(Capture { tx }));
    let allocator = Arc::new(Allocator::new());
    allocator.start();

    let target = ConnectTarget::Tcp { host: "127.0.0.1".into(), port: addr.port() };
    let connection = ClientConnection::connect(&target, node_manager.clone(), allocator.clone())
        .await
        .unwrap();
    let node = connection.attach_node(build_definition("TestNode1")).unwrap();

    // The server needs the definition before routing exists; wait until it
    // advertised the node's require-data file back to us.
    timeout(Duration::from_secs(10), async {
        while node.require_file_address().is_none() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("require-data file never arrived");

    // Publish until the echo lands; early publishes may race the server's
    // open of our provide-data file.
    let received = timeout(Duration::from_secs(10), async {
        loop {
            connection
                .publish("TestNode1", "Speed", &DtlValue::u32(0x1234))
                .expect("publish");
            match timeout(Duration::from_millis(200), rx.recv()).await {
                Ok(Some((node_name, port_id, value))) => {
                    assert_eq!(node_name, "TestNode1");
                    assert_eq!(port_id, 0);
                    if value == DtlValue::u32(0x1234) {
                        return value;
                    }
                }
                _ => continue,
            }
        }
    })
    .await
    .expect("echo never arrived");

    assert_eq!(received, DtlValue::u32(0x1234));
    assert_eq!(connection.file_manager().unknown_address_count(), 0);

    connection.close().await;
    allocator.stop();
}

#[tokio::test]
async fn test_connect_failure_is_io_error() {
    let node_manager = NodeManager::new();
    let allocator = Arc::new(Allocator::new());
    // Port 1 is essentially never listening on loopback.
    let target = ConnectTarget::Tcp { host: "127.0.0.1".into(), port: 1 };
    let result = ClientConnection::connect(&target, node_manager, allocator).await;
    assert!(matches!(result, Err(ApxError::Io(_))));
}
