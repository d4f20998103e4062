// SPDX-License-Identifier: MIT
// Copyright (c) 2025 the apx authors

//! Session-driven client against a live server: connect, attach, publish,
//! session commands, disconnect.

use apx_client::{ApxClient, ClientConfig, SessionCmd, SessionCmdKind, SessionEvents};
use apx_core::{ApxError, DtlValue, PortId};
use apx_runtime::node::PortDataHandler;
use apx_runtime::{NodeDefinition, PortDefinition};
use apx_transport::{ApxServer, DefinitionHandler};
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

enum Event {
    Connected,
    Disconnected,
    Completed(i32),
    Error(SessionCmdKind),
    NodeList(Vec<String>),
}

struct ChannelEvents {
    tx: mpsc::UnboundedSender<Event>,
}

impl SessionEvents for ChannelEvents {
    fn connected(&self) {
        let _ = self.tx.send(Event::Connected);
    }

    fn disconnected(&self) {
        let _ = self.tx.send(Event::Disconnected);
    }

    fn completed(&self, user_code: i32) {
        let _ = self.tx.send(Event::Completed(user_code));
    }

    fn error(&self, cmd: SessionCmdKind, _error: &ApxError) {
        let _ = self.tx.send(Event::Error(cmd));
    }

    fn node_list(&self, nodes: Vec<String>) {
        let _ = self.tx.send(Event::NodeList(nodes));
    }
}

struct Capture {
    tx: mpsc::UnboundedSender<(PortId, DtlValue)>,
}

impl PortDataHandler for Capture {
    fn on_require_port_data(&self, _node: &str, port_id: PortId, value: &DtlValue) {
        let _ = self.tx.send((port_id, value.clone()));
    }
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    timeout(Duration::from_secs(10), rx.recv()).await.expect("event timeout").expect("closed")
}

#[tokio::test]
async fn test_session_connect_publish_disconnect() {
    let server = ApxServer::bind("127.0.0.1:0", Arc::new(TestParser)).await.unwrap();
    let port = server.local_addr().unwrap().port();
    tokio::spawn(server.serve());

    let (event_tx, mut events) = mpsc::unbounded_channel();
    let client = ApxClient::new(
        ClientConfig::tcp("127.0.0.1", port),
        Arc::new(ChannelEvents { tx: event_tx }),
    );
    let (data_tx, mut data) = mpsc::unbounded_channel();
    client.set_port_data_handler(Arc::new(Capture { tx: data_tx }));

    // Attached before connecting: advertised as part of the handshake.
    client.attach_node(build_definition("TestNode1")).unwrap();
    client.connect().unwrap();
    assert!(matches!(next_event(&mut events).await, Event::Connected));

    let node = timeout(Duration::from_secs(10), async {
        loop {
            if let Some(node) = client.node_manager().get("TestNode1") {
                if node.require_file_address().is_some() {
                    return node;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("node never wired");
    assert_eq!(node.name(), "TestNode1");

    // Publish until the server's matcher echoes the value back.
    timeout(Duration::from_secs(10), async {
        loop {
            client.publish("TestNode1", "Speed", &DtlValue::u32(0x0BEE)).expect("publish");
            match timeout(Duration::from_millis(200), data.recv()).await {
                Ok(Some((0, value))) if value == DtlValue::u32(0x0BEE) => return,
                _ => continue,
            }
        }
    })
    .await
    .expect("echo never arrived");

    // Session commands run in order through the queue.
    client.session().send(SessionCmd::Heartbeat).unwrap();
    client.session().send(SessionCmd::ListNodes).unwrap();
    client.session().send(SessionCmd::Complete(7)).unwrap();
    loop {
        match next_event(&mut events).await {
            Event::NodeList(_) => {}
            Event::Completed(code) => {
                assert_eq!(code, 7);
                break;
            }
            Event::Error(kind) => panic!("unexpected error for {kind:?}"),
            _ => {}
        }
    }

    client.disconnect().unwrap();
    assert!(matches!(next_event(&mut events).await, Event::Disconnected));
    client.shutdown().await;
}
