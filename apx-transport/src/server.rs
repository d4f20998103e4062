// SPDX-License-Identifier: MIT
// Copyright (c) 2025 the apx authors

//! Server side: accept connections, read each peer's node definitions,
//! match compatible ports through the signature map and feed require ports
//! back to the peer.

use crate::connection::read_loop;
use crate::transmit::{transmit_loop, SocketTransmitHandler, DEFAULT_MAX_FRAME, DEFAULT_QUEUE_DEPTH};
use apx_codec::file_info::PROVIDE_DATA_EXT;
use apx_codec::{FileInfo, FileKind};
use apx_core::ApxError;
use apx_runtime::file::FileDataSource;
use apx_runtime::signature_map::apply_connector_changes;
use apx_runtime::{
    Allocator, FileManager, FileManagerEvents, NodeDefinition, NodeInstance, NodeManager,
    PortSignatureMap,
};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Seam to the definition parser, which lives outside the runtime.
pub trait DefinitionHandler: Send + Sync {
    fn parse_definition(&self, name: &str, text: &[u8]) -> Result<NodeDefinition, ApxError>;
}

pub struct ApxServer {
    listener: TcpListener,
    handler: Arc<dyn DefinitionHandler>,
    allocator: Arc<Allocator>,
}

impl ApxServer {
    pub async fn bind(
        addr: &str,
        handler: Arc<dyn DefinitionHandler>,
    ) -> Result<Self, ApxError> {
        let listener = TcpListener::bind(addr).await?;
        let allocator = Arc::new(Allocator::new());
        allocator.start();
        Ok(ApxServer { listener, handler, allocator })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ApxError> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn serve(self) -> Result<(), ApxError> {
        info!(addr = ?self.listener.local_addr().ok(), "server listening");
        loop {
            let (stream, peer) = self.listener.accept().await?;
            let connection_id: u32 = rand::random();
            debug!(%peer, connection_id, "accepted connection");
            let handler = self.handler.clone();
            let allocator = self.allocator.clone();
            tokio::spawn(async move {
                if let Err(err) =
                    handle_connection(stream, connection_id, handler, allocator).await
                {
                    warn!(connection_id, error = %err, "connection ended with error");
                }
            });
        }
    }
}

/// Drive one peer until its stream closes.
pub async fn handle_connection(
    stream: TcpStream,
    connection_id: u32,
    handler: Arc<dyn DefinitionHandler>,
    allocator: Arc<Allocator>,
) -> Result<(), ApxError> {
    stream.set_nodelay(true)?;
    let (read_half, write_half) = tokio::io::split(stream);
    let (frame_tx, frame_rx) = tokio::sync::mpsc::channel(DEFAULT_QUEUE_DEPTH);
    let transmit = Arc::new(SocketTransmitHandler::new(frame_tx, DEFAULT_MAX_FRAME));
    let file_manager = FileManager::new(transmit, allocator);
    file_manager.shared().set_connection_id(connection_id);

    let node_manager = NodeManager::new();
    let signature_map = Arc::new(Mutex::new(PortSignatureMap::new()));
    let events = ServerEvents::new(node_manager.clone(), signature_map.clone(), handler);
    file_manager.set_events(events);

    let (shutdown, shutdown_rx) = watch::channel(false);
    let mut writer_shutdown = shutdown.subscribe();
    let writer = tokio::spawn(async move {
        tokio::select! {
            result = transmit_loop(frame_rx, write_half) => {
                if let Err(err) = result {
                    warn!(error = %err, "transmit loop ended");
                }
            }
            _ = writer_shutdown.changed() => {}
        }
    });

    file_manager.connected()?;
    let result = read_loop(read_half, file_manager.clone(), shutdown_rx).await;

    file_manager.disconnected();
    {
        let mut map = signature_map.lock().expect("signature map lock");
        for name in node_manager.node_names() {
            if let Some(node) = node_manager.get(&name) {
                let _ = map.disconnect_node(&node);
                node.clear_connection();
            }
        }
        let _ = apply_connector_changes(&mut map);
    }
    let _ = shutdown.send(true);
    let _ = writer.await;
    debug!(connection_id, "connection closed");
    result
}

/// Per-connection reaction to peer files: collect definitions, attach
/// nodes, open provide-port data and route it onward.
struct ServerEvents {
    node_manager: Arc<NodeManager>,
    signature_map: Arc<Mutex<PortSignatureMap>>,
    handler: Arc<dyn DefinitionHandler>,
    self_weak: Weak<ServerEvents>,
}

impl ServerEvents {
    fn new(
        node_manager: Arc<NodeManager>,
        signature_map: Arc<Mutex<PortSignatureMap>>,
        handler: Arc<dyn DefinitionHandler>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_weak| ServerEvents {
            node_manager,
            signature_map,
            handler,
            self_weak: self_weak.clone(),
        })
    }

    fn on_definition_complete(&self, file_manager: &Arc<FileManager>, name: &str, text: &[u8]) {
        let definition = match self.handler.parse_definition(name, text) {
            Ok(definition) => definition,
            Err(err) => {
                warn!(node = name, error = %err, "definition rejected");
                return;
            }
        };
        let node = match self.node_manager.attach_server_node(definition, file_manager) {
            Ok(node) => node,
            Err(err) => {
                warn!(node = name, error = %err, "node attach failed");
                return;
            }
        };
        {
            let mut map = self.signature_map.lock().expect("signature map lock");
            if let Err(err) = map.connect_node(&node) {
                warn!(node = name, error = %err, "port routing failed");
            }
            if let Err(err) = apply_connector_changes(&mut map) {
                warn!(node = name, error = %err, "connector changes failed");
            }
        }
        info!(node = name, "node online");
        let out_name = format!("{name}{PROVIDE_DATA_EXT}");
        if let Some(snapshot) = file_manager.shared().snapshot_remote_by_name(&out_name) {
            self.wire_provide_data(file_manager, &snapshot.info, &node);
        }
    }

    fn wire_provide_data(
        &self,
        file_manager: &Arc<FileManager>,
        info: &FileInfo,
        node: &Arc<NodeInstance>,
    ) {
        let router = Arc::new(ProvideDataRouter {
            node: node.clone(),
            events: self.self_weak.clone(),
        });
        if file_manager.shared().attach_remote_source(info.address, router).is_err() {
            return;
        }
        node.set_provide_file_address(info.address);
        if let Err(err) = file_manager.request_open_remote(info.address) {
            warn!(node = %node.name(), error = %err, "failed to open provide-data file");
        }
    }

    /// A provide-port write landed: update every require port triggered by
    /// the touched ports and push their new bytes out through each target
    /// node's own connection.
    fn route_provide_write(&self, node: &Arc<NodeInstance>, offset: u32, len: usize) {
        let Some(map) = node.info().provide_byte_map.as_ref() else {
            return;
        };
        for port_id in map.ports_in_range(offset, len) {
            for trigger in node.triggers(port_id) {
                let Some(target) = trigger.node() else {
                    continue;
                };
                if let Err(err) =
                    target.update_require_port_from(trigger.port_id(), node, port_id)
                {
                    warn!(error = %err, "require-port update failed");
                    continue;
                }
                if let Err(err) = self.node_manager.send_require_data(&target, trigger.port_id())
                {
                    warn!(error = %err, "require-data transmit failed");
                }
            }
        }
    }
}

impl FileManagerEvents for ServerEvents {
    fn remote_file_created(&self, file_manager: &Arc<FileManager>, info: &FileInfo) {
        match info.kind() {
            FileKind::Definition => {
                let collector = Arc::new(DefinitionCollector {
                    name: info.base_name().to_string(),
                    buf: Mutex::new(vec![0u8; info.length as usize]),
                    events: self.self_weak.clone(),
                    file_manager: Arc::downgrade(file_manager),
                });
                if file_manager.shared().attach_remote_source(info.address, collector).is_ok() {
                    if let Err(err) = file_manager.request_open_remote(info.address) {
                        warn!(name = %info.name, error = %err, "failed to open definition");
                    }
                }
            }
            FileKind::ProvideData => {
                // The node exists only once its definition was processed;
                // otherwise wiring happens from on_definition_complete.
                if let Some(node) = self.node_manager.get(info.base_name()) {
                    self.wire_provide_data(file_manager, info, &node);
                }
            }
            FileKind::RequireData | FileKind::UserData => {}
        }
    }
}

/// Buffers a peer's definition file and fires once all of it has arrived.
struct DefinitionCollector {
    name: String,
    buf: Mutex<Vec<u8>>,
    events: Weak<ServerEvents>,
    file_manager: Weak<FileManager>,
}

impl FileDataSource for DefinitionCollector {
    fn read(&self, offset: u32, dest: &mut [u8]) -> Result<(), ApxError> {
        let buf = self.buf.lock().expect("definition lock");
        let start = offset as usize;
        let end = start + dest.len();
        if end > buf.len() {
            return Err(ApxError::BufferBoundary);
        }
        dest.copy_from_slice(&buf[start..end]);
        Ok(())
    }

    fn write(&self, offset: u32, data: &[u8]) -> Result<(), ApxError> {
        let complete = {
            let mut buf = self.buf.lock().expect("definition lock");
            let start = offset as usize;
            let end = start + data.len();
            if end > buf.len() {
                return Err(ApxError::BufferBoundary);
            }
            buf[start..end].copy_from_slice(data);
            start == 0 && data.len() == buf.len()
        };
        if complete {
            if let (Some(events), Some(file_manager)) =
                (self.events.upgrade(), self.file_manager.upgrade())
            {
                events.on_definition_complete(&file_manager, &self.name, data);
            }
        }
        Ok(())
    }
}

/// Applies peer provide-port writes and routes them to connected consumers.
struct ProvideDataRouter {
    node: Arc<NodeInstance>,
    events: Weak<ServerEvents>,
}

impl FileDataSource for ProvideDataRouter {
    fn read(&self, offset: u32, dest: &mut [u8]) -> Result<(), ApxError> {
        self.node.data().read_provide_data(offset, dest)
    }

    fn write(&self, offset: u32, data: &[u8]) -> Result<(), ApxError> {
        self.node.data().write_provide_data(offset, data)?;
        if let Some(events) = self.events.upgrade() {
            events.route_provide_write(&self.node, offset, data.len());
        }
        Ok(())
    }
}
