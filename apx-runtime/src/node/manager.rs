// SPDX-License-Identifier: MIT
// Copyright (c) 2025 the apx authors

use crate::file::FileDataSource;
use crate::file_manager::{FileManager, FileManagerEvents};
use crate::node::definition::NodeDefinition;
use crate::node::instance::NodeInstance;
use apx_codec::file_info::{DEFINITION_EXT, PROVIDE_DATA_EXT, REQUIRE_DATA_EXT};
use apx_codec::{FileInfo, FileKind};
use apx_core::{ApxError, DtlValue, NodeMode, NodeState, PortId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, warn};

/// Application-facing delivery of require-port updates.
pub trait PortDataHandler: Send + Sync {
    fn on_require_port_data(&self, node: &str, port_id: PortId, value: &DtlValue);
}

/// Owns the node instances of one connection and wires their buffers to
/// the file manager's files.
pub struct NodeManager {
    nodes: Mutex<HashMap<String, Arc<NodeInstance>>>,
    handler: Mutex<Option<Arc<dyn PortDataHandler>>>,
    self_weak: Weak<NodeManager>,
}

impl NodeManager {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|self_weak| NodeManager {
            nodes: Mutex::new(HashMap::new()),
            handler: Mutex::new(None),
            self_weak: self_weak.clone(),
        })
    }

    pub fn set_port_data_handler(&self, handler: Arc<dyn PortDataHandler>) {
        *self.handler.lock().expect("handler lock") = Some(handler);
    }

    pub fn get(&self, name: &str) -> Option<Arc<NodeInstance>> {
        self.nodes.lock().expect("nodes lock").get(name).cloned()
    }

    pub fn node_names(&self) -> Vec<String> {
        let mut names: Vec<String> =
            self.nodes.lock().expect("nodes lock").keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.nodes.lock().expect("nodes lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.lock().expect("nodes lock").is_empty()
    }

    /// Client-side attach: build the instance and publish its definition
    /// and provide-port data as local files. The require-port data file
    /// arrives from the peer and is hooked up in `remote_file_created`.
    pub fn attach_node(
        &self,
        definition: NodeDefinition,
        file_manager: &Arc<FileManager>,
    ) -> Result<Arc<NodeInstance>, ApxError> {
        let node = NodeInstance::build(definition)?;
        self.register(&node)?;
        node.set_connection(file_manager);

        let definition_bytes = node.definition_bytes();
        let info =
            FileInfo::new(format!("{}{DEFINITION_EXT}", node.name()), definition_bytes.len() as u32)?;
        let address = file_manager
            .attach_local_file(info, Arc::new(DefinitionSource { node: node.clone() }))?;
        node.set_definition_file_address(address);

        if node.info().provide_data_len > 0 {
            let info = FileInfo::new(
                format!("{}{PROVIDE_DATA_EXT}", node.name()),
                node.info().provide_data_len,
            )?;
            let address = file_manager
                .attach_local_file(info, Arc::new(ProvideDataSource { node: node.clone() }))?;
            node.set_provide_file_address(address);
        }
        debug!(node = %node.name(), "node attached");
        Ok(node)
    }

    /// Server-side attach: the definition was read from the peer; the
    /// require-port data file is ours to publish.
    pub fn attach_server_node(
        &self,
        definition: NodeDefinition,
        file_manager: &Arc<FileManager>,
    ) -> Result<Arc<NodeInstance>, ApxError> {
        let node = NodeInstance::build_with_mode(definition, NodeMode::Server)?;
        self.register(&node)?;
        node.set_connection(file_manager);
        if node.info().require_data_len > 0 {
            let info = FileInfo::new(
                format!("{}{REQUIRE_DATA_EXT}", node.name()),
                node.info().require_data_len,
            )?;
            let address = file_manager.attach_local_file(
                info,
                Arc::new(RequireDataSink {
                    node: node.clone(),
                    manager: self.self_weak.clone(),
                }),
            )?;
            node.set_require_file_address(address);
        }
        debug!(node = %node.name(), "server node attached");
        Ok(node)
    }

    /// Pack and transmit one provide-port value through the node's
    /// connection.
    pub fn publish(
        &self,
        node_name: &str,
        port_name: &str,
        value: &DtlValue,
    ) -> Result<(), ApxError> {
        let node = self.get(node_name).ok_or(ApxError::FileNotFound)?;
        let port_id =
            node.info().provide_port_id(port_name).ok_or(ApxError::InvalidArgument)?;
        self.publish_by_id(&node, port_id, value)
    }

    pub fn publish_by_id(
        &self,
        node: &Arc<NodeInstance>,
        port_id: PortId,
        value: &DtlValue,
    ) -> Result<(), ApxError> {
        let file_manager = node.connection().ok_or(ApxError::NotConnected)?;
        let (offset, block) =
            node.pack_provide_port(port_id, value, file_manager.allocator())?;
        let base = node.provide_file_address().ok_or(ApxError::NotConnected)?;
        file_manager.send_data(base + offset, &block)
    }

    /// Push the require-port bytes of a server node to its peer.
    pub fn send_require_data(
        &self,
        node: &Arc<NodeInstance>,
        port_id: PortId,
    ) -> Result<(), ApxError> {
        let file_manager = node.connection().ok_or(ApxError::NotConnected)?;
        let port =
            node.info().port(apx_core::PortKind::Require, port_id).ok_or(ApxError::InvalidArgument)?;
        let base = node.require_file_address().ok_or(ApxError::NotConnected)?;
        let mut bytes = vec![0u8; port.props.size as usize];
        node.data().read_require_data(port.props.offset, &mut bytes)?;
        file_manager.send_data(base + port.props.offset, &bytes)
    }

    pub fn mark_all(&self, state: NodeState) {
        for node in self.nodes.lock().expect("nodes lock").values() {
            node.set_state(state);
        }
    }

    fn register(&self, node: &Arc<NodeInstance>) -> Result<(), ApxError> {
        let mut nodes = self.nodes.lock().expect("nodes lock");
        if nodes.contains_key(node.name()) {
            return Err(ApxError::FileAlreadyExists);
        }
        nodes.insert(node.name().to_string(), node.clone());
        Ok(())
    }

    fn notify_port_data(&self, node: &str, updates: &[(PortId, DtlValue)]) {
        let handler = self.handler.lock().expect("handler lock").clone();
        if let Some(handler) = handler {
            for (port_id, value) in updates {
                handler.on_require_port_data(node, *port_id, value);
            }
        }
    }
}

impl FileManagerEvents for NodeManager {
    /// Client side: when the peer advertises this node's require-port data
    /// file, claim it and ask for its content.
    fn remote_file_created(&self, file_manager: &Arc<FileManager>, info: &FileInfo) {
        if info.kind() != FileKind::RequireData {
            return;
        }
        let Some(node) = self.get(info.base_name()) else {
            return;
        };
        if node.info().require_data_len != info.length {
            warn!(
                node = %node.name(),
                advertised = info.length,
                expected = node.info().require_data_len,
                "require-data file length mismatch, ignoring"
            );
            return;
        }
        let sink = Arc::new(RequireDataSink {
            node: node.clone(),
            manager: self.self_weak.clone(),
        });
        if file_manager.shared().attach_remote_source(info.address, sink).is_err() {
            return;
        }
        node.set_require_file_address(info.address);
        if let Err(err) = file_manager.request_open_remote(info.address) {
            warn!(node = %node.name(), error = %err, "failed to open require-data file");
            return;
        }
        node.set_state(NodeState::Connected);
    }
}

struct DefinitionSource {
    node: Arc<NodeInstance>,
}

impl FileDataSource for DefinitionSource {
    fn read(&self, offset: u32, dest: &mut [u8]) -> Result<(), ApxError> {
        self.node.data().read_definition(offset, dest)
    }

    fn write(&self, offset: u32, data: &[u8]) -> Result<(), ApxError> {
        self.node.data().write_definition(offset, data)
    }
}

struct ProvideDataSource {
    node: Arc<NodeInstance>,
}

impl FileDataSource for ProvideDataSource {
    fn read(&self, offset: u32, dest: &mut [u8]) -> Result<(), ApxError> {
        self.node.data().read_provide_data(offset, dest)
    }

    fn write(&self, offset: u32, data: &[u8]) -> Result<(), ApxError> {
        self.node.data().write_provide_data(offset, data)
    }
}

/// Applies peer writes to the require buffer and fans the unpacked values
/// out to the application handler.
struct RequireDataSink {
    node: Arc<NodeInstance>,
    manager: Weak<NodeManager>,
}

impl FileDataSource for RequireDataSink {
    fn read(&self, offset: u32, dest: &mut [u8]) -> Result<(), ApxError> {
        self.node.data().read_require_data(offset, dest)
    }

    fn write(&self, offset: u32, data: &[u8]) -> Result<(), ApxError> {
        let updates = self.node.apply_require_write(offset, data)?;
        if let Some(manager) = self.manager.upgrade() {
            manager.notify_port_data(self.node.name(), &updates);
        }
        Ok(())
    }
}
