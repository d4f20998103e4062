// SPDX-License-Identifier: MIT
// Copyright (c) 2025 the apx authors

use crate::allocator::{AllocBlock, Allocator};
use crate::connector_table::{PortConnectorChangeTable, PortEvent};
use crate::file_manager::FileManager;
use crate::node::data::NodeData;
use crate::node::definition::NodeDefinition;
use crate::node::info::{NodeInfo, PortInfo};
use apx_core::{ApxError, DtlValue, NodeMode, NodeState, PortId, PortKind};
use apx_vm::{Deserializer, Serializer};
use std::sync::{Arc, Mutex, Weak};

/// Non-owning reference to one port of one node. Holding a `PortRef` never
/// keeps its node alive.
#[derive(Debug, Clone)]
pub struct PortRef {
    node: Weak<NodeInstance>,
    kind: PortKind,
    port_id: PortId,
}

impl PortRef {
    pub fn new(node: &Arc<NodeInstance>, kind: PortKind, port_id: PortId) -> Self {
        PortRef { node: Arc::downgrade(node), kind, port_id }
    }

    pub fn node(&self) -> Option<Arc<NodeInstance>> {
        self.node.upgrade()
    }

    pub fn kind(&self) -> PortKind {
        self.kind
    }

    pub fn port_id(&self) -> PortId {
        self.port_id
    }

    pub fn same(&self, other: &PortRef) -> bool {
        self.port_id == other.port_id
            && self.kind == other.kind
            && Weak::ptr_eq(&self.node, &other.node)
    }
}

/// Per-node runtime state: static info, mutable buffers, routing tables and
/// lifecycle.
pub struct NodeInstance {
    info: NodeInfo,
    data: NodeData,
    mode: NodeMode,
    state: Mutex<NodeState>,
    /// Parent link to the enclosing connection's file manager. Non-owning:
    /// a node must never keep its connection alive.
    connection: Mutex<Weak<FileManager>>,
    definition_file_address: Mutex<Option<u32>>,
    provide_file_address: Mutex<Option<u32>>,
    require_file_address: Mutex<Option<u32>>,
    /// Server side only: for each provide port, the require ports currently
    /// fed by it.
    provide_triggers: Mutex<Vec<Vec<PortRef>>>,
    provide_changes: Mutex<Option<PortConnectorChangeTable>>,
    require_changes: Mutex<Option<PortConnectorChangeTable>>,
}

impl NodeInstance {
    pub fn build(definition: NodeDefinition) -> Result<Arc<Self>, ApxError> {
        Self::build_with_mode(definition, NodeMode::Client)
    }

    /// Process a definition all the way to `DataReady`: derive the node
    /// info, create the runtime buffers and pack every init value. The
    /// definition itself is consumed; only its raw text is retained.
    pub fn build_with_mode(
        definition: NodeDefinition,
        mode: NodeMode,
    ) -> Result<Arc<Self>, ApxError> {
        let info = NodeInfo::build(&definition)?;
        let data = NodeData::new(
            definition.definition,
            info.require_data_len as usize,
            info.provide_data_len as usize,
        );
        let num_provide = info.num_provide_ports();
        let instance = NodeInstance {
            info,
            data,
            mode,
            state: Mutex::new(NodeState::InfoBuilt),
            connection: Mutex::new(Weak::new()),
            definition_file_address: Mutex::new(None),
            provide_file_address: Mutex::new(None),
            require_file_address: Mutex::new(None),
            provide_triggers: Mutex::new(vec![Vec::new(); num_provide]),
            provide_changes: Mutex::new(None),
            require_changes: Mutex::new(None),
        };
        instance.pack_init_values()?;
        instance.set_state(NodeState::DataReady);
        Ok(Arc::new(instance))
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn info(&self) -> &NodeInfo {
        &self.info
    }

    pub fn data(&self) -> &NodeData {
        &self.data
    }

    pub fn mode(&self) -> NodeMode {
        self.mode
    }

    pub fn state(&self) -> NodeState {
        *self.state.lock().expect("state lock")
    }

    pub fn set_state(&self, state: NodeState) {
        *self.state.lock().expect("state lock") = state;
    }

    /// Point this node at its enclosing connection's file manager.
    pub fn set_connection(&self, file_manager: &Arc<FileManager>) {
        *self.connection.lock().expect("connection lock") = Arc::downgrade(file_manager);
    }

    pub fn clear_connection(&self) {
        *self.connection.lock().expect("connection lock") = Weak::new();
    }

    /// The enclosing connection's file manager, if it is still alive.
    pub fn connection(&self) -> Option<Arc<FileManager>> {
        self.connection.lock().expect("connection lock").upgrade()
    }

    pub fn definition_bytes(&self) -> Vec<u8> {
        let len = self.data.definition_len();
        let mut bytes = vec![0u8; len];
        // Freshly sized from the same buffer; cannot fail.
        let _ = self.data.read_definition(0, &mut bytes);
        bytes
    }

    pub fn set_definition_file_address(&self, address: u32) {
        *self.definition_file_address.lock().expect("address lock") = Some(address);
    }

    pub fn definition_file_address(&self) -> Option<u32> {
        *self.definition_file_address.lock().expect("address lock")
    }

    pub fn set_provide_file_address(&self, address: u32) {
        *self.provide_file_address.lock().expect("address lock") = Some(address);
    }

    pub fn provide_file_address(&self) -> Option<u32> {
        *self.provide_file_address.lock().expect("address lock")
    }

    pub fn set_require_file_address(&self, address: u32) {
        *self.require_file_address.lock().expect("address lock") = Some(address);
    }

    pub fn require_file_address(&self) -> Option<u32> {
        *self.require_file_address.lock().expect("address lock")
    }

    pub fn provide_port_ref(self: &Arc<Self>, port_id: PortId) -> PortRef {
        PortRef::new(self, PortKind::Provide, port_id)
    }

    pub fn require_port_ref(self: &Arc<Self>, port_id: PortId) -> PortRef {
        PortRef::new(self, PortKind::Require, port_id)
    }

    fn provide_port(&self, port_id: PortId) -> Result<&PortInfo, ApxError> {
        self.info.port(PortKind::Provide, port_id).ok_or(ApxError::InvalidArgument)
    }

    fn require_port(&self, port_id: PortId) -> Result<&PortInfo, ApxError> {
        self.info.port(PortKind::Require, port_id).ok_or(ApxError::InvalidArgument)
    }

    /// Pack `value` into the provide-port buffer and snapshot the port's
    /// packed bytes. The buffer lock covers both steps, so concurrent
    /// publishers to the same port serialize and never tear.
    pub fn pack_provide_port(
        &self,
        port_id: PortId,
        value: &DtlValue,
        allocator: &Allocator,
    ) -> Result<(u32, AllocBlock), ApxError> {
        let port = self.provide_port(port_id)?;
        let program = port.pack_program.as_ref().ok_or(ApxError::InvalidProgram)?;
        let offset = port.props.offset as usize;
        let size = port.props.size as usize;
        let block = self.data.with_provide_data(|buf| {
            if offset + size > buf.len() {
                return Err(ApxError::BufferBoundary);
            }
            let slice = &mut buf[offset..offset + size];
            let mut serializer = Serializer::new(slice);
            serializer.set_value(value);
            serializer.run(program)?;
            let mut block = allocator.alloc(size)?;
            block.copy_from_slice(&buf[offset..offset + size]);
            Ok(block)
        })?;
        Ok((port.props.offset, block))
    }

    /// Current value of a provide port, unpacked from the buffer.
    pub fn read_provide_port(&self, port_id: PortId) -> Result<DtlValue, ApxError> {
        let port = self.provide_port(port_id)?;
        let program = port.unpack_program.as_ref().ok_or(ApxError::InvalidProgram)?;
        let mut bytes = vec![0u8; port.props.size as usize];
        self.data.read_provide_data(port.props.offset, &mut bytes)?;
        Deserializer::new(&bytes).run(program)
    }

    /// Current value of a require port, unpacked from the buffer.
    pub fn unpack_require_port(&self, port_id: PortId) -> Result<DtlValue, ApxError> {
        let port = self.require_port(port_id)?;
        let program = port.unpack_program.as_ref().ok_or(ApxError::InvalidProgram)?;
        let mut bytes = vec![0u8; port.props.size as usize];
        self.data.read_require_data(port.props.offset, &mut bytes)?;
        Deserializer::new(&bytes).run(program)
    }

    /// Apply a peer write to the require-port buffer and unpack every port
    /// the write touched.
    pub fn apply_require_write(
        &self,
        offset: u32,
        data: &[u8],
    ) -> Result<Vec<(PortId, DtlValue)>, ApxError> {
        self.data.write_require_data(offset, data)?;
        let map = self.info.require_byte_map.as_ref().ok_or(ApxError::InvalidArgument)?;
        let mut updates = Vec::new();
        for port_id in map.ports_in_range(offset, data.len()) {
            updates.push((port_id, self.unpack_require_port(port_id)?));
        }
        Ok(updates)
    }

    /// Copy a provider's packed bytes straight into a require port of
    /// `self`. Both ports must share a signature, hence a packed size.
    pub fn update_require_port_from(
        &self,
        require_id: PortId,
        provider: &NodeInstance,
        provide_id: PortId,
    ) -> Result<(), ApxError> {
        let dest = self.require_port(require_id)?.props;
        let src = provider.provide_port(provide_id)?.props;
        if dest.size != src.size {
            return Err(ApxError::LengthError);
        }
        let mut bytes = vec![0u8; src.size as usize];
        provider.data.read_provide_data(src.offset, &mut bytes)?;
        self.data.write_require_data(dest.offset, &bytes)
    }

    pub fn record_connector_change(
        &self,
        side: PortKind,
        port_id: PortId,
        remote: PortRef,
        event: PortEvent,
    ) {
        let (table, num_ports) = match side {
            PortKind::Provide => (&self.provide_changes, self.info.num_provide_ports()),
            PortKind::Require => (&self.require_changes, self.info.num_require_ports()),
        };
        let mut guard = table.lock().expect("change table lock");
        guard
            .get_or_insert_with(|| PortConnectorChangeTable::new(num_ports))
            .record(port_id, remote, event);
    }

    pub fn take_provide_changes(&self) -> Option<PortConnectorChangeTable> {
        self.provide_changes.lock().expect("change table lock").take()
    }

    pub fn take_require_changes(&self) -> Option<PortConnectorChangeTable> {
        self.require_changes.lock().expect("change table lock").take()
    }

    pub fn add_trigger(&self, provide_id: PortId, target: PortRef) {
        let mut triggers = self.provide_triggers.lock().expect("trigger lock");
        if let Some(list) = triggers.get_mut(provide_id as usize) {
            if !list.iter().any(|t| t.same(&target)) {
                list.push(target);
            }
        }
    }

    pub fn remove_trigger(&self, provide_id: PortId, target: &PortRef) {
        let mut triggers = self.provide_triggers.lock().expect("trigger lock");
        if let Some(list) = triggers.get_mut(provide_id as usize) {
            list.retain(|t| !t.same(target));
        }
    }

    pub fn triggers(&self, provide_id: PortId) -> Vec<PortRef> {
        self.provide_triggers
            .lock()
            .expect("trigger lock")
            .get(provide_id as usize)
            .cloned()
            .unwrap_or_default()
    }

    fn pack_init_values(&self) -> Result<(), ApxError> {
        for (port_id, port) in self.info.provide_ports.iter().enumerate() {
            if let (Some(value), Some(program)) = (&port.init_value, &port.pack_program) {
                let offset = port.props.offset as usize;
                let size = port.props.size as usize;
                self.data.with_provide_data(|buf| {
                    let mut serializer = Serializer::new(&mut buf[offset..offset + size]);
                    serializer.set_value(value);
                    serializer.run(program).map(|_| ())
                })?;
                tracing::trace!(node = %self.info.name, port_id, "packed provide init value");
            }
        }
        for port in &self.info.require_ports {
            if let (Some(value), Some(program)) =
                (&port.init_value, port.pack_program.as_ref())
            {
                let offset = port.props.offset as usize;
                let size = port.props.size as usize;
                self.data.with_require_data(|buf| {
                    let mut serializer = Serializer::new(&mut buf[offset..offset + size]);
                    serializer.set_value(value);
                    serializer.run(program).map(|_| ())
                })?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::definition::PortDefinition;
    use apx_vm::{ProgramBuilder, ProgramType, Width};

    fn u16_port(name: &str, init: Option<u32>) -> PortDefinition {
        PortDefinition {
            name: name.into(),
            signature: "S".into(),
            data_size: 2,
            queue_len: 0,
            is_dynamic: false,
            pack_program: ProgramBuilder::new(ProgramType::Pack, 2).uint(Width::Two).build(),
            unpack_program: ProgramBuilder::new(ProgramType::Unpack, 2)
                .uint(Width::Two)
                .build(),
            init_value: init.map(DtlValue::u32),
        }
    }

    fn test_node() -> Arc<NodeInstance> {
        let mut definition = NodeDefinition::new("TestNode1", b"APX/1.2\n".to_vec());
        definition.provide_ports.push(u16_port("Speed", Some(0x1234)));
        definition.provide_ports.push(u16_port("Rpm", None));
        definition.require_ports.push(u16_port("Limit", None));
        NodeInstance::build(definition).unwrap()
    }

    #[test]
    fn test_init_value_packed_into_provide_buffer() {
        let node = test_node();
        assert_eq!(node.state(), NodeState::DataReady);
        assert_eq!(node.read_provide_port(0).unwrap(), DtlValue::u32(0x1234));
    }

    #[test]
    fn test_pack_provide_port_snapshots_bytes() {
        let node = test_node();
        let allocator = Allocator::new();
        let (offset, block) = node
            .pack_provide_port(1, &DtlValue::u32(0xBEEF), &allocator)
            .unwrap();
        assert_eq!(offset, 2);
        assert_eq!(&block[..], &[0xEF, 0xBE]);
    }

    #[test]
    fn test_apply_require_write_reports_touched_ports() {
        let node = test_node();
        let updates = node.apply_require_write(0, &[0x10, 0x20]).unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].0, 0);
        assert_eq!(updates[0].1, DtlValue::u32(0x2010));
    }

    #[test]
    fn test_port_ref_does_not_keep_node_alive() {
        let node = test_node();
        let port_ref = node.provide_port_ref(0);
        assert!(port_ref.node().is_some());
        drop(node);
        assert!(port_ref.node().is_none());
    }

    #[test]
    fn test_update_require_port_from_provider() {
        let provider = test_node();
        let consumer = test_node();
        provider
            .pack_provide_port(0, &DtlValue::u32(0x4242), &Allocator::new())
            .unwrap();
        consumer.update_require_port_from(0, &provider, 0).unwrap();
        assert_eq!(consumer.unpack_require_port(0).unwrap(), DtlValue::u32(0x4242));
    }
}
