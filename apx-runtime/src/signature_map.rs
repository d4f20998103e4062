// SPDX-License-Identifier: MIT
// Copyright (c) 2025 the apx authors

//! Server-side port matching.
//!
//! Ports with byte-equal signatures are compatible. Every require port has
//! at most one active provider; when several providers share a signature
//! the last one attached wins, and detaching the active provider rebinds
//! its consumers to the previous one. Routing records its decisions as
//! connect/disconnect deltas in the affected nodes' connector change
//! tables; applying them is the caller's move.

use crate::connector_table::PortEvent;
use crate::node::{NodeInstance, PortRef};
use apx_core::{ApxError, PortKind};
use std::collections::HashMap;
use std::sync::{Arc, Weak};

#[derive(Default)]
struct SignatureMapEntry {
    /// Insertion ordered; the last element is the active provider.
    provide_ports: Vec<PortRef>,
    require_ports: Vec<PortRef>,
}

#[derive(Default)]
pub struct PortSignatureMap {
    map: HashMap<String, SignatureMapEntry>,
    /// Nodes whose change tables gained entries since the last drain.
    touched: Vec<Weak<NodeInstance>>,
}

impl PortSignatureMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Route every port of `node` into the map.
    pub fn connect_node(&mut self, node: &Arc<NodeInstance>) -> Result<(), ApxError> {
        for port_id in 0..node.info().num_provide_ports() {
            self.connect_provide(node.provide_port_ref(port_id as u32))?;
        }
        for port_id in 0..node.info().num_require_ports() {
            self.connect_require(node.require_port_ref(port_id as u32))?;
        }
        Ok(())
    }

    /// Remove every port of `node`, rebinding orphaned consumers.
    pub fn disconnect_node(&mut self, node: &Arc<NodeInstance>) -> Result<(), ApxError> {
        for port_id in 0..node.info().num_provide_ports() {
            self.disconnect_provide(&node.provide_port_ref(port_id as u32))?;
        }
        for port_id in 0..node.info().num_require_ports() {
            self.disconnect_require(&node.require_port_ref(port_id as u32))?;
        }
        Ok(())
    }

    pub fn connect_provide(&mut self, provide: PortRef) -> Result<(), ApxError> {
        let signature = signature_of(&provide)?;
        let entry = self.map.entry(signature).or_default();
        let superseded = entry.provide_ports.last().cloned();
        let consumers = entry.require_ports.clone();
        entry.provide_ports.push(provide.clone());
        for require in &consumers {
            if let Some(previous) = &superseded {
                self.record_pair(require, previous, PortEvent::Disconnected);
            }
            self.record_pair(require, &provide, PortEvent::Connected);
        }
        Ok(())
    }

    pub fn connect_require(&mut self, require: PortRef) -> Result<(), ApxError> {
        let signature = signature_of(&require)?;
        let entry = self.map.entry(signature).or_default();
        entry.require_ports.push(require.clone());
        if let Some(provider) = entry.provide_ports.last().cloned() {
            self.record_pair(&require, &provider, PortEvent::Connected);
        }
        Ok(())
    }

    pub fn disconnect_provide(&mut self, provide: &PortRef) -> Result<(), ApxError> {
        let signature = signature_of(provide)?;
        let Some(entry) = self.map.get_mut(&signature) else {
            return Err(ApxError::KeyNotFound(signature));
        };
        let Some(pos) = entry.provide_ports.iter().position(|p| p.same(provide)) else {
            return Ok(());
        };
        let was_active = pos == entry.provide_ports.len() - 1;
        entry.provide_ports.remove(pos);
        if was_active {
            let replacement = entry.provide_ports.last().cloned();
            let consumers = entry.require_ports.clone();
            for require in &consumers {
                self.record_pair(require, provide, PortEvent::Disconnected);
                if let Some(next) = &replacement {
                    self.record_pair(require, next, PortEvent::Connected);
                }
            }
        }
        self.drop_entry_if_empty(&signature);
        Ok(())
    }

    pub fn disconnect_require(&mut self, require: &PortRef) -> Result<(), ApxError> {
        let signature = signature_of(require)?;
        let Some(entry) = self.map.get_mut(&signature) else {
            return Err(ApxError::KeyNotFound(signature));
        };
        let Some(pos) = entry.require_ports.iter().position(|p| p.same(require)) else {
            return Ok(());
        };
        entry.require_ports.remove(pos);
        if let Some(provider) = entry.provide_ports.last().cloned() {
            self.record_pair(require, &provider, PortEvent::Disconnected);
        }
        self.drop_entry_if_empty(&signature);
        Ok(())
    }

    /// Nodes touched by routing since the last call, ready for change-table
    /// consumption.
    pub fn take_touched(&mut self) -> Vec<Arc<NodeInstance>> {
        let mut nodes: Vec<Arc<NodeInstance>> = Vec::new();
        for weak in self.touched.drain(..) {
            if let Some(node) = weak.upgrade() {
                if !nodes.iter().any(|n| Arc::ptr_eq(n, &node)) {
                    nodes.push(node);
                }
            }
        }
        nodes
    }

    /// Record the delta on both endpoints' tables: the require side learns
    /// about its (dis)connected provider and the provide side about its
    /// (dis)connected consumer.
    fn record_pair(&mut self, require: &PortRef, provide: &PortRef, event: PortEvent) {
        if let Some(node) = require.node() {
            node.record_connector_change(
                PortKind::Require,
                require.port_id(),
                provide.clone(),
                event,
            );
            self.touched.push(Arc::downgrade(&node));
        }
        if let Some(node) = provide.node() {
            node.record_connector_change(
                PortKind::Provide,
                provide.port_id(),
                require.clone(),
                event,
            );
            self.touched.push(Arc::downgrade(&node));
        }
    }

    fn drop_entry_if_empty(&mut self, signature: &str) {
        if let Some(entry) = self.map.get(signature) {
            if entry.provide_ports.is_empty() && entry.require_ports.is_empty() {
                self.map.remove(signature);
            }
        }
    }
}

fn signature_of(port: &PortRef) -> Result<String, ApxError> {
    let node = port.node().ok_or(ApxError::InvalidArgument)?;
    let info = node
        .info()
        .port(port.kind(), port.port_id())
        .ok_or(ApxError::InvalidArgument)?;
    if info.signature.is_empty() {
        return Err(ApxError::InvalidArgument);
    }
    Ok(info.signature.clone())
}

/// Consume the touched nodes' change tables: refresh trigger lists on
/// provider nodes and copy current provider data into newly bound require
/// ports.
pub fn apply_connector_changes(map: &mut PortSignatureMap) -> Result<(), ApxError> {
    for node in map.take_touched() {
        if let Some(mut table) = node.take_provide_changes() {
            for (provide_id, changes) in table.drain() {
                for change in changes {
                    match change.event {
                        PortEvent::Connected => node.add_trigger(provide_id, change.remote),
                        PortEvent::Disconnected => {
                            node.remove_trigger(provide_id, &change.remote)
                        }
                    }
                }
            }
        }
        if let Some(mut table) = node.take_require_changes() {
            for (require_id, changes) in table.drain() {
                // Only the final state of the port matters here.
                let last_connect = changes
                    .iter()
                    .rev()
                    .find(|c| c.event == PortEvent::Connected);
                if let Some(change) = last_connect {
                    if let Some(provider) = change.remote.node() {
                        node.update_require_port_from(
                            require_id,
                            &provider,
                            change.remote.port_id(),
                        )?;
                    }
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::Allocator;
    use crate::node::{NodeDefinition, PortDefinition};
    use apx_core::DtlValue;
    use apx_vm::{ProgramBuilder, ProgramType, Width};

    fn port(name: &str, signature: &str) -> PortDefinition {
        PortDefinition {
            name: name.into(),
            signature: signature.into(),
            data_size: 2,
            queue_len: 0,
            is_dynamic: false,
            pack_program: ProgramBuilder::new(ProgramType::Pack, 2).uint(Width::Two).build(),
            unpack_program: ProgramBuilder::new(ProgramType::Unpack, 2)
                .uint(Width::Two)
                .build(),
            init_value: None,
        }
    }

    fn provider(name: &str, signature: &str) -> Arc<NodeInstance> {
        let mut definition = NodeDefinition::new(name, Vec::new());
        definition.provide_ports.push(port("Signal", signature));
        NodeInstance::build(definition).unwrap()
    }

    fn consumer(name: &str, signature: &str) -> Arc<NodeInstance> {
        let mut definition = NodeDefinition::new(name, Vec::new());
        definition.require_ports.push(port("Signal", signature));
        NodeInstance::build(definition).unwrap()
    }

    #[test]
    fn test_last_attached_provider_wins() {
        let mut map = PortSignatureMap::new();
        let consumer_node = consumer("C", "T\"Sig\"S");
        let first = provider("P1", "T\"Sig\"S");
        let second = provider("P2", "T\"Sig\"S");

        map.connect_node(&consumer_node).unwrap();
        map.connect_node(&first).unwrap();
        first
            .pack_provide_port(0, &DtlValue::u32(0x1111), &Allocator::new())
            .unwrap();
        apply_connector_changes(&mut map).unwrap();
        assert_eq!(consumer_node.unpack_require_port(0).unwrap(), DtlValue::u32(0x1111));
        assert_eq!(first.triggers(0).len(), 1);

        map.connect_node(&second).unwrap();
        second
            .pack_provide_port(0, &DtlValue::u32(0x2222), &Allocator::new())
            .unwrap();
        apply_connector_changes(&mut map).unwrap();
        assert_eq!(consumer_node.unpack_require_port(0).unwrap(), DtlValue::u32(0x2222));
        assert!(first.triggers(0).is_empty());
        assert_eq!(second.triggers(0).len(), 1);
    }

    #[test]
    fn test_detaching_active_provider_rebinds_to_previous() {
        let mut map = PortSignatureMap::new();
        let consumer_node = consumer("C", "S");
        let first = provider("P1", "S");
        let second = provider("P2", "S");
        map.connect_node(&consumer_node).unwrap();
        map.connect_node(&first).unwrap();
        map.connect_node(&second).unwrap();
        first
            .pack_provide_port(0, &DtlValue::u32(0xAAAA), &Allocator::new())
            .unwrap();
        apply_connector_changes(&mut map).unwrap();

        map.disconnect_node(&second).unwrap();
        apply_connector_changes(&mut map).unwrap();
        assert_eq!(consumer_node.unpack_require_port(0).unwrap(), DtlValue::u32(0xAAAA));
        assert_eq!(first.triggers(0).len(), 1);
        assert!(second.triggers(0).is_empty());
    }

    #[test]
    fn test_orphan_after_last_provider_leaves() {
        let mut map = PortSignatureMap::new();
        let consumer_node = consumer("C", "S");
        let only = provider("P", "S");
        map.connect_node(&consumer_node).unwrap();
        map.connect_node(&only).unwrap();
        apply_connector_changes(&mut map).unwrap();
        assert_eq!(only.triggers(0).len(), 1);

        map.disconnect_node(&only).unwrap();
        apply_connector_changes(&mut map).unwrap();
        assert!(only.triggers(0).is_empty());
    }

    #[test]
    fn test_signatures_must_match_exactly() {
        let mut map = PortSignatureMap::new();
        let consumer_node = consumer("C", "A");
        let other = provider("P", "B");
        map.connect_node(&consumer_node).unwrap();
        map.connect_node(&other).unwrap();
        apply_connector_changes(&mut map).unwrap();
        assert!(other.triggers(0).is_empty());
        assert_eq!(map.len(), 2);
    }
}
