// SPDX-License-Identifier: MIT
// Copyright (c) 2025 the apx authors

//! Accumulated connect/disconnect deltas for one side of one node.
//!
//! Produced while the signature map routes ports, consumed exactly once by
//! whoever applies the changes, then cleared.

use crate::node::PortRef;
use apx_core::PortId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortEvent {
    Connected,
    Disconnected,
}

#[derive(Debug, Clone)]
pub struct PortChange {
    pub remote: PortRef,
    pub event: PortEvent,
}

/// Per-port slot. Storage grows from empty through a single inline change
/// to a list only when routing actually produces that many deltas.
#[derive(Default)]
pub enum PortConnectorChangeEntry {
    #[default]
    None,
    One(PortChange),
    Many(Vec<PortChange>),
}

impl PortConnectorChangeEntry {
    fn push(&mut self, change: PortChange) {
        match std::mem::take(self) {
            PortConnectorChangeEntry::None => *self = PortConnectorChangeEntry::One(change),
            PortConnectorChangeEntry::One(first) => {
                *self = PortConnectorChangeEntry::Many(vec![first, change]);
            }
            PortConnectorChangeEntry::Many(mut changes) => {
                changes.push(change);
                *self = PortConnectorChangeEntry::Many(changes);
            }
        }
    }

    pub fn changes(&self) -> &[PortChange] {
        match self {
            PortConnectorChangeEntry::None => &[],
            PortConnectorChangeEntry::One(change) => std::slice::from_ref(change),
            PortConnectorChangeEntry::Many(changes) => changes,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, PortConnectorChangeEntry::None)
    }
}

/// Dense table indexed by port id.
pub struct PortConnectorChangeTable {
    entries: Vec<PortConnectorChangeEntry>,
}

impl PortConnectorChangeTable {
    pub fn new(num_ports: usize) -> Self {
        let mut entries = Vec::with_capacity(num_ports);
        entries.resize_with(num_ports, PortConnectorChangeEntry::default);
        PortConnectorChangeTable { entries }
    }

    pub fn num_ports(&self) -> usize {
        self.entries.len()
    }

    pub fn record(&mut self, port_id: PortId, remote: PortRef, event: PortEvent) {
        if let Some(entry) = self.entries.get_mut(port_id as usize) {
            entry.push(PortChange { remote, event });
        }
    }

    pub fn entry(&self, port_id: PortId) -> Option<&PortConnectorChangeEntry> {
        self.entries.get(port_id as usize)
    }

    /// Drain every non-empty slot in port order.
    pub fn drain(&mut self) -> Vec<(PortId, Vec<PortChange>)> {
        let mut out = Vec::new();
        for (port_id, entry) in self.entries.iter_mut().enumerate() {
            let taken = std::mem::take(entry);
            if !taken.is_empty() {
                out.push((port_id as PortId, taken.changes().to_vec()));
            }
        }
        out
    }
}
