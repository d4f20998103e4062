// SPDX-License-Identifier: MIT
// Copyright (c) 2025 the apx authors

//! Byte offset to port id lookup.
//!
//! For a packed port-data layout the map holds one entry per byte, so
//! answering "which port was written?" is a plain index.

use crate::node::PortDataProps;
use apx_core::{ApxError, PortId};

pub struct BytePortMap {
    map: Vec<PortId>,
}

impl BytePortMap {
    /// Build from the ports' packed layout. Offsets must be contiguous from
    /// zero, in port order.
    pub fn new(props: &[PortDataProps]) -> Result<Self, ApxError> {
        let total: usize = props.iter().map(|p| p.total_size() as usize).sum();
        let mut map = Vec::with_capacity(total);
        let mut expected_offset = 0u32;
        for (port_id, prop) in props.iter().enumerate() {
            if prop.offset != expected_offset {
                return Err(ApxError::InvalidArgument);
            }
            for _ in 0..prop.total_size() {
                map.push(port_id as PortId);
            }
            expected_offset += prop.total_size();
        }
        Ok(BytePortMap { map })
    }

    pub fn lookup(&self, offset: u32) -> Option<PortId> {
        self.map.get(offset as usize).copied()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Distinct ports overlapping `[offset, offset + len)`, in layout order.
    pub fn ports_in_range(&self, offset: u32, len: usize) -> Vec<PortId> {
        let mut ports = Vec::new();
        for k in offset as usize..(offset as usize + len).min(self.map.len()) {
            let port = self.map[k];
            if ports.last() != Some(&port) {
                ports.push(port);
            }
        }
        ports
    }
}
