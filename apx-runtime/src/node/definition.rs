// SPDX-License-Identifier: MIT
// Copyright (c) 2025 the apx authors

//! Parser-facing node description. The definition parser lives outside the
//! runtime; it hands over one `NodeDefinition` per node and the runtime
//! derives everything else from it.

use apx_core::DtlValue;

/// Packed layout of one port inside its side's data file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortDataProps {
    pub offset: u32,
    /// Packed size of one element, length prefix included for dynamic data.
    pub size: u32,
    /// Queue depth; 0 and 1 both mean unqueued.
    pub queue_len: u32,
    pub is_dynamic: bool,
}

impl PortDataProps {
    pub fn total_size(&self) -> u32 {
        if self.queue_len > 1 {
            self.size * self.queue_len
        } else {
            self.size
        }
    }
}

#[derive(Debug, Clone)]
pub struct PortDefinition {
    pub name: String,
    /// Compact type signature; byte-equal signatures are compatible.
    pub signature: String,
    pub data_size: u32,
    pub queue_len: u32,
    pub is_dynamic: bool,
    pub pack_program: Vec<u8>,
    pub unpack_program: Vec<u8>,
    pub init_value: Option<DtlValue>,
}

#[derive(Debug, Clone, Default)]
pub struct NodeDefinition {
    pub name: String,
    /// Raw definition text, published as the node's `.apx` file.
    pub definition: Vec<u8>,
    pub provide_ports: Vec<PortDefinition>,
    pub require_ports: Vec<PortDefinition>,
}

impl NodeDefinition {
    pub fn new(name: impl Into<String>, definition: Vec<u8>) -> Self {
        NodeDefinition {
            name: name.into(),
            definition,
            provide_ports: Vec::new(),
            require_ports: Vec::new(),
        }
    }
}
