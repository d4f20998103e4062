// SPDX-License-Identifier: MIT
// Copyright (c) 2025 the apx authors

use crate::byte_port_map::BytePortMap;
use crate::node::definition::{NodeDefinition, PortDataProps, PortDefinition};
use apx_core::{ApxError, DtlValue, PortId, PortKind};
use apx_vm::Program;

/// Static description of one port, derived from the definition.
pub struct PortInfo {
    pub name: String,
    pub signature: String,
    pub props: PortDataProps,
    pub pack_program: Option<Program>,
    pub unpack_program: Option<Program>,
    pub init_value: Option<DtlValue>,
}

/// Everything about a node that never changes after the definition has been
/// processed. The definition's parse tree is not retained; this is what
/// survives it.
pub struct NodeInfo {
    pub name: String,
    pub provide_ports: Vec<PortInfo>,
    pub require_ports: Vec<PortInfo>,
    pub provide_data_len: u32,
    pub require_data_len: u32,
    pub provide_byte_map: Option<BytePortMap>,
    pub require_byte_map: Option<BytePortMap>,
}

impl NodeInfo {
    /// Derive layout, programs and lookup tables from a definition.
    pub fn build(definition: &NodeDefinition) -> Result<Self, ApxError> {
        if definition.name.is_empty() {
            return Err(ApxError::InvalidArgument);
        }
        let (provide_ports, provide_data_len) = build_side(&definition.provide_ports)?;
        let (require_ports, require_data_len) = build_side(&definition.require_ports)?;
        let provide_byte_map = build_byte_map(&provide_ports)?;
        let require_byte_map = build_byte_map(&require_ports)?;
        Ok(NodeInfo {
            name: definition.name.clone(),
            provide_ports,
            require_ports,
            provide_data_len,
            require_data_len,
            provide_byte_map,
            require_byte_map,
        })
    }

    pub fn port(&self, kind: PortKind, port_id: PortId) -> Option<&PortInfo> {
        match kind {
            PortKind::Provide => self.provide_ports.get(port_id as usize),
            PortKind::Require => self.require_ports.get(port_id as usize),
        }
    }

    pub fn num_provide_ports(&self) -> usize {
        self.provide_ports.len()
    }

    pub fn num_require_ports(&self) -> usize {
        self.require_ports.len()
    }

    pub fn provide_port_id(&self, name: &str) -> Option<PortId> {
        self.provide_ports.iter().position(|p| p.name == name).map(|i| i as PortId)
    }

    pub fn require_port_id(&self, name: &str) -> Option<PortId> {
        self.require_ports.iter().position(|p| p.name == name).map(|i| i as PortId)
    }
}

fn build_side(ports: &[PortDefinition]) -> Result<(Vec<PortInfo>, u32), ApxError> {
    let mut infos = Vec::with_capacity(ports.len());
    let mut offset = 0u32;
    for port in ports {
        if port.data_size == 0 {
            return Err(ApxError::LengthError);
        }
        let props = PortDataProps {
            offset,
            size: port.data_size,
            queue_len: port.queue_len,
            is_dynamic: port.is_dynamic,
        };
        let pack_program = parse_optional(&port.pack_program)?;
        let unpack_program = parse_optional(&port.unpack_program)?;
        infos.push(PortInfo {
            name: port.name.clone(),
            signature: port.signature.clone(),
            props,
            pack_program,
            unpack_program,
            init_value: port.init_value.clone(),
        });
        offset += props.total_size();
    }
    Ok((infos, offset))
}

fn parse_optional(bytes: &[u8]) -> Result<Option<Program>, ApxError> {
    if bytes.is_empty() {
        return Ok(None);
    }
    Program::parse(bytes).map(Some)
}

fn build_byte_map(ports: &[PortInfo]) -> Result<Option<BytePortMap>, ApxError> {
    if ports.is_empty() {
        return Ok(None);
    }
    let props: Vec<PortDataProps> = ports.iter().map(|p| p.props).collect();
    BytePortMap::new(&props).map(Some)
}
