// SPDX-License-Identifier: MIT
// Copyright (c) 2025 the apx authors

/// Port identifier, dense per node and per side (provide/require).
pub type PortId = u32;

/// Connection identifier assigned by the server at accept time.
pub type ConnectionId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortKind {
    Provide,
    Require,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeMode {
    Client,
    Server,
}

/// Lifecycle of a node instance. Transitions only move forward, except the
/// final Connected -> Disconnected step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum NodeState {
    Constructed,
    DefinitionAttached,
    InfoBuilt,
    DataReady,
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum FileType {
    Fixed = 0,
    Dynamic = 1,
    Stream = 2,
}

impl FileType {
    pub fn from_u16(raw: u16) -> Option<Self> {
        match raw {
            0 => Some(FileType::Fixed),
            1 => Some(FileType::Dynamic),
            2 => Some(FileType::Stream),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum DigestType {
    None = 0,
    Sha256 = 1,
}

impl DigestType {
    pub fn from_u16(raw: u16) -> Option<Self> {
        match raw {
            0 => Some(DigestType::None),
            1 => Some(DigestType::Sha256),
            _ => None,
        }
    }
}
