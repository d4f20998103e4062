// SPDX-License-Identifier: MIT
// Copyright (c) 2025 the apx authors

pub mod error;
pub mod transmit;
pub mod types;
pub mod value;

pub use error::ApxError;
pub use transmit::{TransmitHandler, TransmitReservation};
pub use types::{
    ConnectionId, DigestType, FileType, NodeMode, NodeState, PortId, PortKind,
};
pub use value::{DtlScalar, DtlValue};
