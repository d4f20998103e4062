// SPDX-License-Identifier: MIT
// Copyright (c) 2025 the apx authors

pub mod client;
pub mod connection;
pub mod server;
pub mod transmit;

pub use client::{ClientConnection, ConnectTarget};
pub use connection::Framer;
pub use server::{ApxServer, DefinitionHandler};
pub use transmit::SocketTransmitHandler;
