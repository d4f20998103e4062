// SPDX-License-Identifier: MIT
// Copyright (c) 2025 the apx authors

pub mod config;
pub mod logging;
pub mod session;

pub use config::{ClientConfig, ConnectConfig};
pub use session::{ClientSession, SessionCmd, SessionCmdKind, SessionEvents};

use apx_core::{ApxError, DtlValue};
use apx_runtime::node::PortDataHandler;
use apx_runtime::{Allocator, NodeDefinition, NodeManager};
use std::sync::Arc;

/// Application-facing handle: owns the allocator, the node manager and the
/// session worker that drives the connection.
pub struct ApxClient {
    node_manager: Arc<NodeManager>,
    allocator: Arc<Allocator>,
    session: Arc<ClientSession>,
    config: ClientConfig,
}

impl ApxClient {
    pub fn new(config: ClientConfig, events: Arc<dyn SessionEvents>) -> Arc<Self> {
        let node_manager = NodeManager::new();
        let allocator = Arc::new(Allocator::new());
        allocator.start();
        let session = ClientSession::start(
            node_manager.clone(),
            allocator.clone(),
            events,
            config.session_queue_depth,
        );
        Arc::new(ApxClient { node_manager, allocator, session, config })
    }

    pub fn session(&self) -> &Arc<ClientSession> {
        &self.session
    }

    pub fn node_manager(&self) -> &Arc<NodeManager> {
        &self.node_manager
    }

    /// Register a node. Attached before connecting, its files are
    /// advertised as part of the handshake; attached later, immediately.
    pub fn attach_node(&self, definition: NodeDefinition) -> Result<(), ApxError> {
        self.session.attach_node(definition)
    }

    pub fn set_port_data_handler(&self, handler: Arc<dyn PortDataHandler>) {
        self.node_manager.set_port_data_handler(handler);
    }

    /// Enqueue the connect command for the configured target.
    pub fn connect(&self) -> Result<(), ApxError> {
        self.session.send(SessionCmd::Connect(self.config.connect.target()))
    }

    pub fn disconnect(&self) -> Result<(), ApxError> {
        self.session.send(SessionCmd::Disconnect)
    }

    /// Pack and transmit one provide-port value. Callable from any thread.
    pub fn publish(
        &self,
        node_name: &str,
        port_name: &str,
        value: &DtlValue,
    ) -> Result<(), ApxError> {
        self.session.publish(node_name, port_name, value)
    }

    /// Cooperative shutdown of the session worker and the allocator's
    /// reclamation thread.
    pub async fn shutdown(&self) {
        self.session.stop().await;
        self.allocator.stop();
    }
}
