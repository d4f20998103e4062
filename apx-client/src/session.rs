// SPDX-License-Identifier: MIT
// Copyright (c) 2025 the apx authors

//! The session worker: a bounded command queue consumed by one task that
//! drives the connection state machine. `Exit` is the shutdown sentinel.

use apx_codec::file_info::DEFINITION_EXT;
use apx_codec::{CmdType, FileKind};
use apx_core::{ApxError, DtlValue};
use apx_runtime::{Allocator, NodeDefinition, NodeManager};
use apx_transport::{ClientConnection, ConnectTarget};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCmd {
    Exit,
    /// Sentinel that fires the user's completion callback with a code.
    Complete(i32),
    Connect(ConnectTarget),
    Disconnect,
    Heartbeat,
    PingBroker,
    ListNodes,
    OpenNode(String),
    CloseNode(String),
    PingNode(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCmdKind {
    Exit,
    Complete,
    Connect,
    Disconnect,
    Heartbeat,
    PingBroker,
    ListNodes,
    OpenNode,
    CloseNode,
    PingNode,
}

impl SessionCmd {
    pub fn kind(&self) -> SessionCmdKind {
        match self {
            SessionCmd::Exit => SessionCmdKind::Exit,
            SessionCmd::Complete(_) => SessionCmdKind::Complete,
            SessionCmd::Connect(_) => SessionCmdKind::Connect,
            SessionCmd::Disconnect => SessionCmdKind::Disconnect,
            SessionCmd::Heartbeat => SessionCmdKind::Heartbeat,
            SessionCmd::PingBroker => SessionCmdKind::PingBroker,
            SessionCmd::ListNodes => SessionCmdKind::ListNodes,
            SessionCmd::OpenNode(_) => SessionCmdKind::OpenNode,
            SessionCmd::CloseNode(_) => SessionCmdKind::CloseNode,
            SessionCmd::PingNode(_) => SessionCmdKind::PingNode,
        }
    }
}

/// Per-command status reporting back to the application.
pub trait SessionEvents: Send + Sync {
    fn connected(&self) {}
    fn disconnected(&self) {}
    fn completed(&self, user_code: i32) {
        let _ = user_code;
    }
    fn error(&self, cmd: SessionCmdKind, error: &ApxError) {
        let _ = (cmd, error);
    }
    fn node_list(&self, nodes: Vec<String>) {
        let _ = nodes;
    }
}

pub struct ClientSession {
    tx: mpsc::Sender<SessionCmd>,
    worker: Mutex<Option<JoinHandle<()>>>,
    shared: Arc<SessionShared>,
}

/// State visible both to the worker and to callers on other threads.
struct SessionShared {
    node_manager: Arc<NodeManager>,
    connection: Mutex<Option<Arc<ClientConnection>>>,
    pending_nodes: Mutex<Vec<NodeDefinition>>,
}

impl ClientSession {
    pub fn start(
        node_manager: Arc<NodeManager>,
        allocator: Arc<Allocator>,
        events: Arc<dyn SessionEvents>,
        queue_depth: usize,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(queue_depth.max(1));
        let shared = Arc::new(SessionShared {
            node_manager,
            connection: Mutex::new(None),
            pending_nodes: Mutex::new(Vec::new()),
        });
        let worker_shared = shared.clone();
        let worker = tokio::spawn(async move {
            session_worker(rx, worker_shared, allocator, events).await;
        });
        Arc::new(ClientSession { tx, worker: Mutex::new(Some(worker)), shared })
    }

    /// Enqueue a command; fails with `SessionQueueFull` on backpressure.
    pub fn send(&self, cmd: SessionCmd) -> Result<(), ApxError> {
        self.tx.try_send(cmd).map_err(|_| ApxError::SessionQueueFull)
    }

    /// Attach now when connected, otherwise queue for the next connect.
    pub fn attach_node(&self, definition: NodeDefinition) -> Result<(), ApxError> {
        let connection = self.shared.connection.lock().expect("connection lock").clone();
        match connection {
            Some(connection) => connection.attach_node(definition).map(|_| ()),
            None => {
                self.shared.pending_nodes.lock().expect("pending lock").push(definition);
                Ok(())
            }
        }
    }

    /// Direct publish path; bypasses the command queue so application
    /// threads are never serialized behind session commands.
    pub fn publish(
        &self,
        node_name: &str,
        port_name: &str,
        value: &DtlValue,
    ) -> Result<(), ApxError> {
        let connection = self.shared.connection.lock().expect("connection lock").clone();
        let connection = connection.ok_or(ApxError::NotConnected)?;
        connection.publish(node_name, port_name, value)
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connection.lock().expect("connection lock").is_some()
    }

    /// Send the exit sentinel and give the worker a bounded window to
    /// drain.
    pub async fn stop(&self) {
        if self.tx.send(SessionCmd::Exit).await.is_err() {
            return;
        }
        let worker = self.worker.lock().expect("worker lock").take();
        if let Some(worker) = worker {
            let abort = worker.abort_handle();
            if tokio::time::timeout(STOP_TIMEOUT, worker).await.is_err() {
                warn!("session worker did not stop in time, aborting");
                abort.abort();
            }
        }
    }
}

async fn session_worker(
    mut rx: mpsc::Receiver<SessionCmd>,
    shared: Arc<SessionShared>,
    allocator: Arc<Allocator>,
    events: Arc<dyn SessionEvents>,
) {
    while let Some(cmd) = rx.recv().await {
        let kind = cmd.kind();
        match cmd {
            SessionCmd::Exit => {
                debug!("session worker exiting");
                break;
            }
            SessionCmd::Complete(user_code) => events.completed(user_code),
            SessionCmd::Connect(target) => {
                match ClientConnection::connect(
                    &target,
                    shared.node_manager.clone(),
                    allocator.clone(),
                )
                .await
                {
                    Ok(connection) => {
                        let pending: Vec<NodeDefinition> =
                            shared.pending_nodes.lock().expect("pending lock").drain(..).collect();
                        for definition in pending {
                            if let Err(err) = connection.attach_node(definition) {
                                events.error(kind, &err);
                            }
                        }
                        *shared.connection.lock().expect("connection lock") = Some(connection);
                        events.connected();
                    }
                    Err(err) => events.error(kind, &err),
                }
            }
            SessionCmd::Disconnect => {
                let connection = shared.connection.lock().expect("connection lock").take();
                match connection {
                    Some(connection) => {
                        connection.close().await;
                        events.disconnected();
                    }
                    None => events.error(kind, &ApxError::NotConnected),
                }
            }
            SessionCmd::Heartbeat => {
                with_connection(&shared, &events, kind, |connection| {
                    connection.file_manager().send_plain_cmd(CmdType::Ack)
                });
            }
            SessionCmd::PingBroker => {
                // The broker answers a file-list request with its listing
                // and EOT; any response proves liveness.
                with_connection(&shared, &events, kind, |connection| {
                    connection.file_manager().send_plain_cmd(CmdType::GetFileList)
                });
            }
            SessionCmd::ListNodes => {
                let connection = shared.connection.lock().expect("connection lock").clone();
                match connection {
                    Some(connection) => {
                        let mut names: Vec<String> = connection
                            .file_manager()
                            .shared()
                            .remote_file_infos()
                            .iter()
                            .filter(|info| info.kind() == FileKind::Definition)
                            .map(|info| info.base_name().to_string())
                            .collect();
                        names.sort();
                        events.node_list(names);
                    }
                    None => events.error(kind, &ApxError::NotConnected),
                }
            }
            SessionCmd::OpenNode(name) => {
                with_definition_file(&shared, &events, kind, &name, |connection, address| {
                    connection.file_manager().request_open_remote(address)
                });
            }
            SessionCmd::CloseNode(name) => {
                with_definition_file(&shared, &events, kind, &name, |connection, address| {
                    connection.file_manager().request_close_remote(address)
                });
            }
            SessionCmd::PingNode(name) => {
                with_definition_file(&shared, &events, kind, &name, |connection, address| {
                    connection.file_manager().request_file_info(address)
                });
            }
        }
    }
    // Dropping a still-open connection on exit would leak its tasks.
    let connection = shared.connection.lock().expect("connection lock").take();
    if let Some(connection) = connection {
        connection.close().await;
    }
}

fn with_connection(
    shared: &Arc<SessionShared>,
    events: &Arc<dyn SessionEvents>,
    kind: SessionCmdKind,
    f: impl FnOnce(&Arc<ClientConnection>) -> Result<(), ApxError>,
) {
    let connection = shared.connection.lock().expect("connection lock").clone();
    match connection {
        Some(connection) => {
            if let Err(err) = f(&connection) {
                events.error(kind, &err);
            }
        }
        None => events.error(kind, &ApxError::NotConnected),
    }
}

fn with_definition_file(
    shared: &Arc<SessionShared>,
    events: &Arc<dyn SessionEvents>,
    kind: SessionCmdKind,
    node_name: &str,
    f: impl FnOnce(&Arc<ClientConnection>, u32) -> Result<(), ApxError>,
) {
    with_connection(shared, events, kind, |connection| {
        let file_name = format!("{node_name}{DEFINITION_EXT}");
        let snapshot = connection
            .file_manager()
            .shared()
            .snapshot_remote_by_name(&file_name)
            .ok_or(ApxError::FileNotFound)?;
        f(connection, snapshot.info.address)
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI32, Ordering};
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingEvents {
        completed: AtomicI32,
        errors: StdMutex<Vec<SessionCmdKind>>,
    }

    impl SessionEvents for RecordingEvents {
        fn completed(&self, user_code: i32) {
            self.completed.store(user_code, Ordering::SeqCst);
        }

        fn error(&self, cmd: SessionCmdKind, _error: &ApxError) {
            self.errors.lock().unwrap().push(cmd);
        }
    }

    fn session(events: Arc<RecordingEvents>) -> Arc<ClientSession> {
        ClientSession::start(NodeManager::new(), Arc::new(Allocator::new()), events, 8)
    }

    #[tokio::test]
    async fn test_complete_fires_callback() {
        let events = Arc::new(RecordingEvents::default());
        let session = session(events.clone());
        session.send(SessionCmd::Complete(42)).unwrap();
        session.stop().await;
        assert_eq!(events.completed.load(Ordering::SeqCst), 42);
    }

    #[tokio::test]
    async fn test_commands_without_connection_report_errors() {
        let events = Arc::new(RecordingEvents::default());
        let session = session(events.clone());
        session.send(SessionCmd::Heartbeat).unwrap();
        session.send(SessionCmd::ListNodes).unwrap();
        session.send(SessionCmd::Disconnect).unwrap();
        session.stop().await;
        let errors = events.errors.lock().unwrap();
        assert_eq!(
            &*errors,
            &[SessionCmdKind::Heartbeat, SessionCmdKind::ListNodes, SessionCmdKind::Disconnect]
        );
    }

    #[tokio::test]
    async fn test_queue_overflow_is_reported() {
        let events = Arc::new(RecordingEvents::default());
        // Depth 1 and a worker that we never let run by flooding from this
        // thread before yielding.
        let session =
            ClientSession::start(NodeManager::new(), Arc::new(Allocator::new()), events, 1);
        let mut saw_full = false;
        for _ in 0..64 {
            if matches!(
                session.send(SessionCmd::Complete(1)),
                Err(ApxError::SessionQueueFull)
            ) {
                saw_full = true;
                break;
            }
        }
        assert!(saw_full);
        session.stop().await;
    }

    #[tokio::test]
    async fn test_publish_without_connection() {
        let events = Arc::new(RecordingEvents::default());
        let session = session(events);
        let result = session.publish("N", "P", &DtlValue::u32(1));
        assert!(matches!(result, Err(ApxError::NotConnected)));
        session.stop().await;
    }
}
