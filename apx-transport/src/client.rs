// SPDX-License-Identifier: MIT
// Copyright (c) 2025 the apx authors

use crate::connection::read_loop;
use crate::transmit::{transmit_loop, SocketTransmitHandler, DEFAULT_MAX_FRAME, DEFAULT_QUEUE_DEPTH};
use apx_core::{ApxError, DtlValue, NodeState};
use apx_runtime::{Allocator, FileManager, NodeDefinition, NodeInstance, NodeManager};
use socket2::SockRef;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectTarget {
    Tcp { host: String, port: u16 },
    Unix { path: PathBuf },
}

/// One client-side connection: socket tasks, file manager and the node
/// manager living on top of it.
pub struct ClientConnection {
    file_manager: Arc<FileManager>,
    node_manager: Arc<NodeManager>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ClientConnection {
    pub async fn connect(
        target: &ConnectTarget,
        node_manager: Arc<NodeManager>,
        allocator: Arc<Allocator>,
    ) -> Result<Arc<Self>, ApxError> {
        match target {
            ConnectTarget::Tcp { host, port } => {
                let stream = TcpStream::connect((host.as_str(), *port)).await?;
                tune_tcp(&stream)?;
                info!(%host, port, "connected over TCP");
                Self::start(stream, node_manager, allocator).await
            }
            ConnectTarget::Unix { path } => {
                let stream = UnixStream::connect(path).await?;
                info!(path = %path.display(), "connected over local socket");
                Self::start(stream, node_manager, allocator).await
            }
        }
    }

    /// Wire an already-established stream. Used directly by tests.
    pub async fn start<S>(
        stream: S,
        node_manager: Arc<NodeManager>,
        allocator: Arc<Allocator>,
    ) -> Result<Arc<Self>, ApxError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (frame_tx, frame_rx) = mpsc::channel(DEFAULT_QUEUE_DEPTH);
        let transmit = Arc::new(SocketTransmitHandler::new(frame_tx, DEFAULT_MAX_FRAME));
        let file_manager = FileManager::new(transmit, allocator);
        file_manager.set_events(node_manager.clone());

        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut writer_shutdown = shutdown.subscribe();
        let writer_task = tokio::spawn(async move {
            tokio::select! {
                result = transmit_loop(frame_rx, write_half) => {
                    if let Err(err) = result {
                        warn!(error = %err, "transmit loop ended");
                    }
                }
                _ = writer_shutdown.changed() => {}
            }
        });
        let fm = file_manager.clone();
        let reader_task = tokio::spawn(async move {
            if let Err(err) = read_loop(read_half, fm, shutdown_rx).await {
                warn!(error = %err, "read loop ended");
            }
        });

        file_manager.connected()?;
        Ok(Arc::new(ClientConnection {
            file_manager,
            node_manager,
            shutdown,
            tasks: Mutex::new(vec![writer_task, reader_task]),
        }))
    }

    pub fn file_manager(&self) -> &Arc<FileManager> {
        &self.file_manager
    }

    pub fn node_manager(&self) -> &Arc<NodeManager> {
        &self.node_manager
    }

    /// Attach a node; its files are advertised immediately.
    pub fn attach_node(&self, definition: NodeDefinition) -> Result<Arc<NodeInstance>, ApxError> {
        self.node_manager.attach_node(definition, &self.file_manager)
    }

    pub fn publish(
        &self,
        node_name: &str,
        port_name: &str,
        value: &DtlValue,
    ) -> Result<(), ApxError> {
        self.node_manager.publish(node_name, port_name, value)
    }

    /// Cooperative teardown: stop the read loop, close the transmit queue,
    /// give both tasks a bounded window to finish.
    pub async fn close(&self) {
        self.file_manager.disconnected();
        self.node_manager.mark_all(NodeState::Disconnected);
        for name in self.node_manager.node_names() {
            if let Some(node) = self.node_manager.get(&name) {
                node.clear_connection();
            }
        }
        let _ = self.shutdown.send(true);
        let tasks = std::mem::take(&mut *self.tasks.lock().expect("task lock"));
        for task in tasks {
            let abort = task.abort_handle();
            if tokio::time::timeout(JOIN_TIMEOUT, task).await.is_err() {
                warn!("connection task did not stop in time, aborting");
                abort.abort();
            }
        }
    }
}

fn tune_tcp(stream: &TcpStream) -> Result<(), ApxError> {
    let sock = SockRef::from(stream);
    sock.set_nodelay(true)?;
    Ok(())
}
