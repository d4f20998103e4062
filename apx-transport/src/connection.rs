// SPDX-License-Identifier: MIT
// Copyright (c) 2025 the apx authors

//! Inbound byte-stream handling shared by client and server connections:
//! greeting validation, NumHeader deframing, dispatch into the file
//! manager.

use apx_codec::{greeting, numheader};
use apx_core::ApxError;
use apx_runtime::FileManager;
use bytes::{Buf, BytesMut};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::watch;
use tracing::{debug, warn};

const READ_CHUNK: usize = 64 * 1024;

/// Turns raw bytes into whole messages. Partial messages stay buffered;
/// every complete message is handed to the file manager. The first message
/// on a connection must be the peer's greeting.
pub struct Framer {
    buf: BytesMut,
    greeted: bool,
}

impl Default for Framer {
    fn default() -> Self {
        Self::new()
    }
}

impl Framer {
    pub fn new() -> Self {
        Framer { buf: BytesMut::with_capacity(READ_CHUNK), greeted: false }
    }

    pub fn is_greeted(&self) -> bool {
        self.greeted
    }

    /// Feed received bytes; returns how many buffered bytes were consumed
    /// as whole messages. Fatal errors (greeting/protocol violations)
    /// propagate; per-message processing errors are logged and skipped.
    pub fn on_bytes(
        &mut self,
        file_manager: &Arc<FileManager>,
        data: &[u8],
    ) -> Result<usize, ApxError> {
        self.buf.extend_from_slice(data);
        let mut consumed = 0usize;
        loop {
            let Some((len, prefix_len)) = numheader::decode_len(&self.buf) else {
                return Ok(consumed);
            };
            if self.buf.len() < prefix_len + len {
                return Ok(consumed);
            }
            self.buf.advance(prefix_len);
            let message = self.buf.split_to(len);
            consumed += prefix_len + len;
            if !self.greeted {
                let text = std::str::from_utf8(&message)
                    .map_err(|_| ApxError::Protocol("greeting is not valid text".into()))?;
                let parsed = greeting::parse_greeting(text)?;
                debug!(numheader_format = parsed.numheader_format, "peer greeting accepted");
                self.greeted = true;
                continue;
            }
            match file_manager.process_message(&message) {
                Ok(()) => {}
                // A message that cannot even be framed as an address plus
                // payload means the stream is corrupt.
                Err(ApxError::TooShort) => {
                    return Err(ApxError::Protocol("malformed frame".into()))
                }
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => warn!(error = %err, "message processing failed"),
            }
        }
    }
}

/// Read the socket until it closes, the shutdown signal fires, or the peer
/// violates the protocol.
pub async fn read_loop<R>(
    mut reader: R,
    file_manager: Arc<FileManager>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), ApxError>
where
    R: AsyncRead + Unpin,
{
    let mut framer = Framer::new();
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                debug!("read loop shut down");
                return Ok(());
            }
            read = reader.read(&mut chunk) => {
                let n = read?;
                if n == 0 {
                    debug!("peer closed the stream");
                    return Ok(());
                }
                framer.on_bytes(&file_manager, &chunk[..n])?;
            }
        }
    }
}
