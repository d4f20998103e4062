// SPDX-License-Identifier: MIT
// Copyright (c) 2025 the apx authors

//! Outbound side of a connection: a bounded frame queue drained by one
//! writer task. Reservation failure maps the queue's backpressure onto
//! `TransmitUnavailable`; the caller retries once the writer has drained.

use apx_codec::numheader;
use apx_core::{ApxError, TransmitHandler, TransmitReservation};
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

pub const DEFAULT_QUEUE_DEPTH: usize = 256;
pub const DEFAULT_MAX_FRAME: usize = 65536;

pub struct SocketTransmitHandler {
    tx: mpsc::Sender<Bytes>,
    max_frame: usize,
}

impl SocketTransmitHandler {
    pub fn new(tx: mpsc::Sender<Bytes>, max_frame: usize) -> Self {
        SocketTransmitHandler { tx, max_frame }
    }
}

impl TransmitHandler for SocketTransmitHandler {
    fn max_frame_size(&self) -> usize {
        self.max_frame
    }

    fn reserve(&self, len: usize) -> Result<Box<dyn TransmitReservation>, ApxError> {
        if len > self.max_frame {
            return Err(ApxError::LengthError);
        }
        let permit = self
            .tx
            .clone()
            .try_reserve_owned()
            .map_err(|_| ApxError::TransmitUnavailable)?;
        Ok(Box::new(SocketReservation { buf: BytesMut::with_capacity(len), permit }))
    }
}

struct SocketReservation {
    buf: BytesMut,
    permit: mpsc::OwnedPermit<Bytes>,
}

impl TransmitReservation for SocketReservation {
    fn buffer(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    fn commit(self: Box<Self>) -> Result<(), ApxError> {
        self.permit.send(self.buf.freeze());
        Ok(())
    }
}

/// Drain the frame queue into the socket, prefixing every message with its
/// NumHeader length. Returns when the queue closes or the socket fails.
pub async fn transmit_loop<W>(mut rx: mpsc::Receiver<Bytes>, mut writer: W) -> Result<(), ApxError>
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = rx.recv().await {
        let mut prefix = BytesMut::with_capacity(4);
        numheader::encode_len(&mut prefix, frame.len())?;
        writer.write_all(&prefix).await?;
        writer.write_all(&frame).await?;
        writer.flush().await?;
    }
    Ok(())
}
