// SPDX-License-Identifier: MIT
// Copyright (c) 2025 the apx authors

use crate::ApxError;
use bytes::BytesMut;

/// Outbound seam between the file manager and the transport.
///
/// `reserve` hands back an exactly-sized reservation or fails with
/// `TransmitUnavailable` when the transport is backpressured; the caller
/// retries after the transmit worker has drained. A reservation dropped
/// without `commit` is simply abandoned.
pub trait TransmitHandler: Send + Sync {
    /// Largest frame the transport accepts in one reservation. Writes above
    /// this are fragmented by the sender.
    fn max_frame_size(&self) -> usize;

    fn reserve(&self, len: usize) -> Result<Box<dyn TransmitReservation>, ApxError>;
}

pub trait TransmitReservation: Send {
    /// Frame under construction. Callers never grow it past the reserved
    /// length.
    fn buffer(&mut self) -> &mut BytesMut;

    /// Hand the filled frame to the transmit queue.
    fn commit(self: Box<Self>) -> Result<(), ApxError>;
}
