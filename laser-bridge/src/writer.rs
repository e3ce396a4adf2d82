//! Backpressure-aware output queue for one client connection.
//!
//! Writes are attempted immediately.  When the socket takes only part of a
//! chunk, the remainder goes back to the **front** of the queue and the
//! queue stops writing until the owner reports a drain
//! ([`OutputQueue::on_drain`]).  Chunks therefore reach the client in the
//! order they were queued.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;

use tokio::net::tcp::OwnedWriteHalf;

/// Non-blocking byte sink.
pub trait TryWrite {
    /// Write as much of `buf` as possible without blocking.
    ///
    /// Returns `ErrorKind::WouldBlock` when nothing can be written right now.
    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize>;
}

impl TryWrite for Arc<OwnedWriteHalf> {
    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (**self).try_write(buf)
    }
}

/// Result of a write or flush attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Everything queued so far reached the socket.
    Flushed,
    /// Data is still queued; wait for the socket to become writable.
    Blocked,
}

/// Pending-write queue plus the writable flag.
#[derive(Debug)]
pub struct OutputQueue {
    pending: VecDeque<Vec<u8>>,
    writable: bool,
}

impl Default for OutputQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputQueue {
    pub fn new() -> Self {
        Self {
            pending: VecDeque::new(),
            writable: true,
        }
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Total bytes waiting for the socket.
    pub fn queued_bytes(&self) -> usize {
        self.pending.iter().map(Vec::len).sum()
    }

    /// Queue `bytes` behind anything already pending and flush if writable.
    pub fn write<W: TryWrite>(&mut self, sink: &mut W, bytes: Vec<u8>) -> io::Result<WriteOutcome> {
        if !bytes.is_empty() {
            self.pending.push_back(bytes);
        }
        self.flush(sink)
    }

    /// The socket reported writable again: resume flushing.
    pub fn on_drain<W: TryWrite>(&mut self, sink: &mut W) -> io::Result<WriteOutcome> {
        self.writable = true;
        self.flush(sink)
    }

    fn flush<W: TryWrite>(&mut self, sink: &mut W) -> io::Result<WriteOutcome> {
        while self.writable {
            let Some(chunk) = self.pending.pop_front() else {
                return Ok(WriteOutcome::Flushed);
            };
            match sink.try_write(&chunk) {
                Ok(0) => {
                    self.pending.push_front(chunk);
                    return Err(io::ErrorKind::WriteZero.into());
                }
                Ok(n) if n == chunk.len() => {}
                Ok(n) => {
                    self.pending.push_front(chunk[n..].to_vec());
                    self.writable = false;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.pending.push_front(chunk);
                    self.writable = false;
                }
                Err(e) => {
                    self.pending.push_front(chunk);
                    return Err(e);
                }
            }
        }
        if self.pending.is_empty() {
            Ok(WriteOutcome::Flushed)
        } else {
            Ok(WriteOutcome::Blocked)
        }
    }
}
