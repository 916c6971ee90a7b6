//! Relay capabilities backed by a non-blocking mio `TcpStream`.
//!
//! Both halves share one socket: the inbound half reads from it and the
//! outbound half writes the echo back to it.
//!
//! mio readiness is edge-triggered, so "ready" can only be learned by trying.
//! `SocketInbound` therefore performs the read inside `read_ready` and stages
//! the result for the following `read`. `SocketOutbound` takes every chunk,
//! writes what the kernel accepts, and keeps the rest pending; it reports
//! ready only while nothing is pending.

use crate::relay::{Inbound, Outbound, ReadOutcome};
use bytes::{Buf, Bytes, BytesMut};
use mio::net::TcpStream;
use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::rc::Rc;

/// Read side of a session socket.
pub struct SocketInbound {
    stream: Rc<TcpStream>,
    buf: BytesMut,
    chunk_size: usize,
    /// Result of a read performed by `read_ready`, not yet consumed.
    staged: Option<io::Result<ReadOutcome>>,
    exhausted: bool,
}

impl SocketInbound {
    pub fn new(stream: Rc<TcpStream>, chunk_size: usize) -> Self {
        Self {
            stream,
            buf: BytesMut::with_capacity(chunk_size),
            chunk_size,
            staged: None,
            exhausted: false,
        }
    }

    fn try_read(&mut self) -> Option<io::Result<ReadOutcome>> {
        // Bytes past the previous split are still initialized; only refill
        // what the last chunk took.
        if self.buf.len() < self.chunk_size {
            self.buf.resize(self.chunk_size, 0);
        }

        loop {
            match (&*self.stream).read(&mut self.buf[..]) {
                Ok(0) => return Some(Ok(ReadOutcome::EndOfInput)),
                Ok(n) => {
                    let chunk = self.buf.split_to(n).freeze();
                    return Some(Ok(ReadOutcome::Chunk(chunk)));
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return None,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

impl Inbound for SocketInbound {
    fn read_ready(&mut self) -> bool {
        if self.staged.is_some() {
            return true;
        }
        if self.exhausted {
            return false;
        }

        self.staged = self.try_read();
        self.staged.is_some()
    }

    fn read(&mut self) -> io::Result<ReadOutcome> {
        let outcome = self
            .staged
            .take()
            .unwrap_or_else(|| Err(io::Error::from(io::ErrorKind::WouldBlock)))?;

        if outcome == ReadOutcome::EndOfInput {
            self.exhausted = true;
        }
        Ok(outcome)
    }

    fn is_exhausted(&self) -> bool {
        self.exhausted
    }
}

/// Write side of a session socket.
pub struct SocketOutbound {
    stream: Rc<TcpStream>,
    /// Bytes accepted from the relay but not yet taken by the kernel.
    pending: BytesMut,
    /// Error hit while flushing from `write_ready`, reported by the next `write`.
    deferred_error: Option<io::Error>,
    bytes_sent: u64,
}

impl SocketOutbound {
    pub fn new(stream: Rc<TcpStream>) -> Self {
        Self {
            stream,
            pending: BytesMut::new(),
            deferred_error: None,
            bytes_sent: 0,
        }
    }

    /// Write pending bytes until the kernel pushes back.
    ///
    /// Returns `Ok(true)` when nothing is left pending.
    pub fn flush_pending(&mut self) -> io::Result<bool> {
        if let Some(e) = self.deferred_error.take() {
            return Err(e);
        }

        while !self.pending.is_empty() {
            match (&*self.stream).write(&self.pending) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
                }
                Ok(n) => {
                    self.pending.advance(n);
                    self.bytes_sent += n as u64;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        Ok(true)
    }

    /// Bytes accepted but not yet written to the socket.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Bytes handed to the kernel so far.
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    /// Signal end of output to the peer.
    pub fn shutdown(&self) -> io::Result<()> {
        match self.stream.shutdown(Shutdown::Write) {
            Err(ref e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }
}

impl Outbound for SocketOutbound {
    fn write_ready(&mut self) -> bool {
        if self.deferred_error.is_some() {
            return true;
        }
        if self.pending.is_empty() {
            return true;
        }

        match self.flush_pending() {
            Ok(drained) => drained,
            Err(e) => {
                // Let the relay see it through `write`
                self.deferred_error = Some(e);
                true
            }
        }
    }

    fn write(&mut self, chunk: Bytes) -> io::Result<()> {
        self.pending.extend_from_slice(&chunk);
        self.flush_pending().map(|_| ())
    }
}
