//! Capability interfaces supplied by the transport.
//!
//! All operations are non-blocking. The relay only calls `read` after
//! `read_ready` returned true, and only calls `write` after `write_ready`
//! returned true.

use crate::relay::error::RelayError;
use bytes::Bytes;
use std::io;

/// Result of a single non-blocking read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// A chunk of input bytes. Never empty.
    Chunk(Bytes),
    /// The peer finished sending; no more input will arrive.
    EndOfInput,
}

/// Readable side of a session.
pub trait Inbound {
    /// True iff `read` would return data, end of input, or an error without
    /// blocking.
    fn read_ready(&mut self) -> bool;

    /// Read the next chunk.
    fn read(&mut self) -> io::Result<ReadOutcome>;

    /// True once all input has been consumed.
    fn is_exhausted(&self) -> bool;
}

/// Writable side of a session.
pub trait Outbound {
    /// True iff a write would proceed without blocking.
    fn write_ready(&mut self) -> bool;

    /// Hand a whole chunk to the transport.
    fn write(&mut self, chunk: Bytes) -> io::Result<()>;
}

/// Terminal notifications delivered to the owner of the session.
///
/// The relay calls exactly one of these, exactly once.
pub trait SessionControl {
    fn complete(&mut self);

    fn fail(&mut self, cause: RelayError);
}
