//! Relay state machine.
//!
//! A `Relay` owns one session's inbound and outbound capabilities, the
//! overflow buffer, and the completion flag. The transport drives it through
//! four entry points:
//!
//! - `on_input_readable`: read while input is ready, writing directly or
//!   queueing each chunk, then flush the queue while output accepts writes
//! - `on_input_exhausted`: input is done; attempt to drain and complete
//! - `on_output_writable`: drain the queue, then either complete (input
//!   exhausted) or go back to reading
//! - `on_error`: terminal failure
//!
//! ## Ordering
//!
//! A chunk is only written directly when the overflow is empty. Once anything
//! is queued, every later chunk queues behind it, even if the outbound side
//! has become ready in the meantime.
//!
//! ## Termination
//!
//! The session completes when input is exhausted and the overflow is empty.
//! Exactly one of `complete`/`fail` reaches the `SessionControl`; events
//! arriving afterwards are ignored.

use crate::relay::capability::{Inbound, Outbound, ReadOutcome, SessionControl};
use crate::relay::error::RelayError;
use crate::relay::overflow::Overflow;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, trace};

/// Diagnostic counters for one session.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    /// Chunks read from inbound.
    pub chunks_read: u64,
    /// Bytes read from inbound.
    pub bytes_read: u64,
    /// Bytes written straight through without queueing.
    pub bytes_written: u64,
    /// Bytes routed through the overflow buffer.
    pub bytes_buffered: u64,
    /// Bytes written out of the overflow buffer.
    pub bytes_drained: u64,
    /// Largest overflow size seen, in bytes.
    pub overflow_high_water: usize,
}

/// Why the read phase stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadStop {
    /// Inbound has nothing more right now.
    NotReady,
    /// Inbound reported end of input.
    EndOfInput,
    /// Overflow reached its soft limit.
    OverflowFull,
}

/// Echo relay for a single session.
pub struct Relay<I, O, C> {
    inbound: I,
    outbound: O,
    control: C,
    overflow: Overflow,
    stats: RelayStats,
    /// Set once, by whichever path fires the terminal signal first.
    completed: AtomicBool,
}

impl<I, O, C> Relay<I, O, C>
where
    I: Inbound,
    O: Outbound,
    C: SessionControl,
{
    /// Create a relay using the given (possibly bounded) overflow buffer.
    pub fn with_overflow(inbound: I, outbound: O, control: C, overflow: Overflow) -> Self {
        Self {
            inbound,
            outbound,
            control,
            overflow,
            stats: RelayStats::default(),
            completed: AtomicBool::new(false),
        }
    }

    /// Input became readable.
    pub fn on_input_readable(&mut self) {
        if self.is_completed() {
            trace!("Input readable after completion, ignoring");
            return;
        }

        if let Err(e) = self.pump() {
            self.on_error(e);
        }
    }

    /// All input has been delivered.
    pub fn on_input_exhausted(&mut self) {
        if self.is_completed() {
            trace!("Input exhausted after completion, ignoring");
            return;
        }

        debug!(
            bytes_read = self.stats.bytes_read,
            bytes_written = self.stats.bytes_written,
            bytes_buffered = self.stats.bytes_buffered,
            queued_chunks = self.overflow.len(),
            "Input exhausted"
        );

        self.on_output_writable();
    }

    /// Output can accept writes again.
    pub fn on_output_writable(&mut self) {
        if self.is_completed() {
            trace!("Output writable after completion, ignoring");
            return;
        }

        if let Err(e) = self.flush_overflow() {
            self.on_error(e);
            return;
        }

        if self.inbound.is_exhausted() {
            if self.overflow.is_empty() {
                self.finish();
            }
            return;
        }

        // Output draining may have unblocked more reading
        self.on_input_readable();
    }

    /// The session failed. No-op once a terminal signal has fired.
    pub fn on_error(&mut self, failure: RelayError) {
        if !self.claim_terminal() {
            trace!(error = %failure, "Error after completion, ignoring");
            return;
        }

        debug!(
            kind = failure.kind(),
            error = %failure,
            bytes_read = self.stats.bytes_read,
            queued_bytes = self.overflow.byte_len(),
            "Session failed"
        );
        self.control.fail(failure);
    }

    /// True once `complete` or `fail` has been delivered.
    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    /// Snapshot of the diagnostic counters.
    pub fn stats(&self) -> RelayStats {
        RelayStats {
            overflow_high_water: self.overflow.high_water_mark(),
            ..self.stats
        }
    }

    pub fn overflow(&self) -> &Overflow {
        &self.overflow
    }

    pub fn inbound(&self) -> &I {
        &self.inbound
    }

    #[cfg(test)]
    pub fn inbound_mut(&mut self) -> &mut I {
        &mut self.inbound
    }

    pub fn outbound(&self) -> &O {
        &self.outbound
    }

    pub fn outbound_mut(&mut self) -> &mut O {
        &mut self.outbound
    }

    pub fn control(&self) -> &C {
        &self.control
    }

    /// Read, then flush; repeat while a full overflow is making progress.
    fn pump(&mut self) -> Result<(), RelayError> {
        loop {
            let stop = self.read_phase()?;
            let flushed = self.flush_overflow()?;

            if stop == ReadStop::OverflowFull && flushed > 0 && !self.overflow.is_full() {
                continue;
            }

            return Ok(());
        }
    }

    fn read_phase(&mut self) -> Result<ReadStop, RelayError> {
        loop {
            if self.overflow.is_full() {
                return Ok(ReadStop::OverflowFull);
            }
            if !self.inbound.read_ready() {
                return Ok(ReadStop::NotReady);
            }

            let chunk = match self.inbound.read().map_err(RelayError::Read)? {
                ReadOutcome::Chunk(chunk) => chunk,
                ReadOutcome::EndOfInput => return Ok(ReadStop::EndOfInput),
            };
            if chunk.is_empty() {
                continue;
            }

            let len = chunk.len() as u64;
            self.stats.chunks_read += 1;
            self.stats.bytes_read += len;

            if self.overflow.is_empty() && self.outbound.write_ready() {
                self.outbound.write(chunk).map_err(RelayError::Write)?;
                self.stats.bytes_written += len;
            } else {
                self.overflow.push(chunk);
                self.stats.bytes_buffered += len;
            }
        }
    }

    /// Write queued chunks while output is ready. Returns bytes written.
    fn flush_overflow(&mut self) -> Result<usize, RelayError> {
        let mut flushed = 0;

        while !self.overflow.is_empty() && self.outbound.write_ready() {
            let Some(chunk) = self.overflow.pop() else {
                break;
            };
            let len = chunk.len();
            self.outbound.write(chunk).map_err(RelayError::Write)?;
            self.stats.bytes_drained += len as u64;
            flushed += len;
        }

        if flushed > 0 {
            trace!(flushed, remaining = self.overflow.byte_len(), "Drained overflow");
        }
        Ok(flushed)
    }

    fn finish(&mut self) {
        if !self.claim_terminal() {
            return;
        }

        debug!(
            bytes_read = self.stats.bytes_read,
            bytes_written = self.stats.bytes_written,
            bytes_drained = self.stats.bytes_drained,
            overflow_high_water = self.overflow.high_water_mark(),
            "Session complete"
        );
        self.control.complete();
    }

    fn claim_terminal(&self) -> bool {
        self.completed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}
