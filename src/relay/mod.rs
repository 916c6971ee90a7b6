//! Readiness-driven echo relay.
//!
//! The relay moves bytes from an inbound stream to an outbound stream for a
//! single session. It never blocks and never polls: the owning transport
//! delivers readiness events and the relay decides whether to read, write,
//! buffer, or terminate.
//!
//! Building blocks:
//! - `capability`: traits the transport implements (read/write/readiness)
//! - `overflow`: ordered FIFO of chunks held back by outbound backpressure
//! - `error`: terminal failure causes
//! - `session`: the `Relay` state machine itself

pub mod capability;
pub mod error;
pub mod overflow;
pub mod session;

pub use capability::{Inbound, Outbound, ReadOutcome, SessionControl};
pub use error::RelayError;
pub use overflow::Overflow;
pub use session::{Relay, RelayStats};
