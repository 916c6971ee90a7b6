//! mio transport for the echo relay.
//!
//! Accepts TCP connections and turns each one into a relay session:
//! - `socket`: relay capabilities over a non-blocking `TcpStream`
//! - `connection`: per-session state and the session registry
//! - `event_loop`: thread-per-core workers translating poll events into
//!   relay events

mod connection;
mod event_loop;
mod socket;

use crate::config::Config;

/// Run the echo server until the workers exit.
pub fn run(config: Config) -> std::io::Result<()> {
    event_loop::run(config)
}
