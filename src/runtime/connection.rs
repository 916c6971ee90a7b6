//! Per-connection session state for the mio runtime.
//!
//! Each accepted TCP connection owns one `Relay` wired to the two halves of
//! its socket. The worker loop translates poll events into relay events and
//! watches the session's terminal outcome to decide when to close.

use crate::relay::{Inbound, Overflow, Relay, RelayError, RelayStats, SessionControl};
use crate::runtime::socket::{SocketInbound, SocketOutbound};
use mio::net::TcpStream;
use slab::Slab;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Terminal outcome reported by the relay.
#[derive(Debug)]
pub enum SessionOutcome {
    Completed,
    Failed(RelayError),
}

/// `SessionControl` that records the outcome for the worker loop.
#[derive(Debug, Default)]
pub struct SessionSignal {
    outcome: Option<SessionOutcome>,
}

impl SessionSignal {
    pub fn outcome(&self) -> Option<&SessionOutcome> {
        self.outcome.as_ref()
    }
}

impl SessionControl for SessionSignal {
    fn complete(&mut self) {
        debug_assert!(self.outcome.is_none(), "terminal signal fired twice");
        self.outcome = Some(SessionOutcome::Completed);
    }

    fn fail(&mut self, cause: RelayError) {
        debug_assert!(self.outcome.is_none(), "terminal signal fired twice");
        self.outcome = Some(SessionOutcome::Failed(cause));
    }
}

/// Current state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Relay is running.
    Relaying,
    /// Relay completed; the socket still holds echo bytes to flush.
    Flushing,
    /// Session is finished and can be closed.
    Closing,
}

/// Readiness reported by the poller for one event.
#[derive(Debug, Clone, Copy, Default)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
}

impl From<&mio::event::Event> for Readiness {
    fn from(event: &mio::event::Event) -> Self {
        Self {
            readable: event.is_readable() || event.is_read_closed(),
            writable: event.is_writable(),
            error: event.is_error(),
        }
    }
}

/// Settings applied to every new session.
#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    /// Maximum bytes per read.
    pub chunk_size: usize,
    /// Soft overflow limit in bytes (`None` = unbounded).
    pub max_overflow: Option<usize>,
}

type SocketRelay = Relay<SocketInbound, SocketOutbound, SessionSignal>;

/// One echo session over a TCP connection.
pub struct Session {
    relay: SocketRelay,
    stream: Rc<TcpStream>,
    peer: SocketAddr,
    state: SessionState,
    exhaustion_notified: bool,
    last_activity: Instant,
}

impl Session {
    /// Wrap an accepted (and already registered) stream.
    pub fn new(stream: TcpStream, peer: SocketAddr, settings: SessionSettings) -> Self {
        let stream = Rc::new(stream);
        let relay = Relay::with_overflow(
            SocketInbound::new(Rc::clone(&stream), settings.chunk_size),
            SocketOutbound::new(Rc::clone(&stream)),
            SessionSignal::default(),
            Overflow::with_limit(settings.max_overflow),
        );

        Self {
            relay,
            stream,
            peer,
            state: SessionState::Relaying,
            exhaustion_notified: false,
            last_activity: Instant::now(),
        }
    }

    /// Dispatch one poll event to the relay and return the new state.
    pub fn on_event(&mut self, readiness: Readiness) -> SessionState {
        self.last_activity = Instant::now();

        match self.state {
            SessionState::Relaying => self.relay_event(readiness),
            SessionState::Flushing if readiness.writable || readiness.error => {
                self.flush_echo()
            }
            state => state,
        }
    }

    /// Fail the session from outside (idle timeout, shutdown).
    pub fn abort(&mut self, cause: RelayError) -> SessionState {
        self.relay.on_error(cause);
        self.settle()
    }

    fn relay_event(&mut self, readiness: Readiness) -> SessionState {
        if readiness.readable {
            self.relay.on_input_readable();
        }

        if readiness.writable {
            match self.relay.outbound_mut().flush_pending() {
                Ok(true) => self.relay.on_output_writable(),
                Ok(false) => trace!(
                    peer = %self.peer,
                    pending = self.relay.outbound().pending_len(),
                    "Socket still backpressured"
                ),
                Err(e) => self.relay.on_error(RelayError::Write(e)),
            }
        }

        if readiness.error {
            let cause = match self.stream.take_error() {
                Ok(Some(e)) | Err(e) => RelayError::Read(e),
                Ok(None) => RelayError::Aborted,
            };
            self.relay.on_error(cause);
        }

        if !self.exhaustion_notified && self.relay.inbound().is_exhausted() {
            self.exhaustion_notified = true;
            self.relay.on_input_exhausted();
        }

        self.settle()
    }

    /// Move to the next state based on the relay's outcome.
    fn settle(&mut self) -> SessionState {
        self.state = match self.relay.control().outcome() {
            None => SessionState::Relaying,
            Some(SessionOutcome::Failed(_)) => SessionState::Closing,
            Some(SessionOutcome::Completed) => SessionState::Flushing,
        };

        if self.state == SessionState::Flushing {
            return self.flush_echo();
        }
        self.state
    }

    /// Push the remaining echo bytes out, then half-close.
    fn flush_echo(&mut self) -> SessionState {
        let outbound = self.relay.outbound_mut();
        self.state = match outbound.flush_pending() {
            Ok(true) => {
                if let Err(e) = outbound.shutdown() {
                    debug!(peer = %self.peer, error = %e, "Shutdown failed");
                }
                SessionState::Closing
            }
            Ok(false) => SessionState::Flushing,
            Err(e) => {
                debug!(peer = %self.peer, error = %e, "Flush after completion failed");
                SessionState::Closing
            }
        };
        self.state
    }

    pub fn outcome(&self) -> Option<&SessionOutcome> {
        self.relay.control().outcome()
    }

    pub fn stats(&self) -> RelayStats {
        self.relay.stats()
    }

    /// Bytes read but still waiting in the overflow buffer.
    pub fn queued_bytes(&self) -> usize {
        self.relay.overflow().byte_len()
    }

    pub fn bytes_sent(&self) -> u64 {
        self.relay.outbound().bytes_sent()
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Time since the last poll event for this session.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    pub fn raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

/// Registry of active sessions using slab allocation.
///
/// Provides O(1) insert, lookup, and remove operations. Slab keys double as
/// mio tokens.
pub struct SessionRegistry<T> {
    sessions: Slab<T>,
    max_sessions: usize,
}

impl<T> SessionRegistry<T> {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: Slab::with_capacity(max_sessions),
            max_sessions,
        }
    }

    /// Key the next insert will receive.
    pub fn next_id(&self) -> usize {
        self.sessions.vacant_key()
    }

    /// Insert a new session.
    ///
    /// Returns `None` if the registry is at capacity.
    pub fn insert(&mut self, session: T) -> Option<usize> {
        if self.is_full() {
            return None;
        }
        Some(self.sessions.insert(session))
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut T> {
        self.sessions.get_mut(id)
    }

    pub fn remove(&mut self, id: usize) -> Option<T> {
        self.sessions.try_remove(id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_full(&self) -> bool {
        self.sessions.len() >= self.max_sessions
    }

    /// Iterate over all sessions.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &T)> {
        self.sessions.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::Shutdown;

    fn accepted_session(settings: SessionSettings) -> (Session, std::net::TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let peer = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (ours, addr) = listener.accept().unwrap();
        ours.set_nonblocking(true).unwrap();
        (Session::new(TcpStream::from_std(ours), addr, settings), peer)
    }

    fn settings() -> SessionSettings {
        SessionSettings {
            chunk_size: 8,
            max_overflow: None,
        }
    }

    const BOTH: Readiness = Readiness {
        readable: true,
        writable: true,
        error: false,
    };

    #[test]
    fn test_signal_records_outcome() {
        let mut signal = SessionSignal::default();
        assert!(signal.outcome().is_none());

        signal.fail(RelayError::Aborted);
        assert!(matches!(
            signal.outcome(),
            Some(SessionOutcome::Failed(RelayError::Aborted))
        ));
    }

    #[test]
    fn test_session_echoes_and_closes() {
        let (mut session, mut peer) = accepted_session(settings());

        peer.write_all(b"echo through the relay").unwrap();
        peer.shutdown(Shutdown::Write).unwrap();

        // Loopback delivery is not instantaneous; keep feeding events
        let deadline = Instant::now() + Duration::from_secs(5);
        while session.on_event(BOTH) != SessionState::Closing {
            assert!(Instant::now() < deadline, "session never finished");
            std::thread::sleep(Duration::from_millis(5));
        }

        assert!(matches!(session.outcome(), Some(SessionOutcome::Completed)));
        assert_eq!(session.stats().bytes_read, 22);
        assert_eq!(session.bytes_sent(), 22);

        let mut echoed = Vec::new();
        peer.read_to_end(&mut echoed).unwrap();
        assert_eq!(echoed, b"echo through the relay");
    }

    #[test]
    fn test_reset_peer_fails_session() {
        let (mut session, mut peer) = accepted_session(settings());

        peer.write_all(b"then reset").unwrap();
        socket2::SockRef::from(&peer)
            .set_linger(Some(Duration::ZERO))
            .unwrap();
        drop(peer);

        let deadline = Instant::now() + Duration::from_secs(5);
        while session.on_event(BOTH) != SessionState::Closing {
            assert!(Instant::now() < deadline, "reset never surfaced");
            std::thread::sleep(Duration::from_millis(5));
        }

        // The reset reaches the relay as an I/O error, never as end of input
        assert!(matches!(
            session.outcome(),
            Some(SessionOutcome::Failed(RelayError::Read(_) | RelayError::Write(_)))
        ));
        // Later events cannot revive a failed session
        assert_eq!(session.on_event(BOTH), SessionState::Closing);
    }

    #[test]
    fn test_error_event_without_pending_error_aborts() {
        let (mut session, _peer) = accepted_session(settings());

        let state = session.on_event(Readiness {
            error: true,
            ..Default::default()
        });
        assert_eq!(state, SessionState::Closing);
        assert!(matches!(
            session.outcome(),
            Some(SessionOutcome::Failed(RelayError::Aborted))
        ));
    }

    #[test]
    fn test_abort_closes_once() {
        let (mut session, _peer) = accepted_session(settings());

        let state = session.abort(RelayError::IdleTimeout(Duration::from_secs(1)));
        assert_eq!(state, SessionState::Closing);

        // A second abort is ignored by the relay
        session.abort(RelayError::Aborted);
        assert!(matches!(
            session.outcome(),
            Some(SessionOutcome::Failed(RelayError::IdleTimeout(_)))
        ));
        assert_eq!(session.on_event(BOTH), SessionState::Closing);
    }

    #[test]
    fn test_idle_for() {
        let (session, _peer) = accepted_session(settings());
        let later = Instant::now() + Duration::from_secs(2);
        assert!(session.idle_for(later) >= Duration::from_secs(2));
    }

    #[test]
    fn test_session_registry() {
        let mut registry = SessionRegistry::new(2);

        let next = registry.next_id();
        let id1 = registry.insert("first").unwrap();
        assert_eq!(id1, next);
        let id2 = registry.insert("second").unwrap();

        // At capacity
        assert!(registry.is_full());
        assert!(registry.insert("third").is_none());

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get_mut(id2).copied(), Some("second"));

        assert_eq!(registry.remove(id1), Some("first"));
        assert!(registry.get_mut(id1).is_none());
        assert!(registry.remove(id1).is_none());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.iter().count(), 1);
    }
}
