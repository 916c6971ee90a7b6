//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when sockets are ready, then the
//! session's relay performs non-blocking reads and writes.
//! Uses epoll on Linux, kqueue on macOS.
//!
//! Each worker owns a poller, an `SO_REUSEPORT` listener, and a registry of
//! sessions. Nothing is shared between workers.

use crate::config::Config;
use crate::relay::RelayError;
use crate::runtime::connection::{
    Readiness, Session, SessionOutcome, SessionRegistry, SessionSettings, SessionState,
};
use mio::net::{TcpListener, TcpStream};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use std::io;
use std::net::SocketAddr;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);

/// Upper bound on how long a poll waits when idle sessions must be swept.
const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Per-worker counters, logged when sessions close.
#[derive(Debug, Default)]
struct WorkerStats {
    accepted: u64,
    rejected: u64,
    completed: u64,
    failed: u64,
    bytes_echoed: u64,
}

/// Run the mio-based server.
pub fn run(config: Config) -> io::Result<()> {
    let num_workers = config.workers.unwrap_or_else(num_cpus);
    let addr = config.listen;

    info!(
        workers = num_workers,
        addr = %addr,
        chunk_size = config.chunk_size,
        max_overflow = ?config.max_overflow,
        idle_timeout = ?config.idle_timeout,
        "Starting mio runtime"
    );

    let mut handles = Vec::with_capacity(num_workers);

    for worker_id in 0..num_workers {
        let config = config.clone();
        let listener = create_listener_with_reuseport(addr)?;

        let handle = thread::Builder::new()
            .name(format!("worker-{worker_id}"))
            .spawn(move || {
                if let Err(e) = worker_loop(worker_id, listener, &config) {
                    error!(worker = worker_id, error = %e, "Worker failed");
                }
            })?;

        handles.push(handle);
    }

    // Wait for all workers
    for handle in handles {
        let _ = handle.join();
    }

    Ok(())
}

pub(crate) fn worker_loop(
    worker_id: usize,
    listener: std::net::TcpListener,
    config: &Config,
) -> io::Result<()> {
    let mut poll = Poll::new()?;
    let mut events = Events::with_capacity(config.batch_size);

    let mut listener = TcpListener::from_std(listener);
    poll.registry()
        .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

    let settings = SessionSettings {
        chunk_size: config.chunk_size,
        max_overflow: config.max_overflow,
    };
    let idle_timeout = config.idle_timeout;
    let poll_timeout = idle_timeout.map(|idle| idle.min(MAX_SWEEP_INTERVAL));

    let mut sessions: SessionRegistry<Session> = SessionRegistry::new(config.max_connections);
    let mut stats = WorkerStats::default();

    info!(
        worker = worker_id,
        max_connections = config.max_connections,
        "Worker started"
    );

    loop {
        if let Err(e) = poll.poll(&mut events, poll_timeout) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(e);
        }

        for event in events.iter() {
            match event.token() {
                LISTENER_TOKEN => {
                    accept_connections(
                        &listener,
                        &mut poll,
                        &mut sessions,
                        &mut stats,
                        settings,
                        worker_id,
                    );
                }
                Token(session_id) => {
                    let state = match sessions.get_mut(session_id) {
                        Some(session) => session.on_event(Readiness::from(event)),
                        None => continue,
                    };
                    if state == SessionState::Closing {
                        close_session(&mut poll, &mut sessions, &mut stats, session_id);
                    }
                }
            }
        }

        if let Some(idle) = idle_timeout {
            sweep_idle(&mut poll, &mut sessions, &mut stats, idle);
        }
    }
}

fn accept_connections(
    listener: &TcpListener,
    poll: &mut Poll,
    sessions: &mut SessionRegistry<Session>,
    stats: &mut WorkerStats,
    settings: SessionSettings,
    worker_id: usize,
) {
    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                if sessions.is_full() {
                    stats.rejected += 1;
                    warn!(worker = worker_id, peer = %peer, "Connection limit reached");
                    continue;
                }

                if let Err(e) = register_session(poll, sessions, stream, peer, settings) {
                    stats.rejected += 1;
                    warn!(worker = worker_id, peer = %peer, error = %e, "Failed to register connection");
                    continue;
                }

                stats.accepted += 1;
                debug!(worker = worker_id, peer = %peer, "Accepted connection");
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                error!("Accept error: {}", e);
                break;
            }
        }
    }
}

fn register_session(
    poll: &mut Poll,
    sessions: &mut SessionRegistry<Session>,
    mut stream: TcpStream,
    peer: SocketAddr,
    settings: SessionSettings,
) -> io::Result<()> {
    stream.set_nodelay(true)?;

    let session_id = sessions.next_id();
    poll.registry().register(
        &mut stream,
        Token(session_id),
        Interest::READABLE | Interest::WRITABLE,
    )?;

    let inserted = sessions.insert(Session::new(stream, peer, settings));
    debug_assert_eq!(inserted, Some(session_id));
    Ok(())
}

fn close_session(
    poll: &mut Poll,
    sessions: &mut SessionRegistry<Session>,
    stats: &mut WorkerStats,
    session_id: usize,
) {
    let Some(session) = sessions.remove(session_id) else {
        return;
    };

    let fd = session.raw_fd();
    let _ = poll.registry().deregister(&mut SourceFd(&fd));

    match session.outcome() {
        Some(SessionOutcome::Completed) => stats.completed += 1,
        Some(SessionOutcome::Failed(e)) => {
            stats.failed += 1;
            debug!(session_id, kind = e.kind(), error = %e, "Closing failed session");
        }
        None => stats.failed += 1,
    }
    stats.bytes_echoed += session.bytes_sent();

    let relay_stats = session.stats();
    debug!(
        session_id,
        peer = %session.peer(),
        completed = matches!(session.outcome(), Some(SessionOutcome::Completed)),
        chunks_read = relay_stats.chunks_read,
        bytes_read = relay_stats.bytes_read,
        bytes_written = relay_stats.bytes_written,
        bytes_buffered = relay_stats.bytes_buffered,
        bytes_drained = relay_stats.bytes_drained,
        overflow_high_water = relay_stats.overflow_high_water,
        queued_bytes = session.queued_bytes(),
        active = sessions.len(),
        worker_accepted = stats.accepted,
        worker_rejected = stats.rejected,
        worker_completed = stats.completed,
        worker_failed = stats.failed,
        worker_bytes_echoed = stats.bytes_echoed,
        "Session closed"
    );
}

fn sweep_idle(
    poll: &mut Poll,
    sessions: &mut SessionRegistry<Session>,
    stats: &mut WorkerStats,
    idle: Duration,
) {
    let now = Instant::now();
    let expired: Vec<usize> = sessions
        .iter()
        .filter(|(_, session)| session.idle_for(now) >= idle)
        .map(|(id, _)| id)
        .collect();

    for session_id in expired {
        if let Some(session) = sessions.get_mut(session_id) {
            debug!(session_id, peer = %session.peer(), "Session idle, aborting");
            session.abort(RelayError::IdleTimeout(idle));
        }
        close_session(poll, sessions, stats, session_id);
    }
}

/// Create a TCP listener with SO_REUSEPORT for kernel load balancing.
pub(crate) fn create_listener_with_reuseport(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_port(true)?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    Ok(socket.into())
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
