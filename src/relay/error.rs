//! Terminal failure causes for a relay session.

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Why a session ended without completing.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The inbound capability failed.
    #[error("read failed: {0}")]
    Read(#[source] io::Error),

    /// The outbound capability failed.
    #[error("write failed: {0}")]
    Write(#[source] io::Error),

    /// No readiness event arrived within the configured idle window.
    #[error("session idle for {0:?}")]
    IdleTimeout(Duration),

    /// The transport tore the session down (peer reset or hang-up).
    #[error("session aborted by transport")]
    Aborted,
}

impl RelayError {
    /// Short label used as a structured log field.
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::Read(_) => "read",
            RelayError::Write(_) => "write",
            RelayError::IdleTimeout(_) => "idle_timeout",
            RelayError::Aborted => "aborted",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_display_and_source() {
        let err = RelayError::Write(io::Error::new(io::ErrorKind::BrokenPipe, "pipe"));
        assert_eq!(err.to_string(), "write failed: pipe");
        assert!(err.source().is_some());
        assert_eq!(err.kind(), "write");

        let err = RelayError::IdleTimeout(Duration::from_secs(3));
        assert_eq!(err.to_string(), "session idle for 3s");
        assert!(err.source().is_none());
    }
}
