//! Error types for kestrel

use std::fmt;

/// Unified error type for all kestrel operations
///
/// Variants fall into four classes:
///
/// - **fatal**: the transport is unusable and the session ends
///   ([`Io`](KestrelError::Io), [`Protocol`](KestrelError::Protocol),
///   [`InvalidMac`](KestrelError::InvalidMac),
///   [`Negotiation`](KestrelError::Negotiation),
///   [`Trust`](KestrelError::Trust), [`Internal`](KestrelError::Internal))
/// - **channel-scoped**: only one channel is affected
///   ([`Channel`](KestrelError::Channel))
/// - **recoverable**: the caller may retry ([`Auth`](KestrelError::Auth))
/// - **usage**: bad configuration or a call after shutdown
///   ([`Config`](KestrelError::Config), [`Closed`](KestrelError::Closed))
#[derive(Debug)]
pub enum KestrelError {
    /// I/O error
    Io(std::io::Error),

    /// Malformed or unexpected protocol data
    Protocol(String),

    /// Packet MAC did not verify
    InvalidMac,

    /// No common algorithm for a negotiated list
    Negotiation(String),

    /// Host key rejected or its signature did not verify
    Trust(String),

    /// Authentication failed
    Auth(String),

    /// A single channel failed
    Channel {
        /// Local channel id
        id: u32,
        /// Failure description
        reason: String,
    },

    /// Internal invariant violation
    Internal(String),

    /// Configuration error
    Config(String),

    /// The session has been closed
    Closed,

    /// Other error
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl KestrelError {
    /// Returns `true` if the error ends the session.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            KestrelError::Io(_)
                | KestrelError::Protocol(_)
                | KestrelError::InvalidMac
                | KestrelError::Negotiation(_)
                | KestrelError::Trust(_)
                | KestrelError::Internal(_)
        )
    }

    /// Returns `true` if the error only concerns one channel.
    pub fn is_channel_scoped(&self) -> bool {
        matches!(self, KestrelError::Channel { .. })
    }

    /// Returns `true` if the caller may retry the failed operation.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, KestrelError::Auth(_))
    }

    /// Builds a [`KestrelError::Channel`].
    pub fn channel(id: u32, reason: impl Into<String>) -> Self {
        KestrelError::Channel {
            id,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for KestrelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KestrelError::Io(e) => write!(f, "IO error: {}", e),
            KestrelError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            KestrelError::InvalidMac => write!(f, "Invalid MAC"),
            KestrelError::Negotiation(msg) => write!(f, "Negotiation error: {}", msg),
            KestrelError::Trust(msg) => write!(f, "Host key not trusted: {}", msg),
            KestrelError::Auth(msg) => write!(f, "Authentication failed: {}", msg),
            KestrelError::Channel { id, reason } => write!(f, "Channel {} error: {}", id, reason),
            KestrelError::Internal(msg) => write!(f, "Internal error: {}", msg),
            KestrelError::Config(msg) => write!(f, "Configuration error: {}", msg),
            KestrelError::Closed => write!(f, "Session closed"),
            KestrelError::Other(e) => write!(f, "Error: {}", e),
        }
    }
}

impl std::error::Error for KestrelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            KestrelError::Io(e) => Some(e),
            KestrelError::Other(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for KestrelError {
    fn from(err: std::io::Error) -> Self {
        KestrelError::Io(err)
    }
}

/// Result type for kestrel operations
pub type KestrelResult<T> = Result<T, KestrelError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_error_display() {
        let err = KestrelError::Config("user must not be empty".to_string());
        assert_eq!(err.to_string(), "Configuration error: user must not be empty");

        assert_eq!(KestrelError::InvalidMac.to_string(), "Invalid MAC");
        assert_eq!(
            KestrelError::channel(3, "open failed").to_string(),
            "Channel 3 error: open failed"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        let err: KestrelError = io_err.into();
        assert!(matches!(err, KestrelError::Io(_)));
        assert!(err.source().is_some());
    }

    #[test]
    fn test_classification() {
        assert!(KestrelError::InvalidMac.is_fatal());
        assert!(KestrelError::Trust("rejected".into()).is_fatal());
        assert!(KestrelError::Internal("unknown channel".into()).is_fatal());
        assert!(!KestrelError::Auth("denied".into()).is_fatal());
        assert!(KestrelError::Auth("denied".into()).is_recoverable());

        let ch = KestrelError::channel(1, "refused");
        assert!(ch.is_channel_scoped());
        assert!(!ch.is_fatal());
        assert!(!ch.is_recoverable());

        assert!(!KestrelError::Closed.is_fatal());
    }
}
