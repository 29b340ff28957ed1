//! Error types for the authentication daemon.

use thiserror::Error;

/// Main error type for the daemon.
#[derive(Error, Debug)]
pub enum DaemonError {
    /// Configuration-related errors.
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Socket-related errors.
    #[error("Socket error: {message}")]
    Socket { message: String },

    /// Handshake failures.
    #[error("Authentication error: {kind}")]
    Auth { kind: AuthErrorKind },

    /// Protocol errors.
    #[error("Protocol error: {kind}")]
    Protocol { kind: ProtocolErrorKind },

    /// I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DaemonError {
    /// Shorthand for an authentication failure of the given kind.
    pub fn auth(kind: AuthErrorKind) -> Self {
        DaemonError::Auth { kind }
    }

    /// Returns the authentication failure kind, if this is one.
    pub fn auth_kind(&self) -> Option<&AuthErrorKind> {
        match self {
            DaemonError::Auth { kind } => Some(kind),
            _ => None,
        }
    }

    /// True when the error came from an elapsed receive deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            DaemonError::Protocol {
                kind: ProtocolErrorKind::ConnectionTimeout
            }
        )
    }

    /// True when the peer closed the stream.
    pub fn is_disconnect(&self) -> bool {
        match self {
            DaemonError::Protocol {
                kind: ProtocolErrorKind::ConnectionClosed,
            }
            | DaemonError::Auth {
                kind: AuthErrorKind::PeerDisconnected,
            } => true,
            DaemonError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionReset
            ),
            _ => false,
        }
    }
}

/// Which side of a TLS requirement comparison could not be satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequirementSide {
    /// Local configuration cannot meet the requirement.
    Local,
    /// The peer did not advertise what the requirement needs.
    Remote,
}

impl std::fmt::Display for RequirementSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequirementSide::Local => write!(f, "local"),
            RequirementSide::Remote => write!(f, "remote"),
        }
    }
}

/// Broad failure categories shown to interactive users.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCategory {
    LocalConfig,
    RemoteRejection,
    NetworkFailure,
}

impl FailureCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCategory::LocalConfig => "local_config",
            FailureCategory::RemoteRejection => "remote_rejection",
            FailureCategory::NetworkFailure => "network_failure",
        }
    }
}

/// Authentication error kinds.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthErrorKind {
    #[error("Bad Hello: {reason}")]
    BadHello { reason: String },

    #[error("Unknown peer \"{name}\"")]
    UnknownPeer { name: String },

    #[error("Incompatible TLS requirements ({side} side cannot comply)")]
    TlsRequirementMismatch { side: RequirementSide },

    #[error("Authorization failed")]
    CredentialMismatch,

    #[error("TLS negotiation failed: {message}")]
    TlsNegotiationFailed { message: String },

    #[error("Bad or missing Hello acknowledgment: {message}")]
    NoHelloAck { message: String },

    #[error("Peer disconnected during handshake")]
    PeerDisconnected,
}

impl AuthErrorKind {
    /// Short stable code used in logs and audit entries.
    pub fn code(&self) -> &'static str {
        match self {
            AuthErrorKind::BadHello { .. } => "BAD_HELLO",
            AuthErrorKind::UnknownPeer { .. } => "UNKNOWN_PEER",
            AuthErrorKind::TlsRequirementMismatch { .. } => "TLS_REQUIREMENT_MISMATCH",
            AuthErrorKind::CredentialMismatch => "CREDENTIAL_MISMATCH",
            AuthErrorKind::TlsNegotiationFailed { .. } => "TLS_NEGOTIATION_FAILED",
            AuthErrorKind::NoHelloAck { .. } => "NO_HELLO_ACK",
            AuthErrorKind::PeerDisconnected => "PEER_DISCONNECTED",
        }
    }

    /// Category reported to console users.
    pub fn category(&self) -> FailureCategory {
        match self {
            AuthErrorKind::TlsRequirementMismatch {
                side: RequirementSide::Local,
            } => FailureCategory::LocalConfig,
            AuthErrorKind::BadHello { .. }
            | AuthErrorKind::UnknownPeer { .. }
            | AuthErrorKind::TlsRequirementMismatch {
                side: RequirementSide::Remote,
            }
            | AuthErrorKind::CredentialMismatch
            | AuthErrorKind::NoHelloAck { .. } => FailureCategory::RemoteRejection,
            AuthErrorKind::TlsNegotiationFailed { .. }
            | AuthErrorKind::PeerDisconnected => FailureCategory::NetworkFailure,
        }
    }
}

/// Protocol error kinds.
#[derive(Error, Debug)]
pub enum ProtocolErrorKind {
    #[error("Message too large: {size} bytes exceeds maximum of {max} bytes")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Invalid message format: {message}")]
    InvalidMessageFormat { message: String },

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Connection timed out")]
    ConnectionTimeout,
}

/// Result type alias for daemon operations.
pub type DaemonResult<T> = Result<T, DaemonError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_mismatch_is_local_config() {
        let kind = AuthErrorKind::TlsRequirementMismatch {
            side: RequirementSide::Local,
        };
        assert_eq!(kind.category(), FailureCategory::LocalConfig);
        assert_eq!(kind.code(), "TLS_REQUIREMENT_MISMATCH");
    }

    #[test]
    fn test_unknown_peer_and_bad_secret_share_category() {
        let unknown = AuthErrorKind::UnknownPeer {
            name: "x".to_string(),
        };
        assert_eq!(unknown.category(), AuthErrorKind::CredentialMismatch.category());
    }

    #[test]
    fn test_timeout_detection() {
        let err = DaemonError::Protocol {
            kind: ProtocolErrorKind::ConnectionTimeout,
        };
        assert!(err.is_timeout());
        assert!(!err.is_disconnect());

        let err = DaemonError::Protocol {
            kind: ProtocolErrorKind::ConnectionClosed,
        };
        assert!(err.is_disconnect());
    }
}
