//! Authentication module.
//!
//! Hello parsing, TLS requirement negotiation, challenge-response proofs,
//! peer resolution and the handshake orchestrator that ties them together.

mod challenge;
mod diagnostics;
mod directory;
mod handshake;
mod hello;
mod role;
mod secret;
mod throttle;
mod tls;

pub use challenge::{
    act_as_challenger, act_as_responder, compute_response, Announcement, PendingChallenge,
    AUTH_FAILED, AUTH_OK,
};
pub use diagnostics::{ConsoleMessages, DiagnosticSink, FanoutSink, HandshakeReport, TracingSink};
pub use directory::{
    DaemonDirectory, JobKeyRegistry, PeerDirectory, PeerEntry, PeerKey, StaticPeerDirectory,
};
pub use handshake::{
    Authenticated, Handshake, HandshakeContext, HandshakeOptions, HandshakeState, HandshakeTimer,
    Session, COMPRESSION_MIN_VERSION, PROTOCOL_VERSION,
};
pub use hello::{
    escape_spaces, parse_hello, unescape_spaces, Grammar, Hello, HelloError, Token,
    CONSOLE_GRAMMARS, DIRECTOR_GRAMMARS, FILE_JOB_GRAMMARS, MAX_HELLO_LEN, MAX_NAME_LEN,
    MIN_HELLO_LEN, STORAGE_JOB_GRAMMARS,
};
pub use role::{DaemonClass, RolePolicy, Side, CONSOLE_AUTH_TIMEOUT, DAEMON_AUTH_TIMEOUT};
pub use secret::SharedSecret;
pub use throttle::FailureThrottle;
pub use tls::{
    NegotiatedNeed, Negotiated, TlsMechanism, TlsNeed, TlsNegotiator, TlsPolicy, TlsRequirement,
    UpgradeOutcome,
};
