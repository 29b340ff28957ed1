//! Reporting of handshake outcomes.
//!
//! The orchestrator hands every finished attempt to a [`DiagnosticSink`].
//! Sinks decide how to present it: structured log lines, a message for an
//! interactive console, or an audit record.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{AuthErrorKind, FailureCategory};

use super::role::RolePolicy;

/// Summary of one finished handshake attempt.
#[derive(Debug, Clone)]
pub struct HandshakeReport<'a> {
    pub session_id: Uuid,
    pub peer_addr: &'a str,
    pub role: RolePolicy,
    /// Name from the Hello (accepting) or the target (connecting), if known.
    pub peer_name: Option<&'a str>,
    pub failure: Option<&'a AuthErrorKind>,
    /// The failure was caused by the deadline elapsing.
    pub timed_out: bool,
    pub elapsed: Duration,
}

impl HandshakeReport<'_> {
    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }
}

/// Receives handshake outcomes.
pub trait DiagnosticSink: Send + Sync {
    fn record(&self, report: &HandshakeReport<'_>);
}

/// Logs outcomes through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn record(&self, report: &HandshakeReport<'_>) {
        match report.failure {
            None => info!(
                session_id = %report.session_id,
                peer = %report.peer_addr,
                role = ?report.role,
                name = report.peer_name.unwrap_or("-"),
                elapsed_ms = report.elapsed.as_millis() as u64,
                "Handshake succeeded"
            ),
            Some(kind) => warn!(
                session_id = %report.session_id,
                peer = %report.peer_addr,
                role = ?report.role,
                name = report.peer_name.unwrap_or("-"),
                code = kind.code(),
                category = kind.category().as_str(),
                timed_out = report.timed_out,
                error = %kind,
                "Handshake failed"
            ),
        }
    }
}

/// Keeps a human-readable message for display in a console.
#[derive(Debug, Default)]
pub struct ConsoleMessages {
    last: Mutex<Option<(FailureCategory, String)>>,
}

impl ConsoleMessages {
    pub fn new() -> Self {
        Self::default()
    }

    /// Message and category of the last failure, if any.
    pub fn last_failure(&self) -> Option<(FailureCategory, String)> {
        self.last.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl DiagnosticSink for ConsoleMessages {
    fn record(&self, report: &HandshakeReport<'_>) {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        *last = report
            .failure
            .map(|kind| (kind.category(), console_message(report, kind)));
    }
}

fn console_message(report: &HandshakeReport<'_>, kind: &AuthErrorKind) -> String {
    let remote = report.role.remote_class();
    let addr = report.peer_addr;
    match kind.category() {
        FailureCategory::LocalConfig => format!(
            "Authorization problem with {} at \"{}\": the local TLS configuration \
             cannot satisfy the connection requirements. Check the TLS settings \
             for this {}.",
            remote, addr, remote
        ),
        FailureCategory::RemoteRejection => format!(
            "{} at \"{}\" rejected the Hello or the credentials: {}. \
             Most likely the passwords do not agree.",
            remote, addr, kind
        ),
        FailureCategory::NetworkFailure => {
            let detail = if report.timed_out {
                "no answer before the timeout".to_string()
            } else {
                kind.to_string()
            };
            format!(
                "Connection to {} at \"{}\" failed during authentication: {}.",
                remote, addr, detail
            )
        }
    }
}

/// Forwards every report to several sinks.
#[derive(Clone, Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn DiagnosticSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn DiagnosticSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl DiagnosticSink for FanoutSink {
    fn record(&self, report: &HandshakeReport<'_>) {
        for sink in &self.sinks {
            sink.record(report);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RequirementSide;

    fn report<'a>(failure: Option<&'a AuthErrorKind>, timed_out: bool) -> HandshakeReport<'a> {
        HandshakeReport {
            session_id: Uuid::nil(),
            peer_addr: "10.0.0.5:9101",
            role: RolePolicy::ConsoleProvesToDirector,
            peer_name: Some("bacula-dir"),
            failure,
            timed_out,
            elapsed: Duration::from_millis(3),
        }
    }

    #[test]
    fn test_console_local_config_message() {
        let sink = ConsoleMessages::new();
        let kind = AuthErrorKind::TlsRequirementMismatch {
            side: RequirementSide::Local,
        };
        sink.record(&report(Some(&kind), false));

        let (category, message) = sink.last_failure().unwrap();
        assert_eq!(category, FailureCategory::LocalConfig);
        assert!(message.contains("Director"));
        assert!(message.contains("TLS"));
    }

    #[test]
    fn test_console_rejection_message() {
        let sink = ConsoleMessages::new();
        sink.record(&report(Some(&AuthErrorKind::CredentialMismatch), false));

        let (category, message) = sink.last_failure().unwrap();
        assert_eq!(category, FailureCategory::RemoteRejection);
        assert!(message.contains("passwords do not agree"));
    }

    #[test]
    fn test_console_network_message_mentions_timeout() {
        let sink = ConsoleMessages::new();
        let kind = AuthErrorKind::TlsNegotiationFailed {
            message: "connection timed out".to_string(),
        };
        sink.record(&report(Some(&kind), true));

        let (category, message) = sink.last_failure().unwrap();
        assert_eq!(category, FailureCategory::NetworkFailure);
        assert!(message.contains("timeout"));
    }

    #[test]
    fn test_success_clears_message() {
        let sink = ConsoleMessages::new();
        sink.record(&report(Some(&AuthErrorKind::CredentialMismatch), false));
        sink.record(&report(None, false));
        assert!(sink.last_failure().is_none());
    }

    #[test]
    fn test_fanout_reaches_every_sink() {
        let first = Arc::new(ConsoleMessages::new());
        let second = Arc::new(ConsoleMessages::new());
        let fanout = FanoutSink::new()
            .with(first.clone())
            .with(second.clone());

        fanout.record(&report(Some(&AuthErrorKind::PeerDisconnected), false));
        assert!(first.last_failure().is_some());
        assert!(second.last_failure().is_some());
    }
}
