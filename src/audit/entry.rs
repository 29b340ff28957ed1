//! Audit entry types.
//!
//! Defines the structure of audit log entries.

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::auth::{DaemonClass, HandshakeReport};

/// A single audit log entry.
///
/// Records one finished handshake: who connected, in which role, and how it
/// ended. Secrets and challenge material are never part of an entry.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    /// RFC 3339 timestamp when the handshake finished.
    pub timestamp: String,
    /// Unique identifier of the handshake session.
    pub session_id: Uuid,
    /// Address of the remote end.
    pub peer_addr: String,
    /// Role played by this process.
    pub role: String,
    pub local_class: DaemonClass,
    pub remote_class: DaemonClass,
    /// Name announced or targeted, if one was parsed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer_name: Option<String>,
    pub result: AuditResult,
    /// Handshake duration in milliseconds.
    pub duration_ms: u64,
}

impl AuditEntry {
    /// Build an entry from a handshake report, stamped with the current time.
    pub fn from_report(report: &HandshakeReport<'_>) -> Self {
        let result = match report.failure {
            None => AuditResult::Success,
            Some(kind) => AuditResult::Failure {
                error_code: kind.code().to_string(),
                category: kind.category().as_str().to_string(),
                error_message: kind.to_string(),
                timed_out: report.timed_out,
            },
        };

        Self {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            session_id: report.session_id,
            peer_addr: report.peer_addr.to_string(),
            role: format!("{:?}", report.role),
            local_class: report.role.local_class(),
            remote_class: report.role.remote_class(),
            peer_name: report.peer_name.map(str::to_string),
            result,
            duration_ms: report.elapsed.as_millis() as u64,
        }
    }
}

/// Outcome of a handshake for audit purposes.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status")]
pub enum AuditResult {
    #[serde(rename = "success")]
    Success,
    #[serde(rename = "failure")]
    Failure {
        error_code: String,
        category: String,
        error_message: String,
        timed_out: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::RolePolicy;
    use crate::error::AuthErrorKind;
    use std::time::Duration;

    fn report<'a>(failure: Option<&'a AuthErrorKind>) -> HandshakeReport<'a> {
        HandshakeReport {
            session_id: Uuid::nil(),
            peer_addr: "192.168.1.20:40112",
            role: RolePolicy::StorageAcceptsDirector,
            peer_name: Some("bacula-dir"),
            failure,
            timed_out: false,
            elapsed: Duration::from_millis(15),
        }
    }

    #[test]
    fn test_audit_entry_success_serialization() {
        let entry = AuditEntry::from_report(&report(None));

        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"status\":\"success\""));
        assert!(json.contains("\"role\":\"StorageAcceptsDirector\""));
        assert!(json.contains("\"remote_class\":\"director\""));
        assert!(json.contains("\"peer_name\":\"bacula-dir\""));
        assert!(json.contains("\"duration_ms\":15"));
    }

    #[test]
    fn test_audit_entry_failure_serialization() {
        let kind = AuditEntry::from_report(&report(Some(&AuthErrorKind::CredentialMismatch)));

        let json = serde_json::to_value(&kind).unwrap();
        assert_eq!(json["result"]["status"], "failure");
        assert_eq!(json["result"]["error_code"], AuthErrorKind::CredentialMismatch.code());
        assert_eq!(json["result"]["category"], "remote_rejection");
        assert_eq!(json["result"]["timed_out"], false);
    }

    #[test]
    fn test_unknown_name_is_omitted() {
        let kind = AuthErrorKind::BadHello {
            reason: "no Hello received".to_string(),
        };
        let mut r = report(Some(&kind));
        r.peer_name = None;
        let json = serde_json::to_string(&AuditEntry::from_report(&r)).unwrap();
        assert!(!json.contains("peer_name"));
    }
}
