//! Audit logger for writing audit entries to file.
//!
//! Writes structured audit entries as JSON lines (one JSON object per line)
//! for easy parsing by log analysis tools.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, warn};

use crate::auth::{DiagnosticSink, HandshakeReport};
use crate::error::DaemonError;

use super::entry::AuditEntry;

/// Logger for audit entries.
///
/// Writes audit entries to a file in JSON lines format.
/// Thread-safe via internal mutex.
pub struct AuditLogger {
    file: Mutex<File>,
    path: PathBuf,
}

impl AuditLogger {
    /// Create a new audit logger that appends to `path`.
    ///
    /// Creates the parent directory if it doesn't exist.
    pub fn new(path: &Path) -> Result<Self, DaemonError> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                debug!(path = %parent.display(), "Creating audit log directory");
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;

        debug!(path = %path.display(), "Audit logger initialized");

        Ok(Self {
            file: Mutex::new(file),
            path: path.to_path_buf(),
        })
    }

    /// Serialize `entry` and write it as a single line.
    pub fn log(&self, entry: &AuditEntry) -> Result<(), DaemonError> {
        let json = serde_json::to_string(entry)?;

        let mut file = self.file.lock().map_err(|e| DaemonError::Socket {
            message: format!("Failed to acquire audit log lock: {}", e),
        })?;

        writeln!(file, "{}", json)?;

        if let Err(e) = file.sync_data() {
            warn!(error = %e, "Failed to sync audit log");
        }

        debug!(session_id = %entry.session_id, "Audit entry logged");

        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DiagnosticSink for AuditLogger {
    fn record(&self, report: &HandshakeReport<'_>) {
        if let Err(e) = self.log(&AuditEntry::from_report(report)) {
            warn!(error = %e, path = %self.path.display(), "Failed to write audit entry");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::RolePolicy;
    use crate::error::AuthErrorKind;
    use std::io::Read;
    use std::time::Duration;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn report<'a>(failure: Option<&'a AuthErrorKind>) -> HandshakeReport<'a> {
        HandshakeReport {
            session_id: Uuid::new_v4(),
            peer_addr: "10.0.0.7:9102",
            role: RolePolicy::FileNodeAcceptsDirector,
            peer_name: Some("bacula-dir"),
            failure,
            timed_out: false,
            elapsed: Duration::from_millis(4),
        }
    }

    fn read(path: &Path) -> String {
        let mut content = String::new();
        File::open(path)
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        content
    }

    #[test]
    fn test_logger_creates_directory() {
        let temp_dir = TempDir::new().unwrap();
        let log_path = temp_dir.path().join("subdir/audit.log");

        let logger = AuditLogger::new(&log_path).unwrap();
        assert!(log_path.parent().unwrap().exists());
        assert_eq!(logger.path(), log_path);
    }

    #[test]
    fn test_sink_writes_json_lines() {
        let temp_dir = TempDir::new().unwrap();
        let log_path = temp_dir.path().join("audit.log");
        let logger = AuditLogger::new(&log_path).unwrap();

        logger.record(&report(None));
        logger.record(&report(Some(&AuthErrorKind::CredentialMismatch)));

        let content = read(&log_path);
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["result"]["status"], "success");
        assert_eq!(first["local_class"], "file_node");

        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["result"]["status"], "failure");
        assert_eq!(second["peer_name"], "bacula-dir");
    }

    #[test]
    fn test_logger_appends_to_existing_file() {
        let temp_dir = TempDir::new().unwrap();
        let log_path = temp_dir.path().join("audit.log");

        {
            let logger = AuditLogger::new(&log_path).unwrap();
            logger.record(&report(None));
        }
        {
            let logger = AuditLogger::new(&log_path).unwrap();
            logger.record(&report(None));
        }

        assert_eq!(read(&log_path).lines().count(), 2);
    }
}
