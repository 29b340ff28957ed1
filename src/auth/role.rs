//! Daemon classes and the per-pairing role policy.
//!
//! A [`RolePolicy`] value carries everything that differs between the
//! daemon pairings: which side proves first, the Hello grammars, the
//! acknowledgment format, the timeout ceiling and the failure delay.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::directory::PeerKey;
use super::hello::{self, Grammar};

/// Timeout ceiling for daemon-to-daemon handshakes.
pub const DAEMON_AUTH_TIMEOUT: Duration = Duration::from_secs(10 * 60);
/// Timeout ceiling for interactive console handshakes.
pub const CONSOLE_AUTH_TIMEOUT: Duration = Duration::from_secs(15);

/// Kinds of processes taking part in a handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DaemonClass {
    Console,
    FileNode,
    Storage,
    Director,
}

impl DaemonClass {
    /// Human-readable name used in diagnostics.
    pub fn label(&self) -> &'static str {
        match self {
            DaemonClass::Console => "Console",
            DaemonClass::FileNode => "File daemon",
            DaemonClass::Storage => "Storage daemon",
            DaemonClass::Director => "Director",
        }
    }
}

impl fmt::Display for DaemonClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Which end of the connection this process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Server side: receives the Hello, challenges first, sends the ack.
    Accepting,
    /// Client side: sends the Hello, responds first, reads the ack.
    Connecting,
}

/// Format of the final acknowledgment line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AckStyle {
    /// `1000 OK: <version> ...`
    Console,
    /// `2000 OK Hello <version>`
    FileNode,
    /// `3000 OK Hello <version>`
    Storage,
}

/// One end of one daemon pairing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RolePolicy {
    DirectorAcceptsConsole,
    ConsoleProvesToDirector,
    StorageAcceptsDirector,
    DirectorProvesToStorage,
    FileNodeAcceptsDirector,
    DirectorProvesToFileNode,
    StorageAcceptsFileNode,
    FileNodeProvesToStorage,
    StorageAcceptsStorage,
    StorageProvesToStorage,
}

impl RolePolicy {
    pub fn side(&self) -> Side {
        match self {
            RolePolicy::DirectorAcceptsConsole
            | RolePolicy::StorageAcceptsDirector
            | RolePolicy::FileNodeAcceptsDirector
            | RolePolicy::StorageAcceptsFileNode
            | RolePolicy::StorageAcceptsStorage => Side::Accepting,
            RolePolicy::ConsoleProvesToDirector
            | RolePolicy::DirectorProvesToStorage
            | RolePolicy::DirectorProvesToFileNode
            | RolePolicy::FileNodeProvesToStorage
            | RolePolicy::StorageProvesToStorage => Side::Connecting,
        }
    }

    pub fn local_class(&self) -> DaemonClass {
        match self {
            RolePolicy::DirectorAcceptsConsole
            | RolePolicy::DirectorProvesToStorage
            | RolePolicy::DirectorProvesToFileNode => DaemonClass::Director,
            RolePolicy::ConsoleProvesToDirector => DaemonClass::Console,
            RolePolicy::StorageAcceptsDirector
            | RolePolicy::StorageAcceptsFileNode
            | RolePolicy::StorageAcceptsStorage
            | RolePolicy::StorageProvesToStorage => DaemonClass::Storage,
            RolePolicy::FileNodeAcceptsDirector | RolePolicy::FileNodeProvesToStorage => {
                DaemonClass::FileNode
            }
        }
    }

    pub fn remote_class(&self) -> DaemonClass {
        match self {
            RolePolicy::DirectorAcceptsConsole => DaemonClass::Console,
            RolePolicy::ConsoleProvesToDirector
            | RolePolicy::StorageAcceptsDirector
            | RolePolicy::FileNodeAcceptsDirector => DaemonClass::Director,
            RolePolicy::DirectorProvesToStorage
            | RolePolicy::FileNodeProvesToStorage
            | RolePolicy::StorageAcceptsStorage
            | RolePolicy::StorageProvesToStorage => DaemonClass::Storage,
            RolePolicy::DirectorProvesToFileNode | RolePolicy::StorageAcceptsFileNode => {
                DaemonClass::FileNode
            }
        }
    }

    /// Job pairings authenticate with a per-job secret instead of a configured password.
    pub fn uses_job_secret(&self) -> bool {
        matches!(
            self,
            RolePolicy::StorageAcceptsFileNode
                | RolePolicy::FileNodeProvesToStorage
                | RolePolicy::StorageAcceptsStorage
                | RolePolicy::StorageProvesToStorage
        )
    }

    fn is_console(&self) -> bool {
        matches!(
            self,
            RolePolicy::DirectorAcceptsConsole | RolePolicy::ConsoleProvesToDirector
        )
    }

    pub fn timeout(&self) -> Duration {
        if self.is_console() {
            CONSOLE_AUTH_TIMEOUT
        } else {
            DAEMON_AUTH_TIMEOUT
        }
    }

    /// Penalty applied by the failure throttle after a failed attempt.
    pub fn failure_delay(&self) -> Duration {
        if self.uses_job_secret() {
            Duration::from_secs(6)
        } else {
            Duration::from_secs(5)
        }
    }

    /// Hello grammars for this pairing, most specific first.
    pub fn hello_grammars(&self) -> &'static [Grammar] {
        match self {
            RolePolicy::DirectorAcceptsConsole | RolePolicy::ConsoleProvesToDirector => {
                hello::CONSOLE_GRAMMARS
            }
            RolePolicy::StorageAcceptsDirector
            | RolePolicy::DirectorProvesToStorage
            | RolePolicy::FileNodeAcceptsDirector
            | RolePolicy::DirectorProvesToFileNode => hello::DIRECTOR_GRAMMARS,
            RolePolicy::StorageAcceptsFileNode | RolePolicy::FileNodeProvesToStorage => {
                hello::FILE_JOB_GRAMMARS
            }
            RolePolicy::StorageAcceptsStorage | RolePolicy::StorageProvesToStorage => {
                hello::STORAGE_JOB_GRAMMARS
            }
        }
    }

    /// Build the Hello line the connecting side sends.
    pub fn hello_line(&self, name: &str, version: u32, tls_capable: bool) -> String {
        self.hello_grammars()[0].render(name, version, tls_capable)
    }

    /// Directory lookup key for the name announced in a Hello.
    pub fn peer_key<'a>(&self, name: &'a str) -> PeerKey<'a> {
        if self.uses_job_secret() {
            PeerKey::Job { name }
        } else {
            PeerKey::Resource {
                class: self.remote_class(),
                name,
            }
        }
    }

    fn ack_style(&self) -> AckStyle {
        match self {
            RolePolicy::DirectorAcceptsConsole | RolePolicy::ConsoleProvesToDirector => {
                AckStyle::Console
            }
            RolePolicy::FileNodeAcceptsDirector | RolePolicy::DirectorProvesToFileNode => {
                AckStyle::FileNode
            }
            _ => AckStyle::Storage,
        }
    }

    /// Final acknowledgment sent by the accepting side.
    pub fn ack_line(&self, version: u32, local_name: &str) -> String {
        match self.ack_style() {
            AckStyle::Console => format!(
                "1000 OK: {} {} Version: {}\n",
                version,
                local_name,
                env!("CARGO_PKG_VERSION")
            ),
            AckStyle::FileNode => format!("2000 OK Hello {}\n", version),
            AckStyle::Storage => format!("3000 OK Hello {}\n", version),
        }
    }

    /// Parse an acknowledgment, returning the peer's protocol version.
    ///
    /// A missing version field is reported as 0.
    pub fn parse_ack(&self, line: &str) -> Option<u32> {
        let line = line.trim_end_matches(['\n', '\r']);
        match self.ack_style() {
            AckStyle::Console => {
                let rest = line.strip_prefix("1000 OK:")?;
                Some(
                    rest.split_whitespace()
                        .next()
                        .and_then(|v| v.parse().ok())
                        .unwrap_or(0),
                )
            }
            AckStyle::FileNode => parse_numbered_ack(line, "2000 OK Hello"),
            AckStyle::Storage => parse_numbered_ack(line, "3000 OK Hello"),
        }
    }

    /// Line sent by the accepting side before closing a failed handshake.
    pub fn rejection_line(&self) -> &'static str {
        match self.ack_style() {
            AckStyle::Console => "1999 You are not authorized.\n",
            AckStyle::FileNode => "2999 Authorization failed.\n",
            AckStyle::Storage => "3999 Authorization failed.\n",
        }
    }

    /// Roles a daemon of `class` serves on its listening socket.
    pub fn accepting_roles(class: DaemonClass) -> &'static [RolePolicy] {
        match class {
            DaemonClass::Director => &[RolePolicy::DirectorAcceptsConsole],
            DaemonClass::FileNode => &[RolePolicy::FileNodeAcceptsDirector],
            DaemonClass::Storage => &[
                RolePolicy::StorageAcceptsDirector,
                RolePolicy::StorageAcceptsFileNode,
                RolePolicy::StorageAcceptsStorage,
            ],
            DaemonClass::Console => &[],
        }
    }
}

fn parse_numbered_ack(line: &str, prefix: &str) -> Option<u32> {
    let rest = line.strip_prefix(prefix)?;
    if rest.is_empty() {
        return Some(0);
    }
    rest.strip_prefix(' ')?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sides_and_classes() {
        let role = RolePolicy::StorageAcceptsFileNode;
        assert_eq!(role.side(), Side::Accepting);
        assert_eq!(role.local_class(), DaemonClass::Storage);
        assert_eq!(role.remote_class(), DaemonClass::FileNode);
        assert!(role.uses_job_secret());

        let role = RolePolicy::ConsoleProvesToDirector;
        assert_eq!(role.side(), Side::Connecting);
        assert_eq!(role.remote_class(), DaemonClass::Director);
    }

    #[test]
    fn test_timeouts() {
        assert_eq!(RolePolicy::DirectorAcceptsConsole.timeout(), CONSOLE_AUTH_TIMEOUT);
        assert_eq!(RolePolicy::StorageAcceptsDirector.timeout(), DAEMON_AUTH_TIMEOUT);
        assert_eq!(
            RolePolicy::FileNodeProvesToStorage.failure_delay(),
            Duration::from_secs(6)
        );
    }

    #[test]
    fn test_ack_lines_parse_back() {
        for role in [
            RolePolicy::ConsoleProvesToDirector,
            RolePolicy::DirectorProvesToFileNode,
            RolePolicy::DirectorProvesToStorage,
        ] {
            let ack = role.ack_line(5, "bacula-dir");
            assert_eq!(role.parse_ack(&ack), Some(5), "{ack}");
        }
    }

    #[test]
    fn test_ack_prefixes() {
        assert!(RolePolicy::DirectorAcceptsConsole
            .ack_line(5, "dir")
            .starts_with("1000 OK: 5 dir"));
        assert_eq!(RolePolicy::FileNodeAcceptsDirector.ack_line(5, "fd"), "2000 OK Hello 5\n");
        assert_eq!(RolePolicy::StorageAcceptsDirector.ack_line(5, "sd"), "3000 OK Hello 5\n");
    }

    #[test]
    fn test_legacy_acks_default_to_version_zero() {
        assert_eq!(RolePolicy::ConsoleProvesToDirector.parse_ack("1000 OK:\n"), Some(0));
        assert_eq!(RolePolicy::DirectorProvesToStorage.parse_ack("3000 OK Hello\n"), Some(0));
    }

    #[test]
    fn test_wrong_ack_rejected() {
        let role = RolePolicy::DirectorProvesToStorage;
        assert_eq!(role.parse_ack("2000 OK Hello 5\n"), None);
        assert_eq!(role.parse_ack("3999 Authorization failed.\n"), None);
        assert_eq!(role.parse_ack("3000 OK Hellox\n"), None);
    }

    #[test]
    fn test_storage_serves_three_roles() {
        let roles = RolePolicy::accepting_roles(DaemonClass::Storage);
        assert_eq!(roles.len(), 3);
        assert!(roles.iter().all(|r| r.side() == Side::Accepting));
        assert!(RolePolicy::accepting_roles(DaemonClass::Console).is_empty());
    }
}
