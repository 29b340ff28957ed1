//! Configuration settings for the authentication daemon.

use serde::Deserialize;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::auth::{DaemonClass, TlsPolicy, MAX_NAME_LEN};
use crate::error::DaemonError;
use crate::protocol::DEFAULT_MAX_MESSAGE_SIZE;

/// Main configuration structure for the daemon.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
}

/// Identity of this daemon.
#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    /// Name announced to peers.
    pub name: String,
    /// Which kind of daemon this process is.
    pub class: DaemonClass,
    /// TCP address to accept handshakes on (e.g. "0.0.0.0:9103").
    pub listen: Option<String>,
}

/// Security configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SecurityConfig {
    /// Fixed delay after every failed handshake, replacing the per-role delay.
    pub failure_delay_ms: Option<u64>,
    /// Reject peers announcing protocol version 0.
    #[serde(default)]
    pub reject_legacy_peers: bool,
    /// Allow stream compression with peers that support it.
    #[serde(default = "default_comm_compression")]
    pub comm_compression: bool,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log format ("pretty" or "json").
    #[serde(default = "default_log_format")]
    pub format: String,
}

/// Limits configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    /// Maximum packet size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    /// Maximum concurrent connections.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_connections: usize,
}

/// Audit logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AuditConfig {
    /// Whether audit logging is enabled.
    #[serde(default)]
    pub enabled: bool,
    /// Path to the audit log file.
    #[serde(default = "default_audit_log_path")]
    pub log_path: PathBuf,
}

/// A peer this daemon shares a password with.
#[derive(Debug, Clone, Deserialize)]
pub struct PeerConfig {
    pub name: String,
    pub class: DaemonClass,
    pub password: String,
    #[serde(default)]
    pub tls: TlsPolicy,
}

// Default value functions
fn default_comm_compression() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_max_message_size() -> usize {
    DEFAULT_MAX_MESSAGE_SIZE
}

fn default_max_concurrent() -> usize {
    100
}

fn default_audit_log_path() -> PathBuf {
    PathBuf::from("/var/log/backup-authd/audit.log")
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            failure_delay_ms: None,
            reject_legacy_peers: false,
            comm_compression: default_comm_compression(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_message_size: default_max_message_size(),
            max_concurrent_connections: default_max_concurrent(),
        }
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            log_path: default_audit_log_path(),
        }
    }
}

impl SecurityConfig {
    pub fn failure_delay(&self) -> Option<Duration> {
        self.failure_delay_ms.map(Duration::from_millis)
    }
}

impl Settings {
    /// Load settings from a TOML configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, DaemonError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| DaemonError::Config {
            message: format!("Failed to read config file '{}': {}", path.display(), e),
        })?;

        Self::parse(&content).map_err(|e| match e {
            DaemonError::Config { message } => DaemonError::Config {
                message: format!("{}: {}", path.display(), message),
            },
            other => other,
        })
    }

    /// Parse and validate settings from TOML text.
    pub fn parse(content: &str) -> Result<Self, DaemonError> {
        let settings: Settings = toml::from_str(content).map_err(|e| DaemonError::Config {
            message: format!("Failed to parse config: {}", e),
        })?;

        settings.validate()?;

        Ok(settings)
    }

    /// Parsed listen address, if the daemon accepts connections.
    pub fn listen_addr(&self) -> Result<Option<SocketAddr>, DaemonError> {
        self.daemon
            .listen
            .as_deref()
            .map(|addr| {
                addr.parse().map_err(|e| DaemonError::Config {
                    message: format!("Invalid listen address '{}': {}", addr, e),
                })
            })
            .transpose()
    }

    /// Validate the settings.
    fn validate(&self) -> Result<(), DaemonError> {
        // Validate log level
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(DaemonError::Config {
                message: format!(
                    "Invalid log level '{}'. Valid levels: {:?}",
                    self.logging.level, valid_levels
                ),
            });
        }

        // Validate log format
        let valid_formats = ["pretty", "json"];
        if !valid_formats.contains(&self.logging.format.to_lowercase().as_str()) {
            return Err(DaemonError::Config {
                message: format!(
                    "Invalid log format '{}'. Valid formats: {:?}",
                    self.logging.format, valid_formats
                ),
            });
        }

        validate_name("daemon.name", &self.daemon.name)?;
        self.listen_addr()?;
        if self.daemon.class == DaemonClass::Console && self.daemon.listen.is_some() {
            return Err(DaemonError::Config {
                message: "A console does not accept connections; remove daemon.listen".to_string(),
            });
        }

        if self.limits.max_concurrent_connections == 0 {
            return Err(DaemonError::Config {
                message: "limits.max_concurrent_connections must be at least 1".to_string(),
            });
        }

        let mut seen = HashSet::new();
        for peer in &self.peers {
            validate_name("peers.name", &peer.name)?;
            if peer.password.is_empty() {
                return Err(DaemonError::Config {
                    message: format!("Peer '{}' has an empty password", peer.name),
                });
            }
            if !seen.insert((peer.class, peer.name.as_str())) {
                return Err(DaemonError::Config {
                    message: format!("Duplicate {} peer '{}'", peer.class, peer.name),
                });
            }
        }

        Ok(())
    }
}

fn validate_name(field: &str, name: &str) -> Result<(), DaemonError> {
    if name.is_empty() || name.len() > MAX_NAME_LEN || name.chars().any(char::is_control) {
        return Err(DaemonError::Config {
            message: format!(
                "Invalid {} '{}'. Must be 1-{} printable characters",
                field, name, MAX_NAME_LEN
            ),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [daemon]
        name = "bacula-sd"
        class = "storage"
        listen = "127.0.0.1:9103"
    "#;

    #[test]
    fn test_default_values() {
        let settings = Settings::parse(MINIMAL).unwrap();
        assert_eq!(settings.logging.level, "info");
        assert_eq!(settings.logging.format, "pretty");
        assert!(settings.security.comm_compression);
        assert!(!settings.security.reject_legacy_peers);
        assert!(settings.security.failure_delay().is_none());
        assert!(!settings.audit.enabled);
        assert!(settings.peers.is_empty());
        assert_eq!(
            settings.listen_addr().unwrap(),
            Some("127.0.0.1:9103".parse().unwrap())
        );
    }

    #[test]
    fn test_security_defaults_match_empty_section() {
        let absent = Settings::parse(MINIMAL).unwrap();
        let empty = Settings::parse(&format!("{}\n[security]\n", MINIMAL)).unwrap();
        assert_eq!(
            absent.security.comm_compression,
            empty.security.comm_compression
        );
        assert_eq!(
            absent.security.reject_legacy_peers,
            empty.security.reject_legacy_peers
        );
        assert!(absent.security.comm_compression);
    }

    #[test]
    fn test_peers_with_tls() {
        let settings = Settings::parse(&format!(
            r#"{}
            [[peers]]
            name = "bacula-dir"
            class = "director"
            password = "secret"

            [peers.tls]
            psk_enable = true
            require = true
            "#,
            MINIMAL
        ))
        .unwrap();

        let peer = &settings.peers[0];
        assert_eq!(peer.class, DaemonClass::Director);
        assert!(peer.tls.psk_enable);
        assert!(peer.tls.require);
        assert!(peer.tls.verify_peer);
    }

    #[test]
    fn test_duplicate_peer_rejected() {
        let peer = r#"
            [[peers]]
            name = "bacula-dir"
            class = "director"
            password = "secret"
        "#;
        let result = Settings::parse(&format!("{}{}{}", MINIMAL, peer, peer));
        assert!(matches!(result, Err(DaemonError::Config { .. })));
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(Settings::parse(&MINIMAL.replace("9103\"", "x\"")).is_err());
        assert!(Settings::parse(&format!("{}\n[logging]\nlevel = \"loud\"\n", MINIMAL)).is_err());
        assert!(Settings::parse(&MINIMAL.replace("storage", "console")).is_err());
        assert!(Settings::parse(&MINIMAL.replace("bacula-sd", "")).is_err());
        assert!(Settings::parse(&format!(
            "{}\n[[peers]]\nname = \"d\"\nclass = \"director\"\npassword = \"\"\n",
            MINIMAL
        ))
        .is_err());
    }
}
