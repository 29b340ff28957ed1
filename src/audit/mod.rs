//! Audit logging module.
//!
//! Records every finished handshake as one JSON line in an append-only file.
//! The logger is a [`DiagnosticSink`](crate::auth::DiagnosticSink), so it is
//! plugged into the handshake next to the tracing sink.

mod entry;
mod logger;

pub use entry::{AuditEntry, AuditResult};
pub use logger::AuditLogger;
