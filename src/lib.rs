//! Backup daemon authentication library.
//!
//! Mutual authentication handshake between the director, storage nodes,
//! file nodes and consoles of a distributed backup system: Hello exchange,
//! TLS requirement negotiation, challenge-response proofs of a shared
//! secret, optional transport upgrade and the final acknowledgment.

pub mod audit;
pub mod auth;
pub mod config;
pub mod error;
pub mod protocol;
pub mod socket;
