//! Peer resolution.
//!
//! Maps a name announced in a Hello to the secret and TLS policy configured
//! for it. Per-job keys are single use: a successful job handshake consumes
//! them.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::debug;
use zeroize::Zeroizing;

use crate::config::PeerConfig;

use super::role::DaemonClass;
use super::secret::SharedSecret;
use super::tls::TlsPolicy;

/// What a Hello name is looked up as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerKey<'a> {
    /// A configured resource of the given class.
    Resource { class: DaemonClass, name: &'a str },
    /// A running job holding a per-job key.
    Job { name: &'a str },
}

/// A resolved peer.
#[derive(Debug, Clone)]
pub struct PeerEntry {
    pub name: String,
    pub secret: SharedSecret,
    pub tls: TlsPolicy,
}

/// Resolves peers by name.
pub trait PeerDirectory: Send + Sync {
    fn resolve(&self, key: PeerKey<'_>) -> Option<PeerEntry>;

    /// Called once a handshake under `key` succeeded. Transient secrets are
    /// dropped here so they cannot authenticate a second connection.
    fn consume(&self, _key: PeerKey<'_>) {}
}

/// Directory built from the `[[peers]]` configuration.
#[derive(Debug, Default)]
pub struct StaticPeerDirectory {
    peers: HashMap<(DaemonClass, String), PeerEntry>,
}

impl StaticPeerDirectory {
    pub fn new(peers: &[PeerConfig]) -> Self {
        let peers = peers
            .iter()
            .map(|peer| {
                let entry = PeerEntry {
                    name: peer.name.clone(),
                    secret: SharedSecret::from_password(&peer.password),
                    tls: peer.tls.clone(),
                };
                ((peer.class, peer.name.clone()), entry)
            })
            .collect();
        Self { peers }
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

impl PeerDirectory for StaticPeerDirectory {
    fn resolve(&self, key: PeerKey<'_>) -> Option<PeerEntry> {
        match key {
            PeerKey::Resource { class, name } => {
                self.peers.get(&(class, name.to_string())).cloned()
            }
            PeerKey::Job { .. } => None,
        }
    }
}

struct JobKey {
    key: Zeroizing<Vec<u8>>,
    tls: TlsPolicy,
}

/// Per-job keys handed out for file-node and storage-node sessions.
#[derive(Default)]
pub struct JobKeyRegistry {
    jobs: RwLock<HashMap<String, JobKey>>,
}

impl JobKeyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the key a job's peers must prove.
    pub fn register(&self, job: &str, key: impl Into<Vec<u8>>, tls: TlsPolicy) {
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        jobs.insert(
            job.to_string(),
            JobKey {
                key: Zeroizing::new(key.into()),
                tls,
            },
        );
        debug!(job = %job, "Job key registered");
    }

    /// Forget a job; its key is wiped on drop.
    pub fn remove(&self, job: &str) -> bool {
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        jobs.remove(job).is_some()
    }

    pub fn len(&self) -> usize {
        self.jobs.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PeerDirectory for JobKeyRegistry {
    fn resolve(&self, key: PeerKey<'_>) -> Option<PeerEntry> {
        let PeerKey::Job { name } = key else {
            return None;
        };
        let jobs = self.jobs.read().unwrap_or_else(|e| e.into_inner());
        jobs.get(name).map(|job| PeerEntry {
            name: name.to_string(),
            secret: SharedSecret::per_job(job.key.as_slice()),
            tls: job.tls.clone(),
        })
    }

    fn consume(&self, key: PeerKey<'_>) {
        if let PeerKey::Job { name } = key {
            if self.remove(name) {
                debug!(job = %name, "Job key consumed");
            }
        }
    }
}

/// Configured resources plus running jobs.
pub struct DaemonDirectory {
    resources: StaticPeerDirectory,
    jobs: Arc<JobKeyRegistry>,
}

impl DaemonDirectory {
    pub fn new(resources: StaticPeerDirectory, jobs: Arc<JobKeyRegistry>) -> Self {
        Self { resources, jobs }
    }

    pub fn jobs(&self) -> Arc<JobKeyRegistry> {
        Arc::clone(&self.jobs)
    }
}

impl PeerDirectory for DaemonDirectory {
    fn resolve(&self, key: PeerKey<'_>) -> Option<PeerEntry> {
        match key {
            PeerKey::Resource { .. } => self.resources.resolve(key),
            PeerKey::Job { .. } => self.jobs.resolve(key),
        }
    }

    fn consume(&self, key: PeerKey<'_>) {
        if let PeerKey::Job { .. } = key {
            self.jobs.consume(key);
        }
    }
}
