//! Shared secrets used for the challenge-response proof.

use std::fmt;
use std::sync::Arc;

use zeroize::{Zeroize, Zeroizing};

/// Secret bound to a resolved peer.
///
/// Configured passwords are shared across connections and live as long as
/// the configuration does. Per-job keys belong to one session and are
/// wiped as soon as the session releases them.
#[derive(Clone)]
pub enum SharedSecret {
    Static(Arc<str>),
    PerJob(Zeroizing<Vec<u8>>),
}

impl SharedSecret {
    pub fn from_password(password: &str) -> Self {
        SharedSecret::Static(Arc::from(password))
    }

    pub fn per_job(key: impl Into<Vec<u8>>) -> Self {
        SharedSecret::PerJob(Zeroizing::new(key.into()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            SharedSecret::Static(password) => password.as_bytes(),
            SharedSecret::PerJob(key) => key.as_slice(),
        }
    }

    pub fn is_per_job(&self) -> bool {
        matches!(self, SharedSecret::PerJob(_))
    }

    /// Drop the session's copy, wiping it if it is a per-job key.
    pub fn release(self) {
        if let SharedSecret::PerJob(mut key) = self {
            key.zeroize();
        }
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SharedSecret::Static(_) => f.write_str("SharedSecret::Static(<redacted>)"),
            SharedSecret::PerJob(_) => f.write_str("SharedSecret::PerJob(<redacted>)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_never_prints_secret() {
        let secret = SharedSecret::from_password("hunter2");
        assert!(!format!("{:?}", secret).contains("hunter2"));

        let secret = SharedSecret::per_job(b"job-key".to_vec());
        assert!(!format!("{:?}", secret).contains("job-key"));
    }

    #[test]
    fn test_bytes_and_kind() {
        let secret = SharedSecret::per_job("abc");
        assert!(secret.is_per_job());
        assert_eq!(secret.as_bytes(), b"abc");
        secret.release();

        let secret = SharedSecret::from_password("pw");
        assert!(!secret.is_per_job());
        assert_eq!(secret.as_bytes(), b"pw");
    }
}
