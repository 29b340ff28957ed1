//! Challenge-response proof of a shared secret.
//!
//! The challenger sends a random token along with its TLS announcement, the
//! responder answers with `hex(HMAC-SHA256(secret, token))`, and the
//! challenger replies with a verdict line. The secret itself never crosses
//! the wire.

use std::time::{SystemTime, UNIX_EPOCH};

use ring::hmac;
use ring::rand::{SecureRandom, SystemRandom};
use tokio::time::Instant;

use crate::error::{AuthErrorKind, DaemonError, DaemonResult, ProtocolErrorKind};
use crate::protocol::Transport;

use super::hello::escape_spaces;
use super::tls::TlsNeed;

const CHALLENGE_PREFIX: &str = "auth cram-sha256 ";
/// Verdict sent by a satisfied challenger.
pub const AUTH_OK: &str = "1000 OK auth\n";
/// Verdict sent when the response does not match.
pub const AUTH_FAILED: &str = "1999 Authorization failed.\n";

const NONCE_LEN: usize = 16;
const MAX_TOKEN_LEN: usize = 256;

/// TLS capabilities carried on a challenge line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Announcement {
    pub tls_need: TlsNeed,
    pub psk: bool,
}

/// Compute the response to `token` under `secret`.
pub fn compute_response(secret: &[u8], token: &str) -> String {
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret);
    hex::encode(hmac::sign(&key, token.as_bytes()).as_ref())
}

/// Constant-time check of a hex response.
fn verify_response(secret: &[u8], token: &str, response: &str) -> bool {
    let Ok(tag) = hex::decode(response.trim_end_matches(['\n', '\r'])) else {
        return false;
    };
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret);
    hmac::verify(&key, token.as_bytes(), &tag).is_ok()
}

fn new_token(local_name: &str) -> DaemonResult<String> {
    let mut nonce = [0u8; NONCE_LEN];
    SystemRandom::new()
        .fill(&mut nonce)
        .map_err(|_| DaemonError::Socket {
            message: "system random source unavailable".to_string(),
        })?;
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    Ok(format!(
        "<{}.{}@{}>",
        hex::encode(nonce),
        now,
        escape_spaces(local_name)
    ))
}

/// A fresh random secret nobody knows, for proofs that must fail.
pub fn decoy_secret() -> DaemonResult<Vec<u8>> {
    let mut secret = vec![0u8; 32];
    SystemRandom::new()
        .fill(&mut secret)
        .map_err(|_| DaemonError::Socket {
            message: "system random source unavailable".to_string(),
        })?;
    Ok(secret)
}

fn mismatch() -> DaemonError {
    DaemonError::auth(AuthErrorKind::CredentialMismatch)
}

/// Challenge the peer to prove it knows `secret`.
///
/// Succeeds only if the single response received matches; a bad response
/// is answered with [`AUTH_FAILED`] and reported as `CredentialMismatch`.
pub async fn act_as_challenger<T: Transport>(
    transport: &mut T,
    secret: &[u8],
    local_name: &str,
    announce: Announcement,
    deadline: Instant,
) -> DaemonResult<()> {
    let token = new_token(local_name)?;
    let line = format!(
        "{}{} tls={} psk={}\n",
        CHALLENGE_PREFIX,
        token,
        announce.tls_need.wire_code(),
        u8::from(announce.psk)
    );
    transport.send_line(&line).await?;

    let response = transport.receive_line(deadline).await?;
    if verify_response(secret, &token, &response) {
        transport.send_line(AUTH_OK).await?;
        Ok(())
    } else {
        // Best effort; the peer may already be gone.
        let _ = transport.send_line(AUTH_FAILED).await;
        Err(mismatch())
    }
}

/// A challenge received but not yet answered.
#[derive(Debug)]
pub struct PendingChallenge {
    token: String,
    announcement: Announcement,
}

impl PendingChallenge {
    /// Wait for the peer's challenge line.
    pub async fn receive<T: Transport>(transport: &mut T, deadline: Instant) -> DaemonResult<Self> {
        let line = transport.receive_line(deadline).await?;
        parse_challenge(&line).ok_or_else(|| DaemonError::Protocol {
            kind: ProtocolErrorKind::InvalidMessageFormat {
                message: "expected an authentication challenge".to_string(),
            },
        })
    }

    /// TLS capabilities the challenger announced.
    pub fn announcement(&self) -> Announcement {
        self.announcement
    }

    /// Answer the challenge and wait for the verdict.
    pub async fn respond<T: Transport>(
        self,
        transport: &mut T,
        secret: &[u8],
        deadline: Instant,
    ) -> DaemonResult<()> {
        let response = compute_response(secret, &self.token);
        transport.send_line(&format!("{}\n", response)).await?;

        let verdict = transport.receive_line(deadline).await?;
        if verdict == AUTH_OK {
            Ok(())
        } else {
            Err(mismatch())
        }
    }
}

/// Prove knowledge of `secret` to a challenging peer.
pub async fn act_as_responder<T: Transport>(
    transport: &mut T,
    secret: &[u8],
    deadline: Instant,
) -> DaemonResult<Announcement> {
    let pending = PendingChallenge::receive(transport, deadline).await?;
    let announcement = pending.announcement();
    pending.respond(transport, secret, deadline).await?;
    Ok(announcement)
}

fn parse_challenge(line: &str) -> Option<PendingChallenge> {
    let rest = line.trim_end_matches(['\n', '\r']).strip_prefix(CHALLENGE_PREFIX)?;
    let mut fields = rest.split(' ');

    let token = fields.next()?;
    if token.len() > MAX_TOKEN_LEN || !token.starts_with('<') || !token.ends_with('>') {
        return None;
    }
    let tls: u32 = fields.next()?.strip_prefix("tls=")?.parse().ok()?;
    let psk: u32 = fields.next()?.strip_prefix("psk=")?.parse().ok()?;
    if fields.next().is_some() {
        return None;
    }

    Some(PendingChallenge {
        token: token.to_string(),
        announcement: Announcement {
            tls_need: TlsNeed::from_wire(tls),
            psk: psk != 0,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::StreamTransport;
    use std::time::Duration;

    fn pair() -> (
        StreamTransport<tokio::io::DuplexStream>,
        StreamTransport<tokio::io::DuplexStream>,
    ) {
        let (a, b) = tokio::io::duplex(4096);
        (StreamTransport::new(a, "a"), StreamTransport::new(b, "b"))
    }

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(10)
    }

    const ANNOUNCE: Announcement = Announcement {
        tls_need: TlsNeed::Ok,
        psk: true,
    };

    #[tokio::test]
    async fn test_matching_secrets_succeed() {
        let (mut a, mut b) = pair();
        let (challenger, responder) = tokio::join!(
            act_as_challenger(&mut a, b"secret", "bacula-sd", ANNOUNCE, deadline()),
            act_as_responder(&mut b, b"secret", deadline()),
        );
        assert!(challenger.is_ok());
        assert_eq!(responder.unwrap(), ANNOUNCE);
    }

    #[tokio::test]
    async fn test_either_secret_changed_fails_both_sides() {
        for (challenger_secret, responder_secret) in
            [(&b"secret"[..], &b"Secret"[..]), (&b"other"[..], &b"secret"[..])]
        {
            let (mut a, mut b) = pair();
            let (challenger, responder) = tokio::join!(
                act_as_challenger(&mut a, challenger_secret, "sd", ANNOUNCE, deadline()),
                act_as_responder(&mut b, responder_secret, deadline()),
            );
            assert_eq!(
                challenger.unwrap_err().auth_kind(),
                Some(&AuthErrorKind::CredentialMismatch)
            );
            assert_eq!(
                responder.unwrap_err().auth_kind(),
                Some(&AuthErrorKind::CredentialMismatch)
            );
        }
    }

    #[tokio::test]
    async fn test_malformed_response_is_failure() {
        let (mut a, mut b) = pair();
        let peer = async {
            let _challenge = b.receive_line(deadline()).await.unwrap();
            b.send_line("not-hex\n").await.unwrap();
            b.receive_line(deadline()).await.unwrap()
        };
        let (challenger, verdict) = tokio::join!(
            act_as_challenger(&mut a, b"secret", "sd", ANNOUNCE, deadline()),
            peer,
        );
        assert!(challenger.is_err());
        assert_eq!(verdict, AUTH_FAILED);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer_times_out() {
        let (mut a, _b) = pair();
        let result = act_as_challenger(
            &mut a,
            b"secret",
            "sd",
            ANNOUNCE,
            Instant::now() + Duration::from_secs(15),
        )
        .await;
        assert!(result.unwrap_err().is_timeout());
    }

    #[test]
    fn test_parse_challenge() {
        let pending = parse_challenge("auth cram-sha256 <abc.1@sd> tls=2 psk=0\n").unwrap();
        assert_eq!(pending.announcement().tls_need, TlsNeed::Required);
        assert!(!pending.announcement().psk);

        assert!(parse_challenge("auth cram-sha256 abc tls=2 psk=0\n").is_none());
        assert!(parse_challenge("1999 You are not authorized.\n").is_none());
        assert!(parse_challenge("auth cram-sha256 <abc@sd> tls=1\n").is_none());
    }

    #[test]
    fn test_response_is_deterministic_and_keyed() {
        let a = compute_response(b"secret", "<token>");
        assert_eq!(a, compute_response(b"secret", "<token>"));
        assert_ne!(a, compute_response(b"secret2", "<token>"));
        assert!(verify_response(b"secret", "<token>", &format!("{}\n", a)));
        assert!(!verify_response(b"secret", "<other>", &a));
    }

    #[test]
    fn test_tokens_are_unique() {
        let a = new_token("bacula sd").unwrap();
        let b = new_token("bacula sd").unwrap();
        assert_ne!(a, b);
        assert!(!a.contains(' '));
    }
}
