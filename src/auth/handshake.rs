//! Handshake orchestration.
//!
//! One [`Handshake`] drives one connection attempt through
//! `Hello -> identity -> requirement check -> proofs -> upgrade -> ack`.
//! Role differences come from the [`RolePolicy`]; everything that can go
//! wrong funnels into a single failure path that reports the outcome,
//! cancels the deadline and applies the failure throttle exactly once.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::error::{AuthErrorKind, DaemonError, DaemonResult, RequirementSide};
use crate::protocol::{Transport, UpgradeRequest};

use super::challenge::{act_as_challenger, decoy_secret, Announcement, PendingChallenge};
use super::diagnostics::{DiagnosticSink, HandshakeReport};
use super::directory::{PeerDirectory, PeerEntry};
use super::hello::{parse_hello, Hello, HelloError};
use super::role::{DaemonClass, RolePolicy, Side};
use super::secret::SharedSecret;
use super::throttle::FailureThrottle;
use super::tls::{TlsMechanism, TlsNeed, TlsNegotiator, TlsRequirement};

/// Protocol version announced in Hello and ack lines.
pub const PROTOCOL_VERSION: u32 = 5;
/// Oldest peer version that understands compressed streams.
pub const COMPRESSION_MIN_VERSION: u32 = 4;

/// Progress of a session through the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Start,
    HelloExchanged,
    IdentityResolved,
    RequirementChecked,
    ProofInProgress,
    TransportUpgrade,
    FinalAck,
    Success,
    Failed,
}

/// Deadline guarding one handshake.
#[derive(Debug, Clone, Copy)]
pub struct HandshakeTimer {
    deadline: Option<Instant>,
}

impl HandshakeTimer {
    pub fn arm(ceiling: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + ceiling),
        }
    }

    /// Deadline for the next receive. A cancelled timer yields "now".
    pub fn deadline(&self) -> Instant {
        self.deadline.unwrap_or_else(Instant::now)
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }
}

/// Per-attempt handshake state.
#[derive(Debug)]
pub struct Session {
    id: Uuid,
    role: RolePolicy,
    local_class: DaemonClass,
    remote_class: DaemonClass,
    peer_name: Option<String>,
    local_need: TlsNeed,
    remote_need: TlsNeed,
    secret: Option<SharedSecret>,
    remote_version: u32,
    transport_upgraded: bool,
    auth_succeeded: bool,
    state: HandshakeState,
    failed_at: Option<HandshakeState>,
    timer: HandshakeTimer,
}

impl Session {
    fn new(role: RolePolicy) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            local_class: role.local_class(),
            remote_class: role.remote_class(),
            peer_name: None,
            local_need: TlsNeed::Off,
            remote_need: TlsNeed::Off,
            secret: None,
            remote_version: 0,
            transport_upgraded: false,
            auth_succeeded: false,
            state: HandshakeState::Start,
            failed_at: None,
            timer: HandshakeTimer::arm(role.timeout()),
        }
    }

    fn adopt_role(&mut self, role: RolePolicy) {
        self.role = role;
        self.local_class = role.local_class();
        self.remote_class = role.remote_class();
    }

    fn release_secret(&mut self) {
        if let Some(secret) = self.secret.take() {
            secret.release();
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn role(&self) -> RolePolicy {
        self.role
    }

    pub fn local_class(&self) -> DaemonClass {
        self.local_class
    }

    pub fn remote_class(&self) -> DaemonClass {
        self.remote_class
    }

    pub fn peer_name(&self) -> Option<&str> {
        self.peer_name.as_deref()
    }

    pub fn local_need(&self) -> TlsNeed {
        self.local_need
    }

    pub fn remote_need(&self) -> TlsNeed {
        self.remote_need
    }

    pub fn holds_secret(&self) -> bool {
        self.secret.is_some()
    }

    pub fn remote_version(&self) -> u32 {
        self.remote_version
    }

    pub fn transport_upgraded(&self) -> bool {
        self.transport_upgraded
    }

    pub fn auth_succeeded(&self) -> bool {
        self.auth_succeeded
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Last state reached before a failure.
    pub fn failed_at(&self) -> Option<HandshakeState> {
        self.failed_at
    }

    pub fn timer(&self) -> &HandshakeTimer {
        &self.timer
    }
}

/// Local identity and protocol options.
#[derive(Debug, Clone)]
pub struct HandshakeOptions {
    pub local_name: String,
    pub protocol_version: u32,
    pub comm_compression: bool,
    /// Treat peers announcing protocol version 0 as malformed.
    pub reject_legacy_peers: bool,
}

impl HandshakeOptions {
    pub fn new(local_name: impl Into<String>) -> Self {
        Self {
            local_name: local_name.into(),
            protocol_version: PROTOCOL_VERSION,
            comm_compression: true,
            reject_legacy_peers: false,
        }
    }
}

/// Collaborators shared by every handshake of a process.
pub struct HandshakeContext {
    pub directory: Arc<dyn PeerDirectory>,
    pub throttle: Arc<FailureThrottle>,
    pub options: HandshakeOptions,
}

/// A successfully authenticated connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authenticated {
    pub role: RolePolicy,
    pub peer_name: String,
    pub remote_version: u32,
    /// Encrypted channel left active on the transport.
    pub tls: Option<TlsMechanism>,
    pub compression: bool,
}

#[derive(Debug)]
struct Failure {
    kind: AuthErrorKind,
    timed_out: bool,
}

impl Failure {
    fn new(kind: AuthErrorKind) -> Self {
        Self {
            kind,
            timed_out: false,
        }
    }

    /// Classify a transport or proof error as a failure of the current phase.
    fn at(kind: AuthErrorKind) -> impl FnOnce(DaemonError) -> Failure {
        move |err| {
            debug!(error = %err, code = kind.code(), "Handshake step failed");
            Failure {
                timed_out: err.is_timeout(),
                kind,
            }
        }
    }

    fn ack(err: DaemonError) -> Failure {
        let kind = if err.is_disconnect() {
            AuthErrorKind::PeerDisconnected
        } else {
            AuthErrorKind::NoHelloAck {
                message: err.to_string(),
            }
        };
        Failure::at(kind)(err)
    }
}

fn check_requirement(negotiator: &TlsNegotiator<'_>, remote: TlsNeed) -> Result<(), Failure> {
    let side = match negotiator.test_requirement(remote) {
        TlsRequirement::Ok => return Ok(()),
        TlsRequirement::ErrorLocal => RequirementSide::Local,
        TlsRequirement::ErrorRemote => RequirementSide::Remote,
    };
    Err(Failure::new(AuthErrorKind::TlsRequirementMismatch { side }))
}

fn secret_bytes(secret: &Option<SharedSecret>) -> &[u8] {
    secret.as_ref().map(SharedSecret::as_bytes).unwrap_or_default()
}

fn match_hello(candidates: &[RolePolicy], line: &str) -> Result<(RolePolicy, Hello), HelloError> {
    let mut error = HelloError::NoGrammarMatched;
    for role in candidates {
        match parse_hello(line, role.hello_grammars()) {
            Ok(hello) => return Ok((*role, hello)),
            Err(HelloError::NoGrammarMatched) => {}
            Err(e) => error = e,
        }
    }
    Err(error)
}

fn bad_hello(reason: impl Into<String>) -> AuthErrorKind {
    AuthErrorKind::BadHello {
        reason: reason.into(),
    }
}

/// Drives one handshake attempt. Not reusable.
pub struct Handshake {
    ctx: Arc<HandshakeContext>,
    sink: Arc<dyn DiagnosticSink>,
    candidates: Vec<RolePolicy>,
    session: Session,
    started: Instant,
}

impl Handshake {
    /// Start a handshake for one role; the deadline is armed now.
    pub fn new(role: RolePolicy, ctx: Arc<HandshakeContext>, sink: Arc<dyn DiagnosticSink>) -> Self {
        Self {
            ctx,
            sink,
            candidates: vec![role],
            session: Session::new(role),
            started: Instant::now(),
        }
    }

    /// Start an accepting handshake whose role is picked by the Hello grammar.
    pub fn accepting_any(
        roles: &[RolePolicy],
        ctx: Arc<HandshakeContext>,
        sink: Arc<dyn DiagnosticSink>,
    ) -> DaemonResult<Self> {
        let Some(first) = roles.first().copied() else {
            return Err(DaemonError::Config {
                message: "no accepting roles for this daemon class".to_string(),
            });
        };
        if roles.iter().any(|role| role.side() != Side::Accepting) {
            return Err(DaemonError::Config {
                message: "connecting role offered to an accepting handshake".to_string(),
            });
        }

        let mut handshake = Self::new(first, ctx, sink);
        let ceiling = roles.iter().map(RolePolicy::timeout).max().unwrap_or(first.timeout());
        handshake.session.timer = HandshakeTimer::arm(ceiling);
        handshake.candidates = roles.to_vec();
        Ok(handshake)
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    fn begin(&self, side: Side) -> DaemonResult<()> {
        if self.session.state != HandshakeState::Start {
            return Err(DaemonError::Config {
                message: "handshake session already used".to_string(),
            });
        }
        if self.session.role.side() != side {
            return Err(DaemonError::Config {
                message: format!("{:?} cannot run on the {:?} side", self.session.role, side),
            });
        }
        Ok(())
    }

    /// Run the accepting side over `transport`.
    pub async fn accept<T: Transport>(&mut self, transport: &mut T) -> DaemonResult<Authenticated> {
        self.begin(Side::Accepting)?;
        let result = self.accept_steps(transport).await;
        self.finish(transport, result).await
    }

    /// Run the connecting side, proving ourselves to the peer named `target`.
    ///
    /// For job roles `target` is the job name and is also sent in the Hello.
    pub async fn connect<T: Transport>(
        &mut self,
        transport: &mut T,
        target: &str,
    ) -> DaemonResult<Authenticated> {
        self.begin(Side::Connecting)?;
        let result = self.connect_steps(transport, target).await;
        self.finish(transport, result).await
    }

    async fn accept_steps<T: Transport>(&mut self, t: &mut T) -> Result<Authenticated, Failure> {
        let deadline = self.session.timer.deadline();
        let line = t
            .receive_line(deadline)
            .await
            .map_err(Failure::at(bad_hello("no Hello received")))?;
        self.session.state = HandshakeState::HelloExchanged;

        let (role, hello) = match_hello(&self.candidates, &line)
            .map_err(|e| Failure::new(bad_hello(e.to_string())))?;
        self.session.adopt_role(role);
        if hello.version == 0 && self.ctx.options.reject_legacy_peers {
            return Err(Failure::new(bad_hello("protocol version 0 is not accepted")));
        }
        self.session.peer_name = Some(hello.name.clone());
        self.session.remote_version = hello.version;
        self.session.remote_need = TlsNeed::from_psk_flag(hello.tls_psk);

        let Some(PeerEntry { secret, tls, .. }) = self.ctx.directory.resolve(role.peer_key(&hello.name))
        else {
            self.decoy_proof(t, deadline).await;
            return Err(Failure::new(AuthErrorKind::UnknownPeer { name: hello.name }));
        };
        self.session.state = HandshakeState::IdentityResolved;

        let negotiator = TlsNegotiator::new(&tls);
        self.session.local_need = negotiator.local_need();
        check_requirement(&negotiator, self.session.remote_need)?;
        self.session.state = HandshakeState::RequirementChecked;

        self.session.secret = Some(secret);
        self.session.state = HandshakeState::ProofInProgress;
        let announce = Announcement {
            tls_need: negotiator.local_need(),
            psk: negotiator.local_psk(),
        };
        let secret = secret_bytes(&self.session.secret);
        act_as_challenger(t, secret, &self.ctx.options.local_name, announce, deadline)
            .await
            .map_err(Failure::at(AuthErrorKind::CredentialMismatch))?;
        let pending = PendingChallenge::receive(t, deadline)
            .await
            .map_err(Failure::at(AuthErrorKind::CredentialMismatch))?;
        let remote = pending.announcement();
        check_requirement(&negotiator, remote.tls_need)?;
        pending
            .respond(t, secret, deadline)
            .await
            .map_err(Failure::at(AuthErrorKind::CredentialMismatch))?;
        self.session.remote_need = remote.tls_need;

        let tls_used = self.upgrade(t, &negotiator, remote).await?;
        self.session.release_secret();

        self.session.state = HandshakeState::FinalAck;
        let ack = role.ack_line(self.ctx.options.protocol_version, &self.ctx.options.local_name);
        t.send_line(&ack).await.map_err(Failure::ack)?;

        self.complete(t, role, &negotiator, tls_used).await
    }

    async fn connect_steps<T: Transport>(
        &mut self,
        t: &mut T,
        target: &str,
    ) -> Result<Authenticated, Failure> {
        let role = self.session.role;
        let deadline = self.session.timer.deadline();
        self.session.peer_name = Some(target.to_string());

        let Some(PeerEntry { secret, tls, .. }) = self.ctx.directory.resolve(role.peer_key(target))
        else {
            return Err(Failure::new(AuthErrorKind::UnknownPeer {
                name: target.to_string(),
            }));
        };
        self.session.state = HandshakeState::IdentityResolved;
        let negotiator = TlsNegotiator::new(&tls);
        self.session.local_need = negotiator.local_need();
        self.session.secret = Some(secret);

        let hello_name = if role.uses_job_secret() {
            target
        } else {
            self.ctx.options.local_name.as_str()
        };
        let hello = role.hello_line(
            hello_name,
            self.ctx.options.protocol_version,
            negotiator.local_need().is_capable(),
        );
        t.send_line(&hello)
            .await
            .map_err(Failure::at(AuthErrorKind::PeerDisconnected))?;
        self.session.state = HandshakeState::HelloExchanged;

        let pending = PendingChallenge::receive(t, deadline)
            .await
            .map_err(Failure::at(AuthErrorKind::CredentialMismatch))?;
        let remote = pending.announcement();
        self.session.remote_need = remote.tls_need;
        check_requirement(&negotiator, remote.tls_need)?;
        self.session.state = HandshakeState::RequirementChecked;

        self.session.state = HandshakeState::ProofInProgress;
        let secret = secret_bytes(&self.session.secret);
        pending
            .respond(t, secret, deadline)
            .await
            .map_err(Failure::at(AuthErrorKind::CredentialMismatch))?;
        let announce = Announcement {
            tls_need: negotiator.local_need(),
            psk: negotiator.local_psk(),
        };
        act_as_challenger(t, secret, &self.ctx.options.local_name, announce, deadline)
            .await
            .map_err(Failure::at(AuthErrorKind::CredentialMismatch))?;

        let tls_used = self.upgrade(t, &negotiator, remote).await?;
        self.session.release_secret();

        self.session.state = HandshakeState::FinalAck;
        let line = t.receive_line(deadline).await.map_err(Failure::ack)?;
        let version = role.parse_ack(&line).ok_or_else(|| {
            Failure::new(AuthErrorKind::NoHelloAck {
                message: format!("unexpected reply from {}", role.remote_class()),
            })
        })?;
        if version == 0 && self.ctx.options.reject_legacy_peers {
            return Err(Failure::new(AuthErrorKind::NoHelloAck {
                message: "protocol version 0 is not accepted".to_string(),
            }));
        }
        self.session.remote_version = version;

        self.complete(t, role, &negotiator, tls_used).await
    }

    /// Issue a challenge nobody can answer so an unknown name looks like a wrong secret.
    async fn decoy_proof<T: Transport>(&self, t: &mut T, deadline: Instant) {
        let Ok(secret) = decoy_secret() else {
            return;
        };
        let announce = Announcement {
            tls_need: TlsNeed::Ok,
            psk: true,
        };
        let _ = act_as_challenger(t, &secret, &self.ctx.options.local_name, announce, deadline).await;
    }

    async fn upgrade<T: Transport>(
        &mut self,
        t: &mut T,
        negotiator: &TlsNegotiator<'_>,
        remote: Announcement,
    ) -> Result<Option<TlsMechanism>, Failure> {
        let negotiated = negotiator.negotiate(remote.tls_need, remote.psk);
        let Some(mechanism) = negotiated.mechanism else {
            return Ok(None);
        };
        self.session.state = HandshakeState::TransportUpgrade;

        let policy = negotiator.policy();
        let role = self.session.role;
        let diagnostic = format!(
            "TLS negotiation with {} \"{}\" at {} failed",
            role.remote_class(),
            self.session.peer_name.as_deref().unwrap_or("-"),
            t.peer_addr()
        );
        let failed = |detail: String| {
            Failure::new(AuthErrorKind::TlsNegotiationFailed {
                message: format!("{}: {}", diagnostic, detail),
            })
        };

        if mechanism == TlsMechanism::Certificate && !policy.enable {
            return Err(failed("certificate TLS is not configured".to_string()));
        }

        let request = UpgradeRequest {
            mechanism,
            side: role.side(),
            psk: (mechanism == TlsMechanism::Psk).then(|| secret_bytes(&self.session.secret)),
            verify_peer: policy.verify_peer,
        };
        let outcome = t.upgrade_transport(request).await.map_err(|e| match e.auth_kind() {
            Some(AuthErrorKind::TlsNegotiationFailed { message }) => failed(message.clone()),
            _ => failed(e.to_string()),
        })?;

        if mechanism == TlsMechanism::Certificate
            && policy.verify_peer
            && !policy.allowed_identities.is_empty()
        {
            let allowed = outcome
                .peer_identity
                .as_ref()
                .is_some_and(|identity| policy.allowed_identities.contains(identity));
            if !allowed {
                return Err(failed(format!(
                    "peer identity {} is not in the allowed list",
                    outcome.peer_identity.as_deref().unwrap_or("<none>")
                )));
            }
        }

        self.session.transport_upgraded = true;
        debug!(session_id = %self.session.id, mechanism = ?mechanism, need = ?negotiated.need, "Transport upgraded");
        Ok(Some(mechanism))
    }

    async fn complete<T: Transport>(
        &mut self,
        t: &mut T,
        role: RolePolicy,
        negotiator: &TlsNegotiator<'_>,
        mut tls: Option<TlsMechanism>,
    ) -> Result<Authenticated, Failure> {
        let options = &self.ctx.options;
        let compression = options.comm_compression
            && options.protocol_version >= COMPRESSION_MIN_VERSION
            && self.session.remote_version >= COMPRESSION_MIN_VERSION;
        if compression {
            t.enable_compression();
        }

        if tls.is_some() && negotiator.policy().authenticate_only {
            t.downgrade_transport().await.map_err(|e| {
                Failure::new(AuthErrorKind::TlsNegotiationFailed {
                    message: e.to_string(),
                })
            })?;
            tls = None;
        }

        Ok(Authenticated {
            role,
            peer_name: self.session.peer_name.clone().unwrap_or_default(),
            remote_version: self.session.remote_version,
            tls,
            compression,
        })
    }

    async fn finish<T: Transport>(
        &mut self,
        t: &mut T,
        result: Result<Authenticated, Failure>,
    ) -> DaemonResult<Authenticated> {
        match result {
            Ok(authenticated) => {
                if self.session.role.uses_job_secret() {
                    let key = self.session.role.peer_key(&authenticated.peer_name);
                    self.ctx.directory.consume(key);
                }
                self.session.timer.cancel();
                self.session.auth_succeeded = true;
                self.session.state = HandshakeState::Success;
                self.report(t.peer_addr(), None);
                Ok(authenticated)
            }
            Err(failure) => {
                if self.session.role.side() == Side::Accepting {
                    let _ = t.send_line(self.session.role.rejection_line()).await;
                }
                self.session.release_secret();
                self.session.timer.cancel();
                self.session.failed_at = Some(self.session.state);
                self.session.state = HandshakeState::Failed;
                self.report(t.peer_addr(), Some(&failure));
                self.ctx
                    .throttle
                    .penalize(self.session.role.failure_delay())
                    .await;
                Err(DaemonError::auth(failure.kind))
            }
        }
    }

    fn report(&self, peer_addr: &str, failure: Option<&Failure>) {
        self.sink.record(&HandshakeReport {
            session_id: self.session.id,
            peer_addr,
            role: self.session.role,
            peer_name: self.session.peer_name.as_deref(),
            failure: failure.map(|f| &f.kind),
            timed_out: failure.is_some_and(|f| f.timed_out),
            elapsed: self.started.elapsed(),
        });
    }
}
