//! Byte-stream transport used by the handshake.
//!
//! The handshake only ever needs a handful of primitives from the socket
//! layer; they are collected in [`Transport`] so the orchestrator can be
//! driven over a TCP stream, an in-memory pipe, or a test double.

use std::future::Future;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::time::Instant;
use tracing::debug;

use crate::auth::{Side, TlsMechanism, UpgradeOutcome};
use crate::error::{AuthErrorKind, DaemonError, DaemonResult};

use super::wire::{read_line_until, write_message_with_timeout, DEFAULT_MAX_MESSAGE_SIZE};

/// Upper bound on a single handshake write.
const WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// Parameters handed to the transport when upgrading to an encrypted channel.
#[derive(Debug, Clone, Copy)]
pub struct UpgradeRequest<'a> {
    pub mechanism: TlsMechanism,
    pub side: Side,
    /// Pre-shared key, present only for [`TlsMechanism::Psk`].
    pub psk: Option<&'a [u8]>,
    pub verify_peer: bool,
}

/// Socket primitives consumed by the handshake.
pub trait Transport: Send {
    /// Printable peer address used in diagnostics.
    fn peer_addr(&self) -> &str;

    fn send_line(&mut self, line: &str) -> impl Future<Output = DaemonResult<()>> + Send;

    /// Receive one line; fails with a timeout-flavoured error once `deadline` passes.
    fn receive_line(&mut self, deadline: Instant)
        -> impl Future<Output = DaemonResult<String>> + Send;

    fn upgrade_transport(
        &mut self,
        request: UpgradeRequest<'_>,
    ) -> impl Future<Output = DaemonResult<UpgradeOutcome>> + Send;

    /// Return to cleartext after an authenticate-only upgrade.
    fn downgrade_transport(&mut self) -> impl Future<Output = DaemonResult<()>> + Send;

    fn enable_compression(&mut self);
}

/// Performs the actual TLS/PSK session setup for a [`StreamTransport`].
pub trait TlsProvider: Send + Sync {
    fn upgrade(&self, request: &UpgradeRequest<'_>, peer: &str) -> Result<UpgradeOutcome, String>;
}

/// Provider used when no TLS library is linked: every upgrade fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoTls;

impl TlsProvider for NoTls {
    fn upgrade(&self, request: &UpgradeRequest<'_>, _peer: &str) -> Result<UpgradeOutcome, String> {
        Err(format!(
            "no TLS provider available for {:?} upgrade",
            request.mechanism
        ))
    }
}

/// [`Transport`] over any tokio byte stream using length-prefixed lines.
pub struct StreamTransport<S, P = NoTls> {
    stream: BufReader<S>,
    peer: String,
    max_message_size: usize,
    provider: P,
    upgraded: Option<TlsMechanism>,
    compression: bool,
}

impl<S> StreamTransport<S, NoTls>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S, peer: impl Into<String>) -> Self {
        Self::with_provider(stream, peer, NoTls)
    }
}

impl<S, P> StreamTransport<S, P>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
    P: TlsProvider,
{
    pub fn with_provider(stream: S, peer: impl Into<String>, provider: P) -> Self {
        Self {
            stream: BufReader::new(stream),
            peer: peer.into(),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            provider,
            upgraded: None,
            compression: false,
        }
    }

    pub fn with_max_message_size(mut self, max: usize) -> Self {
        self.max_message_size = max;
        self
    }

    /// Mechanism of the active encrypted channel, if any.
    pub fn upgraded(&self) -> Option<TlsMechanism> {
        self.upgraded
    }

    pub fn compression_enabled(&self) -> bool {
        self.compression
    }

    pub fn into_inner(self) -> S {
        self.stream.into_inner()
    }
}

impl<S, P> Transport for StreamTransport<S, P>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
    P: TlsProvider,
{
    fn peer_addr(&self) -> &str {
        &self.peer
    }

    async fn send_line(&mut self, line: &str) -> DaemonResult<()> {
        write_message_with_timeout(&mut self.stream, line.as_bytes(), WRITE_TIMEOUT).await
    }

    async fn receive_line(&mut self, deadline: Instant) -> DaemonResult<String> {
        read_line_until(&mut self.stream, self.max_message_size, deadline).await
    }

    async fn upgrade_transport(&mut self, request: UpgradeRequest<'_>) -> DaemonResult<UpgradeOutcome> {
        let outcome = self.provider.upgrade(&request, &self.peer).map_err(|message| {
            DaemonError::auth(AuthErrorKind::TlsNegotiationFailed { message })
        })?;
        self.upgraded = Some(request.mechanism);
        debug!(peer = %self.peer, mechanism = ?request.mechanism, "Transport upgraded");
        Ok(outcome)
    }

    async fn downgrade_transport(&mut self) -> DaemonResult<()> {
        if self.upgraded.take().is_some() {
            debug!(peer = %self.peer, "Transport returned to cleartext");
        }
        Ok(())
    }

    fn enable_compression(&mut self) {
        self.compression = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProtocolErrorKind;

    #[tokio::test]
    async fn test_lines_cross_a_duplex_pipe() {
        let (a, b) = tokio::io::duplex(1024);
        let mut left = StreamTransport::new(a, "left");
        let mut right = StreamTransport::new(b, "right");

        left.send_line("Hello there\n").await.unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        let line = right.receive_line(deadline).await.unwrap();
        assert_eq!(line, "Hello there\n");
    }

    #[tokio::test]
    async fn test_no_tls_upgrade_fails() {
        let (a, _b) = tokio::io::duplex(64);
        let mut transport = StreamTransport::new(a, "peer");
        let request = UpgradeRequest {
            mechanism: TlsMechanism::Certificate,
            side: Side::Accepting,
            psk: None,
            verify_peer: true,
        };

        let result = transport.upgrade_transport(request).await;
        assert!(matches!(
            result.unwrap_err().auth_kind(),
            Some(AuthErrorKind::TlsNegotiationFailed { .. })
        ));
        assert_eq!(transport.upgraded(), None);
    }

    #[tokio::test]
    async fn test_closed_peer_reports_connection_closed() {
        let (a, b) = tokio::io::duplex(64);
        drop(b);
        let mut transport = StreamTransport::new(a, "peer");
        let deadline = Instant::now() + Duration::from_secs(5);

        let result = transport.receive_line(deadline).await;
        assert!(matches!(
            result,
            Err(DaemonError::Protocol {
                kind: ProtocolErrorKind::ConnectionClosed
            })
        ));
    }

    #[test]
    fn test_compression_flag() {
        let (a, _b) = tokio::io::duplex(64);
        let mut transport = StreamTransport::new(a, "peer");
        assert!(!transport.compression_enabled());
        transport.enable_compression();
        assert!(transport.compression_enabled());
    }
}
