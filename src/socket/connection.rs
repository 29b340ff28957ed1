//! Per-connection handshake drivers.

use std::sync::Arc;

use tokio::net::{TcpStream, ToSocketAddrs};
use tracing::{debug, info};

use crate::auth::{Authenticated, DiagnosticSink, Handshake, HandshakeContext, RolePolicy};
use crate::error::{DaemonError, DaemonResult};
use crate::protocol::{StreamTransport, Transport};

/// Transport over a TCP connection.
pub type TcpTransport = StreamTransport<TcpStream>;

/// A connection that passed the handshake, ready for the session protocol.
pub struct AuthenticatedConnection {
    pub transport: TcpTransport,
    pub auth: Authenticated,
}

/// Run the accepting handshake on a freshly accepted stream.
///
/// The role is chosen among `roles` from the Hello the peer sends.
pub async fn handle_connection(
    stream: TcpStream,
    roles: &[RolePolicy],
    ctx: Arc<HandshakeContext>,
    sink: Arc<dyn DiagnosticSink>,
    max_message_size: usize,
) -> DaemonResult<AuthenticatedConnection> {
    let peer = peer_label(&stream);
    let mut transport = StreamTransport::new(stream, peer).with_max_message_size(max_message_size);

    let mut handshake = Handshake::accepting_any(roles, ctx, sink)?;
    debug!(session_id = %handshake.session().id(), peer = %transport.peer_addr(), "Handshake started");
    let auth = handshake.accept(&mut transport).await?;

    info!(
        peer = %transport.peer_addr(),
        name = %auth.peer_name,
        role = ?auth.role,
        "Peer authenticated"
    );
    Ok(AuthenticatedConnection { transport, auth })
}

/// Connect to `addr` and prove ourselves to `target` under `role`.
pub async fn connect<A: ToSocketAddrs>(
    addr: A,
    role: RolePolicy,
    target: &str,
    ctx: Arc<HandshakeContext>,
    sink: Arc<dyn DiagnosticSink>,
    max_message_size: usize,
) -> DaemonResult<AuthenticatedConnection> {
    let stream = TcpStream::connect(addr).await.map_err(|e| DaemonError::Socket {
        message: format!("Failed to connect to {} \"{}\": {}", role.remote_class(), target, e),
    })?;
    let peer = peer_label(&stream);
    let mut transport = StreamTransport::new(stream, peer).with_max_message_size(max_message_size);

    let mut handshake = Handshake::new(role, ctx, sink);
    let auth = handshake.connect(&mut transport, target).await?;
    debug!(target = %target, role = ?role, "Connected and authenticated");
    Ok(AuthenticatedConnection { transport, auth })
}

fn peer_label(stream: &TcpStream) -> String {
    stream
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}
