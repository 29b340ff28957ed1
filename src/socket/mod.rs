//! TCP socket layer.
//!
//! Accepts connections and runs the accepting handshake on each, and opens
//! outgoing connections that run a connecting handshake.

mod connection;
mod listener;

pub use connection::{connect, handle_connection, AuthenticatedConnection, TcpTransport};
pub use listener::{
    accepts_connections, diagnostic_sink, failure_throttle, handshake_context, ConnectionMetrics,
    SocketListener,
};
