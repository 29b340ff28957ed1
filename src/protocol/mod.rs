//! Wire protocol module.
//!
//! Message framing and the transport abstraction the handshake runs over.
//!
//! ## Wire Format
//!
//! Every handshake line is sent as one length-prefixed packet:
//! ```text
//! [4 bytes: length (big-endian u32)][ASCII line, newline included]
//! ```

mod transport;
mod wire;

pub use transport::{NoTls, StreamTransport, TlsProvider, Transport, UpgradeRequest};
pub use wire::{
    read_line_until, read_message, write_message, write_message_with_timeout,
    DEFAULT_MAX_MESSAGE_SIZE,
};
