//! # ws-endpoint: server-side WebSocket protocol engine
//!
//! An RFC 6455 endpoint for connections that have already been upgraded
//! from HTTP. The crate drives the frame-level protocol (framing,
//! fragmentation, control-frame handling, per-message deflate and the
//! orderly close handshake) and exposes an event-style API for sending
//! and receiving messages.
//!
//! The opening handshake, TLS, and subprotocol negotiation policy belong
//! to the upgrade layer; this crate takes over once the stream speaks
//! WebSocket.
//!
//! ## Example
//!
//! ```ignore
//! use ws_endpoint::{ConnectOptions, WebSocket};
//!
//! let ws = WebSocket::attach(upgraded_stream, ConnectOptions::default());
//! ws.on_message(|event| {
//!     // handle event.kind / event.data
//! });
//! ws.on_close(|event| {
//!     // event.was_clean, event.code, event.reason
//! });
//! ws.connect_as_server().await?;
//!
//! ws.send_text("ready").await?;
//! ```

use std::time::Duration;

pub mod close;
pub mod connection;
pub mod deflate;
pub mod error;
pub mod events;
pub mod frame;
pub mod mask;
pub mod queue;
pub mod signal;
pub mod state;

pub use close::CloseReason;
pub use connection::{ConnectOptions, WebSocket};
pub use error::{Error, Result};
pub use events::{CloseEvent, MessageEvent, MessageKind};
pub use frame::{Frame, OpCode};
pub use state::ReadyState;

/// Payload bytes carried by each outgoing fragment. Messages longer than
/// this are split; every non-terminal fragment is exactly this long.
pub const FRAGMENT_LENGTH: usize = 1016;

/// Maximum control-frame payload (RFC 6455 §5.5)
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Largest payload encodable with a 7-bit length
pub const SMALL_PAYLOAD_THRESHOLD: usize = 125;

/// Largest payload encodable with a 16-bit extended length
pub const MEDIUM_PAYLOAD_THRESHOLD: usize = 65535;

/// How long the close path waits for the peer's confirming close
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_millis(1000);

/// Advisory keep-alive interval. The endpoint exposes the value and the
/// pong signal; scheduling pings is left to the surrounding layer.
pub const DEFAULT_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Initial receive buffer capacity
pub const RECV_BUFFER_SIZE: usize = 64 * 1024;

/// Per-message compression mode, fixed when the connection is bound
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    /// No compression; inbound RSV1 frames fail the connection
    #[default]
    Disabled,
    /// Per-message deflate negotiated by the upgrade layer
    Deflate,
}

impl Compression {
    /// Returns true if compression is enabled
    pub fn is_enabled(&self) -> bool {
        !matches!(self, Compression::Disabled)
    }
}

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::connection::{ConnectOptions, WebSocket};
    pub use crate::error::{Error, Result};
    pub use crate::events::{CloseEvent, MessageEvent, MessageKind};
    pub use crate::{Compression, ReadyState};
}
