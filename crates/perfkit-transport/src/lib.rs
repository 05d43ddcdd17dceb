//! # perfkit-transport
//!
//! Framed message transports for the perfkit client.
//!
//! This crate provides:
//! - The [`Transport`] contract consumed by the session layer
//! - Frame codec (magic, length prefix, CBOR envelope)
//! - A tokio TCP transport
//! - An in-memory transport pair for tests and embedding
//!
//! ## Architecture
//!
//! This is Layer 1 in the architecture - it depends on perfkit-core and is
//! consumed by perfkit-session. Transports deliver inbound envelopes through a
//! single callback that may run on any thread; the receiver is responsible for
//! handing them off to its own execution context.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod frame;
pub mod memory;
pub mod tcp;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use perfkit_core::Result;

// Re-export commonly used types
pub use frame::{FrameDecoder, MAGIC, MAX_FRAME_LEN};
pub use memory::{memory_pair, MemoryPeer, MemoryTransport};
pub use tcp::TcpTransport;

/// Connection state of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportStatus {
    /// Closed, failed, or never connected
    Invalid,
    /// Connection attempt in progress
    Connecting,
    /// Connected and exchanging frames
    Connected,
}

impl TransportStatus {
    /// Whether frames can still be queued for sending.
    pub fn accepts_sends(&self) -> bool {
        !matches!(self, TransportStatus::Invalid)
    }
}

/// One routed message as carried in a frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Route identifier
    pub route: String,
    /// Route-specific payload document
    #[serde(default)]
    pub parameter: Value,
}

impl Envelope {
    /// Create a new envelope.
    pub fn new(route: impl Into<String>, parameter: Value) -> Self {
        Self {
            route: route.into(),
            parameter,
        }
    }
}

/// Callback receiving inbound envelopes. Called from the transport's I/O thread.
pub type InboundHandler = Box<dyn Fn(Envelope) + Send>;

/// Bidirectional routed-message channel to one peer.
pub trait Transport: Send {
    /// Current connection state.
    fn status(&self) -> TransportStatus;

    /// Queue a message for sending. Never blocks.
    fn send(&self, route: &str, payload: Value) -> Result<()>;

    /// Install the single inbound callback, replacing any previous one.
    fn set_inbound_handler(&mut self, handler: InboundHandler);

    /// Close the connection. Status becomes [`TransportStatus::Invalid`].
    fn close(&mut self);
}
