//! In-process transport pair.
//!
//! [`MemoryTransport`] is handed to a session; the matching [`MemoryPeer`]
//! plays the server: it injects inbound envelopes (from any thread) and
//! records everything the session sends.

use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde_json::Value;

use perfkit_core::{Error, Result};

use crate::{Envelope, InboundHandler, Transport, TransportStatus};

#[derive(Default)]
struct Shared {
    outbound: Mutex<Vec<Envelope>>,
    handler: Mutex<Option<InboundHandler>>,
    status: Mutex<Option<TransportStatus>>,
}

impl Shared {
    fn status(&self) -> TransportStatus {
        self.status
            .lock()
            .unwrap()
            .unwrap_or(TransportStatus::Connected)
    }
}

/// Session-side end of an in-memory connection.
pub struct MemoryTransport {
    shared: Arc<Shared>,
}

/// Server-side end of an in-memory connection.
#[derive(Clone)]
pub struct MemoryPeer {
    shared: Arc<Shared>,
}

/// Create a connected transport/peer pair.
pub fn memory_pair() -> (MemoryTransport, MemoryPeer) {
    let shared = Arc::new(Shared::default());
    (
        MemoryTransport {
            shared: Arc::clone(&shared),
        },
        MemoryPeer { shared },
    )
}

impl std::fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("status", &self.shared.status())
            .finish_non_exhaustive()
    }
}

impl Transport for MemoryTransport {
    fn status(&self) -> TransportStatus {
        self.shared.status()
    }

    fn send(&self, route: &str, payload: Value) -> Result<()> {
        if !self.status().accepts_sends() {
            return Err(Error::TransportClosed);
        }
        self.shared
            .outbound
            .lock()
            .unwrap()
            .push(Envelope::new(route, payload));
        Ok(())
    }

    fn set_inbound_handler(&mut self, handler: InboundHandler) {
        *self.shared.handler.lock().unwrap() = Some(handler);
    }

    fn close(&mut self) {
        *self.shared.status.lock().unwrap() = Some(TransportStatus::Invalid);
    }
}

impl MemoryPeer {
    /// Deliver a raw envelope to the session side.
    pub fn send(&self, route: &str, parameter: Value) -> Result<()> {
        if !self.shared.status().accepts_sends() {
            return Err(Error::TransportClosed);
        }
        let handler = self.shared.handler.lock().unwrap();
        let deliver = handler
            .as_ref()
            .ok_or_else(|| Error::Other("no inbound handler installed".to_string()))?;
        deliver(Envelope::new(route, parameter));
        Ok(())
    }

    /// Serialize `message` and deliver it on `route`.
    pub fn send_message<M: Serialize>(&self, route: &str, message: &M) -> Result<()> {
        self.send(route, serde_json::to_value(message)?)
    }

    /// Drain everything the session has sent so far.
    pub fn take_outbound(&self) -> Vec<Envelope> {
        std::mem::take(&mut *self.shared.outbound.lock().unwrap())
    }

    /// Number of envelopes sent by the session and not yet taken.
    pub fn outbound_len(&self) -> usize {
        self.shared.outbound.lock().unwrap().len()
    }

    /// Force the connection state seen by the session.
    pub fn set_status(&self, status: TransportStatus) {
        *self.shared.status.lock().unwrap() = Some(status);
    }

    /// Simulate a connection loss.
    pub fn disconnect(&self) {
        self.set_status(TransportStatus::Invalid);
    }
}
