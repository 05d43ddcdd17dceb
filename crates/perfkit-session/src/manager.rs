//! Session manager for coordinating several remote sessions.

use std::collections::HashMap;
use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use perfkit_core::{ClientConfig, Error, Result, ShellSettings, TraceSettings};
use perfkit_transport::{Transport, TransportStatus};

use crate::context::SessionContext;
use crate::trace::{TickReport, TraceContext};

/// Identifier of a manager slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SlotId(Uuid);

impl SlotId {
    /// Generate a new random slot id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SlotId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One session paired with its trace context.
///
/// Field order matters: the trace context is dropped before the session it
/// reads from.
#[derive(Debug)]
pub struct SessionSlot {
    label: String,
    opened_at: Instant,
    trace: TraceContext,
    session: SessionContext,
}

impl SessionSlot {
    /// Human-readable label given at open time.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// When the slot was opened.
    pub fn opened_at(&self) -> Instant {
        self.opened_at
    }

    /// Session context.
    pub fn session(&self) -> &SessionContext {
        &self.session
    }

    /// Mutable session context.
    pub fn session_mut(&mut self) -> &mut SessionContext {
        &mut self.session
    }

    /// Trace context.
    pub fn trace(&self) -> &TraceContext {
        &self.trace
    }

    /// Mutable trace context.
    pub fn trace_mut(&mut self) -> &mut TraceContext {
        &mut self.trace
    }

    /// Borrow both halves at once, e.g. to send a node control.
    pub fn parts_mut(&mut self) -> (&mut SessionContext, &mut TraceContext) {
        (&mut self.session, &mut self.trace)
    }

    /// Pump inbound frames, then advance the trace context.
    pub fn tick(&mut self, now: Instant) -> TickReport {
        self.session.pump();
        self.trace.tick(&mut self.session, now)
    }
}

/// Configuration for session manager.
#[derive(Debug, Clone)]
pub struct SessionManagerConfig {
    /// Maximum number of concurrent slots
    pub max_sessions: usize,

    /// Shell buffer settings for new sessions
    pub shell: ShellSettings,

    /// Trace settings for new trace contexts
    pub trace: TraceSettings,
}

impl SessionManagerConfig {
    /// Derive manager settings from a client configuration.
    pub fn from_client_config(config: &ClientConfig) -> Self {
        Self {
            max_sessions: config.connection.max_sessions,
            shell: config.shell.clone(),
            trace: config.trace.clone(),
        }
    }
}

impl Default for SessionManagerConfig {
    fn default() -> Self {
        Self::from_client_config(&ClientConfig::default())
    }
}

/// Summary of one slot.
#[derive(Debug, Clone)]
pub struct SlotInfo {
    /// Slot ID
    pub slot_id: SlotId,

    /// Label
    pub label: String,

    /// Transport status
    pub status: TransportStatus,

    /// Resets observed
    pub epoch: u64,

    /// Session name from the latest reset
    pub session_name: Option<String>,
}

/// Owns every open session slot.
#[derive(Debug)]
pub struct SessionManager {
    slots: HashMap<SlotId, SessionSlot>,
    config: SessionManagerConfig,
}

impl SessionManager {
    /// Create a new session manager with default configuration.
    pub fn new() -> Self {
        Self::with_config(SessionManagerConfig::default())
    }

    /// Create a new session manager with custom configuration.
    pub fn with_config(config: SessionManagerConfig) -> Self {
        Self {
            slots: HashMap::new(),
            config,
        }
    }

    /// Open a slot over `transport`.
    pub fn open<T: Transport + 'static>(&mut self, label: &str, transport: T) -> Result<SlotId> {
        if self.slots.len() >= self.config.max_sessions {
            return Err(Error::SessionLimitReached(self.config.max_sessions));
        }

        let slot_id = SlotId::new();
        let slot = SessionSlot {
            label: label.to_string(),
            opened_at: Instant::now(),
            trace: TraceContext::with_settings(self.config.trace.clone()),
            session: SessionContext::with_settings(transport, &self.config.shell),
        };
        self.slots.insert(slot_id, slot);
        info!("Session slot opened: id={}, label={}", slot_id, label);
        Ok(slot_id)
    }

    /// Get a slot by ID.
    pub fn get(&self, slot_id: &SlotId) -> Result<&SessionSlot> {
        self.slots
            .get(slot_id)
            .ok_or_else(|| Error::SlotNotFound(slot_id.to_string()))
    }

    /// Get a slot by ID for mutation.
    pub fn get_mut(&mut self, slot_id: &SlotId) -> Result<&mut SessionSlot> {
        self.slots
            .get_mut(slot_id)
            .ok_or_else(|| Error::SlotNotFound(slot_id.to_string()))
    }

    /// List all slots.
    pub fn list(&self) -> Vec<SlotInfo> {
        self.slots
            .iter()
            .map(|(slot_id, slot)| SlotInfo {
                slot_id: *slot_id,
                label: slot.label.clone(),
                status: slot.session.status(),
                epoch: slot.session.epoch(),
                session_name: slot.session.info().map(|info| info.name.clone()),
            })
            .collect()
    }

    /// Tick every slot.
    pub fn tick_all(&mut self, now: Instant) -> Vec<(SlotId, TickReport)> {
        self.slots
            .iter_mut()
            .map(|(slot_id, slot)| (*slot_id, slot.tick(now)))
            .collect()
    }

    /// Close a slot. The trace context is torn down before the session.
    pub fn close(&mut self, slot_id: &SlotId) -> Result<()> {
        let slot = self
            .slots
            .remove(slot_id)
            .ok_or_else(|| Error::SlotNotFound(slot_id.to_string()))?;

        let SessionSlot {
            label,
            trace,
            mut session,
            ..
        } = slot;
        drop(trace);
        session.close();
        info!("Session slot closed: id={}, label={}", slot_id, label);
        Ok(())
    }

    /// Close every slot whose transport is `Invalid`. Returns the closed ids.
    pub fn close_invalid(&mut self) -> Vec<SlotId> {
        let dead: Vec<SlotId> = self
            .slots
            .iter()
            .filter(|(_, slot)| slot.session.status() == TransportStatus::Invalid)
            .map(|(slot_id, _)| *slot_id)
            .collect();

        for slot_id in &dead {
            let _ = self.close(slot_id);
        }
        dead
    }

    /// Close all slots.
    pub fn close_all(&mut self) {
        let slot_ids: Vec<SlotId> = self.slots.keys().copied().collect();
        for slot_id in slot_ids {
            let _ = self.close(&slot_id);
        }
    }

    /// Get the number of open slots.
    pub fn session_count(&self) -> usize {
        self.slots.len()
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}
