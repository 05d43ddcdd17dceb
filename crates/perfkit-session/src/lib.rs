//! # perfkit-session
//!
//! Client-side session state for the perfkit monitoring client.
//!
//! This crate provides:
//! - Route dispatch of inbound frames
//! - Correlated request slots (suggestions, trace fetches)
//! - Shell output buffering with fence reads
//! - The mirrored config registry with its flat entity index
//! - Trace class reconciliation, fetch scheduling and node flattening
//! - A manager for several concurrent sessions
//!
//! ## Architecture
//!
//! This is Layer 2 in the architecture - it depends on perfkit-core and
//! perfkit-transport. Frames arrive on transport threads and are handed off
//! through a channel; all state here is mutated only from the thread that
//! calls [`SessionContext::pump`] and [`TraceContext::tick`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config_registry;
pub mod context;
pub mod correlation;
pub mod manager;
pub mod routes;
pub mod shell;
pub mod trace;

// Re-export commonly used types
pub use config_registry::{ConfigClass, ConfigEntity, ConfigNode, ConfigRegistry};
pub use context::{DispatchStats, SessionContext, SessionStateObserver};
pub use correlation::{PendingReply, PendingTable, ReplyState, SequencedSlot};
pub use manager::{SessionManager, SessionManagerConfig, SessionSlot, SlotId, SlotInfo};
pub use routes::RouteTable;
pub use shell::{ShellBuffer, ShellRead};
pub use trace::{reconcile, ClassDiff, FetchPhase, NodeState, TickReport, TraceContext, TracedClass};
