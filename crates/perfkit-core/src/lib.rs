//! # perfkit-core
//!
//! Core types for the perfkit monitoring client.
//!
//! This crate contains all fundamental types with **no internal dependencies**
//! on other perfkit crates. It provides:
//!
//! - Error types
//! - Client configuration (YAML)
//! - Route and composite-key hashing
//! - Wire message types for every inbound and outbound route
//!
//! ## Architecture
//!
//! This is Layer 0 in the architecture - all other crates depend on this one,
//! but this crate has no dependencies on other perfkit crates.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod hash;
pub mod message;

// Re-export commonly used types
pub use config::{ClientConfig, ConnectionSettings, LoggingSettings, ShellSettings, TraceSettings};
pub use error::{Error, Result};
pub use hash::{composite_key, route_hash, NodeId, RouteHash};
pub use message::{
    ConfigCategory, ConfigEntityDesc, ConfigEntityUpdate, ConfigEntityValue, NewConfigClass,
    SessionInfo, SessionReset, SessionStateUpdate, ShellOutput, SuggestReply, TraceClassInfo,
    TraceClassList, TraceNode, TraceResult, TraceValue,
};
