//! Error types for the perfkit client.

use thiserror::Error;

/// Main error type for perfkit client operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Inbound route has no registered handler
    #[error("Route not recognized: {0}")]
    UnknownRoute(String),

    /// Payload could not be decoded into the route's message type
    #[error("Marshal error on route '{route}': {message}")]
    Marshal {
        /// Route the payload arrived on
        route: String,
        /// Decoder message
        message: String,
    },

    /// Two handlers registered under the same route hash
    #[error("Duplicate route registration: {route} (hash {hash:#018x})")]
    DuplicateRoute {
        /// Route being registered
        route: String,
        /// Colliding hash
        hash: u64,
    },

    /// Pending reply slot was replaced or dropped before resolution
    #[error("Pending reply abandoned")]
    Abandoned,

    /// Malformed frame header
    #[error("Frame error: {0}")]
    Frame(String),

    /// Well-framed payload that is not a valid envelope
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    /// Declared frame length exceeds the limit
    #[error("Frame too large: {len} bytes (max: {max})")]
    OversizedFrame {
        /// Declared payload length
        len: usize,
        /// Maximum accepted payload length
        max: usize,
    },

    /// Transport is not connected or has been closed
    #[error("Transport closed")]
    TransportClosed,

    /// Trace node is not present in the node index
    #[error("Trace node not found: {0:#018x}")]
    NodeNotFound(u64),

    /// Trace class is not tracked
    #[error("Trace class not found: {0}")]
    ClassNotFound(String),

    /// Node value type cannot be plotted
    #[error("Trace node {0:#018x} is not plottable")]
    NotPlottable(u64),

    /// Session slot limit reached
    #[error("Session limit reached (max: {0})")]
    SessionLimitReached(usize),

    /// Session slot does not exist
    #[error("Session slot not found: {0}")]
    SlotNotFound(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic error with custom message
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Build a marshal error for `route`.
    pub fn marshal(route: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Marshal {
            route: route.into(),
            message: err.to_string(),
        }
    }
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
