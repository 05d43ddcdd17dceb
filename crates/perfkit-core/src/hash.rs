//! Route and composite-key hashing.
//!
//! All hashes are 64-bit FNV-1a so that they are stable across processes and
//! platforms. Composite keys continue the class-name hash over the
//! little-endian bytes of the local key, which lets one flat map address
//! entities from every class.

use serde::{Deserialize, Serialize};

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

fn fnv1a(mut state: u64, bytes: &[u8]) -> u64 {
    for &byte in bytes {
        state ^= u64::from(byte);
        state = state.wrapping_mul(FNV_PRIME);
    }
    state
}

/// Hash of a route string, used as the dispatch table key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RouteHash(pub u64);

impl std::fmt::Display for RouteHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

/// Hash a route identifier.
pub fn route_hash(route: &str) -> RouteHash {
    RouteHash(fnv1a(FNV_OFFSET, route.as_bytes()))
}

/// Globally-addressable key for `local_key` inside `class_name`.
pub fn composite_key(class_name: &str, local_key: u64) -> u64 {
    let class_hash = fnv1a(FNV_OFFSET, class_name.as_bytes());
    fnv1a(class_hash, &local_key.to_le_bytes())
}

/// Stable identity of a trace node across fetches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(u64);

impl NodeId {
    /// Identity of the node with `trace_key` in tracer class `class_name`.
    pub fn new(class_name: &str, trace_key: u64) -> Self {
        Self(composite_key(class_name, trace_key))
    }

    /// Raw hash value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fnv1a_known_vectors() {
        assert_eq!(route_hash("").0, 0xcbf2_9ce4_8422_2325);
        assert_eq!(route_hash("a").0, 0xaf63_dc4c_8601_ec8c);
        assert_eq!(route_hash("foobar").0, 0x8594_4171_f739_67e8);
    }

    #[test]
    fn test_route_hash_distinguishes_routes() {
        assert_ne!(route_hash("shell_output"), route_hash("session_reset"));
        assert_eq!(route_hash("traces"), route_hash("traces"));
    }

    #[test]
    fn test_composite_key_depends_on_both_parts() {
        let a = composite_key("render", 1);
        assert_eq!(a, composite_key("render", 1));
        assert_ne!(a, composite_key("render", 2));
        assert_ne!(a, composite_key("physics", 1));
    }

    #[test]
    fn test_node_id_matches_composite_key() {
        let id = NodeId::new("frame", 42);
        assert_eq!(id.as_u64(), composite_key("frame", 42));
        assert_eq!(format!("{id}").len(), 18);
    }
}
