//! Route dispatch table.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde_json::Value;

use perfkit_core::{route_hash, Error, Result, RouteHash};

type Handler<S> = Box<dyn Fn(&mut S, Value) -> Result<()>>;

struct RouteEntry<S> {
    route: String,
    handler: Handler<S>,
}

/// Maps route hashes to decode-and-handle closures over a state `S`.
pub struct RouteTable<S> {
    entries: HashMap<RouteHash, RouteEntry<S>>,
}

impl<S> RouteTable<S> {
    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Register `handler` for messages of type `M` on `route`.
    ///
    /// Fails with [`Error::DuplicateRoute`] if the route hash is taken.
    pub fn try_register<M, F>(&mut self, route: &str, handler: F) -> Result<()>
    where
        M: DeserializeOwned + 'static,
        F: Fn(&mut S, M) + 'static,
    {
        let hash = route_hash(route);
        if self.entries.contains_key(&hash) {
            return Err(Error::DuplicateRoute {
                route: route.to_string(),
                hash: hash.0,
            });
        }

        let decode_route = route.to_string();
        let handler: Handler<S> = Box::new(move |state, payload| {
            let message: M = serde_json::from_value(payload)
                .map_err(|e| Error::marshal(decode_route.as_str(), e))?;
            handler(state, message);
            Ok(())
        });

        self.entries.insert(
            hash,
            RouteEntry {
                route: route.to_string(),
                handler,
            },
        );
        Ok(())
    }

    /// Register `handler` for messages of type `M` on `route`.
    ///
    /// # Panics
    ///
    /// Panics if the route hash is already registered.
    pub fn register<M, F>(&mut self, route: &str, handler: F)
    where
        M: DeserializeOwned + 'static,
        F: Fn(&mut S, M) + 'static,
    {
        if let Err(e) = self.try_register(route, handler) {
            panic!("{e}");
        }
    }

    /// Decode `payload` and run the handler registered for `route`.
    ///
    /// State is untouched when the route is unknown or the payload fails to
    /// decode.
    pub fn dispatch(&self, state: &mut S, route: &str, payload: Value) -> Result<()> {
        let entry = self
            .entries
            .get(&route_hash(route))
            .ok_or_else(|| Error::UnknownRoute(route.to_string()))?;
        (entry.handler)(state, payload)
    }

    /// Whether `route` has a handler.
    pub fn contains(&self, route: &str) -> bool {
        self.entries.contains_key(&route_hash(route))
    }

    /// Registered route names, sorted.
    pub fn routes(&self) -> Vec<&str> {
        let mut routes: Vec<&str> = self.entries.values().map(|e| e.route.as_str()).collect();
        routes.sort_unstable();
        routes
    }

    /// Number of registered routes.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no routes are registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<S> Default for RouteTable<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> std::fmt::Debug for RouteTable<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteTable")
            .field("routes", &self.routes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Deserialize)]
    struct Add {
        amount: i64,
    }

    fn table() -> RouteTable<i64> {
        let mut table = RouteTable::new();
        table.register("add", |total: &mut i64, msg: Add| *total += msg.amount);
        table
    }

    #[test]
    fn test_dispatch_decodes_and_handles() {
        let table = table();
        let mut total = 0;
        table.dispatch(&mut total, "add", json!({"amount": 5})).unwrap();
        table.dispatch(&mut total, "add", json!({"amount": 2})).unwrap();
        assert_eq!(total, 7);
    }

    #[test]
    fn test_unknown_route() {
        let table = table();
        let mut total = 0;
        let err = table
            .dispatch(&mut total, "unknown:thing", json!({}))
            .unwrap_err();
        assert!(matches!(err, Error::UnknownRoute(ref r) if r == "unknown:thing"));
        assert_eq!(total, 0);
    }

    #[test]
    fn test_marshal_error_leaves_state() {
        let table = table();
        let mut total = 10;
        let err = table
            .dispatch(&mut total, "add", json!({"amount": "five"}))
            .unwrap_err();
        assert!(matches!(err, Error::Marshal { ref route, .. } if route == "add"));
        assert_eq!(total, 10);
    }

    #[test]
    fn test_try_register_duplicate() {
        let mut table = table();
        let result = table.try_register("add", |_: &mut i64, _: Add| {});
        assert!(matches!(result, Err(Error::DuplicateRoute { .. })));
        assert_eq!(table.len(), 1);
    }

    #[test]
    #[should_panic(expected = "Duplicate route registration")]
    fn test_register_duplicate_panics() {
        let mut table = table();
        table.register("add", |_: &mut i64, _: Add| {});
    }

    #[test]
    fn test_routes_listing() {
        let mut table = table();
        table.register("sub", |total: &mut i64, msg: Add| *total -= msg.amount);
        assert_eq!(table.routes(), vec!["add", "sub"]);
        assert!(table.contains("sub"));
        assert!(!table.contains("mul"));
    }
}
