//! Session context: one remote perfkit session over one transport.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use perfkit_core::message::{
    routes, ConfigureEntity, ControlTrace, LoginRequest, PushCommand, SignalFetchTraces,
    SuggestRequest,
};
use perfkit_core::{
    ConfigEntityUpdate, ConfigEntityValue, Error, NewConfigClass, Result, SessionInfo,
    SessionReset, SessionStateUpdate, ShellOutput, ShellSettings, SuggestReply, TraceClassInfo,
    TraceClassList, TraceResult,
};
use perfkit_transport::{Envelope, Transport, TransportStatus};

use crate::config_registry::ConfigRegistry;
use crate::correlation::{PendingReply, PendingTable, SequencedSlot};
use crate::routes::RouteTable;
use crate::shell::{ShellBuffer, ShellRead};

/// Callback receiving `session_state` telemetry.
pub type SessionStateObserver = Box<dyn FnMut(&SessionStateUpdate)>;

/// Counters for inbound traffic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Frames handled successfully
    pub dispatched: u64,
    /// Frames on routes with no handler
    pub unknown_routes: u64,
    /// Frames whose payload failed to decode
    pub marshal_errors: u64,
    /// Config updates for keys not in the index
    pub unknown_entities: u64,
    /// Suggestion replies that did not match the outstanding request
    pub stale_replies: u64,
    /// Trace results with no pending fetch
    pub dropped_traces: u64,
}

/// State mutated by inbound handlers.
pub(crate) struct SessionState {
    info: Option<SessionInfo>,
    epoch: u64,
    shell: ShellBuffer,
    config: ConfigRegistry,
    trace_classes: Vec<TraceClassInfo>,
    trace_classes_dirty: bool,
    suggestion: SequencedSlot<SuggestReply>,
    trace_fetches: PendingTable<String, TraceResult>,
    observer: Option<SessionStateObserver>,
    stats: DispatchStats,
}

impl SessionState {
    fn new(shell: &ShellSettings) -> Self {
        Self {
            info: None,
            epoch: 0,
            shell: ShellBuffer::with_settings(shell),
            config: ConfigRegistry::new(),
            trace_classes: Vec::new(),
            trace_classes_dirty: false,
            suggestion: SequencedSlot::new(),
            trace_fetches: PendingTable::new(),
            observer: None,
            stats: DispatchStats::default(),
        }
    }
}

fn on_session_reset(state: &mut SessionState, message: SessionReset) {
    info!(
        "Session reset: name={}, host={}, epoch={}",
        message.info.name, message.info.hostname, message.info.epoch
    );
    state.info = Some(message.info);
    state.epoch += 1;
    state.shell.clear();
    state.config.clear();
    state.trace_classes.clear();
    state.trace_classes_dirty = true;
    state.suggestion.abandon();
    let abandoned = state.trace_fetches.abandon_all();
    if abandoned > 0 {
        debug!("Abandoned {} trace fetches on reset", abandoned);
    }
}

fn on_shell_output(state: &mut SessionState, message: ShellOutput) {
    state.shell.append(message.content.as_bytes());
}

fn on_new_config_class(state: &mut SessionState, message: NewConfigClass) {
    let name = message.key.clone();
    let indexed = state.config.replace_class(message);
    info!("Config class received: name={}, entities={}", name, indexed);
}

fn on_config_entity(state: &mut SessionState, message: ConfigEntityUpdate) {
    for update in &message.content {
        if !state.config.apply_update(update) {
            warn!(
                "Update for unknown config entity: class={}, key={}",
                update.class_key, update.config_key
            );
            state.stats.unknown_entities += 1;
        }
    }
}

fn on_suggest_reply(state: &mut SessionState, message: SuggestReply) {
    let seq = message.reply_to;
    if !state.suggestion.resolve(seq, message) {
        state.stats.stale_replies += 1;
    }
}

fn on_trace_class_list(state: &mut SessionState, message: TraceClassList) {
    debug!("Trace class list: {} classes", message.content.len());
    state.trace_classes = message.content;
    state.trace_classes_dirty = true;
}

fn on_traces(state: &mut SessionState, message: TraceResult) {
    let class_name = message.class_name.clone();
    if !state.trace_fetches.resolve(class_name.as_str(), message) {
        debug!("Dropping trace result with no pending fetch: class={}", class_name);
        state.stats.dropped_traces += 1;
    }
}

fn on_session_state(state: &mut SessionState, message: SessionStateUpdate) {
    if let Some(observer) = state.observer.as_mut() {
        observer(&message);
    }
}

fn build_routes() -> RouteTable<SessionState> {
    let mut table = RouteTable::new();
    table.register(routes::SESSION_RESET, on_session_reset);
    table.register(routes::SHELL_OUTPUT, on_shell_output);
    table.register(routes::NEW_CONFIG_CLASS, on_new_config_class);
    table.register(routes::CONFIG_ENTITY, on_config_entity);
    table.register(routes::SUGGEST_COMMAND, on_suggest_reply);
    table.register(routes::TRACE_CLASS_LIST, on_trace_class_list);
    table.register(routes::TRACES, on_traces);
    table.register(routes::SESSION_STATE, on_session_state);
    table
}

/// Client-side state machine for one remote session.
///
/// The transport may deliver frames on any thread; they are handed off
/// through a channel and only touch session state when [`SessionContext::pump`]
/// runs. Every mutation therefore happens on the thread that owns the
/// context.
pub struct SessionContext {
    transport: Box<dyn Transport>,
    inbound: mpsc::UnboundedReceiver<Envelope>,
    routes: RouteTable<SessionState>,
    state: SessionState,
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("status", &self.status())
            .field("epoch", &self.state.epoch)
            .field("stats", &self.state.stats)
            .finish_non_exhaustive()
    }
}

impl SessionContext {
    /// Create a session over `transport` with default shell settings.
    pub fn new<T: Transport + 'static>(transport: T) -> Self {
        Self::with_settings(transport, &ShellSettings::default())
    }

    /// Create a session over `transport`.
    pub fn with_settings<T: Transport + 'static>(transport: T, shell: &ShellSettings) -> Self {
        let mut transport: Box<dyn Transport> = Box::new(transport);
        let (tx, inbound) = mpsc::unbounded_channel();
        transport.set_inbound_handler(Box::new(move |envelope: Envelope| {
            if tx.send(envelope).is_err() {
                debug!("Session gone, dropping inbound frame");
            }
        }));

        Self {
            transport,
            inbound,
            routes: build_routes(),
            state: SessionState::new(shell),
        }
    }

    // -----------------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------------

    /// Dispatch every frame handed off by the transport so far.
    ///
    /// Returns the number of frames processed. Failures are logged and
    /// counted, never propagated.
    pub fn pump(&mut self) -> usize {
        let mut processed = 0;
        while let Ok(envelope) = self.inbound.try_recv() {
            let _ = self.dispatch(&envelope.route, envelope.parameter);
            processed += 1;
        }
        processed
    }

    /// Dispatch one frame.
    ///
    /// Unknown routes and malformed payloads are logged, counted and
    /// returned; state is left unchanged.
    pub fn dispatch(&mut self, route: &str, payload: Value) -> Result<()> {
        let result = self.routes.dispatch(&mut self.state, route, payload);
        match &result {
            Ok(()) => self.state.stats.dispatched += 1,
            Err(Error::UnknownRoute(_)) => {
                warn!("Route not recognized: route={}", route);
                self.state.stats.unknown_routes += 1;
            }
            Err(e) => {
                warn!("Dropping malformed frame: {}", e);
                self.state.stats.marshal_errors += 1;
            }
        }
        result
    }

    // -----------------------------------------------------------------------
    // Outbound
    // -----------------------------------------------------------------------

    fn send<M: Serialize>(&self, route: &str, message: &M) -> Result<()> {
        let payload = serde_json::to_value(message)?;
        self.transport.send(route, payload)
    }

    /// Authenticate. Only base64(sha256(password)) leaves the process.
    pub fn login(&self, id: &str, password: &str) -> Result<()> {
        info!("Logging in: id={}", id);
        let digest = Sha256::digest(password.as_bytes());
        self.send(
            routes::LOGIN,
            &LoginRequest {
                id: id.to_string(),
                password: BASE64_STANDARD.encode(digest),
            },
        )
    }

    /// Send a shell command line verbatim.
    pub fn push_command(&self, command: &str) -> Result<()> {
        debug!("Pushing command: {}", command);
        self.send(
            routes::PUSH_COMMAND,
            &PushCommand {
                command: command.to_string(),
            },
        )
    }

    /// Request a new value for one config entity.
    ///
    /// The cached value changes only when the server echoes the update.
    pub fn configure(&self, class_key: &str, config_key: u64, value: Value) -> Result<()> {
        self.send(
            routes::CONFIGURE_ENTITY,
            &ConfigureEntity {
                content: vec![ConfigEntityValue {
                    class_key: class_key.to_string(),
                    config_key,
                    value,
                }],
            },
        )
    }

    /// Ask for completions of `command` at `position`.
    ///
    /// Only the most recent suggestion request can resolve; earlier handles
    /// become abandoned.
    pub fn suggest_command(
        &mut self,
        command: &str,
        position: usize,
    ) -> Result<PendingReply<SuggestReply>> {
        let (query_id, reply) = self.state.suggestion.issue();
        let sent = self.send(
            routes::SUGGEST_REQUEST,
            &SuggestRequest {
                query_id,
                command: command.to_string(),
                position,
            },
        );
        if let Err(e) = sent {
            self.state.suggestion.abandon();
            return Err(e);
        }
        Ok(reply)
    }

    /// Request a fresh sample of one tracer class.
    ///
    /// An unresolved fetch for the same class is abandoned once the request
    /// is sent. A failed send leaves the pending table untouched.
    pub fn signal_fetch_trace(&mut self, class_name: &str) -> Result<PendingReply<TraceResult>> {
        self.send(
            routes::SIGNAL_FETCH_TRACES,
            &SignalFetchTraces {
                targets: vec![class_name.to_string()],
            },
        )?;
        Ok(self.state.trace_fetches.register(class_name.to_string()))
    }

    /// Toggle subscription and/or fold state of a trace node on the server.
    pub fn control_trace(
        &self,
        class_name: &str,
        trace_key: u64,
        subscribe: Option<bool>,
        fold: Option<bool>,
    ) -> Result<()> {
        self.send(
            routes::CONTROL_TRACE,
            &ControlTrace {
                class_name: class_name.to_string(),
                trace_key,
                subscribe,
                fold,
            },
        )
    }

    /// Close the transport and abandon every pending request.
    pub fn close(&mut self) {
        self.transport.close();
        self.state.suggestion.abandon();
        self.state.trace_fetches.abandon_all();
        info!("Session closed: epoch={}", self.state.epoch);
    }

    // -----------------------------------------------------------------------
    // Mirrored state
    // -----------------------------------------------------------------------

    /// Connection state of the underlying transport.
    pub fn status(&self) -> TransportStatus {
        self.transport.status()
    }

    /// Identity from the latest reset, if any.
    pub fn info(&self) -> Option<&SessionInfo> {
        self.state.info.as_ref()
    }

    /// Number of resets observed.
    pub fn epoch(&self) -> u64 {
        self.state.epoch
    }

    /// Shell output buffer.
    pub fn shell(&self) -> &ShellBuffer {
        &self.state.shell
    }

    /// Test-and-clear the "new shell output" latch.
    pub fn take_shell_fresh(&mut self) -> bool {
        self.state.shell.take_fresh()
    }

    /// Shell output appended after `fence`.
    pub fn read_shell_since(&self, fence: u64) -> ShellRead<'_> {
        self.state.shell.read_since(fence)
    }

    /// Mirrored config registry.
    pub fn config(&self) -> &ConfigRegistry {
        &self.state.config
    }

    /// Latest advertised tracer classes.
    pub fn trace_classes(&self) -> &[TraceClassInfo] {
        &self.state.trace_classes
    }

    /// Test-and-clear the "class list changed" latch.
    pub fn take_trace_classes_dirty(&mut self) -> bool {
        std::mem::take(&mut self.state.trace_classes_dirty)
    }

    /// Whether a fetch for `class_name` is unresolved.
    pub fn is_fetch_pending(&self, class_name: &str) -> bool {
        self.state.trace_fetches.is_pending(class_name)
    }

    /// Sequence number of the outstanding suggestion request.
    pub fn pending_suggestion(&self) -> Option<u64> {
        self.state.suggestion.current_seq()
    }

    /// Install the `session_state` observer, replacing any previous one.
    pub fn set_session_state_observer<F>(&mut self, observer: F)
    where
        F: FnMut(&SessionStateUpdate) + 'static,
    {
        self.state.observer = Some(Box::new(observer));
    }

    /// Remove the `session_state` observer.
    pub fn clear_session_state_observer(&mut self) {
        self.state.observer = None;
    }

    /// Inbound traffic counters.
    pub fn stats(&self) -> DispatchStats {
        self.state.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlation::ReplyState;
    use perfkit_transport::{memory_pair, MemoryPeer};
    use serde_json::json;

    fn session() -> (SessionContext, MemoryPeer) {
        let (transport, peer) = memory_pair();
        (SessionContext::new(transport), peer)
    }

    #[test]
    fn test_every_inbound_route_registered() {
        let table = build_routes();
        for route in routes::INBOUND {
            assert!(table.contains(route), "missing handler for {route}");
        }
        assert_eq!(table.len(), routes::INBOUND.len());
    }

    #[test]
    fn test_pump_dispatches_in_order() {
        let (mut session, peer) = session();
        peer.send("shell_output", json!({"content": "one "})).unwrap();
        peer.send("shell_output", json!({"content": "two"})).unwrap();

        assert_eq!(session.shell().fence(), 0);
        assert_eq!(session.pump(), 2);
        assert_eq!(session.read_shell_since(0).text(), "one two");
        assert!(session.take_shell_fresh());
        assert!(!session.take_shell_fresh());
        assert_eq!(session.stats().dispatched, 2);
    }

    #[test]
    fn test_login_hashes_password() {
        let (session, peer) = session();
        session.login("admin", "secret").unwrap();

        let sent = peer.take_outbound();
        assert_eq!(sent[0].route, "auth:login");
        assert_eq!(sent[0].parameter["id"], "admin");
        // sha256("secret"), base64
        assert_eq!(
            sent[0].parameter["password"],
            "K7gNU3sdo+OL0wNhqoVWhr3g6s1xYv72ol/pe/Unols="
        );
    }

    #[test]
    fn test_configure_sends_point_update() {
        let (session, peer) = session();
        session.configure("render", 2, json!(4096)).unwrap();

        let sent = peer.take_outbound();
        assert_eq!(sent[0].route, "cmd:configure_entity");
        assert_eq!(
            sent[0].parameter["content"][0],
            json!({"class_key": "render", "config_key": 2, "value": 4096})
        );
    }

    #[test]
    fn test_control_trace_flags() {
        let (session, peer) = session();
        session.control_trace("frame", 9, None, Some(true)).unwrap();

        let sent = peer.take_outbound();
        assert_eq!(
            sent[0].parameter,
            json!({"class_name": "frame", "trace_key": 9, "fold": true})
        );
    }

    #[test]
    fn test_session_state_observer() {
        use std::cell::RefCell;
        use std::rc::Rc;

        let (mut session, peer) = session();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        session.set_session_state_observer(move |s| sink.borrow_mut().push(s.num_threads));

        peer.send("session_state", json!({"num_threads": 12})).unwrap();
        session.pump();
        assert_eq!(*seen.borrow(), vec![12]);

        session.clear_session_state_observer();
        peer.send("session_state", json!({"num_threads": 13})).unwrap();
        session.pump();
        assert_eq!(seen.borrow().len(), 1);
    }

    #[test]
    fn test_trace_result_without_pending_fetch_dropped() {
        let (mut session, peer) = session();
        peer.send(
            "traces",
            json!({"class_name": "gone", "root": {"name": "r", "trace_key": 1}}),
        )
        .unwrap();
        session.pump();
        assert_eq!(session.stats().dropped_traces, 1);
    }

    #[test]
    fn test_close_abandons_pending() {
        let (mut session, _peer) = session();
        let mut fetch = session.signal_fetch_trace("frame").unwrap();
        let mut suggestion = session.suggest_command("he", 2).unwrap();

        session.close();
        assert_eq!(session.status(), TransportStatus::Invalid);
        assert_eq!(fetch.try_take(), ReplyState::Abandoned);
        assert_eq!(suggestion.try_take(), ReplyState::Abandoned);
        assert!(session.push_command("ls").is_err());
    }
}
