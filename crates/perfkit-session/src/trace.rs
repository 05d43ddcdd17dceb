//! Trace context: tracer class tracking, fetch scheduling and the flat node
//! index.
//!
//! The context never stores a reference to its session. Every operation that
//! talks to the server takes the [`SessionContext`] as an argument, so a
//! context can outlive, or be dropped before, the session it was fed from.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use perfkit_core::{
    Error, NodeId, Result, TraceClassInfo, TraceNode, TraceResult, TraceSettings, TraceValue,
};

use crate::context::SessionContext;
use crate::correlation::{PendingReply, ReplyState};

/// Plot colors handed out to nodes in order of first appearance (RGBA).
const PALETTE: [u32; 10] = [
    0x4C72B0FF, 0xDD8452FF, 0x55A868FF, 0xC44E52FF, 0x8172B3FF, 0x937860FF, 0xDA8BC3FF,
    0x8C8C8CFF, 0xCCB974FF, 0x64B5CDFF,
];

/// Fetch phase of a tracked class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchPhase {
    /// No fetch in flight
    Idle,
    /// Fetch issued and unresolved
    Pending,
}

#[derive(Debug)]
struct InFlightFetch {
    reply: PendingReply<TraceResult>,
    issued_at: Instant,
}

/// Local record of one advertised tracer class.
#[derive(Debug)]
pub struct TracedClass {
    name: String,
    instance_id: u64,
    tracing: bool,
    next_fetch: Option<Instant>,
    last_fetch: Option<Instant>,
    in_flight: Option<InFlightFetch>,
    root: Option<NodeId>,
    nodes: HashSet<NodeId>,
    fetch_count: u64,
}

impl TracedClass {
    fn new(info: &TraceClassInfo, tracing: bool) -> Self {
        Self {
            name: info.name.clone(),
            instance_id: info.instance_id,
            tracing,
            next_fetch: None,
            last_fetch: None,
            in_flight: None,
            root: None,
            nodes: HashSet::new(),
            fetch_count: 0,
        }
    }

    /// Class name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Advertised instance id.
    pub fn instance_id(&self) -> u64 {
        self.instance_id
    }

    /// Whether the class is fetched periodically.
    pub fn is_tracing(&self) -> bool {
        self.tracing
    }

    /// Current fetch phase.
    pub fn phase(&self) -> FetchPhase {
        if self.in_flight.is_some() {
            FetchPhase::Pending
        } else {
            FetchPhase::Idle
        }
    }

    /// When the last result was applied.
    pub fn last_fetch(&self) -> Option<Instant> {
        self.last_fetch
    }

    /// Root node of the latest result.
    pub fn root(&self) -> Option<NodeId> {
        self.root
    }

    /// Number of indexed nodes owned by this class.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Results applied since the class was added.
    pub fn fetch_count(&self) -> u64 {
        self.fetch_count
    }

    fn fetch_due(&self, now: Instant, timeout: Duration) -> bool {
        if !self.tracing {
            return false;
        }
        if self.next_fetch.is_some_and(|deadline| now < deadline) {
            return false;
        }
        match &self.in_flight {
            None => true,
            Some(fetch) => now.saturating_duration_since(fetch.issued_at) >= timeout,
        }
    }
}

/// Display and plot state of one trace node, stable across fetches.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeState {
    /// Node identity
    pub id: NodeId,
    /// Owning class
    pub class_name: String,
    /// Server-side node key
    pub trace_key: u64,
    /// Node name
    pub name: String,
    /// Slash-separated path from the class root
    pub path: String,
    /// Depth below the root
    pub depth: usize,
    /// Latest value
    pub value: TraceValue,
    /// Fold state reported by the server
    pub folded: bool,
    /// Subscription state reported by the server
    pub subscribing: bool,
    /// Local plot toggle
    pub plotting: bool,
    /// Assigned plot color (RGBA)
    pub color: u32,
    /// Children in the latest result
    pub children: Vec<NodeId>,
    /// `(seconds since context start, value)` samples while plotting
    pub history: VecDeque<(f64, f64)>,
    /// Results this node appeared in
    pub update_count: u64,
}

/// Outcome of comparing local classes with an advertised list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassDiff {
    /// Names not tracked locally
    pub added: Vec<TraceClassInfo>,
    /// Tracked names no longer advertised
    pub removed: Vec<String>,
    /// Names advertised with a different instance id
    pub replaced: Vec<TraceClassInfo>,
}

impl ClassDiff {
    /// Whether nothing changed.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.replaced.is_empty()
    }
}

/// Compare tracked `name -> instance id` pairs with the advertised list.
///
/// If a name is advertised twice, the last entry wins.
pub fn reconcile(local: &BTreeMap<String, u64>, advertised: &[TraceClassInfo]) -> ClassDiff {
    let advertised: BTreeMap<&str, &TraceClassInfo> = advertised
        .iter()
        .map(|info| (info.name.as_str(), info))
        .collect();

    let mut diff = ClassDiff::default();
    for (name, info) in &advertised {
        match local.get(*name) {
            None => diff.added.push((*info).clone()),
            Some(&instance_id) if instance_id != info.instance_id => {
                diff.replaced.push((*info).clone())
            }
            Some(_) => {}
        }
    }
    for name in local.keys() {
        if !advertised.contains_key(name.as_str()) {
            diff.removed.push(name.clone());
        }
    }
    diff
}

/// Summary of one [`TraceContext::tick`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Class list changes applied this tick
    pub diff: Option<ClassDiff>,
    /// Results flattened into the node index
    pub applied: usize,
    /// Fetches found abandoned
    pub abandoned: usize,
    /// Fetches issued
    pub issued: usize,
}

/// Tracks tracer classes of one session and flattens their node trees.
#[derive(Debug)]
pub struct TraceContext {
    settings: TraceSettings,
    classes: BTreeMap<String, TracedClass>,
    nodes: HashMap<NodeId, NodeState>,
    started: Instant,
    colors_assigned: usize,
    epoch: u64,
}

impl TraceContext {
    /// Create a context with default settings.
    pub fn new() -> Self {
        Self::with_settings(TraceSettings::default())
    }

    /// Create a context with custom settings.
    pub fn with_settings(settings: TraceSettings) -> Self {
        Self {
            settings,
            classes: BTreeMap::new(),
            nodes: HashMap::new(),
            started: Instant::now(),
            colors_assigned: 0,
            epoch: 0,
        }
    }

    /// Advance the state machine: reconcile the class list if it changed,
    /// collect finished fetches and issue due ones.
    ///
    /// A new session epoch drops every class and node before the advertised
    /// list is applied, even when the list itself looks unchanged.
    pub fn tick(&mut self, session: &mut SessionContext, now: Instant) -> TickReport {
        let mut report = TickReport::default();

        let epoch = session.epoch();
        let purged = (epoch != self.epoch).then(|| self.reset_epoch(epoch));

        if session.take_trace_classes_dirty() || purged.is_some() {
            let advertised = session.trace_classes().to_vec();
            let mut diff = self.apply_class_list(&advertised);
            if let Some(mut names) = purged {
                names.append(&mut diff.removed);
                diff.removed = names;
            }
            report.diff = Some(diff);
        }

        self.collect_results(now, &mut report);
        self.issue_fetches(session, now, &mut report);
        report
    }

    /// Drop every class, node and in-flight fetch and adopt `epoch`.
    ///
    /// Returns the names of the dropped classes.
    fn reset_epoch(&mut self, epoch: u64) -> Vec<String> {
        let names: Vec<String> = self.classes.keys().cloned().collect();
        info!(
            "Session epoch {} -> {}: dropping {} trace classes, {} nodes",
            self.epoch,
            epoch,
            names.len(),
            self.nodes.len()
        );
        self.classes.clear();
        self.nodes.clear();
        self.colors_assigned = 0;
        self.epoch = epoch;
        names
    }

    /// Session epoch the tracked state belongs to.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Reconcile tracked classes with `advertised`.
    ///
    /// Removed and replaced classes have their nodes purged from the index;
    /// replaced classes come back as fresh records.
    pub fn apply_class_list(&mut self, advertised: &[TraceClassInfo]) -> ClassDiff {
        let local: BTreeMap<String, u64> = self
            .classes
            .iter()
            .map(|(name, class)| (name.clone(), class.instance_id))
            .collect();
        let diff = reconcile(&local, advertised);

        for name in &diff.removed {
            if let Some(class) = self.classes.remove(name) {
                let purged = self.purge_nodes(&class);
                info!("Trace class removed: name={}, purged={}", name, purged);
            }
        }

        for info in &diff.replaced {
            if let Some(class) = self.classes.remove(&info.name) {
                let purged = self.purge_nodes(&class);
                info!(
                    "Trace class replaced: name={}, instance {} -> {}, purged={}",
                    info.name, class.instance_id, info.instance_id, purged
                );
            }
            self.classes.insert(
                info.name.clone(),
                TracedClass::new(info, self.settings.auto_trace),
            );
        }

        for info in &diff.added {
            debug!(
                "Trace class added: name={}, instance={}",
                info.name, info.instance_id
            );
            self.classes.insert(
                info.name.clone(),
                TracedClass::new(info, self.settings.auto_trace),
            );
        }

        diff
    }

    fn purge_nodes(&mut self, class: &TracedClass) -> usize {
        class
            .nodes
            .iter()
            .filter(|id| self.nodes.remove(id).is_some())
            .count()
    }

    fn collect_results(&mut self, now: Instant, report: &mut TickReport) {
        let names: Vec<String> = self
            .classes
            .iter()
            .filter(|(_, class)| class.in_flight.is_some())
            .map(|(name, _)| name.clone())
            .collect();

        for name in names {
            let Some(class) = self.classes.get_mut(&name) else {
                continue;
            };
            let Some(fetch) = class.in_flight.as_mut() else {
                continue;
            };

            match fetch.reply.try_take() {
                ReplyState::Pending => {}
                ReplyState::Abandoned => {
                    class.in_flight = None;
                    report.abandoned += 1;
                    warn!("Trace fetch abandoned: class={}", name);
                }
                ReplyState::Ready(result) => {
                    class.in_flight = None;
                    if result.class_name != name {
                        warn!(
                            "Trace result for '{}' arrived on slot '{}'",
                            result.class_name, name
                        );
                        continue;
                    }
                    self.apply_result(&name, &result.root, now);
                    report.applied += 1;
                }
            }
        }
    }

    fn issue_fetches(
        &mut self,
        session: &mut SessionContext,
        now: Instant,
        report: &mut TickReport,
    ) {
        let interval = Duration::from_millis(self.settings.fetch_interval_ms);
        let timeout = Duration::from_millis(self.settings.fetch_timeout_ms);

        for class in self.classes.values_mut() {
            if !class.fetch_due(now, timeout) {
                continue;
            }
            if class.in_flight.is_some() {
                debug!("Trace fetch stalled, reissuing: class={}", class.name);
            }
            match session.signal_fetch_trace(&class.name) {
                Ok(reply) => {
                    class.in_flight = Some(InFlightFetch {
                        reply,
                        issued_at: now,
                    });
                    class.next_fetch = Some(now + interval);
                    report.issued += 1;
                }
                Err(e) => {
                    warn!("Trace fetch failed: class={}, error={}", class.name, e);
                    class.next_fetch = Some(now + interval);
                }
            }
        }
    }

    /// Flatten `root` into the node index as the latest result of
    /// `class_name`.
    ///
    /// Nodes missing from this result keep their index entries; only class
    /// removal purges them.
    pub fn apply_result(&mut self, class_name: &str, root: &TraceNode, now: Instant) -> bool {
        let Some(mut class) = self.classes.remove(class_name) else {
            debug!("Dropping trace result for untracked class: {}", class_name);
            return false;
        };

        let t = now.saturating_duration_since(self.started).as_secs_f64();
        let root_id = self.upsert_node(&mut class, root, "", 0, t);
        class.root = Some(root_id);
        class.last_fetch = Some(now);
        class.fetch_count += 1;

        self.classes.insert(class_name.to_string(), class);
        true
    }

    fn upsert_node(
        &mut self,
        class: &mut TracedClass,
        node: &TraceNode,
        parent_path: &str,
        depth: usize,
        t: f64,
    ) -> NodeId {
        let id = NodeId::new(&class.name, node.trace_key);
        let path = if parent_path.is_empty() {
            node.name.clone()
        } else {
            format!("{parent_path}/{}", node.name)
        };

        let children: Vec<NodeId> = node
            .children
            .iter()
            .map(|child| self.upsert_node(class, child, &path, depth + 1, t))
            .collect();

        let capacity = self.settings.history_capacity;
        let colors_assigned = &mut self.colors_assigned;
        let state = self.nodes.entry(id).or_insert_with(|| {
            let color = PALETTE[*colors_assigned % PALETTE.len()];
            *colors_assigned += 1;
            NodeState {
                id,
                class_name: class.name.clone(),
                trace_key: node.trace_key,
                name: String::new(),
                path: String::new(),
                depth: 0,
                value: TraceValue::Null,
                folded: false,
                subscribing: false,
                plotting: false,
                color,
                children: Vec::new(),
                history: VecDeque::new(),
                update_count: 0,
            }
        });

        state.name = node.name.clone();
        state.path = path;
        state.depth = depth;
        state.value = node.value.clone();
        state.folded = node.folded;
        state.subscribing = node.subscribing;
        state.children = children;
        state.update_count += 1;

        if state.plotting {
            if let Some(v) = node.value.as_plot_value() {
                state.history.push_back((t, v));
                while state.history.len() > capacity {
                    state.history.pop_front();
                }
            }
        }

        class.nodes.insert(id);
        id
    }

    // -----------------------------------------------------------------------
    // Controls
    // -----------------------------------------------------------------------

    /// Enable or disable periodic fetching of a class. Enabling schedules an
    /// immediate fetch.
    pub fn set_class_tracing(&mut self, class_name: &str, tracing: bool) -> Result<()> {
        let class = self
            .classes
            .get_mut(class_name)
            .ok_or_else(|| Error::ClassNotFound(class_name.to_string()))?;
        if tracing && !class.tracing {
            class.next_fetch = None;
        }
        class.tracing = tracing;
        Ok(())
    }

    /// Ask the server to (un)subscribe a node.
    pub fn set_subscription(
        &self,
        session: &SessionContext,
        node: NodeId,
        subscribe: bool,
    ) -> Result<()> {
        let state = self.node(node).ok_or(Error::NodeNotFound(node.as_u64()))?;
        session.control_trace(&state.class_name, state.trace_key, Some(subscribe), None)
    }

    /// Ask the server to fold or unfold a node.
    pub fn set_folded(&self, session: &SessionContext, node: NodeId, folded: bool) -> Result<()> {
        let state = self.node(node).ok_or(Error::NodeNotFound(node.as_u64()))?;
        session.control_trace(&state.class_name, state.trace_key, None, Some(folded))
    }

    /// Toggle local plotting of a node. Only numeric and duration values can
    /// be plotted.
    pub fn set_plotting(&mut self, node: NodeId, plotting: bool) -> Result<()> {
        let state = self
            .nodes
            .get_mut(&node)
            .ok_or(Error::NodeNotFound(node.as_u64()))?;
        if plotting && !state.value.is_plottable() {
            debug!(
                "Refusing to plot node '{}': {} value",
                state.path,
                state.value.type_name()
            );
            return Err(Error::NotPlottable(node.as_u64()));
        }
        state.plotting = plotting;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Tracked class by name.
    pub fn class(&self, name: &str) -> Option<&TracedClass> {
        self.classes.get(name)
    }

    /// All tracked classes, sorted by name.
    pub fn classes(&self) -> impl Iterator<Item = &TracedClass> {
        self.classes.values()
    }

    /// Node by id.
    pub fn node(&self, id: NodeId) -> Option<&NodeState> {
        self.nodes.get(&id)
    }

    /// Every indexed node.
    pub fn nodes(&self) -> impl Iterator<Item = &NodeState> {
        self.nodes.values()
    }

    /// Nodes owned by `class_name`.
    pub fn class_nodes<'a>(
        &'a self,
        class_name: &str,
    ) -> impl Iterator<Item = &'a NodeState> + 'a {
        self.classes
            .get(class_name)
            .into_iter()
            .flat_map(|class| class.nodes.iter())
            .filter_map(|id| self.nodes.get(id))
    }

    /// Nodes with plotting enabled.
    pub fn plotting_nodes(&self) -> impl Iterator<Item = &NodeState> {
        self.nodes.values().filter(|node| node.plotting)
    }

    /// Size of the flat node index.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Active settings.
    pub fn settings(&self) -> &TraceSettings {
        &self.settings
    }
}

impl Default for TraceContext {
    fn default() -> Self {
        Self::new()
    }
}
