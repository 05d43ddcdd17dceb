//! Wire message types exchanged with a perfkit server.
//!
//! Inbound messages are decoded from the envelope's `parameter` document by
//! the session's route table; outbound requests are encoded into it.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Route names.
pub mod routes {
    /// Shell output chunk
    pub const SHELL_OUTPUT: &str = "shell_output";
    /// Session epoch reset
    pub const SESSION_RESET: &str = "session_reset";
    /// Full config class tree
    pub const NEW_CONFIG_CLASS: &str = "new_config_class";
    /// Batch of config entity value updates
    pub const CONFIG_ENTITY: &str = "config_entity";
    /// Command suggestion reply
    pub const SUGGEST_COMMAND: &str = "suggest_command";
    /// Advertised tracer classes
    pub const TRACE_CLASS_LIST: &str = "trace_class_list";
    /// Trace sample result for one class
    pub const TRACES: &str = "traces";
    /// Remote process resource usage
    pub const SESSION_STATE: &str = "session_state";

    /// Login request
    pub const LOGIN: &str = "auth:login";
    /// Shell command line
    pub const PUSH_COMMAND: &str = "cmd:push_command";
    /// Config entity point update
    pub const CONFIGURE_ENTITY: &str = "cmd:configure_entity";
    /// Command suggestion request
    pub const SUGGEST_REQUEST: &str = "cmd:suggest_command";
    /// Trace fetch request
    pub const SIGNAL_FETCH_TRACES: &str = "cmd:signal_fetch_traces";
    /// Trace node subscription/fold control
    pub const CONTROL_TRACE: &str = "cmd:control_trace";

    /// Every route the session handles.
    pub const INBOUND: [&str; 8] = [
        SHELL_OUTPUT,
        SESSION_RESET,
        NEW_CONFIG_CLASS,
        CONFIG_ENTITY,
        SUGGEST_COMMAND,
        TRACE_CLASS_LIST,
        TRACES,
        SESSION_STATE,
    ];
}

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

/// Identity of the remote session.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionInfo {
    /// Session name
    pub name: String,
    /// Host the instrumented process runs on
    pub hostname: String,
    /// Server-side session key string
    pub keystr: String,
    /// Server epoch (generation marker)
    pub epoch: i64,
    /// Free-form description
    pub description: String,
    /// Process id of the instrumented process
    pub pid: i64,
    /// Logical core count of the remote host
    pub num_cores: u32,
}

/// `session_reset`: new epoch, all mirrored state is invalid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionReset {
    /// New session identity
    #[serde(flatten)]
    pub info: SessionInfo,
}

/// `shell_output`: chunk of terminal output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShellOutput {
    /// Output text
    pub content: String,
}

/// Leaf setting inside a config category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigEntityDesc {
    /// Display name
    pub name: String,
    /// Class-local key
    pub config_key: u64,
    /// Current value
    pub value: Value,
    /// Description shown as tooltip
    #[serde(default)]
    pub description: String,
    /// Value constraints and presentation hints
    #[serde(default)]
    pub metadata: Value,
}

/// Category node of a config class tree.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigCategory {
    /// Category name
    pub name: String,
    /// Nested categories
    pub subcategories: Vec<ConfigCategory>,
    /// Leaf settings
    pub entities: Vec<ConfigEntityDesc>,
}

impl ConfigCategory {
    /// Visit every entity in the subtree, depth first.
    pub fn for_each_entity<F: FnMut(&ConfigEntityDesc)>(&self, f: &mut F) {
        for entity in &self.entities {
            f(entity);
        }
        for sub in &self.subcategories {
            sub.for_each_entity(f);
        }
    }

    /// Total number of entities in the subtree.
    pub fn entity_count(&self) -> usize {
        let mut count = 0;
        self.for_each_entity(&mut |_| count += 1);
        count
    }
}

/// `new_config_class`: full tree for one config class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewConfigClass {
    /// Class name
    pub key: String,
    /// Root category
    pub root: ConfigCategory,
}

/// One value in a `config_entity` batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigEntityValue {
    /// Owning class name
    pub class_key: String,
    /// Class-local entity key
    pub config_key: u64,
    /// New value
    pub value: Value,
}

/// `config_entity`: batch of entity updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigEntityUpdate {
    /// Updated entities
    pub content: Vec<ConfigEntityValue>,
}

/// `suggest_command` reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuggestReply {
    /// Sequence number of the request this answers
    pub reply_to: u64,
    /// Command line after completion
    pub new_command: String,
    /// Candidate completions
    #[serde(default)]
    pub candidates: Vec<String>,
}

/// Tracer class advertised by the server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TraceClassInfo {
    /// Class name
    pub name: String,
    /// Generation counter of the class instance
    pub instance_id: u64,
}

/// `trace_class_list`: the complete current class set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceClassList {
    /// Advertised classes
    pub content: Vec<TraceClassInfo>,
}

/// Value carried by a trace node.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum TraceValue {
    /// No value
    #[default]
    Null,
    /// Elapsed time in microseconds
    Duration(u64),
    /// Signed integer
    Integer(i64),
    /// Floating point
    Float(f64),
    /// Text
    String(String),
    /// Flag
    Boolean(bool),
}

impl TraceValue {
    /// Numeric view for plotting; `None` for non-plottable types.
    ///
    /// Durations are reported in milliseconds.
    pub fn as_plot_value(&self) -> Option<f64> {
        match self {
            TraceValue::Duration(us) => Some(*us as f64 / 1000.0),
            TraceValue::Integer(v) => Some(*v as f64),
            TraceValue::Float(v) => Some(*v),
            TraceValue::Null | TraceValue::String(_) | TraceValue::Boolean(_) => None,
        }
    }

    /// Whether values of this type can be plotted.
    pub fn is_plottable(&self) -> bool {
        self.as_plot_value().is_some()
    }

    /// Short type tag.
    pub fn type_name(&self) -> &'static str {
        match self {
            TraceValue::Null => "null",
            TraceValue::Duration(_) => "duration",
            TraceValue::Integer(_) => "integer",
            TraceValue::Float(_) => "float",
            TraceValue::String(_) => "string",
            TraceValue::Boolean(_) => "boolean",
        }
    }
}

/// Node of a fetched trace tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceNode {
    /// Node name
    pub name: String,
    /// Opaque key, stable across fetches
    pub trace_key: u64,
    /// Sampled value
    #[serde(default)]
    pub value: TraceValue,
    /// Children are folded on the server
    #[serde(default)]
    pub folded: bool,
    /// Node is subscribed on the server
    #[serde(default)]
    pub subscribing: bool,
    /// Child nodes
    #[serde(default)]
    pub children: Vec<TraceNode>,
}

/// `traces`: one fetched class tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceResult {
    /// Tracer class name
    pub class_name: String,
    /// Root node
    pub root: TraceNode,
}

/// `session_state`: remote process resource usage.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionStateUpdate {
    /// Total user CPU usage (0..1 per core)
    pub cpu_usage_total_user: f64,
    /// Total kernel CPU usage
    pub cpu_usage_total_kernel: f64,
    /// Instrumented process user CPU usage
    pub cpu_usage_self_user: f64,
    /// Instrumented process kernel CPU usage
    pub cpu_usage_self_kernel: f64,
    /// Virtual memory in bytes
    pub memory_usage_virtual: u64,
    /// Resident memory in bytes
    pub memory_usage_resident: u64,
    /// Thread count
    pub num_threads: u32,
    /// Outbound bandwidth, bytes per second
    pub bw_out: u64,
    /// Inbound bandwidth, bytes per second
    pub bw_in: u64,
}

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

/// `auth:login` request. The password field carries base64(sha256(password)).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginRequest {
    /// Account id
    pub id: String,
    /// Encoded password digest
    pub password: String,
}

/// `cmd:push_command` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushCommand {
    /// Command line, sent verbatim
    pub command: String,
}

/// `cmd:configure_entity` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigureEntity {
    /// Updates, usually one
    pub content: Vec<ConfigEntityValue>,
}

/// `cmd:suggest_command` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuggestRequest {
    /// Correlation sequence number
    pub query_id: u64,
    /// Command line being completed
    pub command: String,
    /// Cursor byte position inside `command`
    pub position: usize,
}

/// `cmd:signal_fetch_traces` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalFetchTraces {
    /// Classes to fetch
    pub targets: Vec<String>,
}

/// `cmd:control_trace` request. Only the flags that are `Some` are sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlTrace {
    /// Tracer class name
    pub class_name: String,
    /// Node trace key
    pub trace_key: u64,
    /// New subscription state
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub subscribe: Option<bool>,
    /// New fold state
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub fold: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_trace_value_tagging() {
        let value = TraceValue::Duration(1500);
        let json = serde_json::to_value(&value).unwrap();
        assert_eq!(json, json!({"type": "duration", "value": 1500}));

        let null: TraceValue = serde_json::from_value(json!({"type": "null"})).unwrap();
        assert_eq!(null, TraceValue::Null);
    }

    #[test]
    fn test_trace_value_plottable() {
        assert_eq!(TraceValue::Duration(2500).as_plot_value(), Some(2.5));
        assert_eq!(TraceValue::Integer(-3).as_plot_value(), Some(-3.0));
        assert_eq!(TraceValue::Float(0.5).as_plot_value(), Some(0.5));
        assert!(!TraceValue::Null.is_plottable());
        assert!(!TraceValue::String("x".into()).is_plottable());
        assert!(!TraceValue::Boolean(true).is_plottable());
        assert_eq!(TraceValue::Duration(1).type_name(), "duration");
        assert_eq!(TraceValue::String("x".into()).type_name(), "string");
    }

    #[test]
    fn test_control_trace_omits_unset_flags() {
        let msg = ControlTrace {
            class_name: "frame".to_string(),
            trace_key: 7,
            subscribe: Some(true),
            fold: None,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            json,
            json!({"class_name": "frame", "trace_key": 7, "subscribe": true})
        );
    }

    #[test]
    fn test_session_reset_flattened() {
        let reset: SessionReset = serde_json::from_value(json!({
            "name": "game",
            "hostname": "devbox",
            "epoch": 3,
        }))
        .unwrap();
        assert_eq!(reset.info.name, "game");
        assert_eq!(reset.info.epoch, 3);
        assert_eq!(reset.info.num_cores, 0);
    }

    #[test]
    fn test_config_category_entity_count() {
        let entity = |key| ConfigEntityDesc {
            name: format!("e{key}"),
            config_key: key,
            value: json!(key),
            description: String::new(),
            metadata: Value::Null,
        };
        let root = ConfigCategory {
            name: "root".to_string(),
            subcategories: vec![ConfigCategory {
                name: "child".to_string(),
                subcategories: vec![],
                entities: vec![entity(2), entity(3)],
            }],
            entities: vec![entity(1)],
        };
        assert_eq!(root.entity_count(), 3);
    }

    #[test]
    fn test_trace_node_defaults() {
        let node: TraceNode =
            serde_json::from_value(json!({"name": "root", "trace_key": 1})).unwrap();
        assert_eq!(node.value, TraceValue::Null);
        assert!(node.children.is_empty());
        assert!(!node.subscribing);
    }
}
