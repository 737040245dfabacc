//! Typed building blocks for graph reads and writes

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Node labels of the operational graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeLabel {
    /// A deployed subsystem
    Component,
    /// An inference or tool provider
    Provider,
    /// A runtime feature flag
    FeatureFlag,
    /// One handled request turn
    Run,
    /// A stage within a run
    Step,
    /// Content produced by a step, stored by hash
    Artifact,
    /// An external origin (host or repository)
    Source,
    /// A control-room task
    Task,
    /// A human approval attached to a task
    Approval,
    /// A tool invocation within a step
    Action,
    /// Retention configuration
    RetentionPolicy,
}

impl NodeLabel {
    /// Stable storage name
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeLabel::Component => "Component",
            NodeLabel::Provider => "Provider",
            NodeLabel::FeatureFlag => "FeatureFlag",
            NodeLabel::Run => "Run",
            NodeLabel::Step => "Step",
            NodeLabel::Artifact => "Artifact",
            NodeLabel::Source => "Source",
            NodeLabel::Task => "Task",
            NodeLabel::Approval => "Approval",
            NodeLabel::Action => "Action",
            NodeLabel::RetentionPolicy => "RetentionPolicy",
        }
    }

    /// Parse a stored label name
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "Component" => Some(NodeLabel::Component),
            "Provider" => Some(NodeLabel::Provider),
            "FeatureFlag" => Some(NodeLabel::FeatureFlag),
            "Run" => Some(NodeLabel::Run),
            "Step" => Some(NodeLabel::Step),
            "Artifact" => Some(NodeLabel::Artifact),
            "Source" => Some(NodeLabel::Source),
            "Task" => Some(NodeLabel::Task),
            "Approval" => Some(NodeLabel::Approval),
            "Action" => Some(NodeLabel::Action),
            "RetentionPolicy" => Some(NodeLabel::RetentionPolicy),
            _ => None,
        }
    }
}

impl std::fmt::Display for NodeLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A directed, typed edge to upsert alongside a node
#[derive(Debug, Clone)]
pub struct RelationSpec {
    /// Source node
    pub src: (NodeLabel, String),
    /// Relation name, e.g. `HAS_STEP`
    pub rel: String,
    /// Destination node
    pub dst: (NodeLabel, String),
    /// Edge properties (JSON object)
    pub props: Value,
}

impl RelationSpec {
    /// Create an edge with empty properties
    pub fn new(src: (NodeLabel, impl Into<String>), rel: impl Into<String>, dst: (NodeLabel, impl Into<String>)) -> Self {
        Self {
            src: (src.0, src.1.into()),
            rel: rel.into(),
            dst: (dst.0, dst.1.into()),
            props: Value::Object(Map::new()),
        }
    }

    /// Attach edge properties
    pub fn with_props(mut self, props: Value) -> Self {
        self.props = props;
        self
    }
}

/// Conditional merge guard for a status property.
///
/// When the stored node already has a status, the incoming status must be a
/// listed successor; otherwise the whole property merge is skipped and the
/// stored node is left untouched. This keeps terminal states terminal under
/// replay and concurrent materialization.
#[derive(Debug, Clone, Default)]
pub struct StatusGuard {
    /// Property holding the status (usually `status`)
    pub field: String,
    /// Allowed transitions: current status -> admissible next statuses
    pub successors: HashMap<String, Vec<String>>,
}

impl StatusGuard {
    /// Guard on the `status` property with the given transitions
    pub fn on_status(successors: &[(&str, &[&str])]) -> Self {
        Self {
            field: "status".to_string(),
            successors: successors
                .iter()
                .map(|(from, to)| {
                    (
                        from.to_string(),
                        to.iter().map(|s| s.to_string()).collect(),
                    )
                })
                .collect(),
        }
    }

    /// Whether a merge bringing `incoming` may overwrite a node whose guard
    /// field currently holds `current`.
    pub fn admits(&self, current: Option<&str>, incoming: Option<&str>) -> bool {
        match (current, incoming) {
            // No stored status yet, or the merge does not touch it.
            (None, _) | (_, None) => true,
            (Some(cur), Some(next)) => {
                if cur == next {
                    return true;
                }
                self.successors
                    .get(cur)
                    .map(|allowed| allowed.iter().any(|s| s == next))
                    .unwrap_or(false)
            }
        }
    }
}

/// A node upsert: merge properties and relate in one idempotent write
#[derive(Debug, Clone)]
pub struct UpsertSpec {
    /// Node label
    pub label: NodeLabel,
    /// Primary key within the label
    pub id: String,
    /// Properties to merge over the stored ones (JSON object)
    pub props: Value,
    /// Edges to upsert alongside
    pub relations: Vec<RelationSpec>,
    /// Optional status transition guard
    pub guard: Option<StatusGuard>,
}

impl UpsertSpec {
    /// Start an upsert for `(label, id)` with empty properties
    pub fn new(label: NodeLabel, id: impl Into<String>) -> Self {
        Self {
            label,
            id: id.into(),
            props: Value::Object(Map::new()),
            relations: Vec::new(),
            guard: None,
        }
    }

    /// Set the properties to merge
    pub fn with_props(mut self, props: Value) -> Self {
        self.props = props;
        self
    }

    /// Add an edge
    pub fn with_relation(mut self, relation: RelationSpec) -> Self {
        self.relations.push(relation);
        self
    }

    /// Attach a status guard
    pub fn with_guard(mut self, guard: StatusGuard) -> Self {
        self.guard = Some(guard);
        self
    }
}

/// A typed node row returned from a read
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRow {
    /// Node label
    pub label: NodeLabel,
    /// Primary key
    pub id: String,
    /// Stored properties
    pub props: Value,
    /// Last write timestamp (epoch milliseconds)
    pub updated_ts: i64,
}

impl NodeRow {
    /// String property accessor
    pub fn prop_str(&self, key: &str) -> Option<&str> {
        self.props.get(key).and_then(|v| v.as_str())
    }

    /// Numeric property accessor
    pub fn prop_f64(&self, key: &str) -> Option<f64> {
        self.props.get(key).and_then(|v| v.as_f64())
    }
}

/// A typed edge row returned from a read
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeRow {
    /// Source node
    pub src: (NodeLabel, String),
    /// Relation name
    pub rel: String,
    /// Destination node
    pub dst: (NodeLabel, String),
    /// Edge properties
    pub props: Value,
}

/// A parameterized node read
#[derive(Debug, Clone)]
pub struct ReadQuery {
    /// Label to read
    pub label: NodeLabel,
    /// Restrict to these ids, when set
    pub ids: Option<Vec<String>>,
    /// Property equality filters applied after load
    pub prop_equals: Vec<(String, Value)>,
    /// Maximum rows returned
    pub limit: Option<usize>,
}

impl ReadQuery {
    /// Read all nodes of a label
    pub fn label(label: NodeLabel) -> Self {
        Self {
            label,
            ids: None,
            prop_equals: Vec::new(),
            limit: None,
        }
    }

    /// Restrict to a set of ids
    pub fn with_ids(mut self, ids: Vec<String>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// Add a property equality filter
    pub fn with_prop(mut self, key: impl Into<String>, value: Value) -> Self {
        self.prop_equals.push((key.into(), value));
        self
    }

    /// Cap the number of rows
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}
