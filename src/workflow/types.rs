//! Flow graph and workspace type definitions.
//!
//! A workspace owns endpoints, examples, environments and flows. A flow owns
//! its nodes, edges and variables; a node owns its kind-specific payload.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::id::Id;

/// Node kinds understood by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    NoOp,
    Request,
    Condition,
    For,
    ForEach,
    Js,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::NoOp => "no_op",
            NodeKind::Request => "request",
            NodeKind::Condition => "condition",
            NodeKind::For => "for",
            NodeKind::ForEach => "for_each",
            NodeKind::Js => "js",
        }
    }

    /// Whether nodes of this kind drive a loop body.
    pub fn is_loop(&self) -> bool {
        matches!(self, NodeKind::For | NodeKind::ForEach)
    }
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Subtype of a `no_op` node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoOpKind {
    Start,
    Loop,
    Create,
}

/// How a loop reacts to a failing iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorHandling {
    /// Abort the loop on the first failed iteration.
    #[default]
    Throw,
    /// Keep iterating.
    Ignore,
}

/// Edge handle. Determines which branch an edge belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeHandle {
    #[default]
    Unspecified,
    Then,
    Else,
    Loop,
}

/// Persisted node execution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    #[default]
    Unspecified,
    Running,
    Success,
    Failure,
    Canceled,
}

impl NodeState {
    pub fn as_i64(&self) -> i64 {
        match self {
            NodeState::Unspecified => 0,
            NodeState::Running => 1,
            NodeState::Success => 2,
            NodeState::Failure => 3,
            NodeState::Canceled => 4,
        }
    }

    pub fn from_i64(value: i64) -> Self {
        match value {
            1 => NodeState::Running,
            2 => NodeState::Success,
            3 => NodeState::Failure,
            4 => NodeState::Canceled,
            _ => NodeState::Unspecified,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeState::Success | NodeState::Failure | NodeState::Canceled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeState::Unspecified => "unspecified",
            NodeState::Running => "running",
            NodeState::Success => "success",
            NodeState::Failure => "failure",
            NodeState::Canceled => "canceled",
        }
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canvas position of a node.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// Kind-specific node payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeConfig {
    NoOp {
        subtype: NoOpKind,
    },
    Request {
        endpoint_id: Id,
        example_id: Id,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        delta_endpoint_id: Option<Id>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        delta_example_id: Option<Id>,
    },
    Condition {
        expression: String,
    },
    For {
        iter_count: i64,
        #[serde(default)]
        error_handling: ErrorHandling,
    },
    ForEach {
        items: String,
        #[serde(default)]
        error_handling: ErrorHandling,
    },
    Js {
        code: String,
    },
}

impl NodeConfig {
    pub fn kind(&self) -> NodeKind {
        match self {
            NodeConfig::NoOp { .. } => NodeKind::NoOp,
            NodeConfig::Request { .. } => NodeKind::Request,
            NodeConfig::Condition { .. } => NodeKind::Condition,
            NodeConfig::For { .. } => NodeKind::For,
            NodeConfig::ForEach { .. } => NodeKind::ForEach,
            NodeConfig::Js { .. } => NodeKind::Js,
        }
    }
}

/// A node in a flow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowNodeDef {
    pub id: Id,
    pub flow_id: Id,
    pub name: String,
    pub config: NodeConfig,
    #[serde(default)]
    pub position: Position,
}

impl FlowNodeDef {
    pub fn kind(&self) -> NodeKind {
        self.config.kind()
    }

    pub fn is_start(&self) -> bool {
        matches!(
            self.config,
            NodeConfig::NoOp {
                subtype: NoOpKind::Start
            }
        )
    }
}

/// A directed edge between two nodes of the same flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub id: Id,
    pub flow_id: Id,
    pub source_id: Id,
    pub target_id: Id,
    #[serde(default)]
    pub handle: EdgeHandle,
}

/// Name/value pair used for flow and environment variables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    pub value: String,
}

/// Header or query parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

impl KeyValue {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// A flow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flow {
    pub id: Id,
    pub workspace_id: Id,
    pub name: String,
    #[serde(default)]
    pub variables: Vec<Variable>,
    #[serde(default)]
    pub nodes: Vec<FlowNodeDef>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

impl Flow {
    /// The unique start node.
    pub fn start_node(&self) -> Result<&FlowNodeDef> {
        let mut starts = self.nodes.iter().filter(|n| n.is_start());
        let start = starts
            .next()
            .ok_or_else(|| Error::InvalidInput(format!("flow '{}' has no start node", self.name)))?;
        if starts.next().is_some() {
            return Err(Error::InvalidInput(format!(
                "flow '{}' has more than one start node",
                self.name
            )));
        }
        Ok(start)
    }

    pub fn node(&self, id: Id) -> Option<&FlowNodeDef> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn node_by_name(&self, name: &str) -> Option<&FlowNodeDef> {
        self.nodes.iter().find(|n| n.name == name)
    }

    pub fn node_ids(&self) -> Vec<Id> {
        self.nodes.iter().map(|n| n.id).collect()
    }

    pub fn incoming(&self, id: Id) -> impl Iterator<Item = &Edge> {
        self.edges.iter().filter(move |e| e.target_id == id)
    }

    pub fn outgoing(&self, id: Id) -> impl Iterator<Item = &Edge> {
        self.edges.iter().filter(move |e| e.source_id == id)
    }
}

/// An HTTP endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub id: Id,
    pub name: String,
    pub method: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta_parent_id: Option<Id>,
    #[serde(default)]
    pub hidden: bool,
}

/// A stored request example (headers, query and raw body).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Example {
    pub id: Id,
    pub endpoint_id: Id,
    pub name: String,
    #[serde(default)]
    pub headers: Vec<KeyValue>,
    #[serde(default)]
    pub query: Vec<KeyValue>,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta_parent_id: Option<Id>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_parent_id: Option<Id>,
    #[serde(default)]
    pub hidden: bool,
}

/// Named set of variables selectable at run time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    pub id: Id,
    pub name: String,
    #[serde(default)]
    pub variables: Vec<Variable>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workspace {
    pub id: Id,
    pub name: String,
}

/// Everything owned by one workspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceBundle {
    pub workspace: Workspace,
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
    #[serde(default)]
    pub examples: Vec<Example>,
    #[serde(default)]
    pub environments: Vec<Environment>,
    #[serde(default)]
    pub flows: Vec<Flow>,
}

impl WorkspaceBundle {
    pub fn endpoint(&self, id: Id) -> Option<&Endpoint> {
        self.endpoints.iter().find(|e| e.id == id)
    }

    pub fn example(&self, id: Id) -> Option<&Example> {
        self.examples.iter().find(|e| e.id == id)
    }

    pub fn flow(&self, id: Id) -> Option<&Flow> {
        self.flows.iter().find(|f| f.id == id)
    }

    pub fn flow_by_name(&self, name: &str) -> Option<&Flow> {
        self.flows.iter().find(|f| f.name == name)
    }

    pub fn environment(&self, id: Id) -> Option<&Environment> {
        self.environments.iter().find(|e| e.id == id)
    }

    /// Authored request values of a request node: the base endpoint and example
    /// with the delta layered on top. Placeholders are left unresolved.
    pub fn request_template(&self, config: &NodeConfig) -> Result<RequestTemplate> {
        let NodeConfig::Request {
            endpoint_id,
            example_id,
            delta_endpoint_id,
            delta_example_id,
        } = config
        else {
            return Err(Error::InvalidInput(format!(
                "expected a request node, got {}",
                config.kind()
            )));
        };

        let endpoint = self
            .endpoint(*endpoint_id)
            .ok_or_else(|| Error::NotFound(format!("endpoint {}", endpoint_id)))?;
        let example = self
            .example(*example_id)
            .ok_or_else(|| Error::NotFound(format!("example {}", example_id)))?;

        let mut template = RequestTemplate {
            method: endpoint.method.clone(),
            url: endpoint.url.clone(),
            headers: example.headers.clone(),
            query: example.query.clone(),
            body: example.body.clone(),
        };

        if let Some(id) = delta_endpoint_id {
            let delta = self
                .endpoint(*id)
                .ok_or_else(|| Error::NotFound(format!("delta endpoint {}", id)))?;
            if !delta.method.is_empty() {
                template.method = delta.method.clone();
            }
            if !delta.url.is_empty() {
                template.url = delta.url.clone();
            }
        }

        if let Some(id) = delta_example_id {
            let delta = self
                .example(*id)
                .ok_or_else(|| Error::NotFound(format!("delta example {}", id)))?;
            overlay(&mut template.headers, &delta.headers);
            overlay(&mut template.query, &delta.query);
            if !delta.body.is_empty() {
                template.body = delta.body.clone();
            }
        }

        Ok(template)
    }
}

fn overlay(base: &mut Vec<KeyValue>, delta: &[KeyValue]) {
    for kv in delta {
        match base.iter_mut().find(|b| b.key == kv.key) {
            Some(existing) => existing.value = kv.value.clone(),
            None => base.push(kv.clone()),
        }
    }
}

/// Request values assembled from base and delta rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestTemplate {
    pub method: String,
    pub url: String,
    pub headers: Vec<KeyValue>,
    pub query: Vec<KeyValue>,
    pub body: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_state_codes() {
        for state in [
            NodeState::Unspecified,
            NodeState::Running,
            NodeState::Success,
            NodeState::Failure,
            NodeState::Canceled,
        ] {
            assert_eq!(NodeState::from_i64(state.as_i64()), state);
        }
        assert!(!NodeState::Running.is_terminal());
        assert!(NodeState::Canceled.is_terminal());
    }

    #[test]
    fn test_node_config_serializes_with_kind_tag() {
        let config = NodeConfig::For {
            iter_count: 3,
            error_handling: ErrorHandling::Ignore,
        };
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["kind"], "for");
        assert_eq!(json["iter_count"], 3);
        assert_eq!(json["error_handling"], "ignore");
        assert_eq!(config.kind(), NodeKind::For);
    }

    #[test]
    fn test_start_node_must_be_unique() {
        let flow_id = Id::new();
        let start = |name: &str| FlowNodeDef {
            id: Id::new(),
            flow_id,
            name: name.to_string(),
            config: NodeConfig::NoOp {
                subtype: NoOpKind::Start,
            },
            position: Position::default(),
        };
        let mut flow = Flow {
            id: flow_id,
            workspace_id: Id::new(),
            name: "f".into(),
            variables: vec![],
            nodes: vec![],
            edges: vec![],
        };
        assert!(flow.start_node().is_err());
        flow.nodes.push(start("Start"));
        assert_eq!(flow.start_node().unwrap().name, "Start");
        flow.nodes.push(start("Other"));
        assert!(flow.start_node().is_err());
    }
}
