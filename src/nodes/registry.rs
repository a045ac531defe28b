//! Node registry - turns flow node definitions into runnable nodes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use tracing::warn;

use super::condition::ConditionNode;
use super::for_each::ForEachNode;
use super::for_loop::ForNode;
use super::js::JsNode;
use super::noop::NoOpNode;
use super::request::RequestNode;
use super::types::{EdgeMap, FlowNode, NodeMap};
use crate::config::HttpConfig;
use crate::error::Result;
use crate::workflow::{Flow, FlowNodeDef, NodeConfig, WorkspaceBundle};

/// Builds runtime nodes. Holds the HTTP client shared by request nodes.
#[derive(Clone)]
pub struct NodeRegistry {
    client: Client,
}

impl NodeRegistry {
    pub fn new(config: &HttpConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()
            .unwrap_or_else(|e| {
                warn!("Failed to build HTTP client with configured timeouts: {}", e);
                Client::new()
            });
        Self { client }
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    /// Build the runtime node for `def`. Request nodes resolve their
    /// endpoint/example rows from `bundle` up front.
    pub fn build(&self, def: &FlowNodeDef, bundle: &WorkspaceBundle) -> Result<Arc<dyn FlowNode>> {
        let node: Arc<dyn FlowNode> = match &def.config {
            NodeConfig::NoOp { subtype } => Arc::new(NoOpNode::new(def.id, &def.name, *subtype)),
            NodeConfig::Request { example_id, .. } => {
                let template = bundle.request_template(&def.config)?;
                Arc::new(RequestNode::new(
                    def.id,
                    &def.name,
                    *example_id,
                    template,
                    self.client.clone(),
                ))
            }
            NodeConfig::Condition { expression } => {
                Arc::new(ConditionNode::new(def.id, &def.name, expression))
            }
            NodeConfig::For {
                iter_count,
                error_handling,
            } => Arc::new(ForNode::new(def.id, &def.name, *iter_count, *error_handling)),
            NodeConfig::ForEach {
                items,
                error_handling,
            } => Arc::new(ForEachNode::new(def.id, &def.name, items, *error_handling)),
            NodeConfig::Js { code } => Arc::new(JsNode::new(def.id, &def.name, code)),
        };
        Ok(node)
    }

    /// Runtime nodes for every node of `flow`.
    pub fn node_map(&self, flow: &Flow, bundle: &WorkspaceBundle) -> Result<NodeMap> {
        flow.nodes
            .iter()
            .map(|def| Ok((def.id, self.build(def, bundle)?)))
            .collect()
    }
}

/// Outgoing edges of `flow` grouped by source and handle.
pub fn edge_map(flow: &Flow) -> EdgeMap {
    let mut edges: EdgeMap = HashMap::new();
    for edge in &flow.edges {
        edges
            .entry(edge.source_id)
            .or_default()
            .entry(edge.handle)
            .or_default()
            .push(edge.target_id);
    }
    edges
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{import_workspace, EdgeHandle, NodeKind};

    const YAML: &str = r#"
workspace_name: Registry
requests:
  - name: ping
    method: GET
    url: "http://localhost/ping"
flows:
  - name: main
    steps:
      - request:
          name: R1
          use_request: ping
      - for:
          name: L
          iter_count: 2
          loop: body
          depends_on: [R1]
      - js:
          name: body
          code: "1 + 1"
"#;

    #[test]
    fn test_node_map_builds_every_kind() {
        let bundle = import_workspace(YAML).unwrap();
        let flow = &bundle.flows[0];
        let registry = NodeRegistry::new(&HttpConfig::default());
        let nodes = registry.node_map(flow, &bundle).unwrap();
        assert_eq!(nodes.len(), flow.nodes.len());

        let loop_def = flow.node_by_name("L").unwrap();
        assert_eq!(nodes[&loop_def.id].kind(), NodeKind::For);
        assert_eq!(nodes[&loop_def.id].name(), "L");
    }

    #[test]
    fn test_edge_map_groups_by_handle() {
        let bundle = import_workspace(YAML).unwrap();
        let flow = &bundle.flows[0];
        let edges = edge_map(flow);
        let loop_id = flow.node_by_name("L").unwrap().id;
        let body_id = flow.node_by_name("body").unwrap().id;
        assert_eq!(edges[&loop_id][&EdgeHandle::Loop], vec![body_id]);
    }

    #[test]
    fn test_missing_example_is_not_found() {
        let mut bundle = import_workspace(YAML).unwrap();
        bundle.examples.clear();
        let flow = bundle.flows[0].clone();
        let registry = NodeRegistry::new(&HttpConfig::default());
        let err = registry.node_map(&flow, &bundle).err().unwrap();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
    }
}
