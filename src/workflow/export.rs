//! Simplified workspace YAML export.
//!
//! The inverse of [`super::parser::import_workspace`]. Each request node is
//! promoted into its own reusable request definition, with values read from
//! the base and delta rows so authored placeholders survive.

use std::collections::{BTreeMap, HashSet};

use serde_json::Value;

use super::parser::{
    EnvironmentDef, FlowDef, ForEachStep, ForStep, IfStep, JsStep, RequestDef, RequestStep,
    SimplifiedWorkspace, Step, VariableDef,
};
use super::types::{EdgeHandle, Flow, FlowNodeDef, KeyValue, NodeConfig, WorkspaceBundle};
use crate::error::Result;
use crate::id::Id;

/// Export a workspace bundle to simplified YAML.
pub fn export_workspace(bundle: &WorkspaceBundle) -> Result<String> {
    let doc = to_document(bundle)?;
    Ok(serde_yaml::to_string(&doc)?)
}

/// Build the simplified document for a workspace bundle.
pub fn to_document(bundle: &WorkspaceBundle) -> Result<SimplifiedWorkspace> {
    let mut doc = SimplifiedWorkspace {
        workspace_name: bundle.workspace.name.clone(),
        ..SimplifiedWorkspace::default()
    };

    doc.environments = bundle
        .environments
        .iter()
        .map(|env| EnvironmentDef {
            name: env.name.clone(),
            variables: env
                .variables
                .iter()
                .map(|v| (v.name.clone(), Value::String(v.value.clone())))
                .collect(),
        })
        .collect();

    let mut request_names = HashSet::new();
    for flow in &bundle.flows {
        let flow_def = export_flow(bundle, flow, &mut doc.requests, &mut request_names)?;
        doc.flows.push(flow_def);
    }
    Ok(doc)
}

fn export_flow(
    bundle: &WorkspaceBundle,
    flow: &Flow,
    requests: &mut Vec<RequestDef>,
    request_names: &mut HashSet<String>,
) -> Result<FlowDef> {
    let start_id = flow.start_node()?.id;
    let mut steps = Vec::new();
    let mut first = true;

    for node in flow.nodes.iter().filter(|n| n.id != start_id) {
        let mut depends_on: Vec<String> = flow
            .incoming(node.id)
            .filter(|e| e.handle == EdgeHandle::Unspecified)
            .filter_map(|e| flow.node(e.source_id))
            .map(|n| n.name.clone())
            .collect();
        // The first step hangs off the start node implicitly.
        if first && depends_on.len() == 1 && flow.node(start_id).map(|s| &s.name) == Some(&depends_on[0]) {
            depends_on.clear();
        }
        first = false;

        let step = match &node.config {
            NodeConfig::NoOp { .. } => continue,
            NodeConfig::Request { .. } => {
                let name = unique_name(&node.name, &flow.name, request_names);
                requests.push(request_def(bundle, node, &name)?);
                Step::Request(RequestStep {
                    name: node.name.clone(),
                    use_request: Some(name),
                    depends_on,
                    ..RequestStep::default()
                })
            }
            NodeConfig::Condition { expression } => Step::If(IfStep {
                name: node.name.clone(),
                condition: expression.clone(),
                then: branch_target(flow, node.id, EdgeHandle::Then),
                else_: branch_target(flow, node.id, EdgeHandle::Else),
                depends_on,
            }),
            NodeConfig::For {
                iter_count,
                error_handling,
            } => Step::For(ForStep {
                name: node.name.clone(),
                iter_count: *iter_count,
                loop_: branch_target(flow, node.id, EdgeHandle::Loop),
                error_handling: *error_handling,
                depends_on,
            }),
            NodeConfig::ForEach {
                items,
                error_handling,
            } => Step::ForEach(ForEachStep {
                name: node.name.clone(),
                items: items.clone(),
                loop_: branch_target(flow, node.id, EdgeHandle::Loop),
                error_handling: *error_handling,
                depends_on,
            }),
            NodeConfig::Js { code } => Step::Js(JsStep {
                name: node.name.clone(),
                code: code.clone(),
                depends_on,
            }),
        };
        steps.push(step);
    }

    Ok(FlowDef {
        name: flow.name.clone(),
        variables: flow
            .variables
            .iter()
            .map(|v| VariableDef {
                name: v.name.clone(),
                value: Value::String(v.value.clone()),
            })
            .collect(),
        steps,
    })
}

fn branch_target(flow: &Flow, source: Id, handle: EdgeHandle) -> Option<String> {
    flow.outgoing(source)
        .find(|e| e.handle == handle)
        .and_then(|e| flow.node(e.target_id))
        .map(|n| n.name.clone())
}

fn unique_name(node_name: &str, flow_name: &str, taken: &mut HashSet<String>) -> String {
    let mut candidate = node_name.to_string();
    if taken.contains(&candidate) {
        candidate = format!("{}-{}", flow_name, node_name);
    }
    let mut suffix = 2;
    let base = candidate.clone();
    while taken.contains(&candidate) {
        candidate = format!("{}-{}", base, suffix);
        suffix += 1;
    }
    taken.insert(candidate.clone());
    candidate
}

fn request_def(bundle: &WorkspaceBundle, node: &FlowNodeDef, name: &str) -> Result<RequestDef> {
    let template = bundle.request_template(&node.config)?;
    let to_map = |pairs: &[KeyValue]| -> BTreeMap<String, String> {
        pairs
            .iter()
            .filter(|kv| !kv.key.is_empty())
            .map(|kv| (kv.key.clone(), kv.value.clone()))
            .collect()
    };
    Ok(RequestDef {
        name: name.to_string(),
        method: Some(template.method).filter(|m| !m.is_empty()),
        url: Some(template.url).filter(|u| !u.is_empty()),
        headers: to_map(&template.headers),
        query_params: to_map(&template.query),
        body: body_value(&template.body),
    })
}

fn body_value(body: &str) -> Option<Value> {
    if body.is_empty() {
        return None;
    }
    match serde_json::from_str::<Value>(body) {
        Ok(value) if value.is_object() || value.is_array() => Some(value),
        _ => Some(Value::String(body.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::parser::import_workspace;

    const YAML: &str = r#"
workspace_name: demo
requests:
  - name: authed
    url: "http://api.local/items"
    headers:
      Authorization: "Bearer {{token}}"
flows:
  - name: main
    variables:
      - name: token
        value: abc
    steps:
      - request:
          name: list
          use_request: authed
          body:
            page: 1
      - if:
          name: check
          condition: "list.status == 200"
          then: done
      - js:
          name: done
          code: "true"
"#;

    #[test]
    fn test_export_preserves_placeholders() {
        let bundle = import_workspace(YAML).unwrap();
        let yaml = export_workspace(&bundle).unwrap();
        assert!(yaml.contains("Bearer {{token}}"));
        assert!(!yaml.contains("Bearer abc"));
    }

    #[test]
    fn test_export_shape() {
        let bundle = import_workspace(YAML).unwrap();
        let doc = to_document(&bundle).unwrap();
        assert_eq!(doc.requests.len(), 1);
        assert_eq!(doc.requests[0].name, "list");
        assert_eq!(doc.requests[0].method.as_deref(), Some("GET"));
        assert_eq!(doc.requests[0].body, Some(serde_json::json!({"page": 1})));

        let steps = &doc.flows[0].steps;
        assert_eq!(steps.len(), 3);
        assert!(steps[0].depends_on().is_empty());
        assert_eq!(steps[1].depends_on(), ["list".to_string()]);
        match &steps[1] {
            Step::If(s) => {
                assert_eq!(s.then.as_deref(), Some("done"));
                assert!(s.else_.is_none());
            }
            other => panic!("expected if step, got {:?}", other),
        }
        assert!(steps[2].depends_on().is_empty());
    }

    #[test]
    fn test_empty_fields_omitted() {
        let bundle = import_workspace(YAML).unwrap();
        let yaml = export_workspace(&bundle).unwrap();
        assert!(!yaml.contains("query_params"));
        assert!(!yaml.contains("depends_on: []"));
        assert!(!yaml.contains("else"));
    }

    #[test]
    fn test_unique_request_names() {
        let mut taken = HashSet::new();
        assert_eq!(unique_name("fetch", "a", &mut taken), "fetch");
        assert_eq!(unique_name("fetch", "b", &mut taken), "b-fetch");
        assert_eq!(unique_name("fetch", "b", &mut taken), "b-fetch-2");
    }
}
