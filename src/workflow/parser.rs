//! Simplified workspace YAML import.
//!
//! Turns a human-authored workspace document into the full node, edge,
//! endpoint and example graph. Request steps yield three example rows: the
//! authored base, a default with flow variables substituted, and a hidden
//! delta holding only the fields whose authored value differs from the default.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::layout::layout_flow;
use super::types::{
    Edge, EdgeHandle, Endpoint, Environment, ErrorHandling, Example, Flow, FlowNodeDef, KeyValue,
    NoOpKind, NodeConfig, Position, Variable, Workspace, WorkspaceBundle,
};
use super::validator::validate_flow;
use crate::error::{Error, Result};
use crate::id::Id;
use crate::nodes::template;

/// Name of the start node created for every imported flow.
pub const START_NODE_NAME: &str = "Start";

const DEFAULT_METHOD: &str = "GET";

/// Top-level simplified workspace document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SimplifiedWorkspace {
    pub workspace_name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requests: Vec<RequestDef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub request_templates: Vec<RequestDef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub environments: Vec<EnvironmentDef>,
    #[serde(default)]
    pub flows: Vec<FlowDef>,
}

/// Reusable request definition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestDef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub query_params: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentDef {
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub variables: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowDef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub variables: Vec<VariableDef>,
    #[serde(default, with = "serde_yaml::with::singleton_map_recursive")]
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableDef {
    pub name: String,
    #[serde(default)]
    pub value: Value,
}

/// One flow step. Unknown step kinds fail to parse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Request(RequestStep),
    If(IfStep),
    For(ForStep),
    ForEach(ForEachStep),
    Js(JsStep),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestStep {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_request: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub query_params: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IfStep {
    pub name: String,
    #[serde(alias = "expression")]
    pub condition: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub then: Option<String>,
    #[serde(rename = "else", default, skip_serializing_if = "Option::is_none")]
    pub else_: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ForStep {
    pub name: String,
    pub iter_count: i64,
    #[serde(rename = "loop", default, skip_serializing_if = "Option::is_none")]
    pub loop_: Option<String>,
    #[serde(default, skip_serializing_if = "is_throw")]
    pub error_handling: ErrorHandling,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ForEachStep {
    pub name: String,
    pub items: String,
    #[serde(rename = "loop", default, skip_serializing_if = "Option::is_none")]
    pub loop_: Option<String>,
    #[serde(default, skip_serializing_if = "is_throw")]
    pub error_handling: ErrorHandling,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JsStep {
    pub name: String,
    pub code: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
}

fn is_throw(mode: &ErrorHandling) -> bool {
    *mode == ErrorHandling::Throw
}

impl Step {
    pub fn name(&self) -> &str {
        match self {
            Step::Request(s) => &s.name,
            Step::If(s) => &s.name,
            Step::For(s) => &s.name,
            Step::ForEach(s) => &s.name,
            Step::Js(s) => &s.name,
        }
    }

    pub fn depends_on(&self) -> &[String] {
        match self {
            Step::Request(s) => &s.depends_on,
            Step::If(s) => &s.depends_on,
            Step::For(s) => &s.depends_on,
            Step::ForEach(s) => &s.depends_on,
            Step::Js(s) => &s.depends_on,
        }
    }

    /// Targets reached through `then`/`else`/`loop` handles.
    fn branch_targets(&self) -> Vec<(EdgeHandle, &str)> {
        let mut targets = Vec::new();
        match self {
            Step::If(s) => {
                if let Some(t) = non_empty(s.then.as_deref()) {
                    targets.push((EdgeHandle::Then, t));
                }
                if let Some(e) = non_empty(s.else_.as_deref()) {
                    targets.push((EdgeHandle::Else, e));
                }
            }
            Step::For(ForStep { loop_, .. }) | Step::ForEach(ForEachStep { loop_, .. }) => {
                if let Some(body) = non_empty(loop_.as_deref()) {
                    targets.push((EdgeHandle::Loop, body));
                }
            }
            Step::Request(_) | Step::Js(_) => {}
        }
        targets
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Parse a simplified workspace document without building the graph.
pub fn parse_document(yaml: &str) -> Result<SimplifiedWorkspace> {
    if yaml.trim().is_empty() {
        return Err(Error::InvalidInput("Empty workspace definition".to_string()));
    }

    let doc: SimplifiedWorkspace = serde_yaml::from_str(yaml).map_err(|e| {
        let msg = e.to_string();
        if let Some(field) = extract_missing_field(&msg) {
            Error::InvalidInput(format!("Missing required field: {}", field))
        } else {
            Error::InvalidInput(format!("Invalid YAML: {}", msg))
        }
    })?;

    if doc.workspace_name.trim().is_empty() {
        return Err(Error::InvalidInput("workspace_name is required".into()));
    }
    Ok(doc)
}

/// Import a simplified workspace YAML string into a full bundle.
pub fn import_workspace(yaml: &str) -> Result<WorkspaceBundle> {
    let doc = parse_document(yaml)?;
    build_bundle(&doc)
}

/// Import a simplified workspace from a file path.
pub fn import_workspace_file(path: &Path) -> Result<WorkspaceBundle> {
    let content = std::fs::read_to_string(path)?;
    import_workspace(&content)
}

fn extract_missing_field(error_message: &str) -> Option<&str> {
    let marker = "missing field `";
    let start = error_message.find(marker)? + marker.len();
    let rest = &error_message[start..];
    let end = rest.find('`')?;
    Some(&rest[..end])
}

/// Build the full graph from a parsed document.
pub fn build_bundle(doc: &SimplifiedWorkspace) -> Result<WorkspaceBundle> {
    let workspace = Workspace {
        id: Id::new(),
        name: doc.workspace_name.clone(),
    };
    let mut bundle = WorkspaceBundle {
        workspace: workspace.clone(),
        endpoints: Vec::new(),
        examples: Vec::new(),
        environments: Vec::new(),
        flows: Vec::new(),
    };

    let mut templates: HashMap<&str, &RequestDef> = HashMap::new();
    for def in doc.requests.iter().chain(doc.request_templates.iter()) {
        if templates.insert(def.name.as_str(), def).is_some() {
            return Err(Error::InvalidInput(format!(
                "Duplicate request definition: {}",
                def.name
            )));
        }
    }

    for env in &doc.environments {
        bundle.environments.push(Environment {
            id: Id::new(),
            name: env.name.clone(),
            variables: env
                .variables
                .iter()
                .map(|(name, value)| Variable {
                    name: name.clone(),
                    value: template::value_to_string(value),
                })
                .collect(),
        });
    }

    for flow_def in &doc.flows {
        let flow = FlowBuilder::new(workspace.id, flow_def, &templates, &mut bundle).build()?;
        bundle.flows.push(flow);
    }

    Ok(bundle)
}

struct FlowBuilder<'a> {
    flow: Flow,
    def: &'a FlowDef,
    templates: &'a HashMap<&'a str, &'a RequestDef>,
    bundle: &'a mut WorkspaceBundle,
    vars: Map<String, Value>,
    by_name: HashMap<String, usize>,
}

impl<'a> FlowBuilder<'a> {
    fn new(
        workspace_id: Id,
        def: &'a FlowDef,
        templates: &'a HashMap<&'a str, &'a RequestDef>,
        bundle: &'a mut WorkspaceBundle,
    ) -> Self {
        let variables: Vec<Variable> = def
            .variables
            .iter()
            .filter(|v| !v.name.trim().is_empty())
            .map(|v| Variable {
                name: v.name.clone(),
                value: template::value_to_string(&v.value),
            })
            .collect();
        let vars = variables
            .iter()
            .map(|v| (v.name.clone(), Value::String(v.value.clone())))
            .collect();
        Self {
            flow: Flow {
                id: Id::new(),
                workspace_id,
                name: def.name.clone(),
                variables,
                nodes: Vec::new(),
                edges: Vec::new(),
            },
            def,
            templates,
            bundle,
            vars,
            by_name: HashMap::new(),
        }
    }

    fn build(mut self) -> Result<Flow> {
        let def = self.def;
        if def.name.trim().is_empty() {
            return Err(Error::InvalidInput("Flow name is required".into()));
        }

        let start = self.push_node(
            START_NODE_NAME,
            NodeConfig::NoOp {
                subtype: NoOpKind::Start,
            },
        )?;

        for step in &def.steps {
            let config = self.node_config(step)?;
            self.push_node(step.name(), config)?;
        }

        let branch_targets: HashSet<&str> = def
            .steps
            .iter()
            .flat_map(|s| s.branch_targets().into_iter().map(|(_, t)| t))
            .collect();

        let mut previous = start;
        for step in &def.steps {
            let id = self.node_id(step.name())?;
            let deps: Vec<&str> = step
                .depends_on()
                .iter()
                .map(|d| d.trim())
                .filter(|d| !d.is_empty())
                .collect();

            if deps.is_empty() {
                if !branch_targets.contains(step.name()) {
                    self.push_edge(previous, id, EdgeHandle::Unspecified);
                }
            } else {
                for dep in deps {
                    let source = self.node_id(dep).map_err(|_| {
                        Error::InvalidInput(format!(
                            "Step '{}' depends on unknown step '{}'",
                            step.name(),
                            dep
                        ))
                    })?;
                    self.push_edge(source, id, EdgeHandle::Unspecified);
                }
            }

            for (handle, target) in step.branch_targets() {
                let target_id = self.node_id(target).map_err(|_| {
                    Error::InvalidInput(format!(
                        "Step '{}' references unknown step '{}'",
                        step.name(),
                        target
                    ))
                })?;
                self.push_edge(id, target_id, handle);
            }
            previous = id;
        }

        layout_flow(&mut self.flow);
        validate_flow(&self.flow)?;
        Ok(self.flow)
    }

    fn push_node(&mut self, name: &str, config: NodeConfig) -> Result<Id> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::InvalidInput(format!(
                "Step in flow '{}' is missing a name",
                self.def.name
            )));
        }
        if self.by_name.contains_key(name) {
            return Err(Error::InvalidInput(format!(
                "Duplicate step name '{}' in flow '{}'",
                name, self.def.name
            )));
        }
        let id = Id::new();
        self.by_name.insert(name.to_string(), self.flow.nodes.len());
        self.flow.nodes.push(FlowNodeDef {
            id,
            flow_id: self.flow.id,
            name: name.to_string(),
            config,
            position: Position::default(),
        });
        Ok(id)
    }

    fn push_edge(&mut self, source_id: Id, target_id: Id, handle: EdgeHandle) {
        self.flow.edges.push(Edge {
            id: Id::new(),
            flow_id: self.flow.id,
            source_id,
            target_id,
            handle,
        });
    }

    fn node_id(&self, name: &str) -> Result<Id> {
        self.by_name
            .get(name.trim())
            .map(|i| self.flow.nodes[*i].id)
            .ok_or_else(|| Error::InvalidInput(format!("Unknown step '{}'", name)))
    }

    fn node_config(&mut self, step: &Step) -> Result<NodeConfig> {
        Ok(match step {
            Step::Request(req) => self.request_config(req)?,
            Step::If(s) => NodeConfig::Condition {
                expression: s.condition.clone(),
            },
            Step::For(s) => NodeConfig::For {
                iter_count: s.iter_count,
                error_handling: s.error_handling,
            },
            Step::ForEach(s) => NodeConfig::ForEach {
                items: s.items.clone(),
                error_handling: s.error_handling,
            },
            Step::Js(s) => NodeConfig::Js {
                code: s.code.clone(),
            },
        })
    }

    fn request_config(&mut self, step: &RequestStep) -> Result<NodeConfig> {
        let base = match non_empty(step.use_request.as_deref()) {
            Some(name) => Some(*self.templates.get(name).ok_or_else(|| {
                Error::InvalidInput(format!(
                    "Step '{}' uses unknown request '{}'",
                    step.name, name
                ))
            })?),
            None => None,
        };

        let method = non_empty(step.method.as_deref())
            .or_else(|| base.and_then(|b| non_empty(b.method.as_deref())))
            .unwrap_or(DEFAULT_METHOD)
            .to_uppercase();
        let url = non_empty(step.url.as_deref())
            .or_else(|| base.and_then(|b| non_empty(b.url.as_deref())))
            .unwrap_or_default()
            .to_string();

        let mut headers = base.map(|b| b.headers.clone()).unwrap_or_default();
        headers.extend(step.headers.clone());
        let mut query = base.map(|b| b.query_params.clone()).unwrap_or_default();
        query.extend(step.query_params.clone());
        let body = step
            .body
            .as_ref()
            .or_else(|| base.and_then(|b| b.body.as_ref()))
            .map(body_to_string)
            .unwrap_or_default();

        let resolved_url = template::render(&url, &self.vars);
        let resolved_method = template::render(&method, &self.vars);

        let endpoint = Endpoint {
            id: Id::new(),
            name: step.name.clone(),
            method: resolved_method.clone(),
            url: resolved_url.clone(),
            delta_parent_id: None,
            hidden: false,
        };
        let delta_endpoint = (resolved_url != url || resolved_method != method).then(|| Endpoint {
            id: Id::new(),
            name: step.name.clone(),
            method: method.clone(),
            url: url.clone(),
            delta_parent_id: Some(endpoint.id),
            hidden: true,
        });

        let to_pairs = |map: &BTreeMap<String, String>| -> Vec<KeyValue> {
            map.iter()
                .filter(|(k, _)| !k.trim().is_empty())
                .map(|(k, v)| KeyValue::new(k.clone(), v.clone()))
                .collect()
        };
        let render_pairs = |pairs: &[KeyValue], vars: &Map<String, Value>| -> Vec<KeyValue> {
            pairs
                .iter()
                .map(|kv| KeyValue::new(kv.key.clone(), template::render(&kv.value, vars)))
                .collect()
        };

        let base_headers = to_pairs(&headers);
        let base_query = to_pairs(&query);

        let base_example = Example {
            id: Id::new(),
            endpoint_id: endpoint.id,
            name: step.name.clone(),
            headers: base_headers.clone(),
            query: base_query.clone(),
            body: body.clone(),
            is_default: true,
            delta_parent_id: None,
            version_parent_id: None,
            hidden: false,
        };
        let default_example = Example {
            id: Id::new(),
            endpoint_id: endpoint.id,
            name: step.name.clone(),
            headers: render_pairs(&base_headers, &self.vars),
            query: render_pairs(&base_query, &self.vars),
            body: template::render(&body, &self.vars),
            is_default: false,
            delta_parent_id: None,
            version_parent_id: Some(base_example.id),
            hidden: false,
        };

        let differing = |authored: &[KeyValue], resolved: &[KeyValue]| -> Vec<KeyValue> {
            authored
                .iter()
                .zip(resolved.iter())
                .filter(|(a, r)| a.value != r.value)
                .map(|(a, _)| a.clone())
                .collect()
        };
        let delta_headers = differing(&base_headers, &default_example.headers);
        let delta_query = differing(&base_query, &default_example.query);
        let delta_body = if body != default_example.body {
            body.clone()
        } else {
            String::new()
        };
        let delta_example = (!delta_headers.is_empty()
            || !delta_query.is_empty()
            || !delta_body.is_empty())
        .then(|| Example {
            id: Id::new(),
            endpoint_id: delta_endpoint.as_ref().map(|e| e.id).unwrap_or(endpoint.id),
            name: step.name.clone(),
            headers: delta_headers,
            query: delta_query,
            body: delta_body,
            is_default: false,
            delta_parent_id: Some(default_example.id),
            version_parent_id: None,
            hidden: true,
        });

        let config = NodeConfig::Request {
            endpoint_id: endpoint.id,
            example_id: base_example.id,
            delta_endpoint_id: delta_endpoint.as_ref().map(|e| e.id),
            delta_example_id: delta_example.as_ref().map(|e| e.id),
        };

        self.bundle.endpoints.push(endpoint);
        self.bundle.endpoints.extend(delta_endpoint);
        self.bundle.examples.push(base_example);
        self.bundle.examples.push(default_example);
        self.bundle.examples.extend(delta_example);
        Ok(config)
    }
}

/// Raw request body: strings verbatim, anything else as JSON text.
fn body_to_string(body: &Value) -> String {
    match body {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
