//! Node runtime contract: the trait every flow node implements and the
//! request/result/status types that travel between nodes and the scheduler.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::template;
use crate::error::{Error, ErrorKind};
use crate::id::Id;
use crate::storage::ExampleResponse;
use crate::workflow::{EdgeHandle, NodeKind, NodeState};

/// Runtime nodes of one flow, keyed by node id.
pub type NodeMap = HashMap<Id, Arc<dyn FlowNode>>;

/// Outgoing edges grouped by source node and handle.
pub type EdgeMap = HashMap<Id, HashMap<EdgeHandle, Vec<Id>>>;

/// Position of a status inside nested loops.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IterationContext {
    pub iteration_path: Vec<usize>,
    pub execution_index: usize,
}

/// One iteration of the nearest enclosing loop. Every node invocation inside
/// the iteration draws the next `execution_index` from the shared counter.
#[derive(Debug, Clone)]
pub struct IterationScope {
    path: Vec<usize>,
    counter: Arc<AtomicUsize>,
}

impl IterationScope {
    /// Scope for iteration `index` nested under `parent`.
    pub fn child(parent: Option<&IterationScope>, index: usize) -> Self {
        let mut path = parent.map(|p| p.path.clone()).unwrap_or_default();
        path.push(index);
        Self {
            path,
            counter: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn path(&self) -> &[usize] {
        &self.path
    }

    /// Context for the next invocation inside this iteration.
    pub fn next_context(&self) -> IterationContext {
        IterationContext {
            iteration_path: self.path.clone(),
            execution_index: self.counter.fetch_add(1, Ordering::SeqCst),
        }
    }
}

/// Error attached to a node status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeError {
    pub kind: ErrorKind,
    pub message: String,
}

impl NodeError {
    pub fn is_cancellation(&self) -> bool {
        self.kind == ErrorKind::Cancelled
    }
}

impl From<&Error> for NodeError {
    fn from(err: &Error) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl std::fmt::Display for NodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

/// A state transition reported by a node invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub execution_id: Id,
    pub node_id: Id,
    pub name: String,
    pub kind: NodeKind,
    pub state: NodeState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<NodeError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration: Option<IterationContext>,
}

impl NodeStatus {
    pub fn new(execution_id: Id, node_id: Id, name: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            execution_id,
            node_id,
            name: name.into(),
            kind,
            state: NodeState::Running,
            input: None,
            output: None,
            error: None,
            iteration: None,
        }
    }

    pub fn with_state(mut self, state: NodeState) -> Self {
        self.state = state;
        self
    }

    pub fn with_input(mut self, input: Option<Value>) -> Self {
        self.input = input;
        self
    }

    pub fn with_output(mut self, output: Value) -> Self {
        self.output = Some(output);
        self
    }

    pub fn with_error(mut self, error: &Error) -> Self {
        self.error = Some(NodeError::from(error));
        self
    }

    pub fn with_iteration(mut self, iteration: Option<IterationContext>) -> Self {
        self.iteration = iteration;
        self
    }

    /// Key of the output map, if present.
    pub fn output_field(&self, key: &str) -> Option<&Value> {
        self.output.as_ref().and_then(|o| o.get(key))
    }
}

/// Push side of the status channel.
#[derive(Clone)]
pub struct StatusSender {
    tx: mpsc::Sender<NodeStatus>,
}

impl StatusSender {
    pub fn new(tx: mpsc::Sender<NodeStatus>) -> Self {
        Self { tx }
    }

    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<NodeStatus>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self::new(tx), rx)
    }

    pub async fn push(&self, status: NodeStatus) {
        if let Err(e) = self.tx.send(status).await {
            debug!(execution_id = %e.0.execution_id, "Status dropped, consumer gone");
        }
    }
}

/// A response captured by a request node, delivered on the response side channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseEvent {
    pub execution_id: Id,
    pub response: ExampleResponse,
}

/// Variables a node read during one invocation, recorded as its input.
#[derive(Debug, Clone, Default)]
pub struct ReadTracker {
    reads: Arc<Mutex<Map<String, Value>>>,
}

impl ReadTracker {
    pub fn record(&self, key: &str, value: &Value) {
        if let Ok(mut reads) = self.reads.lock() {
            reads.insert(key.to_string(), value.clone());
        }
    }

    /// Reads so far, or `None` if the node read nothing.
    pub fn snapshot(&self) -> Option<Value> {
        let reads = self.reads.lock().ok()?;
        if reads.is_empty() {
            None
        } else {
            Some(Value::Object(reads.clone()))
        }
    }
}

/// Everything a node invocation can see.
#[derive(Clone)]
pub struct RunRequest {
    pub variables: Arc<RwLock<Map<String, Value>>>,
    pub nodes: Arc<NodeMap>,
    pub edges: Arc<EdgeMap>,
    pub status: StatusSender,
    pub responses: mpsc::Sender<ResponseEvent>,
    pub cancel: CancellationToken,
    /// Execution id of the current invocation; zero outside one.
    pub execution_id: Id,
    /// Enclosing loop iteration, if any.
    pub iteration: Option<IterationScope>,
    /// Context assigned to the current invocation.
    pub iteration_context: Option<IterationContext>,
    pub reads: ReadTracker,
}

impl RunRequest {
    pub fn new(
        variables: Map<String, Value>,
        nodes: NodeMap,
        edges: EdgeMap,
        status: StatusSender,
        responses: mpsc::Sender<ResponseEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            variables: Arc::new(RwLock::new(variables)),
            nodes: Arc::new(nodes),
            edges: Arc::new(edges),
            status,
            responses,
            cancel,
            execution_id: Id::ZERO,
            iteration: None,
            iteration_context: None,
            reads: ReadTracker::default(),
        }
    }

    /// Targets of `node_id`'s edges with `handle`.
    pub fn targets(&self, node_id: Id, handle: EdgeHandle) -> Vec<Id> {
        self.edges
            .get(&node_id)
            .and_then(|by_handle| by_handle.get(&handle))
            .cloned()
            .unwrap_or_default()
    }

    /// Request for the body of iteration `index` of the current loop.
    pub fn for_iteration(&self, index: usize) -> Self {
        let mut req = self.clone();
        req.iteration = Some(IterationScope::child(self.iteration.as_ref(), index));
        req.iteration_context = None;
        req.execution_id = Id::ZERO;
        req.reads = ReadTracker::default();
        req
    }

    /// Render `{{ path }}` placeholders against the variable map, recording reads.
    pub async fn resolve(&self, input: &str) -> String {
        if !template::has_placeholders(input) {
            return input.to_string();
        }
        let vars = self.variables.read().await;
        template::render_with(input, |path| {
            let value = template::lookup(&vars, path)?;
            self.reads.record(path, value);
            Some(template::value_to_string(value))
        })
    }

    /// Look up a variable by dotted path, recording the read.
    pub async fn variable(&self, path: &str) -> Option<Value> {
        let vars = self.variables.read().await;
        let value = template::lookup(&vars, path)?.clone();
        self.reads.record(path, &value);
        Some(value)
    }

    /// Copy of the variable map. Variables named in `source` are recorded as reads.
    pub async fn scope_for(&self, source: &str) -> Map<String, Value> {
        let vars = self.variables.read().await;
        for (name, value) in vars.iter() {
            if source.contains(name.as_str()) {
                self.reads.record(name, value);
            }
        }
        vars.clone()
    }

    /// Publish a node's output under `name`.
    pub async fn publish(&self, name: &str, value: Value) {
        self.variables.write().await.insert(name.to_string(), value);
    }
}

/// Outcome of one node invocation.
#[derive(Debug, Default)]
pub struct RunResult {
    /// Nodes selected to run next.
    pub next: Vec<Id>,
    pub output: Option<Value>,
    pub error: Option<Error>,
}

impl RunResult {
    pub fn next(next: Vec<Id>) -> Self {
        Self {
            next,
            ..Default::default()
        }
    }

    pub fn with_output(mut self, output: Value) -> Self {
        self.output = Some(output);
        self
    }

    pub fn failed(error: Error) -> Self {
        Self {
            error: Some(error),
            ..Default::default()
        }
    }

    /// Terminal state this result maps to.
    pub fn state(&self) -> NodeState {
        match &self.error {
            None => NodeState::Success,
            Some(e) if e.is_cancellation() => NodeState::Canceled,
            Some(_) => NodeState::Failure,
        }
    }
}

/// A finished invocation delivered on the scheduler's result channel.
#[derive(Debug)]
pub struct RunOutcome {
    pub execution_id: Id,
    pub result: RunResult,
}

/// Trait that all flow nodes implement.
#[async_trait]
pub trait FlowNode: Send + Sync {
    fn id(&self) -> Id;

    fn name(&self) -> &str;

    fn kind(&self) -> NodeKind;

    /// Run the node to completion.
    async fn run_sync(&self, req: &RunRequest) -> RunResult;

    /// Run the node and deliver its outcome on `results`.
    async fn run_async(&self, req: &RunRequest, results: mpsc::UnboundedSender<RunOutcome>) {
        let result = self.run_sync(req).await;
        let outcome = RunOutcome {
            execution_id: req.execution_id,
            result,
        };
        if results.send(outcome).is_err() {
            debug!(node = %self.name(), "Scheduler gone before result delivery");
        }
    }
}
