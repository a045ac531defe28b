//! Flow run controller.
//!
//! One run owns its channels, coordinator and cancellation token:
//!
//! ```text
//! scheduler ──status──▶ status consumer ──▶ durable writer
//!     │                      │   └────────▶ coordinator (request nodes)
//!     │                      ├──stream────▶ stream sender ──▶ client
//!     │                      └──logs──────▶ log sender ──▶ LogSink
//!     └──responses──▶ response consumer ──▶ response store, coordinator
//! ```
//!
//! Persistence never observes the run's cancellation token: every row that
//! was opened is closed before the run returns, even after the client went
//! away.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::coordinator::Coordinator;
use super::logref::{self, LogEntry, LogSink, TracingLogSink};
use super::scheduler;
use super::transport::{run_stream_sender, FlowRunResponse, FlowRunStream, Outbound};
use super::visibility;
use crate::auth::{AllowAll, Authorizer};
use crate::config::RunConfig;
use crate::error::{Error, Result};
use crate::id::Id;
use crate::metrics;
use crate::nodes::{edge_map, NodeRegistry, NodeStatus, ResponseEvent, RunRequest, StatusSender};
use crate::storage::{DurableWriter, ExecutionStore, FlowRepository, NodeExecution, ResponseStore};
use crate::workflow::{validate_flow, Flow, NodeKind, NodeState, WorkspaceBundle};

/// Reserved flow variable holding the run deadline in seconds.
pub const TIMEOUT_VARIABLE: &str = "timeout";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FlowRunRequest {
    pub flow_id: Id,
    pub environment_id: Option<Id>,
}

impl FlowRunRequest {
    pub fn new(flow_id: Id) -> Self {
        Self {
            flow_id,
            environment_id: None,
        }
    }

    pub fn with_environment(mut self, environment_id: Id) -> Self {
        self.environment_id = Some(environment_id);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowOutcome {
    Success,
    Failure,
    Canceled,
}

impl FlowOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowOutcome::Success => "success",
            FlowOutcome::Failure => "failure",
            FlowOutcome::Canceled => "canceled",
        }
    }
}

/// Result of a successful run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub flow_id: Id,
    pub outcome: FlowOutcome,
    pub streamed: usize,
    pub closed_on_teardown: usize,
    pub duration_ms: u64,
}

/// Running records not yet closed, shared between the status consumer and
/// teardown.
type OpenRecords = Arc<Mutex<HashMap<Id, NodeExecution>>>;

#[derive(Clone)]
struct Sinks {
    writer: DurableWriter,
    coordinator: Arc<Coordinator>,
    outbound: mpsc::Sender<Outbound>,
    logs: mpsc::Sender<LogEntry>,
    open: OpenRecords,
}

impl Sinks {
    async fn stream(&self, record: &NodeExecution) {
        if self
            .outbound
            .send(Outbound::Response(FlowRunResponse::node(record)))
            .await
            .is_err()
        {
            debug!(execution_id = %record.id, "Stream sender gone");
        }
    }

    async fn persist(&self, record: &NodeExecution) {
        if let Err(e) = self.writer.upsert(record).await {
            warn!(execution_id = %record.id, node = %record.name, error = %e, "Failed to persist node execution");
        }
    }

    /// Fold `status` into the open record for its execution. Terminal
    /// statuses close the record and take it out of the open set.
    fn apply(&self, status: &NodeStatus) -> NodeExecution {
        let mut open = match self.open.lock() {
            Ok(open) => open,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut record = open.remove(&status.execution_id).unwrap_or_else(|| {
            NodeExecution::running(status.execution_id, status.node_id, status.name.clone())
        });
        fill(&mut record, status);
        if !status.state.is_terminal() {
            open.insert(record.id, record.clone());
        }
        record
    }

    async fn handle_request(&self, status: &NodeStatus) {
        if status.state.is_terminal() {
            let outcome = self
                .coordinator
                .complete(status.execution_id, |record| fill(record, status))
                .await;
            if let Err(e) = outcome {
                warn!(execution_id = %status.execution_id, error = %e, "Failed to complete request execution");
            }
            return;
        }

        let mut record =
            NodeExecution::running(status.execution_id, status.node_id, status.name.clone());
        fill(&mut record, status);
        if let Err(e) = self.coordinator.register(record.clone()).await {
            warn!(execution_id = %status.execution_id, error = %e, "Failed to register request execution");
        }
        self.stream(&record).await;
    }

    async fn handle(&self, status: NodeStatus) {
        let visibility = visibility::decide(&status);

        if status.kind == NodeKind::Request {
            self.handle_request(&status).await;
        } else {
            let record = self.apply(&status);
            if visibility.persist {
                self.persist(&record).await;
            }
            if visibility.stream {
                self.stream(&record).await;
            }
        }

        if status.state.is_terminal() && visibility.stream {
            if self.logs.send(logref::log_entry(&status)).await.is_err() {
                debug!(execution_id = %status.execution_id, "Log sender gone");
            }
        }
    }
}

fn fill(record: &mut NodeExecution, status: &NodeStatus) {
    record.name = status.name.clone();
    if status.input.is_some() {
        record.input = status.input.clone();
    }
    if status.output.is_some() {
        record.output = status.output.clone();
    }
    if status.state.is_terminal() {
        record.close(status.state, status.error.as_ref().map(|e| e.message.clone()));
    } else {
        record.state = status.state;
    }
}

async fn consume_statuses(mut rx: mpsc::Receiver<NodeStatus>, sinks: Sinks) {
    while let Some(status) = rx.recv().await {
        sinks.handle(status).await;
    }
}

async fn consume_responses(
    mut rx: mpsc::Receiver<ResponseEvent>,
    coordinator: Arc<Coordinator>,
    store: Arc<dyn ResponseStore>,
) {
    while let Some(event) = rx.recv().await {
        let execution_id = event.execution_id;
        if let Err(e) = coordinator
            .record_response(execution_id, &event.response, false)
            .await
        {
            warn!(execution_id = %execution_id, error = %e, "Failed to attach response");
        }
        match store.save_response(&event.response).await {
            Ok(()) => {
                if let Err(e) = coordinator.mark_response_persisted(execution_id).await {
                    warn!(execution_id = %execution_id, error = %e, "Failed to mark response persisted");
                }
            }
            Err(e) => {
                warn!(execution_id = %execution_id, error = %e, "Failed to save response");
            }
        }
    }
}

async fn send_logs(mut rx: mpsc::Receiver<LogEntry>, sink: Arc<dyn LogSink>) {
    while let Some(entry) = rx.recv().await {
        sink.emit(&entry);
    }
}

/// Wait for `task`, aborting it when `limit` runs out.
async fn join_within<T>(
    task: &mut JoinHandle<T>,
    limit: Option<Duration>,
    what: &str,
) -> Option<T> {
    let joined = match limit {
        Some(limit) => match tokio::time::timeout(limit, &mut *task).await {
            Ok(joined) => joined,
            Err(_) => {
                warn!("{} did not stop within {:?}, aborting", what, limit);
                task.abort();
                return None;
            }
        },
        None => (&mut *task).await,
    };
    match joined {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("{} task failed: {}", what, e);
            None
        }
    }
}

/// Variables visible at the start of a run: environment first, then flow
/// variables on top.
fn initial_variables(bundle: &WorkspaceBundle, flow: &Flow, environment_id: Option<Id>) -> Result<Map<String, Value>> {
    let mut variables = Map::new();
    if let Some(id) = environment_id {
        let environment = bundle
            .environment(id)
            .ok_or_else(|| Error::NotFound(format!("environment {}", id)))?;
        for var in &environment.variables {
            variables.insert(var.name.clone(), Value::String(var.value.clone()));
        }
    }
    for var in &flow.variables {
        variables.insert(var.name.clone(), Value::String(var.value.clone()));
    }
    Ok(variables)
}

/// Run deadline from the reserved `timeout` variable.
fn run_deadline(variables: &Map<String, Value>, default: Duration) -> Duration {
    let seconds = match variables.get(TIMEOUT_VARIABLE) {
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        Some(Value::Number(n)) => n.as_f64(),
        _ => None,
    };
    match seconds {
        Some(s) if s.is_finite() && s > 0.0 => Duration::from_secs_f64(s),
        Some(_) => {
            warn!("Ignoring invalid '{}' variable", TIMEOUT_VARIABLE);
            default
        }
        None => default,
    }
}

/// Runs flows end to end.
#[derive(Clone)]
pub struct FlowRunner {
    repo: Arc<dyn FlowRepository>,
    executions: Arc<dyn ExecutionStore>,
    responses: Arc<dyn ResponseStore>,
    authorizer: Arc<dyn Authorizer>,
    registry: NodeRegistry,
    log_sink: Arc<dyn LogSink>,
    config: RunConfig,
}

impl FlowRunner {
    pub fn new(
        repo: Arc<dyn FlowRepository>,
        executions: Arc<dyn ExecutionStore>,
        responses: Arc<dyn ResponseStore>,
        registry: NodeRegistry,
        config: RunConfig,
    ) -> Self {
        Self {
            repo,
            executions,
            responses,
            authorizer: Arc::new(AllowAll),
            registry,
            log_sink: Arc::new(TracingLogSink),
            config,
        }
    }

    pub fn with_authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }

    pub fn with_log_sink(mut self, log_sink: Arc<dyn LogSink>) -> Self {
        self.log_sink = log_sink;
        self
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Run `request.flow_id`, streaming node states into `stream`.
    ///
    /// Setup errors (unknown flow, access denied, invalid graph) return
    /// before any state is touched. A failing node yields
    /// `Error::NodeFailure`; client disconnect, `cancel` and the run
    /// deadline yield `Error::Cancelled`. In every case no execution row is
    /// left `running` once this returns.
    #[instrument(name = "flow.run", skip(self, stream, cancel), fields(flow_id = %request.flow_id))]
    pub async fn run(
        &self,
        request: FlowRunRequest,
        stream: Box<dyn FlowRunStream>,
        cancel: CancellationToken,
    ) -> Result<RunSummary> {
        let started = Instant::now();

        let bundle = self.repo.workspace_for_flow(request.flow_id).await?;
        self.authorizer.authorize(&bundle.workspace)?;
        let flow = bundle
            .flow(request.flow_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("flow {}", request.flow_id)))?;
        validate_flow(&flow)?;
        let variables = initial_variables(&bundle, &flow, request.environment_id)?;
        let nodes = self.registry.node_map(&flow, &bundle)?;
        let start = flow.start_node()?.id;

        if let Err(e) = self.executions.delete_by_node_ids(&flow.node_ids()).await {
            warn!(error = %e, "Failed to delete prior executions, continuing");
        }

        let run_cancel = cancel.child_token();
        let deadline = run_deadline(&variables, self.config.default_timeout());
        let timed_out = Arc::new(AtomicBool::new(false));
        let timer = {
            let token = run_cancel.clone();
            let flag = timed_out.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = tokio::time::sleep(deadline) => {
                        warn!(deadline_ms = deadline.as_millis() as u64, "Flow run deadline reached");
                        flag.store(true, Ordering::SeqCst);
                        token.cancel();
                    }
                }
            })
        };

        let (status_tx, status_rx) = StatusSender::channel(self.config.status_buffer);
        let (response_tx, response_rx) = mpsc::channel(self.config.status_buffer.max(1));
        let (outbound_tx, outbound_rx) = mpsc::channel(self.config.stream_buffer.max(1));
        let (log_tx, log_rx) = mpsc::channel(self.config.stream_buffer.max(1));

        let writer = DurableWriter::new(self.executions.clone())
            .with_deadline(self.config.persist_deadline());
        let coordinator = Arc::new(Coordinator::new(writer.clone(), outbound_tx.clone()));
        let open: OpenRecords = Arc::new(Mutex::new(HashMap::new()));
        let sinks = Sinks {
            writer: writer.clone(),
            coordinator: coordinator.clone(),
            outbound: outbound_tx.clone(),
            logs: log_tx,
            open: open.clone(),
        };

        let stream_task = tokio::spawn(run_stream_sender(stream, outbound_rx, run_cancel.clone()));
        let log_task = tokio::spawn(send_logs(log_rx, self.log_sink.clone()));
        let mut status_task = tokio::spawn(consume_statuses(status_rx, sinks));
        let mut response_task = tokio::spawn(consume_responses(
            response_rx,
            coordinator.clone(),
            self.responses.clone(),
        ));

        let root = RunRequest::new(
            variables,
            nodes,
            edge_map(&flow),
            status_tx,
            response_tx,
            run_cancel.clone(),
        );
        info!(flow = %flow.name, nodes = flow.nodes.len(), "Starting flow run");
        let mut scheduler_task = tokio::spawn(scheduler::run_flow(root, start));

        let grace = self.config.shutdown_grace();
        let scheduled = tokio::select! {
            joined = &mut scheduler_task => Some(joined),
            _ = run_cancel.cancelled() => None,
        };
        let (scheduled, scheduler_stopped): (Result<()>, bool) = match scheduled {
            Some(Ok(result)) => (result, true),
            Some(Err(e)) => (
                Err(Error::Internal(format!("scheduler task failed: {}", e))),
                true,
            ),
            None => match join_within(&mut scheduler_task, Some(grace), "Scheduler").await {
                Some(result) => (result, true),
                None => (
                    Err(Error::cancelled("flow run aborted after grace period")),
                    false,
                ),
            },
        };

        run_cancel.cancel();
        let _ = timer.await;
        // Once the scheduler is gone every status sender is dropped and the
        // consumers drain to completion; after an abort, bound the wait.
        let consumer_limit = if scheduler_stopped { None } else { Some(grace) };
        join_within(&mut status_task, consumer_limit, "Status consumer").await;
        join_within(&mut response_task, consumer_limit, "Response consumer").await;

        let timed_out = timed_out.load(Ordering::SeqCst);
        let message = if timed_out {
            "flow run timed out"
        } else {
            "flow run canceled"
        };

        let leftovers: Vec<NodeExecution> = match open.lock() {
            Ok(mut open) => open.drain().map(|(_, record)| record).collect(),
            Err(poisoned) => poisoned.into_inner().drain().map(|(_, record)| record).collect(),
        };
        let mut closed_on_teardown = leftovers.len();
        for mut record in leftovers {
            record.close(NodeState::Canceled, Some(message.to_string()));
            if let Err(e) = writer.upsert(&record).await {
                warn!(execution_id = %record.id, error = %e, "Failed to close running execution");
            }
            if outbound_tx
                .send(Outbound::Response(FlowRunResponse::node(&record)))
                .await
                .is_err()
            {
                debug!(execution_id = %record.id, "Stream sender gone");
            }
        }
        match coordinator.cancel_incomplete(message).await {
            Ok(closed) => closed_on_teardown += closed,
            Err(e) => warn!(error = %e, "Failed to close request executions"),
        }
        if let Err(e) = coordinator.flush().await {
            warn!(error = %e, "Failed to flush coordinator");
        }
        if outbound_tx
            .send(Outbound::Finish { flow_id: flow.id })
            .await
            .is_err()
        {
            debug!(flow_id = %flow.id, "Stream sender gone before version marker");
        }
        drop(outbound_tx);
        drop(coordinator);

        let report = stream_task
            .await
            .map_err(|e| Error::Internal(format!("stream sender failed: {}", e)))?;
        let _ = log_task.await;

        let error = if let Some(e) = report.error {
            Some(Error::cancelled(format!("client disconnected: {}", e)))
        } else if timed_out {
            Some(Error::cancelled(message))
        } else {
            match scheduled {
                Err(e) if e.is_cancellation() => Some(e),
                Err(e) => Some(Error::NodeFailure(e.to_string())),
                Ok(()) if cancel.is_cancelled() => Some(Error::cancelled(message)),
                Ok(()) => None,
            }
        };

        let outcome = match &error {
            None => FlowOutcome::Success,
            Some(e) if e.is_cancellation() => FlowOutcome::Canceled,
            Some(_) => FlowOutcome::Failure,
        };
        metrics::record_flow_run(outcome.as_str());
        let duration_ms = started.elapsed().as_millis() as u64;
        info!(
            outcome = outcome.as_str(),
            streamed = report.sent,
            closed_on_teardown,
            duration_ms,
            "Flow run finished"
        );

        match error {
            Some(e) => Err(e),
            None => Ok(RunSummary {
                flow_id: flow.id,
                outcome,
                streamed: report.sent,
                closed_on_teardown,
                duration_ms,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HttpConfig;
    use crate::engine::logref::CollectingLogSink;
    use crate::engine::transport::{ChannelStream, FlowNodeState};
    use crate::error::ErrorKind;
    use crate::storage::SqliteStorage;
    use crate::workflow::import_workspace;

    async fn runner_with(yaml: &str) -> (FlowRunner, Arc<SqliteStorage>, WorkspaceBundle) {
        let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
        let bundle = import_workspace(yaml).unwrap();
        storage.save_workspace(&bundle).await.unwrap();
        let runner = FlowRunner::new(
            storage.clone(),
            storage.clone(),
            storage.clone(),
            NodeRegistry::new(&HttpConfig::default()),
            RunConfig::default(),
        );
        (runner, storage, bundle)
    }

    fn collect(mut rx: mpsc::UnboundedReceiver<FlowRunResponse>) -> Vec<FlowRunResponse> {
        let mut items = Vec::new();
        while let Ok(item) = rx.try_recv() {
            items.push(item);
        }
        items
    }

    #[test]
    fn test_run_deadline_from_variable() {
        let default = Duration::from_secs(60);
        let mut vars = Map::new();
        assert_eq!(run_deadline(&vars, default), default);
        vars.insert("timeout".into(), Value::String("1.5".into()));
        assert_eq!(run_deadline(&vars, default), Duration::from_millis(1500));
        vars.insert("timeout".into(), Value::String("-3".into()));
        assert_eq!(run_deadline(&vars, default), default);
    }

    #[tokio::test]
    async fn test_successful_loop_hides_main_row_but_persists_it() {
        let (runner, storage, bundle) = runner_with(
            r#"
workspace_name: W
flows:
  - name: main
    steps:
      - for: { name: L, iter_count: 3, loop: body }
      - js: { name: body, code: "L.index" }
"#,
        )
        .await;
        let sink = Arc::new(CollectingLogSink::default());
        let runner = runner.with_log_sink(sink.clone());
        let flow = &bundle.flows[0];
        let loop_id = flow.node_by_name("L").unwrap().id;

        let (stream, rx) = ChannelStream::new();
        runner
            .run(FlowRunRequest::new(flow.id), Box::new(stream), CancellationToken::new())
            .await
            .unwrap();

        let items = collect(rx);
        let loop_states: Vec<FlowNodeState> = items
            .iter()
            .filter_map(|item| match item {
                FlowRunResponse::Node { node_id, state, .. } if *node_id == loop_id => Some(*state),
                _ => None,
            })
            .collect();
        assert_eq!(loop_states, vec![FlowNodeState::Running]);
        assert_eq!(items.last().unwrap().kind(), "version");

        let rows = storage.list_by_node(loop_id).await.unwrap();
        // main row plus one row per iteration
        assert_eq!(rows.len(), 4);
        assert!(rows.iter().all(|r| r.state == NodeState::Success));
        assert_eq!(rows.iter().filter(|r| r.name != "L").count(), 3);
        assert!(!sink.entries().is_empty());
    }

    #[tokio::test]
    async fn test_failing_node_is_node_failure() {
        let (runner, storage, bundle) = runner_with(
            r#"
workspace_name: W
flows:
  - name: main
    steps:
      - js: { name: broken, code: "missing_var + 1" }
"#,
        )
        .await;
        let flow = &bundle.flows[0];
        let (stream, _rx) = ChannelStream::new();
        let err = runner
            .run(FlowRunRequest::new(flow.id), Box::new(stream), CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NodeFailure);

        let id = flow.node_by_name("broken").unwrap().id;
        let rows = storage.list_by_node(id).await.unwrap();
        assert_eq!(rows[0].state, NodeState::Failure);
        assert!(rows[0].error.is_some());
    }

    #[tokio::test]
    async fn test_timeout_variable_cancels_run() {
        let (runner, storage, bundle) = runner_with(
            r#"
workspace_name: W
flows:
  - name: main
    variables:
      - { name: timeout, value: "0.2" }
    steps:
      - for: { name: L, iter_count: 1000000, loop: body }
      - js: { name: body, code: "L.index" }
"#,
        )
        .await;
        let flow = &bundle.flows[0];
        let (stream, _rx) = ChannelStream::new();
        let err = runner
            .run(FlowRunRequest::new(flow.id), Box::new(stream), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_cancellation());

        let states = storage.latest_states(&flow.node_ids()).await.unwrap();
        assert!(!states.is_empty());
        assert!(states.iter().all(|s| s.state != NodeState::Running));
    }

    #[tokio::test]
    async fn test_unauthorized_run_touches_nothing() {
        let (runner, storage, bundle) = runner_with(
            r#"
workspace_name: W
flows:
  - name: main
    steps:
      - js: { name: a, code: "1" }
"#,
        )
        .await;
        let flow = &bundle.flows[0];
        let a = flow.node_by_name("a").unwrap().id;
        let stale = NodeExecution::running(Id::new(), a, "a");
        storage.upsert(&stale).await.unwrap();

        let runner = runner.with_authorizer(Arc::new(crate::auth::WorkspaceAllowList::default()));
        let (stream, _rx) = ChannelStream::new();
        let err = runner
            .run(FlowRunRequest::new(flow.id), Box::new(stream), CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);
        assert_eq!(storage.list_by_node(a).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_environment_variables_are_overridden_by_flow() {
        let (runner, storage, bundle) = runner_with(
            r#"
workspace_name: W
environments:
  - name: dev
    variables: { greeting: "hi", who: "env" }
flows:
  - name: main
    variables:
      - { name: who, value: "flow" }
    steps:
      - js: { name: a, code: "greeting + \" \" + who" }
"#,
        )
        .await;
        let flow = &bundle.flows[0];
        let env = bundle.environments[0].id;
        let (stream, _rx) = ChannelStream::new();
        runner
            .run(
                FlowRunRequest::new(flow.id).with_environment(env),
                Box::new(stream),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        let a = flow.node_by_name("a").unwrap().id;
        let rows = storage.list_by_node(a).await.unwrap();
        assert_eq!(rows[0].output, Some(Value::String("hi flow".into())));
    }
}
