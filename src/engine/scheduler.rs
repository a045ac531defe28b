//! Graph scheduler.
//!
//! Runs a subgraph from its root nodes. A node becomes runnable when every
//! incoming edge inside the subgraph has been resolved; it runs only if at
//! least one of those edges was selected by its source. Nodes on untaken
//! branches are skipped and the skip propagates, so joins still run.
//!
//! `loop` edges are not followed: loop nodes run their bodies as nested
//! subgraphs, one iteration at a time. Independent nodes run concurrently,
//! one task each. Every subgraph gets a child cancellation token, so a
//! failing node stops its siblings without touching the enclosing scope.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info_span, warn, Instrument};

use crate::error::{Error, Result};
use crate::id::Id;
use crate::metrics;
use crate::nodes::{FlowNode, NodeStatus, ReadTracker, RunOutcome, RunRequest};
use crate::workflow::EdgeHandle;

struct InFlight {
    node: Arc<dyn FlowNode>,
    running: NodeStatus,
    reads: ReadTracker,
    started: Instant,
}

struct Scheduler {
    req: RunRequest,
    members: HashSet<Id>,
    pending: HashMap<Id, usize>,
    activated: HashSet<Id>,
    in_flight: HashMap<Id, InFlight>,
    results: mpsc::UnboundedSender<RunOutcome>,
    first_error: Option<Error>,
}

/// Targets of `source` reachable without entering a loop body.
fn followable_targets(req: &RunRequest, source: Id) -> impl Iterator<Item = Id> + '_ {
    req.edges
        .get(&source)
        .into_iter()
        .flat_map(|by_handle| by_handle.iter())
        .filter(|(handle, _)| **handle != EdgeHandle::Loop)
        .flat_map(|(_, targets)| targets.iter().copied())
}

impl Scheduler {
    fn new(req: RunRequest, roots: &[Id], results: mpsc::UnboundedSender<RunOutcome>) -> Self {
        let mut members: HashSet<Id> = HashSet::new();
        let mut queue: VecDeque<Id> = roots.iter().copied().collect();
        while let Some(id) = queue.pop_front() {
            if members.insert(id) {
                queue.extend(followable_targets(&req, id));
            }
        }

        let mut pending: HashMap<Id, usize> = HashMap::new();
        for source in &members {
            for target in followable_targets(&req, *source) {
                *pending.entry(target).or_insert(0) += 1;
            }
        }
        for root in roots {
            pending.insert(*root, 0);
        }

        Self {
            req,
            members,
            pending,
            activated: roots.iter().copied().collect(),
            in_flight: HashMap::new(),
            results,
            first_error: None,
        }
    }

    fn fail(&mut self, error: Error) {
        if self.first_error.is_none() {
            debug!(error = %error, "Stopping subgraph");
            self.first_error = Some(error);
        }
        self.req.cancel.cancel();
    }

    async fn start(&mut self, node_id: Id, tasks: &mut JoinSet<()>) {
        if self.first_error.is_some() || self.req.cancel.is_cancelled() {
            return;
        }
        let Some(node) = self.req.nodes.get(&node_id).cloned() else {
            self.fail(Error::NotFound(format!("node {}", node_id)));
            return;
        };

        let execution_id = Id::new();
        let iteration_context = self.req.iteration.as_ref().map(|scope| scope.next_context());
        let mut node_req = self.req.clone();
        node_req.execution_id = execution_id;
        node_req.iteration_context = iteration_context.clone();
        node_req.reads = ReadTracker::default();

        let running = NodeStatus::new(execution_id, node.id(), node.name(), node.kind())
            .with_iteration(iteration_context);
        self.req.status.push(running.clone()).await;

        self.in_flight.insert(
            execution_id,
            InFlight {
                node: node.clone(),
                running,
                reads: node_req.reads.clone(),
                started: Instant::now(),
            },
        );

        let span = info_span!(
            "node.run",
            node = %node.name(),
            kind = %node.kind(),
            execution_id = %execution_id,
        );
        let results = self.results.clone();
        tasks.spawn(
            async move {
                node.run_async(&node_req, results).await;
            }
            .instrument(span),
        );
    }

    async fn finish(&mut self, outcome: RunOutcome, tasks: &mut JoinSet<()>) {
        let Some(flight) = self.in_flight.remove(&outcome.execution_id) else {
            warn!(execution_id = %outcome.execution_id, "Result for unknown execution");
            return;
        };
        let result = outcome.result;
        let state = result.state();

        let mut status = flight
            .running
            .with_state(state)
            .with_input(flight.reads.snapshot());
        if let Some(output) = &result.output {
            status = status.with_output(output.clone());
        }
        if let Some(error) = &result.error {
            status = status.with_error(error);
        }
        self.req.status.push(status).await;
        metrics::record_node_run(
            flight.node.kind().as_str(),
            state.as_str(),
            flight.started.elapsed(),
        );

        match result.error {
            Some(error) => {
                debug!(node = %flight.node.name(), error = %error, "Node did not succeed");
                self.fail(error);
            }
            None => self.route(flight.node.id(), result.next, tasks).await,
        }
    }

    /// Resolve the outgoing edges of a finished (or skipped) node.
    async fn route(&mut self, source: Id, selected: Vec<Id>, tasks: &mut JoinSet<()>) {
        let mut ready = Vec::new();
        let mut queue: VecDeque<(Id, HashSet<Id>)> = VecDeque::new();
        queue.push_back((source, selected.into_iter().collect()));

        while let Some((source, selected)) = queue.pop_front() {
            let targets: Vec<Id> = followable_targets(&self.req, source)
                .filter(|t| self.members.contains(t))
                .collect();
            for target in targets {
                if selected.contains(&target) {
                    self.activated.insert(target);
                }
                let Some(count) = self.pending.get_mut(&target) else {
                    continue;
                };
                *count = count.saturating_sub(1);
                if *count > 0 {
                    continue;
                }
                if self.activated.contains(&target) {
                    ready.push(target);
                } else {
                    debug!(node_id = %target, "Skipping node on untaken branch");
                    queue.push_back((target, HashSet::new()));
                }
            }
        }

        for target in ready {
            self.start(target, tasks).await;
        }
    }
}

/// Run the subgraph rooted at `roots` until every reachable node has finished
/// or been skipped. The first node error stops the subgraph and is returned.
pub async fn run_subgraph(mut req: RunRequest, roots: Vec<Id>) -> Result<()> {
    req.cancel = req.cancel.child_token();
    let (results_tx, mut results_rx) = mpsc::unbounded_channel();
    let mut scheduler = Scheduler::new(req, &roots, results_tx);
    let mut tasks = JoinSet::new();

    for root in roots {
        scheduler.start(root, &mut tasks).await;
    }

    loop {
        tokio::select! {
            biased;
            Some(outcome) = results_rx.recv() => {
                scheduler.finish(outcome, &mut tasks).await;
            }
            joined = tasks.join_next() => match joined {
                Some(Err(e)) if e.is_panic() => {
                    error!("Node task panicked: {}", e);
                    scheduler.fail(Error::Internal(format!("node task panicked: {}", e)));
                }
                Some(_) => {}
                None => {
                    // Every task delivers its outcome before it exits.
                    while let Ok(outcome) = results_rx.try_recv() {
                        scheduler.finish(outcome, &mut tasks).await;
                    }
                    if tasks.is_empty() {
                        break;
                    }
                }
            },
        }
    }

    match scheduler.first_error {
        Some(error) => Err(error),
        None if scheduler.req.cancel.is_cancelled() => {
            Err(Error::cancelled("flow run canceled"))
        }
        None => Ok(()),
    }
}

/// Run a whole flow from its start node.
pub async fn run_flow(req: RunRequest, start: Id) -> Result<()> {
    run_subgraph(req, vec![start]).await
}
