//! Counted loop node and the iteration driver shared with `for_each`.
//!
//! Each iteration runs the `loop` body to completion before the next starts.
//! Iterations report their own statuses (execution rows named
//! "<loop> iteration <i>") carrying `{index}` / `{key}` while running and
//! `{completed: true}` on success. In `throw` mode the first failed
//! iteration produces one summary status and the loop ends `canceled`.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use super::types::{FlowNode, NodeStatus, RunRequest, RunResult};
use crate::engine::scheduler;
use crate::error::Error;
use crate::id::Id;
use crate::workflow::{EdgeHandle, ErrorHandling, NodeKind, NodeState};

/// One unit of loop work.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct IterationItem {
    pub index: usize,
    pub key: Option<String>,
    pub value: Option<Value>,
}

/// How failure summaries label the failing iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IterationLabel {
    Counted,
    Sequence,
    Mapping,
}

impl IterationLabel {
    fn summary(&self, item: &IterationItem, total: usize) -> Value {
        match self {
            IterationLabel::Counted => {
                json!({ "failedAtIteration": item.index, "totalIterations": total })
            }
            IterationLabel::Sequence => {
                json!({ "failedAtIndex": item.index, "totalItems": total })
            }
            IterationLabel::Mapping => {
                json!({ "failedAtKey": item.key, "totalItems": total })
            }
        }
    }
}

/// Loop node identity shared by `for` and `for_each`.
pub(crate) struct LoopDriver<'a> {
    pub id: Id,
    pub name: &'a str,
    pub kind: NodeKind,
    pub error_handling: ErrorHandling,
    pub label: IterationLabel,
}

impl LoopDriver<'_> {
    fn iteration_status(&self, req: &RunRequest, execution_id: Id, item: &IterationItem) -> NodeStatus {
        NodeStatus::new(
            execution_id,
            self.id,
            format!("{} iteration {}", self.name, item.index),
            self.kind,
        )
        .with_iteration(req.iteration_context.clone())
    }

    fn marker(item: &IterationItem) -> Map<String, Value> {
        let mut marker = Map::new();
        marker.insert("index".into(), json!(item.index));
        if let Some(key) = &item.key {
            marker.insert("key".into(), json!(key));
        }
        marker
    }

    /// Run the body once per item. Returns the loop node's own result.
    /// Items are pulled one at a time, so a counted loop never materializes
    /// its range.
    pub async fn run<I>(&self, req: &RunRequest, items: I, output: Value) -> RunResult
    where
        I: ExactSizeIterator<Item = IterationItem> + Send,
    {
        let body = req.targets(self.id, EdgeHandle::Loop);
        let total = items.len();

        for item in items {
            let item = &item;
            if req.cancel.is_cancelled() {
                return RunResult::failed(Error::cancelled(format!(
                    "loop '{}' canceled before iteration {}",
                    self.name, item.index
                )));
            }

            let mut scope_value = Self::marker(item);
            if let Some(value) = &item.value {
                scope_value.insert("item".into(), value.clone());
            }
            req.publish(self.name, Value::Object(scope_value)).await;

            let execution_id = Id::new();
            req.status
                .push(
                    self.iteration_status(req, execution_id, item)
                        .with_output(Value::Object(Self::marker(item))),
                )
                .await;

            let outcome = if body.is_empty() {
                Ok(())
            } else {
                scheduler::run_subgraph(req.for_iteration(item.index), body.clone()).await
            };

            match outcome {
                Ok(()) => {
                    let mut done = Self::marker(item);
                    done.insert("completed".into(), json!(true));
                    req.status
                        .push(
                            self.iteration_status(req, execution_id, item)
                                .with_state(NodeState::Success)
                                .with_output(Value::Object(done)),
                        )
                        .await;
                }
                Err(e) if req.cancel.is_cancelled() => {
                    req.status
                        .push(
                            self.iteration_status(req, execution_id, item)
                                .with_state(NodeState::Canceled)
                                .with_output(Value::Object(Self::marker(item)))
                                .with_error(&e),
                        )
                        .await;
                    return RunResult::failed(Error::cancelled(format!(
                        "loop '{}' canceled at iteration {}",
                        self.name, item.index
                    )));
                }
                Err(e) => {
                    req.status
                        .push(
                            self.iteration_status(req, execution_id, item)
                                .with_state(NodeState::Failure)
                                .with_output(Value::Object(Self::marker(item)))
                                .with_error(&e),
                        )
                        .await;

                    if self.error_handling == ErrorHandling::Ignore {
                        warn!(node = %self.name, iteration = item.index, error = %e, "Iteration failed, continuing");
                        continue;
                    }

                    req.status
                        .push(
                            NodeStatus::new(Id::new(), self.id, format!("{} summary", self.name), self.kind)
                                .with_iteration(req.iteration_context.clone())
                                .with_state(NodeState::Failure)
                                .with_output(self.label.summary(item, total))
                                .with_error(&e),
                        )
                        .await;
                    return RunResult::failed(Error::cancelled(format!(
                        "loop '{}' stopped at iteration {}: {}",
                        self.name, item.index, e
                    )));
                }
            }
        }

        debug!(node = %self.name, iterations = total, "Loop finished");
        RunResult::next(req.targets(self.id, EdgeHandle::Unspecified)).with_output(output)
    }
}

/// `for` node: runs its body `iter_count` times.
pub struct ForNode {
    id: Id,
    name: String,
    iter_count: i64,
    error_handling: ErrorHandling,
}

impl ForNode {
    pub fn new(
        id: Id,
        name: impl Into<String>,
        iter_count: i64,
        error_handling: ErrorHandling,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            iter_count,
            error_handling,
        }
    }
}

#[async_trait]
impl FlowNode for ForNode {
    fn id(&self) -> Id {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> NodeKind {
        NodeKind::For
    }

    async fn run_sync(&self, req: &RunRequest) -> RunResult {
        let count = match usize::try_from(self.iter_count.max(0)) {
            Ok(count) => count,
            Err(_) => {
                return RunResult::failed(Error::Node(format!(
                    "for '{}': iter_count {} exceeds this platform",
                    self.name, self.iter_count
                )))
            }
        };
        let items = (0..count).map(|index| IterationItem {
            index,
            key: None,
            value: None,
        });
        let driver = LoopDriver {
            id: self.id,
            name: &self.name,
            kind: NodeKind::For,
            error_handling: self.error_handling,
            label: IterationLabel::Counted,
        };
        driver.run(req, items, json!({ "iterations": count })).await
    }
}
