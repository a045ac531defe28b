//! Condition node: evaluates a boolean expression and follows `then` or `else`.

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use super::script;
use super::types::{FlowNode, RunRequest, RunResult};
use crate::id::Id;
use crate::workflow::{EdgeHandle, NodeKind};

pub struct ConditionNode {
    id: Id,
    name: String,
    expression: String,
}

impl ConditionNode {
    pub fn new(id: Id, name: impl Into<String>, expression: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            expression: expression.into(),
        }
    }
}

#[async_trait]
impl FlowNode for ConditionNode {
    fn id(&self) -> Id {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Condition
    }

    async fn run_sync(&self, req: &RunRequest) -> RunResult {
        // `{{ }}` placeholders are substituted before evaluation.
        let expression = req.resolve(&self.expression).await;
        let vars = req.scope_for(&expression).await;

        let result = match script::evaluate_bool(&expression, vars, &req.cancel).await {
            Ok(result) => result,
            Err(e) => return RunResult::failed(e),
        };
        debug!(node = %self.name, expression = %expression, result, "Condition evaluated");

        let output = json!({ "condition": result });
        req.publish(&self.name, output.clone()).await;

        let branch = if result {
            EdgeHandle::Then
        } else {
            EdgeHandle::Else
        };
        let mut next = req.targets(self.id, branch);
        next.extend(req.targets(self.id, EdgeHandle::Unspecified));
        RunResult::next(next).with_output(output)
    }
}
