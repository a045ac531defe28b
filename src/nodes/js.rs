//! Script node: runs a Rhai program over the flow variables and publishes
//! the program's value under the node name.

use async_trait::async_trait;
use tracing::debug;

use super::script;
use super::types::{FlowNode, RunRequest, RunResult};
use crate::id::Id;
use crate::workflow::{EdgeHandle, NodeKind};

pub struct JsNode {
    id: Id,
    name: String,
    code: String,
}

impl JsNode {
    pub fn new(id: Id, name: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            code: code.into(),
        }
    }
}

#[async_trait]
impl FlowNode for JsNode {
    fn id(&self) -> Id {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Js
    }

    async fn run_sync(&self, req: &RunRequest) -> RunResult {
        debug!(node = %self.name, "Evaluating script");
        let vars = req.scope_for(&self.code).await;
        match script::evaluate(&self.code, vars, &req.cancel).await {
            Ok(value) => {
                req.publish(&self.name, value.clone()).await;
                RunResult::next(req.targets(self.id, EdgeHandle::Unspecified)).with_output(value)
            }
            Err(e) => RunResult::failed(e),
        }
    }
}
