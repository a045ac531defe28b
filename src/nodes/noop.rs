//! No-op node: the flow start, loop-body sinks and placeholder nodes.

use async_trait::async_trait;

use super::types::{FlowNode, RunRequest, RunResult};
use crate::id::Id;
use crate::workflow::{EdgeHandle, NoOpKind, NodeKind};

pub struct NoOpNode {
    id: Id,
    name: String,
    subtype: NoOpKind,
}

impl NoOpNode {
    pub fn new(id: Id, name: impl Into<String>, subtype: NoOpKind) -> Self {
        Self {
            id,
            name: name.into(),
            subtype,
        }
    }

    pub fn subtype(&self) -> NoOpKind {
        self.subtype
    }
}

#[async_trait]
impl FlowNode for NoOpNode {
    fn id(&self) -> Id {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> NodeKind {
        NodeKind::NoOp
    }

    async fn run_sync(&self, req: &RunRequest) -> RunResult {
        RunResult::next(req.targets(self.id, EdgeHandle::Unspecified))
    }
}
