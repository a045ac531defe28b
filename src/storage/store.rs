//! Storage seams consumed by the run controller.

use async_trait::async_trait;

use super::models::{ExampleResponse, NodeExecution, NodeStateSummary};
use crate::error::Result;
use crate::id::Id;
use crate::workflow::WorkspaceBundle;

/// Execution-record persistence.
///
/// `upsert` must be a true insert-or-update: a concurrent delete of the same
/// row never turns it into a "not found" failure.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    async fn upsert(&self, record: &NodeExecution) -> Result<()>;

    /// Fetch one record; `Error::NotFound` when absent.
    async fn get(&self, id: Id) -> Result<NodeExecution>;

    async fn delete_by_node_id(&self, node_id: Id) -> Result<()>;

    /// Batch delete. An empty slice is a no-op.
    async fn delete_by_node_ids(&self, node_ids: &[Id]) -> Result<()>;

    /// Records of one node, latest first.
    async fn list_by_node(&self, node_id: Id) -> Result<Vec<NodeExecution>>;

    /// Latest record state of each listed node that has one.
    async fn latest_states(&self, node_ids: &[Id]) -> Result<Vec<NodeStateSummary>>;
}

/// Persistence for responses captured by request nodes.
#[async_trait]
pub trait ResponseStore: Send + Sync {
    async fn save_response(&self, response: &ExampleResponse) -> Result<()>;
}

/// Resolves the workspace that owns a flow.
#[async_trait]
pub trait FlowRepository: Send + Sync {
    /// The workspace bundle containing `flow_id`; `Error::NotFound` when unknown.
    async fn workspace_for_flow(&self, flow_id: Id) -> Result<WorkspaceBundle>;
}
