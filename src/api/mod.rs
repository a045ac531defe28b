//! Service façade for flowrun.
//!
//! Exposes the three RPCs (`FlowRunAdHoc`, `NodeList`, `NodeExecutionList`)
//! plus workspace import/export over one storage handle. Errors map onto
//! RPC status names through [`rpc_status`]; wire messages carry only
//! sanitized text.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::auth::{AllowAll, Authorizer};
use crate::config::Config;
use crate::engine::{FlowNodeState, FlowRunRequest, FlowRunStream, FlowRunner, RunSummary};
use crate::error::{Error, ErrorKind, Result};
use crate::id::Id;
use crate::nodes::NodeRegistry;
use crate::storage::{ExecutionStore, FlowRepository, NodeExecution, SqliteStorage};
use crate::workflow::{export_workspace, import_workspace, WorkspaceBundle};

/// RPC status name for an error kind.
pub fn rpc_status(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::InvalidInput => "invalid_argument",
        ErrorKind::NotFound => "not_found",
        ErrorKind::Unauthorized => "permission_denied",
        ErrorKind::TransientStorage => "unavailable",
        ErrorKind::NodeFailure => "aborted",
        ErrorKind::Cancelled => "canceled",
        ErrorKind::Internal => "internal",
    }
}

/// Sanitized error status for callers. Full details go to the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RpcError {
    pub status: &'static str,
    pub message: String,
}

impl From<&Error> for RpcError {
    fn from(e: &Error) -> Self {
        if e.kind() == ErrorKind::Internal {
            error!("API error: {:?}", e);
        }
        Self {
            status: rpc_status(e.kind()),
            message: e.external_message(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeListItem {
    pub node_id: Id,
    pub state: FlowNodeState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeListResponse {
    pub items: Vec<NodeListItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeExecutionItem {
    pub id: Id,
    pub node_id: Id,
    pub name: String,
    pub state: FlowNodeState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_id: Option<Id>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
}

impl From<NodeExecution> for NodeExecutionItem {
    fn from(record: NodeExecution) -> Self {
        Self {
            completed_at: record.completed_at_utc().map(|t| t.to_rfc3339()),
            id: record.id,
            node_id: record.node_id,
            name: record.name,
            state: record.state.into(),
            error: record.error,
            input: record.input,
            output: record.output,
            response_id: record.response_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeExecutionListResponse {
    pub items: Vec<NodeExecutionItem>,
}

/// Imported workspace, as reported back to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportedWorkspace {
    pub workspace_id: Id,
    pub name: String,
    pub flows: Vec<(String, Id)>,
}

#[derive(Clone)]
pub struct FlowService {
    storage: Arc<SqliteStorage>,
    runner: FlowRunner,
    authorizer: Arc<dyn Authorizer>,
}

impl FlowService {
    pub fn new(storage: Arc<SqliteStorage>, config: &Config) -> Self {
        let runner = FlowRunner::new(
            storage.clone(),
            storage.clone(),
            storage.clone(),
            NodeRegistry::new(&config.http),
            config.run.clone(),
        );
        Self {
            storage,
            runner,
            authorizer: Arc::new(AllowAll),
        }
    }

    pub fn with_runner(mut self, runner: FlowRunner) -> Self {
        self.runner = runner;
        self
    }

    pub fn with_authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.runner = self.runner.with_authorizer(authorizer.clone());
        self.authorizer = authorizer;
        self
    }

    pub fn storage(&self) -> &Arc<SqliteStorage> {
        &self.storage
    }

    /// `FlowRunAdHoc`: run a flow, streaming node states into `stream`.
    pub async fn flow_run_adhoc(
        &self,
        request: FlowRunRequest,
        stream: Box<dyn FlowRunStream>,
        cancel: CancellationToken,
    ) -> Result<RunSummary> {
        self.runner.run(request, stream, cancel).await
    }

    /// `NodeList`: latest state of every node of a flow. Nodes that never
    /// ran are reported as `UNSPECIFIED`.
    pub async fn node_list(&self, flow_id: Id) -> Result<NodeListResponse> {
        let bundle = self.storage.workspace_for_flow(flow_id).await?;
        self.authorizer.authorize(&bundle.workspace)?;
        let flow = bundle
            .flow(flow_id)
            .ok_or_else(|| Error::NotFound(format!("flow {}", flow_id)))?;

        let node_ids = flow.node_ids();
        let latest = self.storage.latest_states(&node_ids).await?;
        let items = node_ids
            .into_iter()
            .map(|node_id| NodeListItem {
                node_id,
                state: latest
                    .iter()
                    .find(|s| s.node_id == node_id)
                    .map(|s| s.state.into())
                    .unwrap_or(FlowNodeState::Unspecified),
            })
            .collect();
        Ok(NodeListResponse { items })
    }

    /// `NodeExecutionList`: recorded rows of one node, latest first.
    pub async fn node_execution_list(&self, node_id: Id) -> Result<NodeExecutionListResponse> {
        let items = self
            .storage
            .list_by_node(node_id)
            .await?
            .into_iter()
            .map(NodeExecutionItem::from)
            .collect();
        Ok(NodeExecutionListResponse { items })
    }

    /// Import a simplified YAML workspace. A workspace with the same name is
    /// replaced.
    pub async fn import_yaml(&self, yaml: &str) -> Result<ImportedWorkspace> {
        let bundle = import_workspace(yaml)?;
        if let Some(existing) = self
            .storage
            .find_workspace_by_name(&bundle.workspace.name)
            .await?
        {
            warn!(workspace = %existing.workspace.name, "Replacing existing workspace");
            self.storage.delete_workspace(existing.workspace.id).await?;
        }
        self.storage.save_workspace(&bundle).await?;
        info!(
            workspace = %bundle.workspace.name,
            flows = bundle.flows.len(),
            "Imported workspace"
        );
        Ok(ImportedWorkspace {
            workspace_id: bundle.workspace.id,
            name: bundle.workspace.name.clone(),
            flows: bundle.flows.iter().map(|f| (f.name.clone(), f.id)).collect(),
        })
    }

    /// Export a stored workspace, looked up by id or by name.
    pub async fn export_yaml(&self, workspace: &str) -> Result<String> {
        let bundle = self.find_workspace(workspace).await?;
        self.authorizer.authorize(&bundle.workspace)?;
        export_workspace(&bundle)
    }

    async fn find_workspace(&self, workspace: &str) -> Result<WorkspaceBundle> {
        if let Ok(id) = workspace.parse::<Id>() {
            if let Some(bundle) = self.storage.get_workspace(id).await? {
                return Ok(bundle);
            }
        }
        self.storage
            .find_workspace_by_name(workspace)
            .await?
            .ok_or_else(|| Error::NotFound(format!("workspace '{}'", workspace)))
    }
}
