//! Storage models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::id::Id;
use crate::workflow::{KeyValue, NodeState};

/// Compression applied to a stored payload column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressType {
    #[default]
    None,
    Zstd,
}

impl CompressType {
    pub fn as_i64(&self) -> i64 {
        match self {
            CompressType::None => 0,
            CompressType::Zstd => 1,
        }
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(CompressType::None),
            1 => Some(CompressType::Zstd),
            _ => None,
        }
    }
}

/// One node invocation, including each loop iteration.
///
/// Payloads are held decoded; the store compresses them on write and
/// reverses the compression on read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeExecution {
    pub id: Id,
    pub node_id: Id,
    pub name: String,
    pub state: NodeState,
    pub error: Option<String>,
    pub input: Option<Value>,
    pub output: Option<Value>,
    pub response_id: Option<Id>,
    /// Unix milliseconds at which a terminal state was recorded.
    pub completed_at: Option<i64>,
}

impl NodeExecution {
    /// A fresh `running` record.
    pub fn running(id: Id, node_id: Id, name: impl Into<String>) -> Self {
        Self {
            id,
            node_id,
            name: name.into(),
            state: NodeState::Running,
            error: None,
            input: None,
            output: None,
            response_id: None,
            completed_at: None,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.state.is_terminal()
    }

    /// Close the record with a terminal state.
    pub fn close(&mut self, state: NodeState, error: Option<String>) {
        self.state = state;
        self.error = error;
        self.completed_at = Some(Utc::now().timestamp_millis());
    }

    pub fn completed_at_utc(&self) -> Option<DateTime<Utc>> {
        self.completed_at.and_then(DateTime::from_timestamp_millis)
    }
}

/// A persisted HTTP response captured by a request node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExampleResponse {
    pub id: Id,
    pub example_id: Id,
    pub status: u16,
    pub body: String,
    #[serde(default)]
    pub headers: Vec<KeyValue>,
    pub duration_ms: u64,
    pub created_at: DateTime<Utc>,
}

/// Stored workspace summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredWorkspace {
    pub id: Id,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Latest state of one node, as returned by node listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStateSummary {
    pub node_id: Id,
    pub state: NodeState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_sets_completion() {
        let mut exec = NodeExecution::running(Id::new(), Id::new(), "fetch");
        assert!(!exec.is_completed());
        assert!(exec.completed_at.is_none());

        exec.close(NodeState::Canceled, Some("run canceled".into()));
        assert!(exec.is_completed());
        assert!(exec.completed_at_utc().is_some());
        assert_eq!(exec.error.as_deref(), Some("run canceled"));
    }

    #[test]
    fn test_compress_type_codes() {
        assert_eq!(CompressType::from_i64(0), Some(CompressType::None));
        assert_eq!(CompressType::from_i64(1), Some(CompressType::Zstd));
        assert_eq!(CompressType::from_i64(9), None);
    }
}
