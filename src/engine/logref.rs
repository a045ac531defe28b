//! Log references: a small structured tree describing one node status,
//! rooted under the node's name, plus the sink that receives them.

use std::sync::Mutex;

use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use crate::id::Id;
use crate::nodes::NodeStatus;
use crate::workflow::NodeState;

/// Output keys copied into the `context` of an error reference.
const CONTEXT_KEYS: [&str; 3] = ["failedAtIndex", "failedAtKey", "totalItems"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEntry {
    pub execution_id: Id,
    pub node_id: Id,
    pub level: LogLevel,
    pub message: String,
    pub reference: Value,
}

/// Parse string values that hold JSON documents, recursively.
fn normalize(value: Value) -> Value {
    match value {
        Value::String(text) => {
            let trimmed = text.trim_start();
            if trimmed.starts_with('{') || trimmed.starts_with('[') {
                match serde_json::from_str::<Value>(&text) {
                    Ok(parsed) => normalize(parsed),
                    Err(_) => Value::String(text),
                }
            } else {
                Value::String(text)
            }
        }
        Value::Array(items) => Value::Array(items.into_iter().map(normalize).collect()),
        Value::Object(map) => Value::Object(map.into_iter().map(|(k, v)| (k, normalize(v))).collect()),
        other => other,
    }
}

/// Build the reference tree for `status`.
pub fn build_reference(status: &NodeStatus) -> Value {
    let body = if let Some(error) = &status.error {
        let kind = if error.is_cancellation() { "canceled" } else { "failed" };
        let mut body = json!({
            "node": {
                "id": status.node_id,
                "name": status.name,
                "state": status.state.as_str(),
            },
            "error": {
                "message": error.message,
                "kind": kind,
            },
        });
        let context: Map<String, Value> = CONTEXT_KEYS
            .iter()
            .filter_map(|key| status.output_field(key).map(|v| (key.to_string(), v.clone())))
            .collect();
        if !context.is_empty() {
            body["context"] = Value::Object(context);
        }
        body
    } else if let Some(Value::Object(output)) = &status.output {
        normalize(Value::Object(output.clone()))
    } else {
        json!({
            "node_id": status.node_id,
            "name": status.name,
            "state": status.state.as_str(),
        })
    };

    let mut root = Map::new();
    root.insert(status.name.clone(), body);
    Value::Object(root)
}

pub fn log_entry(status: &NodeStatus) -> LogEntry {
    let (level, message) = match &status.error {
        Some(error) => {
            let tag = if error.is_cancellation() { "canceled" } else { "failed" };
            (LogLevel::Warning, format!("[{}] {}: {}", tag, status.name, error.message))
        }
        None if status.state == NodeState::Success => {
            (LogLevel::Info, format!("{} completed", status.name))
        }
        None => (LogLevel::Info, format!("{} {}", status.name, status.state)),
    };
    LogEntry {
        execution_id: status.execution_id,
        node_id: status.node_id,
        level,
        message,
        reference: build_reference(status),
    }
}

/// Receives the log entries of a run.
pub trait LogSink: Send + Sync {
    fn emit(&self, entry: &LogEntry);
}

/// Renders entries through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn emit(&self, entry: &LogEntry) {
        match entry.level {
            LogLevel::Info => info!(
                node_id = %entry.node_id,
                execution_id = %entry.execution_id,
                reference = %entry.reference,
                "{}",
                entry.message
            ),
            LogLevel::Warning => warn!(
                node_id = %entry.node_id,
                execution_id = %entry.execution_id,
                reference = %entry.reference,
                "{}",
                entry.message
            ),
        }
    }
}

/// Keeps entries in memory.
#[derive(Debug, Default)]
pub struct CollectingLogSink {
    entries: Mutex<Vec<LogEntry>>,
}

impl CollectingLogSink {
    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl LogSink for CollectingLogSink {
    fn emit(&self, entry: &LogEntry) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.push(entry.clone());
        }
    }
}
