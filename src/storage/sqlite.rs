//! SQLite storage implementation.

use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use tracing::debug;

use super::compress::{decode_payload, encode_payload, DEFAULT_COMPRESS_THRESHOLD};
use super::models::*;
use super::pool::{ConnectionPool, PoolConfig};
use super::store::{ExecutionStore, FlowRepository, ResponseStore};
use crate::config::StorageConfig;
use crate::error::{Error, Result};
use crate::id::Id;
use crate::workflow::{KeyValue, NodeState, WorkspaceBundle};

/// RFC 3339 text column `idx` as UTC. A malformed value is a conversion
/// error on that column.
fn timestamp_at(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<chrono::DateTime<Utc>> {
    let text: String = row.get(idx)?;
    chrono::DateTime::parse_from_rfc3339(&text)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

/// SQLite binds at most 999 parameters on older builds; stay well under it.
const MAX_BATCH: usize = 500;

const EXECUTION_COLUMNS: &str = "id, node_id, name, state, error, input_data, \
     input_data_compress_type, output_data, output_data_compress_type, response_id, completed_at";

/// Running rows first, then most recently completed. A loop's main row is
/// minted before its iteration rows but closes after them, so on a
/// same-millisecond tie the older id wins.
const LATEST_FIRST: &str = "(completed_at IS NULL) DESC, completed_at DESC, id ASC";

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS node_execution (
    id BLOB PRIMARY KEY,
    node_id BLOB NOT NULL,
    name TEXT NOT NULL,
    state INT8 NOT NULL,
    error TEXT,
    input_data BLOB,
    input_data_compress_type INT8 NOT NULL DEFAULT 0,
    output_data BLOB,
    output_data_compress_type INT8 NOT NULL DEFAULT 0,
    response_id BLOB,
    completed_at BIGINT
);
CREATE INDEX IF NOT EXISTS idx_node_execution_node ON node_execution(node_id);

CREATE TABLE IF NOT EXISTS example_response (
    id BLOB PRIMARY KEY,
    example_id BLOB NOT NULL,
    status INTEGER NOT NULL,
    body TEXT NOT NULL,
    headers TEXT NOT NULL,
    duration_ms INTEGER NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_example_response_example
    ON example_response(example_id, created_at DESC);

CREATE TABLE IF NOT EXISTS workspace (
    id BLOB PRIMARY KEY,
    name TEXT NOT NULL,
    bundle TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS flow (
    id BLOB PRIMARY KEY,
    workspace_id BLOB NOT NULL,
    name TEXT NOT NULL,
    FOREIGN KEY (workspace_id) REFERENCES workspace(id) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS idx_flow_workspace ON flow(workspace_id);
"#;

/// SQLite-based storage.
#[derive(Clone)]
pub struct SqliteStorage {
    pool: ConnectionPool,
    compress_threshold: usize,
}

/// Row as stored, before payload decoding.
struct RawExecution {
    id: Id,
    node_id: Id,
    name: String,
    state: i64,
    error: Option<String>,
    input: Option<Vec<u8>>,
    input_compress: i64,
    output: Option<Vec<u8>>,
    output_compress: i64,
    response_id: Option<Id>,
    completed_at: Option<i64>,
}

impl RawExecution {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            node_id: row.get(1)?,
            name: row.get(2)?,
            state: row.get(3)?,
            error: row.get(4)?,
            input: row.get(5)?,
            input_compress: row.get(6)?,
            output: row.get(7)?,
            output_compress: row.get(8)?,
            response_id: row.get(9)?,
            completed_at: row.get(10)?,
        })
    }

    fn decode(self) -> Result<NodeExecution> {
        let payload = |bytes: Option<Vec<u8>>, code: i64| -> Result<Option<serde_json::Value>> {
            let Some(bytes) = bytes else {
                return Ok(None);
            };
            let compress = CompressType::from_i64(code).ok_or_else(|| {
                Error::Storage(format!("Unknown compression type {} on {}", code, self.id))
            })?;
            decode_payload(&bytes, compress).map(Some)
        };
        Ok(NodeExecution {
            id: self.id,
            node_id: self.node_id,
            name: self.name.clone(),
            state: NodeState::from_i64(self.state),
            error: self.error.clone(),
            input: payload(self.input.clone(), self.input_compress)?,
            output: payload(self.output.clone(), self.output_compress)?,
            response_id: self.response_id,
            completed_at: self.completed_at,
        })
    }
}

impl SqliteStorage {
    /// Open or create a database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_config(path, &StorageConfig::default())
    }

    /// Open a database with explicit storage settings.
    pub fn open_with_config(path: &Path, config: &StorageConfig) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let pool = ConnectionPool::new(path, PoolConfig::from(config))?;
        Self::init_schema(&pool)?;
        Ok(Self {
            pool,
            compress_threshold: config.compress_threshold_bytes,
        })
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let pool = ConnectionPool::new_in_memory(PoolConfig::default())?;
        Self::init_schema(&pool)?;
        Ok(Self {
            pool,
            compress_threshold: DEFAULT_COMPRESS_THRESHOLD,
        })
    }

    fn init_schema(pool: &ConnectionPool) -> Result<()> {
        let conn = pool.get()?;
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    // ========================================================================
    // Node execution operations
    // ========================================================================

    /// Insert-or-update one record in a single statement.
    pub async fn upsert_node_execution(&self, exec: &NodeExecution) -> Result<()> {
        let threshold = self.compress_threshold;
        let encode = |value: &Option<serde_json::Value>| -> Result<(Option<Vec<u8>>, i64)> {
            match value {
                Some(v) => {
                    let (bytes, compress) = encode_payload(v, threshold)?;
                    Ok((Some(bytes), compress.as_i64()))
                }
                None => Ok((None, CompressType::None.as_i64())),
            }
        };
        let (input, input_compress) = encode(&exec.input)?;
        let (output, output_compress) = encode(&exec.output)?;
        let exec = exec.clone();

        self.pool
            .with_connection(move |conn| {
                conn.execute(
                    "INSERT INTO node_execution
                     (id, node_id, name, state, error, input_data, input_data_compress_type,
                      output_data, output_data_compress_type, response_id, completed_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                     ON CONFLICT(id) DO UPDATE SET
                        node_id = excluded.node_id,
                        name = excluded.name,
                        state = excluded.state,
                        error = excluded.error,
                        input_data = excluded.input_data,
                        input_data_compress_type = excluded.input_data_compress_type,
                        output_data = excluded.output_data,
                        output_data_compress_type = excluded.output_data_compress_type,
                        response_id = COALESCE(node_execution.response_id, excluded.response_id),
                        completed_at = excluded.completed_at",
                    params![
                        exec.id,
                        exec.node_id,
                        exec.name,
                        exec.state.as_i64(),
                        exec.error,
                        input,
                        input_compress,
                        output,
                        output_compress,
                        exec.response_id,
                        exec.completed_at,
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn get_node_execution(&self, id: Id) -> Result<Option<NodeExecution>> {
        let raw = self
            .pool
            .with_connection(move |conn| {
                let sql = format!("SELECT {} FROM node_execution WHERE id = ?1", EXECUTION_COLUMNS);
                Ok(conn
                    .query_row(&sql, [id], RawExecution::from_row)
                    .optional()?)
            })
            .await?;
        raw.map(RawExecution::decode).transpose()
    }

    pub async fn delete_node_executions_by_node_id(&self, node_id: Id) -> Result<()> {
        self.pool
            .with_connection(move |conn| {
                conn.execute("DELETE FROM node_execution WHERE node_id = ?1", [node_id])?;
                Ok(())
            })
            .await
    }

    pub async fn delete_node_executions_by_node_ids(&self, node_ids: &[Id]) -> Result<()> {
        if node_ids.is_empty() {
            return Ok(());
        }
        let node_ids = node_ids.to_vec();
        self.pool
            .with_connection_mut(move |conn| {
                let tx = conn.transaction()?;
                let mut deleted = 0;
                for chunk in node_ids.chunks(MAX_BATCH) {
                    let sql = format!(
                        "DELETE FROM node_execution WHERE node_id IN ({})",
                        placeholders(chunk.len())
                    );
                    deleted += tx.execute(&sql, params_from_iter(chunk.iter()))?;
                }
                tx.commit()?;
                debug!(nodes = node_ids.len(), deleted, "Deleted prior node executions");
                Ok(())
            })
            .await
    }

    /// Records of one node, latest first.
    pub async fn list_node_executions(&self, node_id: Id) -> Result<Vec<NodeExecution>> {
        let raws = self
            .pool
            .with_connection(move |conn| {
                let sql = format!(
                    "SELECT {} FROM node_execution WHERE node_id = ?1 ORDER BY {}",
                    EXECUTION_COLUMNS, LATEST_FIRST
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map([node_id], RawExecution::from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        raws.into_iter().map(RawExecution::decode).collect()
    }

    /// Latest state of each listed node that has at least one record.
    pub async fn latest_node_states(&self, node_ids: &[Id]) -> Result<Vec<NodeStateSummary>> {
        if node_ids.is_empty() {
            return Ok(Vec::new());
        }
        let node_ids = node_ids.to_vec();
        self.pool
            .with_connection(move |conn| {
                let mut summaries = Vec::new();
                for chunk in node_ids.chunks(MAX_BATCH) {
                    let sql = format!(
                        "SELECT node_id, state FROM (
                            SELECT node_id, state,
                                   ROW_NUMBER() OVER (PARTITION BY node_id ORDER BY {}) AS rn
                            FROM node_execution WHERE node_id IN ({})
                         ) WHERE rn = 1",
                        LATEST_FIRST,
                        placeholders(chunk.len())
                    );
                    let mut stmt = conn.prepare(&sql)?;
                    let rows = stmt.query_map(params_from_iter(chunk.iter()), |row| {
                        Ok(NodeStateSummary {
                            node_id: row.get(0)?,
                            state: NodeState::from_i64(row.get(1)?),
                        })
                    })?;
                    for row in rows {
                        summaries.push(row?);
                    }
                }
                Ok(summaries)
            })
            .await
    }

    // ========================================================================
    // Response operations
    // ========================================================================

    pub async fn save_response(&self, response: &ExampleResponse) -> Result<()> {
        let response = response.clone();
        let headers = serde_json::to_string(&response.headers)?;
        self.pool
            .with_connection(move |conn| {
                conn.execute(
                    "INSERT INTO example_response
                     (id, example_id, status, body, headers, duration_ms, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                     ON CONFLICT(id) DO UPDATE SET
                        example_id = excluded.example_id,
                        status = excluded.status,
                        body = excluded.body,
                        headers = excluded.headers,
                        duration_ms = excluded.duration_ms,
                        created_at = excluded.created_at",
                    params![
                        response.id,
                        response.example_id,
                        response.status,
                        response.body,
                        headers,
                        response.duration_ms as i64,
                        response.created_at.to_rfc3339(),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn get_response(&self, id: Id) -> Result<Option<ExampleResponse>> {
        self.pool
            .with_connection(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT id, example_id, status, body, headers, duration_ms, created_at
                         FROM example_response WHERE id = ?1",
                        [id],
                        Self::row_to_response,
                    )
                    .optional()?)
            })
            .await
    }

    /// Responses recorded for an example, newest first.
    pub async fn list_responses(&self, example_id: Id) -> Result<Vec<ExampleResponse>> {
        self.pool
            .with_connection(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, example_id, status, body, headers, duration_ms, created_at
                     FROM example_response WHERE example_id = ?1 ORDER BY id DESC",
                )?;
                let rows = stmt
                    .query_map([example_id], Self::row_to_response)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    fn row_to_response(row: &rusqlite::Row<'_>) -> rusqlite::Result<ExampleResponse> {
        let headers: String = row.get(4)?;
        let duration_ms: i64 = row.get(5)?;
        Ok(ExampleResponse {
            id: row.get(0)?,
            example_id: row.get(1)?,
            status: row.get(2)?,
            body: row.get(3)?,
            headers: serde_json::from_str::<Vec<KeyValue>>(&headers).unwrap_or_default(),
            duration_ms: duration_ms.max(0) as u64,
            created_at: timestamp_at(row, 6)?,
        })
    }

    // ========================================================================
    // Workspace operations
    // ========================================================================

    /// Store (or replace) a workspace bundle and its flow lookup rows.
    pub async fn save_workspace(&self, bundle: &WorkspaceBundle) -> Result<()> {
        let definition = serde_json::to_string(bundle)?;
        let workspace = bundle.workspace.clone();
        let flows: Vec<(Id, String)> = bundle
            .flows
            .iter()
            .map(|f| (f.id, f.name.clone()))
            .collect();

        self.pool
            .with_connection_mut(move |conn| {
                let now = Utc::now().to_rfc3339();
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT INTO workspace (id, name, bundle, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?4)
                     ON CONFLICT(id) DO UPDATE SET
                        name = excluded.name,
                        bundle = excluded.bundle,
                        updated_at = excluded.updated_at",
                    params![workspace.id, workspace.name, definition, now],
                )?;
                tx.execute("DELETE FROM flow WHERE workspace_id = ?1", [workspace.id])?;
                for (flow_id, name) in &flows {
                    tx.execute(
                        "INSERT INTO flow (id, workspace_id, name) VALUES (?1, ?2, ?3)
                         ON CONFLICT(id) DO UPDATE SET
                            workspace_id = excluded.workspace_id,
                            name = excluded.name",
                        params![flow_id, workspace.id, name],
                    )?;
                }
                tx.commit()?;
                Ok(())
            })
            .await
    }

    pub async fn get_workspace(&self, id: Id) -> Result<Option<WorkspaceBundle>> {
        let definition: Option<String> = self
            .pool
            .with_connection(move |conn| {
                Ok(conn
                    .query_row("SELECT bundle FROM workspace WHERE id = ?1", [id], |row| {
                        row.get(0)
                    })
                    .optional()?)
            })
            .await?;
        definition
            .map(|d| serde_json::from_str(&d).map_err(Error::from))
            .transpose()
    }

    pub async fn find_workspace_by_name(&self, name: &str) -> Result<Option<WorkspaceBundle>> {
        let name = name.to_string();
        let id: Option<Id> = self
            .pool
            .with_connection(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT id FROM workspace WHERE name = ?1 ORDER BY updated_at DESC LIMIT 1",
                        [name],
                        |row| row.get(0),
                    )
                    .optional()?)
            })
            .await?;
        match id {
            Some(id) => self.get_workspace(id).await,
            None => Ok(None),
        }
    }

    pub async fn list_workspaces(&self) -> Result<Vec<StoredWorkspace>> {
        self.pool
            .with_connection(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, name, created_at, updated_at FROM workspace ORDER BY name",
                )?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok(StoredWorkspace {
                            id: row.get(0)?,
                            name: row.get(1)?,
                            created_at: timestamp_at(row, 2)?,
                            updated_at: timestamp_at(row, 3)?,
                        })
                    })?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    /// Delete a workspace, its flows, and the execution rows of their nodes.
    pub async fn delete_workspace(&self, id: Id) -> Result<()> {
        if let Some(bundle) = self.get_workspace(id).await? {
            let node_ids: Vec<Id> = bundle
                .flows
                .iter()
                .flat_map(|f| f.nodes.iter().map(|n| n.id))
                .collect();
            self.delete_node_executions_by_node_ids(&node_ids).await?;
        }
        self.pool
            .with_connection(move |conn| {
                conn.execute("DELETE FROM workspace WHERE id = ?1", [id])?;
                Ok(())
            })
            .await
    }

    async fn workspace_id_for_flow(&self, flow_id: Id) -> Result<Option<Id>> {
        self.pool
            .with_connection(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT workspace_id FROM flow WHERE id = ?1",
                        [flow_id],
                        |row| row.get(0),
                    )
                    .optional()?)
            })
            .await
    }
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

#[async_trait]
impl ExecutionStore for SqliteStorage {
    async fn upsert(&self, record: &NodeExecution) -> Result<()> {
        self.upsert_node_execution(record).await
    }

    async fn get(&self, id: Id) -> Result<NodeExecution> {
        self.get_node_execution(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("node execution {}", id)))
    }

    async fn delete_by_node_id(&self, node_id: Id) -> Result<()> {
        self.delete_node_executions_by_node_id(node_id).await
    }

    async fn delete_by_node_ids(&self, node_ids: &[Id]) -> Result<()> {
        self.delete_node_executions_by_node_ids(node_ids).await
    }

    async fn list_by_node(&self, node_id: Id) -> Result<Vec<NodeExecution>> {
        self.list_node_executions(node_id).await
    }

    async fn latest_states(&self, node_ids: &[Id]) -> Result<Vec<NodeStateSummary>> {
        self.latest_node_states(node_ids).await
    }
}

#[async_trait]
impl ResponseStore for SqliteStorage {
    async fn save_response(&self, response: &ExampleResponse) -> Result<()> {
        SqliteStorage::save_response(self, response).await
    }
}

#[async_trait]
impl FlowRepository for SqliteStorage {
    async fn workspace_for_flow(&self, flow_id: Id) -> Result<WorkspaceBundle> {
        let workspace_id = self
            .workspace_id_for_flow(flow_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("flow {}", flow_id)))?;
        self.get_workspace(workspace_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("workspace {}", workspace_id)))
    }
}
