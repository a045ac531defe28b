//! Request correlation.
//!
//! A request node reports its completion on the status channel and its
//! captured response on the response channel, in either order. The
//! coordinator joins the two per execution so that the execution row is
//! streamed once, after the response id is attached and the response row is
//! persisted, followed by exactly one example linkage.
//!
//! State mutations happen under a plain mutex; persistence and stream sends
//! happen after it is released, on a snapshot.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::transport::{FlowRunResponse, Outbound};
use crate::error::{Error, Result};
use crate::id::Id;
use crate::storage::{DurableWriter, ExampleResponse, NodeExecution};
use crate::workflow::NodeState;

#[derive(Debug, Default)]
struct Entry {
    exec: Option<NodeExecution>,
    completed: bool,
    execution_sent: bool,
    /// `(example_id, response_id)`
    response: Option<(Id, Id)>,
    response_persisted: bool,
    example_sent: bool,
    /// A successful request always produces a response; hold the row for it.
    awaits_response: bool,
}

impl Entry {
    fn execution_ready(&self) -> bool {
        self.completed
            && !self.execution_sent
            && self.exec.is_some()
            && (self.response_persisted || (self.response.is_none() && !self.awaits_response))
    }

    fn example_ready(&self) -> bool {
        self.completed && self.execution_sent && self.response_persisted && !self.example_sent
    }

    /// Claim whatever is ready to stream. Flags flip here, under the lock.
    fn take_ready(&mut self, force: bool) -> Vec<FlowRunResponse> {
        let mut ready = Vec::new();
        let execution_due = if force {
            !self.execution_sent && self.exec.is_some()
        } else {
            self.execution_ready()
        };
        if execution_due {
            if let Some(exec) = &self.exec {
                ready.push(FlowRunResponse::node(exec));
                self.execution_sent = true;
            }
        }
        if self.example_ready() {
            if let Some((example_id, response_id)) = self.response {
                ready.push(FlowRunResponse::Example {
                    example_id,
                    response_id,
                });
                self.example_sent = true;
            }
        }
        ready
    }
}

pub struct Coordinator {
    writer: DurableWriter,
    stream: mpsc::Sender<Outbound>,
    entries: Mutex<BTreeMap<Id, Entry>>,
    write_gate: tokio::sync::Mutex<()>,
}

impl Coordinator {
    pub fn new(writer: DurableWriter, stream: mpsc::Sender<Outbound>) -> Self {
        Self {
            writer,
            stream,
            entries: Mutex::new(BTreeMap::new()),
            write_gate: tokio::sync::Mutex::new(()),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, BTreeMap<Id, Entry>>> {
        self.entries
            .lock()
            .map_err(|_| Error::Internal("coordinator state poisoned".into()))
    }

    /// Persist the latest snapshot of one execution. Writers queue on the
    /// gate and read the snapshot after acquiring it, so the last write
    /// always carries the newest state.
    async fn persist(&self, execution_id: Id) -> Result<()> {
        let _gate = self.write_gate.lock().await;
        let snapshot = self
            .lock()?
            .get(&execution_id)
            .and_then(|entry| entry.exec.clone());
        match snapshot {
            Some(record) => self.writer.upsert(&record).await,
            None => Ok(()),
        }
    }

    async fn emit(&self, execution_id: Id, force: bool) -> Result<()> {
        let ready = {
            let mut entries = self.lock()?;
            match entries.get_mut(&execution_id) {
                Some(entry) => entry.take_ready(force),
                None => Vec::new(),
            }
        };
        for response in ready {
            if self.stream.send(Outbound::Response(response)).await.is_err() {
                debug!(execution_id = %execution_id, "Stream sender gone, dropping item");
            }
        }
        Ok(())
    }

    /// Track a new execution, attaching a response that arrived first.
    pub async fn register(&self, mut exec: NodeExecution) -> Result<()> {
        let execution_id = exec.id;
        {
            let mut entries = self.lock()?;
            let entry = entries.entry(execution_id).or_default();
            if let Some((_, response_id)) = entry.response {
                exec.response_id = Some(response_id);
            }
            entry.exec = Some(exec);
        }
        self.persist(execution_id).await?;
        self.emit(execution_id, false).await
    }

    /// Attach a captured response. `persisted` tells whether the response row
    /// is already stored.
    pub async fn record_response(
        &self,
        execution_id: Id,
        response: &ExampleResponse,
        persisted: bool,
    ) -> Result<()> {
        let attached = {
            let mut entries = self.lock()?;
            let entry = entries.entry(execution_id).or_default();
            entry.response = Some((response.example_id, response.id));
            entry.response_persisted |= persisted;
            match entry.exec.as_mut() {
                Some(exec) if exec.response_id.is_none() => {
                    exec.response_id = Some(response.id);
                    true
                }
                _ => false,
            }
        };
        if attached {
            self.persist(execution_id).await?;
        }
        self.emit(execution_id, false).await
    }

    pub async fn mark_response_persisted(&self, execution_id: Id) -> Result<()> {
        {
            let mut entries = self.lock()?;
            entries.entry(execution_id).or_default().response_persisted = true;
        }
        self.emit(execution_id, false).await
    }

    /// Apply `mutator` to the tracked record, persist it and mark the
    /// execution completed.
    pub async fn complete<F>(&self, execution_id: Id, mutator: F) -> Result<()>
    where
        F: FnOnce(&mut NodeExecution),
    {
        {
            let mut entries = self.lock()?;
            let Some(entry) = entries.get_mut(&execution_id) else {
                return Err(Error::NotFound(format!("execution {}", execution_id)));
            };
            let Some(exec) = entry.exec.as_mut() else {
                return Err(Error::NotFound(format!("execution {}", execution_id)));
            };
            mutator(exec);
            if let Some((_, response_id)) = entry.response {
                exec.response_id.get_or_insert(response_id);
            }
            entry.awaits_response = exec.state == NodeState::Success;
            entry.completed = true;
        }
        self.persist(execution_id).await?;
        self.emit(execution_id, false).await
    }

    /// Close every tracked execution that never completed as `canceled`.
    pub async fn cancel_incomplete(&self, message: &str) -> Result<usize> {
        let closed: Vec<Id> = {
            let mut entries = self.lock()?;
            let mut closed = Vec::new();
            for (id, entry) in entries.iter_mut() {
                let Some(exec) = entry.exec.as_mut() else {
                    continue;
                };
                if entry.completed {
                    continue;
                }
                if !exec.is_completed() {
                    exec.close(NodeState::Canceled, Some(message.to_string()));
                }
                entry.completed = true;
                closed.push(*id);
            }
            closed
        };
        for id in &closed {
            if let Err(e) = self.persist(*id).await {
                warn!(execution_id = %id, error = %e, "Failed to persist canceled request row");
            }
        }
        Ok(closed.len())
    }

    /// Emit every record and linkage not yet streamed, once.
    pub async fn flush(&self) -> Result<()> {
        let ids: Vec<Id> = self.lock()?.keys().copied().collect();
        for id in ids {
            self.emit(id, true).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{ExecutionStore, SqliteStorage};
    use chrono::Utc;
    use std::sync::Arc;

    struct Harness {
        coordinator: Coordinator,
        storage: Arc<SqliteStorage>,
        rx: mpsc::Receiver<Outbound>,
    }

    fn harness() -> Harness {
        let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
        let (tx, rx) = mpsc::channel(16);
        Harness {
            coordinator: Coordinator::new(DurableWriter::new(storage.clone()), tx),
            storage,
            rx,
        }
    }

    fn drain(rx: &mut mpsc::Receiver<Outbound>) -> Vec<FlowRunResponse> {
        let mut items = Vec::new();
        while let Ok(Outbound::Response(r)) = rx.try_recv() {
            items.push(r);
        }
        items
    }

    fn response(example_id: Id) -> ExampleResponse {
        ExampleResponse {
            id: Id::new(),
            example_id,
            status: 200,
            body: "{}".into(),
            headers: vec![],
            duration_ms: 3,
            created_at: Utc::now(),
        }
    }

    fn succeed(exec: &mut NodeExecution) {
        exec.close(NodeState::Success, None);
    }

    #[tokio::test]
    async fn test_completion_before_response_waits_for_persisted() {
        let mut h = harness();
        let exec = NodeExecution::running(Id::new(), Id::new(), "R1");
        let id = exec.id;
        let resp = response(Id::new());

        h.coordinator.register(exec).await.unwrap();
        h.coordinator.complete(id, succeed).await.unwrap();
        assert!(drain(&mut h.rx).is_empty());

        h.coordinator.record_response(id, &resp, false).await.unwrap();
        assert!(drain(&mut h.rx).is_empty());

        h.coordinator.mark_response_persisted(id).await.unwrap();
        let items = drain(&mut h.rx);
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].kind(), "node");
        assert_eq!(
            items[1],
            FlowRunResponse::Example {
                example_id: resp.example_id,
                response_id: resp.id
            }
        );

        let stored = h.storage.get(id).await.unwrap();
        assert_eq!(stored.response_id, Some(resp.id));
        assert_eq!(stored.state, NodeState::Success);

        h.coordinator.flush().await.unwrap();
        assert!(drain(&mut h.rx).is_empty());
    }

    #[tokio::test]
    async fn test_response_before_registration_is_attached() {
        let mut h = harness();
        let exec = NodeExecution::running(Id::new(), Id::new(), "R1");
        let id = exec.id;
        let resp = response(Id::new());

        h.coordinator.record_response(id, &resp, true).await.unwrap();
        h.coordinator.register(exec).await.unwrap();
        assert!(drain(&mut h.rx).is_empty());

        h.coordinator.complete(id, succeed).await.unwrap();
        let items = drain(&mut h.rx);
        assert_eq!(items.len(), 2);
        assert_eq!(h.storage.get(id).await.unwrap().response_id, Some(resp.id));
    }

    #[tokio::test]
    async fn test_failed_request_streams_without_response() {
        let mut h = harness();
        let exec = NodeExecution::running(Id::new(), Id::new(), "R1");
        let id = exec.id;
        h.coordinator.register(exec).await.unwrap();
        h.coordinator
            .complete(id, |e| e.close(NodeState::Failure, Some("connect refused".into())))
            .await
            .unwrap();
        let items = drain(&mut h.rx);
        assert_eq!(items.len(), 1);
        match &items[0] {
            FlowRunResponse::Node { info, .. } => {
                assert_eq!(info.as_deref(), Some("connect refused"))
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancel_incomplete_then_flush_sends_once() {
        let mut h = harness();
        let exec = NodeExecution::running(Id::new(), Id::new(), "R1");
        let id = exec.id;
        h.coordinator.register(exec).await.unwrap();

        assert_eq!(h.coordinator.cancel_incomplete("run canceled").await.unwrap(), 1);
        h.coordinator.flush().await.unwrap();
        h.coordinator.flush().await.unwrap();

        let items = drain(&mut h.rx);
        assert_eq!(items.len(), 1);
        let stored = h.storage.get(id).await.unwrap();
        assert_eq!(stored.state, NodeState::Canceled);
        assert!(stored.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_complete_unknown_execution_is_not_found() {
        let h = harness();
        let err = h.coordinator.complete(Id::new(), succeed).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
    }
}
