//! Streaming transport: wire messages and the serialized stream sender.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::id::Id;
use crate::metrics;
use crate::storage::NodeExecution;
use crate::workflow::NodeState;

/// Node state as carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowNodeState {
    Unspecified,
    Running,
    Success,
    Failure,
    Canceled,
}

impl From<NodeState> for FlowNodeState {
    fn from(state: NodeState) -> Self {
        match state {
            NodeState::Unspecified => FlowNodeState::Unspecified,
            NodeState::Running => FlowNodeState::Running,
            NodeState::Success => FlowNodeState::Success,
            NodeState::Failure => FlowNodeState::Failure,
            NodeState::Canceled => FlowNodeState::Canceled,
        }
    }
}

/// One item of a `FlowRunAdHoc` response stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowRunResponse {
    Node {
        node_id: Id,
        state: FlowNodeState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        info: Option<String>,
    },
    Example {
        example_id: Id,
        response_id: Id,
    },
    /// Final marker, sent once when the run ended without a transport error.
    Version { flow_id: Id },
}

impl FlowRunResponse {
    pub fn node(record: &NodeExecution) -> Self {
        FlowRunResponse::Node {
            node_id: record.node_id,
            state: record.state.into(),
            info: record.error.clone(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            FlowRunResponse::Node { .. } => "node",
            FlowRunResponse::Example { .. } => "example",
            FlowRunResponse::Version { .. } => "version",
        }
    }
}

/// Client side of a response stream. Sends are never issued concurrently.
#[async_trait]
pub trait FlowRunStream: Send {
    async fn send(&mut self, response: FlowRunResponse) -> Result<()>;
}

/// Stream backed by an in-process channel. Fails once the receiver is gone.
pub struct ChannelStream {
    tx: mpsc::UnboundedSender<FlowRunResponse>,
}

impl ChannelStream {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<FlowRunResponse>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl FlowRunStream for ChannelStream {
    async fn send(&mut self, response: FlowRunResponse) -> Result<()> {
        self.tx
            .send(response)
            .map_err(|_| Error::Transport("client disconnected".into()))
    }
}

/// Stream writing one JSON document per line.
pub struct JsonLinesStream<W> {
    writer: W,
}

impl<W> JsonLinesStream<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }
}

#[async_trait]
impl<W> FlowRunStream for JsonLinesStream<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, response: FlowRunResponse) -> Result<()> {
        let mut line = serde_json::to_vec(&response)?;
        line.push(b'\n');
        self.writer.write_all(&line).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

/// Work for the stream sender.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Response(FlowRunResponse),
    /// Send the version marker (if the stream is healthy) and stop.
    Finish { flow_id: Id },
}

/// What the stream sender managed to deliver.
#[derive(Debug, Default)]
pub struct StreamReport {
    pub sent: usize,
    pub skipped: usize,
    pub error: Option<Error>,
}

/// Drain `rx` into `stream`, one send at a time.
///
/// The first send error cancels `run_cancel`; later items are counted as
/// skipped so the rest of the run can still close out its records.
pub async fn run_stream_sender(
    mut stream: Box<dyn FlowRunStream>,
    mut rx: mpsc::Receiver<Outbound>,
    run_cancel: CancellationToken,
) -> StreamReport {
    let mut report = StreamReport::default();

    while let Some(item) = rx.recv().await {
        let (response, last) = match item {
            Outbound::Response(response) => (response, false),
            Outbound::Finish { flow_id } => (FlowRunResponse::Version { flow_id }, true),
        };

        if report.error.is_some() {
            report.skipped += 1;
        } else {
            let kind = response.kind();
            match stream.send(response).await {
                Ok(()) => {
                    metrics::record_stream_item(kind);
                    report.sent += 1;
                }
                Err(e) => {
                    warn!(error = %e, "Stream send failed, cancelling run");
                    run_cancel.cancel();
                    report.error = Some(e);
                }
            }
        }

        if last {
            break;
        }
    }

    debug!(sent = report.sent, skipped = report.skipped, "Stream sender finished");
    report
}
