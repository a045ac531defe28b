//! Flow execution engine.

mod controller;
mod coordinator;
pub mod logref;
pub mod scheduler;
pub mod transport;
pub mod visibility;

pub use controller::{FlowOutcome, FlowRunRequest, FlowRunner, RunSummary, TIMEOUT_VARIABLE};
pub use coordinator::Coordinator;
pub use logref::{CollectingLogSink, LogEntry, LogLevel, LogSink, TracingLogSink};
pub use scheduler::{run_flow, run_subgraph};
pub use transport::{
    ChannelStream, FlowNodeState, FlowRunResponse, FlowRunStream, JsonLinesStream, Outbound,
    StreamReport,
};
pub use visibility::Visibility;
