//! Node implementations.
//!
//! Every flow node kind (`no_op`, `request`, `condition`, `for`, `for_each`,
//! `js`) implements [`FlowNode`]. Nodes never hold a reference to the
//! scheduler: they see the node map and edge map through the [`RunRequest`]
//! and report progress through its status sender.

mod condition;
mod for_each;
mod for_loop;
mod js;
mod noop;
mod registry;
mod request;
pub mod script;
pub mod template;
mod types;

pub use condition::ConditionNode;
pub use for_each::ForEachNode;
pub use for_loop::ForNode;
pub use js::JsNode;
pub use noop::NoOpNode;
pub use registry::{edge_map, NodeRegistry};
pub use request::RequestNode;
pub use types::{
    EdgeMap, FlowNode, IterationContext, IterationScope, NodeError, NodeMap, NodeStatus,
    ReadTracker, ResponseEvent, RunOutcome, RunRequest, RunResult, StatusSender,
};
