//! Decides whether a node status is persisted, streamed, or both.

use crate::nodes::NodeStatus;
use crate::workflow::NodeState;

const ITERATION_MARKERS: [&str; 3] = ["index", "key", "completed"];
const SUMMARY_MARKERS: [&str; 3] = ["failedAtIndex", "failedAtKey", "failedAtIteration"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Visibility {
    pub persist: bool,
    pub stream: bool,
}

impl Visibility {
    const BOTH: Visibility = Visibility {
        persist: true,
        stream: true,
    };
    const PERSIST_ONLY: Visibility = Visibility {
        persist: true,
        stream: false,
    };
}

fn has_marker(status: &NodeStatus, markers: &[&str]) -> bool {
    markers.iter().any(|m| status.output_field(m).is_some())
}

/// Iteration rows are recognised by their output markers, whatever node
/// produced them.
pub fn is_iteration(status: &NodeStatus) -> bool {
    has_marker(status, &ITERATION_MARKERS)
}

/// A loop failure summary, or any iteration row that ended badly.
pub fn is_failure_summary(status: &NodeStatus) -> bool {
    has_marker(status, &SUMMARY_MARKERS)
        || (status.state != NodeState::Success && status.error.is_some())
}

pub fn decide(status: &NodeStatus) -> Visibility {
    if is_iteration(status) || has_marker(status, &SUMMARY_MARKERS) {
        // every iteration row is kept so none is left running in storage
        return Visibility {
            persist: true,
            stream: is_failure_summary(status),
        };
    }
    if status.kind.is_loop() && status.state == NodeState::Success {
        return Visibility::PERSIST_ONLY;
    }
    Visibility::BOTH
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::id::Id;
    use crate::workflow::NodeKind;
    use serde_json::json;

    fn status(kind: NodeKind, state: NodeState) -> NodeStatus {
        NodeStatus::new(Id::new(), Id::new(), "n", kind).with_state(state)
    }

    #[test]
    fn test_successful_iteration_is_persisted_not_streamed() {
        let running = status(NodeKind::For, NodeState::Running).with_output(json!({"index": 0}));
        assert_eq!(decide(&running), Visibility::PERSIST_ONLY);

        let done = status(NodeKind::For, NodeState::Success)
            .with_output(json!({"index": 0, "completed": true}));
        assert_eq!(decide(&done), Visibility::PERSIST_ONLY);
    }

    #[test]
    fn test_failed_iteration_and_summary_are_streamed() {
        let failed = status(NodeKind::ForEach, NodeState::Failure)
            .with_output(json!({"index": 1, "key": "b"}))
            .with_error(&Error::Node("boom".into()));
        assert_eq!(decide(&failed), Visibility::BOTH);

        let summary = status(NodeKind::For, NodeState::Failure)
            .with_output(json!({"failedAtIteration": 3, "totalIterations": 5}));
        assert_eq!(decide(&summary), Visibility::BOTH);
    }

    #[test]
    fn test_loop_main_rows() {
        assert_eq!(decide(&status(NodeKind::For, NodeState::Running)), Visibility::BOTH);
        let success = status(NodeKind::For, NodeState::Success).with_output(json!({"iterations": 3}));
        assert_eq!(decide(&success), Visibility::PERSIST_ONLY);
        assert_eq!(decide(&status(NodeKind::ForEach, NodeState::Canceled)), Visibility::BOTH);
        assert_eq!(decide(&status(NodeKind::For, NodeState::Failure)), Visibility::BOTH);
    }

    #[test]
    fn test_markers_apply_regardless_of_kind() {
        let js = status(NodeKind::Js, NodeState::Success).with_output(json!({"index": 4}));
        assert!(is_iteration(&js));
        assert_eq!(decide(&js), Visibility::PERSIST_ONLY);

        let plain = status(NodeKind::Js, NodeState::Success).with_output(json!({"value": 1}));
        assert_eq!(decide(&plain), Visibility::BOTH);
    }
}
