//! Flow graph validation.

use std::collections::{HashMap, HashSet, VecDeque};

use super::types::{EdgeHandle, Flow, NodeKind};
use crate::error::{Error, Result};
use crate::id::Id;

/// Validate a flow graph.
///
/// Checks for:
/// - Unique node IDs and non-empty names
/// - Exactly one start node, with no predecessors
/// - Edges that reference nodes of this flow
/// - `then`/`else` handles only on conditions, `loop` handles only on loops
/// - Every node reachable from the start
/// - No cycles
pub fn validate_flow(flow: &Flow) -> Result<()> {
    let mut ids = HashSet::new();
    for node in &flow.nodes {
        if node.name.trim().is_empty() {
            return Err(Error::InvalidInput(format!(
                "Node {} in flow '{}' has an empty name",
                node.id, flow.name
            )));
        }
        if !ids.insert(node.id) {
            return Err(Error::InvalidInput(format!("Duplicate node ID: {}", node.id)));
        }
    }

    let start = flow.start_node()?;
    if flow.incoming(start.id).next().is_some() {
        return Err(Error::InvalidInput(
            "Start node cannot have predecessors".into(),
        ));
    }

    let kinds: HashMap<Id, NodeKind> = flow.nodes.iter().map(|n| (n.id, n.kind())).collect();
    for edge in &flow.edges {
        let Some(source_kind) = kinds.get(&edge.source_id) else {
            return Err(Error::InvalidInput(format!(
                "Edge {} references unknown source node {}",
                edge.id, edge.source_id
            )));
        };
        if !kinds.contains_key(&edge.target_id) {
            return Err(Error::InvalidInput(format!(
                "Edge {} references unknown target node {}",
                edge.id, edge.target_id
            )));
        }
        match edge.handle {
            EdgeHandle::Then | EdgeHandle::Else if *source_kind != NodeKind::Condition => {
                return Err(Error::InvalidInput(format!(
                    "Edge {}: branch handles may only originate from a condition node",
                    edge.id
                )));
            }
            EdgeHandle::Loop if !source_kind.is_loop() => {
                return Err(Error::InvalidInput(format!(
                    "Edge {}: loop handles may only originate from a for/for_each node",
                    edge.id
                )));
            }
            _ => {}
        }
    }

    let reachable = reachable_from(flow, start.id);
    if let Some(orphan) = flow.nodes.iter().find(|n| !reachable.contains(&n.id)) {
        return Err(Error::InvalidInput(format!(
            "Node '{}' is not reachable from the start node",
            orphan.name
        )));
    }

    if has_cycle(flow) {
        return Err(Error::InvalidInput("Flow has circular dependencies".into()));
    }

    Ok(())
}

/// Every node reachable from `root` through any edge handle.
pub fn reachable_from(flow: &Flow, root: Id) -> HashSet<Id> {
    let mut seen = HashSet::from([root]);
    let mut queue = VecDeque::from([root]);
    while let Some(id) = queue.pop_front() {
        for edge in flow.outgoing(id) {
            if seen.insert(edge.target_id) {
                queue.push_back(edge.target_id);
            }
        }
    }
    seen
}

fn has_cycle(flow: &Flow) -> bool {
    let mut adjacency: HashMap<Id, Vec<Id>> = HashMap::new();
    let mut indegree: HashMap<Id, usize> = flow.nodes.iter().map(|n| (n.id, 0)).collect();
    for edge in &flow.edges {
        adjacency.entry(edge.source_id).or_default().push(edge.target_id);
        *indegree.entry(edge.target_id).or_default() += 1;
    }

    let mut queue: VecDeque<Id> = indegree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut visited = 0;
    while let Some(id) = queue.pop_front() {
        visited += 1;
        for next in adjacency.get(&id).into_iter().flatten() {
            if let Some(d) = indegree.get_mut(next) {
                *d -= 1;
                if *d == 0 {
                    queue.push_back(*next);
                }
            }
        }
    }
    visited != indegree.len()
}
