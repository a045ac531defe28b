//! Level-based node positioning.
//!
//! Each node sits one level below its deepest predecessor; nodes on the same
//! level are spread horizontally and centered on x = 0.

use std::collections::{HashMap, VecDeque};

use super::types::{Flow, Position};
use crate::id::Id;

/// Horizontal distance between siblings on one level.
pub const NODE_SPACING_X: f64 = 300.0;
/// Vertical distance between levels.
pub const LEVEL_SPACING_Y: f64 = 150.0;

/// Compute the level of every node reachable from `start`.
pub fn compute_levels(flow: &Flow, start: Id) -> HashMap<Id, usize> {
    let mut indegree: HashMap<Id, usize> = HashMap::new();
    for edge in &flow.edges {
        *indegree.entry(edge.target_id).or_default() += 1;
    }

    let mut levels = HashMap::from([(start, 0usize)]);
    let mut queue = VecDeque::from([start]);
    while let Some(id) = queue.pop_front() {
        let level = levels.get(&id).copied().unwrap_or(0);
        for edge in flow.outgoing(id) {
            let entry = levels.entry(edge.target_id).or_insert(0);
            *entry = (*entry).max(level + 1);
            if let Some(d) = indegree.get_mut(&edge.target_id) {
                *d = d.saturating_sub(1);
                if *d == 0 {
                    queue.push_back(edge.target_id);
                }
            }
        }
    }
    levels
}

/// Assign positions to every node of `flow`. Unreachable nodes are left alone.
pub fn layout_flow(flow: &mut Flow) {
    let Ok(start) = flow.start_node() else {
        return;
    };
    let levels = compute_levels(flow, start.id);

    let mut rows: Vec<Vec<Id>> = Vec::new();
    for node in &flow.nodes {
        if let Some(level) = levels.get(&node.id) {
            if rows.len() <= *level {
                rows.resize_with(level + 1, Vec::new);
            }
            rows[*level].push(node.id);
        }
    }

    let mut positions = HashMap::new();
    for (level, row) in rows.iter().enumerate() {
        let offset = (row.len() as f64 - 1.0) / 2.0;
        for (i, id) in row.iter().enumerate() {
            positions.insert(
                *id,
                Position {
                    x: (i as f64 - offset) * NODE_SPACING_X,
                    y: level as f64 * LEVEL_SPACING_Y,
                },
            );
        }
    }

    for node in &mut flow.nodes {
        if let Some(position) = positions.get(&node.id) {
            node.position = *position;
        }
    }
}
