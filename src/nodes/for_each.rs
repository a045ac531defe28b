//! `for_each` node: runs its body once per element of a sequence or mapping.
//!
//! Mappings are iterated in lexicographic key order.

use async_trait::async_trait;
use serde_json::{json, Value};

use super::for_loop::{IterationItem, IterationLabel, LoopDriver};
use super::script;
use super::template;
use super::types::{FlowNode, RunRequest, RunResult};
use crate::error::{Error, Result};
use crate::id::Id;
use crate::workflow::{ErrorHandling, NodeKind};

pub struct ForEachNode {
    id: Id,
    name: String,
    items: String,
    error_handling: ErrorHandling,
}

impl ForEachNode {
    pub fn new(
        id: Id,
        name: impl Into<String>,
        items: impl Into<String>,
        error_handling: ErrorHandling,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            items: items.into(),
            error_handling,
        }
    }

    /// Evaluate the items expression. A lone `{{ path }}` is a variable
    /// lookup; anything else is evaluated as a script expression.
    async fn evaluate_items(&self, req: &RunRequest) -> Result<Value> {
        let expression = self.items.trim();
        let names = template::placeholders(expression);
        let lone_placeholder = names.len() == 1
            && template::placeholder_regex()
                .replace(expression, "")
                .trim()
                .is_empty();
        if lone_placeholder {
            return req.variable(&names[0]).await.ok_or_else(|| {
                Error::Node(format!(
                    "for_each items '{}' did not resolve to a variable",
                    expression
                ))
            });
        }
        let expression = req.resolve(expression).await;
        let vars = req.scope_for(&expression).await;
        script::evaluate(&expression, vars, &req.cancel).await
    }
}

/// Split a sequence or mapping into iteration items.
fn iteration_items(value: Value) -> Result<(Vec<IterationItem>, IterationLabel)> {
    match value {
        Value::Array(values) => Ok((
            values
                .into_iter()
                .enumerate()
                .map(|(index, value)| IterationItem {
                    index,
                    key: None,
                    value: Some(value),
                })
                .collect(),
            IterationLabel::Sequence,
        )),
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let items = entries
                .into_iter()
                .enumerate()
                .map(|(index, (key, value))| IterationItem {
                    index,
                    key: Some(key),
                    value: Some(value),
                })
                .collect();
            Ok((items, IterationLabel::Mapping))
        }
        other => Err(Error::Node(format!(
            "for_each items must be a sequence or mapping, got {}",
            other
        ))),
    }
}

#[async_trait]
impl FlowNode for ForEachNode {
    fn id(&self) -> Id {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> NodeKind {
        NodeKind::ForEach
    }

    async fn run_sync(&self, req: &RunRequest) -> RunResult {
        let value = match self.evaluate_items(req).await {
            Ok(value) => value,
            Err(e) => return RunResult::failed(e),
        };
        let (items, label) = match iteration_items(value) {
            Ok(split) => split,
            Err(e) => return RunResult::failed(e),
        };
        let count = items.len();
        let driver = LoopDriver {
            id: self.id,
            name: &self.name,
            kind: NodeKind::ForEach,
            error_handling: self.error_handling,
            label,
        };
        driver
            .run(req, items.into_iter(), json!({ "items": count }))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mapping_items_sorted_by_key() {
        let (items, label) = iteration_items(json!({"b": 2, "a": 1, "c": 3})).unwrap();
        assert_eq!(label, IterationLabel::Mapping);
        let keys: Vec<_> = items.iter().map(|i| i.key.clone().unwrap()).collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
        assert_eq!(items[1].index, 1);
        assert_eq!(items[1].value, Some(json!(2)));
    }

    #[test]
    fn test_sequence_items() {
        let (items, label) = iteration_items(json!(["x", "y"])).unwrap();
        assert_eq!(label, IterationLabel::Sequence);
        assert_eq!(items.len(), 2);
        assert!(items[0].key.is_none());
    }

    #[test]
    fn test_scalar_rejected() {
        assert!(iteration_items(json!(5)).is_err());
    }
}
