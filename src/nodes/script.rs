//! Embedded Rhai evaluation shared by `js`, `condition` and `for_each` nodes.
//!
//! Scripts run on the blocking pool with the flow variables in scope. A
//! progress hook checks the cancellation token so a cancelled run halts the
//! script between operations.

use rhai::{Dynamic, Engine, EvalAltResult, Scope};
use serde_json::{Map, Number, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};

/// Convert a JSON value into a Rhai value.
pub fn json_to_dynamic(value: &Value) -> Dynamic {
    match value {
        Value::Null => Dynamic::UNIT,
        Value::Bool(b) => Dynamic::from(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Dynamic::from(i),
            None => n.as_f64().map(Dynamic::from).unwrap_or(Dynamic::UNIT),
        },
        Value::String(s) => Dynamic::from(s.clone()),
        Value::Array(items) => {
            Dynamic::from_array(items.iter().map(json_to_dynamic).collect())
        }
        Value::Object(obj) => {
            let mut map = rhai::Map::new();
            for (key, value) in obj {
                map.insert(key.as_str().into(), json_to_dynamic(value));
            }
            Dynamic::from_map(map)
        }
    }
}

/// Convert a Rhai value back into JSON. Unknown types become their string form.
pub fn dynamic_to_json(value: Dynamic) -> Value {
    if value.is_unit() {
        return Value::Null;
    }
    if let Ok(b) = value.as_bool() {
        return Value::Bool(b);
    }
    if let Ok(i) = value.as_int() {
        return Value::from(i);
    }
    if let Ok(f) = value.as_float() {
        return Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null);
    }
    if value.is_string() {
        return Value::String(value.into_string().unwrap_or_default());
    }
    if value.is_array() {
        return match value.into_array() {
            Ok(items) => Value::Array(items.into_iter().map(dynamic_to_json).collect()),
            Err(_) => Value::Null,
        };
    }
    if value.is_map() {
        return match value.try_cast::<rhai::Map>() {
            Some(map) => Value::Object(
                map.into_iter()
                    .map(|(k, v)| (k.to_string(), dynamic_to_json(v)))
                    .collect(),
            ),
            None => Value::Null,
        };
    }
    Value::String(value.to_string())
}

/// Variable names usable as script identifiers.
fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn create_engine(cancel: CancellationToken) -> Engine {
    let mut engine = Engine::new();
    engine.on_progress(move |_| {
        if cancel.is_cancelled() {
            Some(Dynamic::UNIT)
        } else {
            None
        }
    });
    engine.register_fn("to_json", |v: Dynamic| -> String {
        serde_json::to_string(&dynamic_to_json(v)).unwrap_or_default()
    });
    engine.register_fn("from_json", |s: &str| -> Dynamic {
        serde_json::from_str::<Value>(s)
            .map(|v| json_to_dynamic(&v))
            .unwrap_or(Dynamic::UNIT)
    });
    engine
}

enum ScriptFailure {
    Terminated,
    Failed(String),
}

/// Evaluate `source` with `vars` in scope and return its value as JSON.
pub async fn evaluate(
    source: &str,
    vars: Map<String, Value>,
    cancel: &CancellationToken,
) -> Result<Value> {
    if cancel.is_cancelled() {
        return Err(Error::cancelled("script canceled before start"));
    }
    let source = source.to_string();
    let token = cancel.clone();

    let outcome = tokio::task::spawn_blocking(move || {
        let engine = create_engine(token);
        let mut scope = Scope::new();
        for (name, value) in &vars {
            if is_identifier(name) {
                scope.push_dynamic(name.as_str(), json_to_dynamic(value));
            }
        }
        engine
            .eval_with_scope::<Dynamic>(&mut scope, &source)
            .map(dynamic_to_json)
            .map_err(|e| match *e {
                EvalAltResult::ErrorTerminated(..) => ScriptFailure::Terminated,
                other => ScriptFailure::Failed(other.to_string()),
            })
    })
    .await
    .map_err(|e| Error::Internal(format!("script task failed: {}", e)))?;

    match outcome {
        Ok(value) => Ok(value),
        Err(ScriptFailure::Terminated) => {
            debug!("Script terminated by cancellation");
            Err(Error::cancelled("script canceled"))
        }
        Err(ScriptFailure::Failed(message)) => {
            Err(Error::Node(format!("script error: {}", message)))
        }
    }
}

/// Evaluate a boolean expression.
pub async fn evaluate_bool(
    expression: &str,
    vars: Map<String, Value>,
    cancel: &CancellationToken,
) -> Result<bool> {
    match evaluate(expression, vars, cancel).await? {
        Value::Bool(b) => Ok(b),
        other => Err(Error::Node(format!(
            "expression '{}' evaluated to {} instead of a boolean",
            expression, other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn test_evaluate_with_nested_variables() {
        let token = CancellationToken::new();
        let result = evaluate(
            "let total = 0; for x in R1.items { total += x; } #{ sum: total, who: user }",
            vars(json!({"R1": {"items": [1, 2, 3]}, "user": "ann", "bad name": 1})),
            &token,
        )
        .await
        .unwrap();
        assert_eq!(result, json!({"sum": 6, "who": "ann"}));
    }

    #[tokio::test]
    async fn test_unknown_variable_is_node_error() {
        let token = CancellationToken::new();
        let err = evaluate_bool("unknownVar > 0", Map::new(), &token)
            .await
            .unwrap_err();
        assert!(!err.is_cancellation());
        assert!(err.to_string().contains("unknownVar"));
    }

    #[tokio::test]
    async fn test_non_boolean_condition_rejected() {
        let token = CancellationToken::new();
        assert!(evaluate_bool("1 + 1", Map::new(), &token).await.is_err());
        assert!(evaluate_bool("2 > 1", Map::new(), &token).await.unwrap());
    }

    #[tokio::test]
    async fn test_cancellation_halts_script() {
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let err = evaluate("loop { }", Map::new(), &token).await.unwrap_err();
        assert!(err.is_cancellation());
    }

    #[test]
    fn test_json_roundtrip_through_dynamic() {
        let value = json!({"a": [1, 2.5, "x", null, true]});
        assert_eq!(dynamic_to_json(json_to_dynamic(&value)), value);
    }
}
