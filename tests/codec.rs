//! Simplified YAML import/export through storage.

use std::collections::BTreeSet;
use std::sync::Arc;

use tempfile::TempDir;

use flowrun::api::FlowService;
use flowrun::config::Config;
use flowrun::storage::SqliteStorage;
use flowrun::workflow::{import_workspace, NodeConfig, WorkspaceBundle};

const YAML: &str = r#"
workspace_name: codec
environments:
  - name: dev
    variables:
      region: eu
requests:
  - name: get-user
    method: GET
    url: "http://api.local/users"
    headers:
      Authorization: "Bearer {{token}}"
      Accept: application/json
flows:
  - name: main
    variables:
      - name: token
        value: abc
    steps:
      - request: { name: fetch, use_request: get-user }
      - if: { name: check, condition: "fetch.response.status == 200", then: ok, else: bad }
      - js: { name: ok, code: "1" }
      - js: { name: bad, code: "2" }
      - for: { name: repeat, iter_count: 3, loop: tick, depends_on: [ok, bad] }
      - js: { name: tick, code: "repeat.index" }
      - js: { name: after, code: "3", depends_on: [repeat] }
"#;

type NodeSet = BTreeSet<(String, String)>;
type EdgeSet = BTreeSet<(String, String, String)>;

fn graph(bundle: &WorkspaceBundle) -> (NodeSet, EdgeSet) {
    let flow = &bundle.flows[0];
    let name = |id| flow.node(id).map(|n| n.name.clone()).unwrap_or_default();
    let nodes = flow
        .nodes
        .iter()
        .map(|n| (n.name.clone(), format!("{:?}", n.kind())))
        .collect();
    let edges = flow
        .edges
        .iter()
        .map(|e| (name(e.source_id), name(e.target_id), format!("{:?}", e.handle)))
        .collect();
    (nodes, edges)
}

/// Header values of the default and delta examples behind `fetch`.
fn auth_layers(bundle: &WorkspaceBundle) -> (String, String) {
    let fetch = bundle.flows[0].node_by_name("fetch").unwrap();
    let NodeConfig::Request {
        example_id,
        delta_example_id,
        ..
    } = &fetch.config
    else {
        panic!("fetch is a request node");
    };
    let default = bundle
        .examples
        .iter()
        .find(|e| e.version_parent_id == Some(*example_id))
        .unwrap();
    let delta = bundle.example(delta_example_id.unwrap()).unwrap();
    let header = |headers: &[flowrun::workflow::KeyValue]| {
        headers
            .iter()
            .find(|h| h.key == "Authorization")
            .map(|h| h.value.clone())
            .unwrap()
    };
    (header(&default.headers), header(&delta.headers))
}

#[tokio::test]
async fn test_placeholders_survive_store_and_export() {
    let dir = TempDir::new().unwrap();
    let storage = Arc::new(SqliteStorage::open(&dir.path().join("codec.db")).unwrap());
    let service = FlowService::new(storage, &Config::default());

    let imported = service.import_yaml(YAML).await.unwrap();
    let stored = service
        .storage()
        .get_workspace(imported.workspace_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        auth_layers(&stored),
        ("Bearer abc".to_string(), "Bearer {{token}}".to_string())
    );

    let exported = service.export_yaml("codec").await.unwrap();
    assert!(exported.contains("Bearer {{token}}"));
    assert!(!exported.contains("Bearer abc"));

    let reimported = import_workspace(&exported).unwrap();
    assert_eq!(graph(&reimported), graph(&stored));
    assert_eq!(auth_layers(&reimported), auth_layers(&stored));
    assert_eq!(reimported.environments.len(), 1);
    assert_eq!(reimported.environments[0].name, "dev");
}

#[tokio::test]
async fn test_export_twice_is_stable() {
    let dir = TempDir::new().unwrap();
    let storage = Arc::new(SqliteStorage::open(&dir.path().join("codec.db")).unwrap());
    let service = FlowService::new(storage, &Config::default());

    service.import_yaml(YAML).await.unwrap();
    let first = service.export_yaml("codec").await.unwrap();
    service.import_yaml(&first).await.unwrap();
    let second = service.export_yaml("codec").await.unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_malformed_yaml_is_invalid_input() {
    let err = import_workspace("workspace_name: [unclosed").unwrap_err();
    assert_eq!(err.kind(), flowrun::error::ErrorKind::InvalidInput);
    assert!(import_workspace("flows: []").is_err());
}
