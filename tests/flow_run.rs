//! End-to-end flow runs through the service façade.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use flowrun::api::FlowService;
use flowrun::config::{Config, HttpConfig};
use flowrun::engine::{ChannelStream, FlowNodeState, FlowRunRequest, FlowRunResponse, FlowRunner};
use flowrun::error::Result;
use flowrun::id::Id;
use flowrun::nodes::NodeRegistry;
use flowrun::storage::{ExampleResponse, ResponseStore, SqliteStorage};
use flowrun::workflow::{Flow, NodeConfig, WorkspaceBundle};

struct Fixture {
    _dir: TempDir,
    service: FlowService,
    bundle: WorkspaceBundle,
}

impl Fixture {
    async fn new(yaml: &str) -> Self {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(SqliteStorage::open(&dir.path().join("flowrun.db")).unwrap());
        let service = FlowService::new(storage, &Config::default());
        let imported = service.import_yaml(yaml).await.unwrap();
        let bundle = service
            .storage()
            .get_workspace(imported.workspace_id)
            .await
            .unwrap()
            .unwrap();
        Self {
            _dir: dir,
            service,
            bundle,
        }
    }

    fn flow(&self) -> &Flow {
        &self.bundle.flows[0]
    }

    fn node(&self, name: &str) -> Id {
        self.flow().node_by_name(name).unwrap().id
    }

    async fn run(&self, cancel: CancellationToken) -> (Result<()>, Vec<FlowRunResponse>) {
        let (stream, mut rx) = ChannelStream::new();
        let result = self
            .service
            .flow_run_adhoc(FlowRunRequest::new(self.flow().id), Box::new(stream), cancel)
            .await
            .map(|_| ());
        let mut items = Vec::new();
        while let Ok(item) = rx.try_recv() {
            items.push(item);
        }
        (result, items)
    }

    /// Invariant: no node is left `running` once a run has returned.
    async fn assert_nothing_running(&self) {
        let nodes = self.service.node_list(self.flow().id).await.unwrap();
        assert!(
            nodes.items.iter().all(|i| i.state != FlowNodeState::Running),
            "running rows left behind: {:?}",
            nodes.items
        );
    }
}

fn node_states(items: &[FlowRunResponse], node: Id) -> Vec<FlowNodeState> {
    items
        .iter()
        .filter_map(|item| match item {
            FlowRunResponse::Node { node_id, state, .. } if *node_id == node => Some(*state),
            _ => None,
        })
        .collect()
}

fn request_yaml(base_url: &str) -> String {
    format!(
        r#"
workspace_name: S1
requests:
  - name: ok
    method: GET
    url: "{}/ok"
flows:
  - name: main
    steps:
      - request: {{ name: R1, use_request: ok }}
"#,
        base_url
    )
}

async fn ok_server() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/ok"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .mount(&server)
        .await;
    server
}

#[tokio::test]
async fn test_successful_linear_flow() {
    let server = ok_server().await;
    let fixture = Fixture::new(&request_yaml(&server.uri())).await;
    let r1 = fixture.node("R1");
    let NodeConfig::Request { example_id, .. } = &fixture.flow().node_by_name("R1").unwrap().config
    else {
        panic!("R1 is a request node");
    };

    let (result, items) = fixture.run(CancellationToken::new()).await;
    result.unwrap();

    assert_eq!(
        node_states(&items, r1),
        vec![FlowNodeState::Running, FlowNodeState::Success]
    );
    let examples: Vec<_> = items
        .iter()
        .filter_map(|item| match item {
            FlowRunResponse::Example {
                example_id,
                response_id,
            } => Some((*example_id, *response_id)),
            _ => None,
        })
        .collect();
    assert_eq!(examples.len(), 1);
    assert_eq!(examples[0].0, *example_id);
    assert_eq!(items.last().unwrap().kind(), "version");

    let rows = fixture.service.node_execution_list(r1).await.unwrap().items;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].state, FlowNodeState::Success);
    assert_eq!(rows[0].response_id, Some(examples[0].1));
    assert!(rows[0].completed_at.is_some());
    assert_eq!(rows[0].output.as_ref().unwrap()["response"]["body"], json!({"ok": true}));

    let stored = fixture
        .service
        .storage()
        .get_response(examples[0].1)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, 200);
    fixture.assert_nothing_running().await;
}

#[tokio::test]
async fn test_client_cancel_mid_loop() {
    let fixture = Fixture::new(
        r#"
workspace_name: S2
flows:
  - name: main
    steps:
      - for: { name: L, iter_count: 1000000, loop: body }
      - js: { name: body, code: "L.index" }
"#,
    )
    .await;

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let (result, _items) = fixture.run(cancel).await;
    assert!(result.unwrap_err().is_cancellation());
    fixture.assert_nothing_running().await;

    let loop_rows = fixture
        .service
        .node_execution_list(fixture.node("L"))
        .await
        .unwrap()
        .items;
    assert!(loop_rows
        .iter()
        .any(|r| r.name == "L" && matches!(r.state, FlowNodeState::Canceled | FlowNodeState::Failure)));

    let body_rows = fixture
        .service
        .node_execution_list(fixture.node("body"))
        .await
        .unwrap()
        .items;
    assert!(!body_rows.is_empty());
    assert_ne!(body_rows[0].state, FlowNodeState::Running);
}

#[tokio::test]
async fn test_client_disconnect_still_closes_rows() {
    let fixture = Fixture::new(
        r#"
workspace_name: Disconnect
flows:
  - name: main
    steps:
      - for: { name: L, iter_count: 1000000, loop: body }
      - js: { name: body, code: "L.index" }
"#,
    )
    .await;

    let (stream, rx) = ChannelStream::new();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        drop(rx);
    });
    let result = fixture
        .service
        .flow_run_adhoc(
            FlowRunRequest::new(fixture.flow().id),
            Box::new(stream),
            CancellationToken::new(),
        )
        .await;
    assert!(result.unwrap_err().is_cancellation());
    fixture.assert_nothing_running().await;
}

/// Response store that persists slowly, so node completion always wins the race.
struct SlowResponses {
    inner: Arc<SqliteStorage>,
    delay: Duration,
}

#[async_trait]
impl ResponseStore for SlowResponses {
    async fn save_response(&self, response: &ExampleResponse) -> Result<()> {
        tokio::time::sleep(self.delay).await;
        self.inner.save_response(response).await
    }
}

#[tokio::test]
async fn test_request_completion_waits_for_persisted_response() {
    let server = ok_server().await;
    let fixture = Fixture::new(&request_yaml(&server.uri())).await;
    let storage = fixture.service.storage().clone();
    let runner = FlowRunner::new(
        storage.clone(),
        storage.clone(),
        Arc::new(SlowResponses {
            inner: storage.clone(),
            delay: Duration::from_millis(300),
        }),
        NodeRegistry::new(&HttpConfig::default()),
        Config::default().run,
    );
    let service = fixture.service.clone().with_runner(runner);

    let (stream, mut rx) = ChannelStream::new();
    service
        .flow_run_adhoc(
            FlowRunRequest::new(fixture.flow().id),
            Box::new(stream),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    let mut items = Vec::new();
    while let Ok(item) = rx.try_recv() {
        items.push(item);
    }

    let r1 = fixture.node("R1");
    let success_at: Vec<usize> = items
        .iter()
        .enumerate()
        .filter(|(_, item)| {
            matches!(item, FlowRunResponse::Node { node_id, state: FlowNodeState::Success, .. } if *node_id == r1)
        })
        .map(|(i, _)| i)
        .collect();
    assert_eq!(success_at.len(), 1, "exactly one terminal message: {:?}", items);

    // The example linkage directly follows the execution it belongs to.
    let FlowRunResponse::Example { response_id, .. } = &items[success_at[0] + 1] else {
        panic!("expected example after execution, got {:?}", items);
    };
    let rows = fixture.service.node_execution_list(r1).await.unwrap().items;
    assert_eq!(rows[0].response_id, Some(*response_id));
    assert!(storage.get_response(*response_id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_throw_in_loop_cancels_loop_main() {
    let fixture = Fixture::new(
        r#"
workspace_name: S5
flows:
  - name: main
    steps:
      - for: { name: L, iter_count: 5, loop: check }
      - if: { name: check, condition: "unknownVar > 0", then: A, else: B }
      - js: { name: A, code: "1" }
      - js: { name: B, code: "2" }
"#,
    )
    .await;
    let (result, items) = fixture.run(CancellationToken::new()).await;
    assert!(result.is_err());

    let loop_id = fixture.node("L");
    let states = node_states(&items, loop_id);
    assert_eq!(states.first(), Some(&FlowNodeState::Running));
    assert_eq!(states.last(), Some(&FlowNodeState::Canceled));
    assert!(!states.contains(&FlowNodeState::Success));

    let rows = fixture.service.node_execution_list(loop_id).await.unwrap().items;
    let summaries: Vec<_> = rows
        .iter()
        .filter(|r| {
            r.output
                .as_ref()
                .and_then(|o| o.get("failedAtIteration"))
                .is_some()
        })
        .collect();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].output.as_ref().unwrap()["failedAtIteration"], 0);
    assert_eq!(summaries[0].output.as_ref().unwrap()["totalIterations"], 5);
    assert!(node_states(&items, fixture.node("A")).is_empty());
    fixture.assert_nothing_running().await;
}

#[tokio::test]
async fn test_successful_for_each_rows() {
    let fixture = Fixture::new(
        r##"
workspace_name: Loops
flows:
  - name: main
    steps:
      - js: { name: data, code: "#{ b: 2, a: 1, c: 3 }" }
      - for_each: { name: each, items: "{{ data }}", loop: body }
      - js: { name: body, code: "each.key + \"=\" + each.item" }
"##,
    )
    .await;
    let (result, items) = fixture.run(CancellationToken::new()).await;
    result.unwrap();

    let loop_id = fixture.node("each");
    // Only the main row's running state reaches the client.
    assert_eq!(node_states(&items, loop_id), vec![FlowNodeState::Running]);

    let rows = fixture.service.node_execution_list(loop_id).await.unwrap().items;
    let iterations: Vec<_> = rows.iter().filter(|r| r.name != "each").collect();
    assert_eq!(iterations.len(), 3);
    assert!(iterations.iter().all(|r| r.state == FlowNodeState::Success));
    let mut keys: Vec<String> = iterations
        .iter()
        .map(|r| r.output.as_ref().unwrap()["key"].as_str().unwrap().to_string())
        .collect();
    keys.sort();
    assert_eq!(keys, vec!["a", "b", "c"]);
    assert!(rows.iter().any(|r| r.name == "each" && r.state == FlowNodeState::Success));

    let body_rows = fixture
        .service
        .node_execution_list(fixture.node("body"))
        .await
        .unwrap()
        .items;
    let mut outputs: Vec<String> = body_rows
        .iter()
        .map(|r| r.output.as_ref().unwrap().as_str().unwrap().to_string())
        .collect();
    outputs.sort();
    assert_eq!(outputs, vec!["a=1", "b=2", "c=3"]);
}

#[tokio::test]
async fn test_rerun_replaces_previous_rows() {
    let fixture = Fixture::new(
        r#"
workspace_name: Rerun
flows:
  - name: main
    steps:
      - js: { name: a, code: "1" }
"#,
    )
    .await;
    fixture.run(CancellationToken::new()).await.0.unwrap();
    fixture.run(CancellationToken::new()).await.0.unwrap();

    let rows = fixture
        .service
        .node_execution_list(fixture.node("a"))
        .await
        .unwrap()
        .items;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].state, FlowNodeState::Success);
}

#[tokio::test]
async fn test_failed_request_streams_without_example() {
    let fixture = Fixture::new(
        r#"
workspace_name: Broken
requests:
  - name: bad
    method: GET
    url: "ftp://example.com/file"
flows:
  - name: main
    steps:
      - request: { name: R1, use_request: bad }
"#,
    )
    .await;

    let (result, items) = fixture.run(CancellationToken::new()).await;
    assert!(result.is_err());
    let r1 = fixture.node("R1");
    assert_eq!(
        node_states(&items, r1),
        vec![FlowNodeState::Running, FlowNodeState::Failure]
    );
    assert!(!items.iter().any(|i| i.kind() == "example"));
    let rows = fixture.service.node_execution_list(r1).await.unwrap().items;
    assert_eq!(rows[0].state, FlowNodeState::Failure);
    assert!(rows[0].response_id.is_none());
    fixture.assert_nothing_running().await;
}
