//! Request node: sends the node's HTTP request and reports the response on
//! the response side channel.
//!
//! The request is assembled from the base endpoint/example with the delta
//! layered on top; `{{ var }}` placeholders are resolved at run time.

use std::collections::BTreeMap;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, Method};
use serde_json::{json, Value};
use tracing::{debug, info};

use super::types::{FlowNode, ResponseEvent, RunRequest, RunResult};
use crate::error::{Error, Result};
use crate::id::Id;
use crate::metrics;
use crate::storage::ExampleResponse;
use crate::workflow::{EdgeHandle, KeyValue, NodeKind, RequestTemplate};

/// Only plain http(s) URLs are sent.
fn validate_url(url: &str) -> Result<reqwest::Url> {
    let parsed = reqwest::Url::parse(url)
        .map_err(|e| Error::Node(format!("Invalid URL '{}': {}", url, e)))?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        scheme => Err(Error::Node(format!(
            "Unsupported URL scheme '{}'. Only http and https are allowed.",
            scheme
        ))),
    }
}

fn to_object(pairs: &[KeyValue]) -> Value {
    let map: BTreeMap<&str, &str> = pairs
        .iter()
        .map(|kv| (kv.key.as_str(), kv.value.as_str()))
        .collect();
    json!(map)
}

/// Request with placeholders resolved.
#[derive(Debug, Clone)]
struct PreparedRequest {
    method: String,
    url: String,
    headers: Vec<KeyValue>,
    query: Vec<KeyValue>,
    body: String,
}

struct RawResponse {
    status: u16,
    headers: Vec<KeyValue>,
    body: String,
}

pub struct RequestNode {
    id: Id,
    name: String,
    example_id: Id,
    template: RequestTemplate,
    client: Client,
}

impl RequestNode {
    pub fn new(
        id: Id,
        name: impl Into<String>,
        example_id: Id,
        template: RequestTemplate,
        client: Client,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            example_id,
            template,
            client,
        }
    }

    async fn prepare(&self, req: &RunRequest) -> PreparedRequest {
        let mut headers = Vec::with_capacity(self.template.headers.len());
        for kv in self.template.headers.iter().filter(|kv| !kv.key.is_empty()) {
            headers.push(KeyValue::new(kv.key.clone(), req.resolve(&kv.value).await));
        }
        let mut query = Vec::with_capacity(self.template.query.len());
        for kv in self.template.query.iter().filter(|kv| !kv.key.is_empty()) {
            query.push(KeyValue::new(kv.key.clone(), req.resolve(&kv.value).await));
        }
        PreparedRequest {
            method: req.resolve(&self.template.method).await.to_uppercase(),
            url: req.resolve(&self.template.url).await,
            headers,
            query,
            body: req.resolve(&self.template.body).await,
        }
    }

    async fn send(&self, prepared: &PreparedRequest) -> Result<RawResponse> {
        let url = validate_url(&prepared.url)?;
        let method = Method::from_bytes(prepared.method.as_bytes())
            .map_err(|_| Error::Node(format!("Unknown HTTP method: {}", prepared.method)))?;

        let mut request = self.client.request(method, url);
        if !prepared.query.is_empty() {
            let pairs: Vec<(&str, &str)> = prepared
                .query
                .iter()
                .map(|kv| (kv.key.as_str(), kv.value.as_str()))
                .collect();
            request = request.query(&pairs);
        }
        for kv in &prepared.headers {
            request = request.header(kv.key.as_str(), kv.value.as_str());
        }
        if !prepared.body.is_empty() {
            request = request.body(prepared.body.clone());
        }

        let response = request.send().await?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(k, v)| KeyValue::new(k.as_str(), v.to_str().unwrap_or("")))
            .collect();
        let body = response.text().await.map_err(|e| {
            Error::Node(format!(
                "Failed to read HTTP response body from {}: {}",
                prepared.url, e
            ))
        })?;

        Ok(RawResponse {
            status,
            headers,
            body,
        })
    }
}

#[async_trait]
impl FlowNode for RequestNode {
    fn id(&self) -> Id {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Request
    }

    async fn run_sync(&self, req: &RunRequest) -> RunResult {
        let prepared = self.prepare(req).await;
        debug!(node = %self.name, "HTTP {} {}", prepared.method, prepared.url);

        let started = Instant::now();
        let raw = tokio::select! {
            biased;
            _ = req.cancel.cancelled() => {
                return RunResult::failed(Error::cancelled(format!(
                    "request '{}' canceled",
                    self.name
                )));
            }
            outcome = self.send(&prepared) => match outcome {
                Ok(raw) => raw,
                Err(e) => return RunResult::failed(e),
            },
        };
        let duration = started.elapsed();

        metrics::record_http_request(&prepared.method, raw.status);
        info!(
            "HTTP {} {} -> {} ({}ms)",
            prepared.method,
            prepared.url,
            raw.status,
            duration.as_millis()
        );

        let body_value =
            serde_json::from_str::<Value>(&raw.body).unwrap_or_else(|_| Value::String(raw.body.clone()));
        let output = json!({
            "request": {
                "method": prepared.method,
                "url": prepared.url,
                "headers": to_object(&prepared.headers),
                "queries": to_object(&prepared.query),
                "body": prepared.body,
            },
            "response": {
                "status": raw.status,
                "headers": to_object(&raw.headers),
                "body": body_value,
                "duration": duration.as_millis() as u64,
            },
        });
        req.publish(&self.name, output.clone()).await;

        let event = ResponseEvent {
            execution_id: req.execution_id,
            response: ExampleResponse {
                id: Id::new(),
                example_id: self.example_id,
                status: raw.status,
                body: raw.body,
                headers: raw.headers,
                duration_ms: duration.as_millis() as u64,
                created_at: Utc::now(),
            },
        };
        if req.responses.send(event).await.is_err() {
            debug!(node = %self.name, "Response consumer gone");
        }

        RunResult::next(req.targets(self.id, EdgeHandle::Unspecified)).with_output(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::types::{EdgeMap, NodeMap, StatusSender};
    use serde_json::Map;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;
    use wiremock::matchers::{body_string, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn template(url: String) -> RequestTemplate {
        RequestTemplate {
            method: "post".into(),
            url,
            headers: vec![KeyValue::new("Authorization", "Bearer {{token}}")],
            query: vec![KeyValue::new("page", "{{page}}")],
            body: r#"{"name":"{{user}}"}"#.into(),
        }
    }

    fn request(
        cancel: CancellationToken,
    ) -> (RunRequest, mpsc::Receiver<ResponseEvent>) {
        let (status, _) = StatusSender::channel(8);
        let (responses, rx) = mpsc::channel(8);
        let mut vars = Map::new();
        vars.insert("token".into(), json!("abc"));
        vars.insert("page".into(), json!(2));
        vars.insert("user".into(), json!("ann"));
        let mut req = RunRequest::new(vars, NodeMap::new(), EdgeMap::new(), status, responses, cancel);
        req.execution_id = Id::new();
        (req, rx)
    }

    #[tokio::test]
    async fn test_request_resolves_variables_and_reports_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/users"))
            .and(header("Authorization", "Bearer abc"))
            .and(query_param("page", "2"))
            .and(body_string(r#"{"name":"ann"}"#))
            .respond_with(ResponseTemplate::new(201).set_body_string(r#"{"ok":true}"#))
            .mount(&server)
            .await;

        let example_id = Id::new();
        let node = RequestNode::new(
            Id::new(),
            "R1",
            example_id,
            template(format!("{}/users", server.uri())),
            Client::new(),
        );
        let (req, mut rx) = request(CancellationToken::new());
        let result = node.run_sync(&req).await;
        assert!(result.error.is_none(), "{:?}", result.error);

        let output = result.output.unwrap();
        assert_eq!(output["response"]["status"], 201);
        assert_eq!(output["response"]["body"]["ok"], true);
        assert_eq!(req.variable("R1.response.status").await, Some(json!(201)));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.execution_id, req.execution_id);
        assert_eq!(event.response.example_id, example_id);
        assert_eq!(event.response.status, 201);
    }

    #[tokio::test]
    async fn test_cancel_aborts_in_flight_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(std::time::Duration::from_secs(10)))
            .mount(&server)
            .await;

        let node = RequestNode::new(
            Id::new(),
            "slow",
            Id::new(),
            template(server.uri()),
            Client::new(),
        );
        let token = CancellationToken::new();
        let (req, mut rx) = request(token.clone());
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let result = node.run_sync(&req).await;
        assert!(started.elapsed() < std::time::Duration::from_secs(5));
        assert!(result.error.unwrap().is_cancellation());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unsupported_scheme_fails() {
        let node = RequestNode::new(
            Id::new(),
            "ftp",
            Id::new(),
            template("ftp://example.com/file".into()),
            Client::new(),
        );
        let (req, _rx) = request(CancellationToken::new());
        let result = node.run_sync(&req).await;
        assert!(result.error.unwrap().to_string().contains("Unsupported URL scheme"));
    }
}
