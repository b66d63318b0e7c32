//! Integration tests for the `http` node type against a mock HTTP server

use kbflow::engine::{ExecuteOptions, WorkflowEngine};
use kbflow::executors::http::HttpNodeExecutor;
use kbflow::models::{ExecutionStatus, StepStatus};
use kbflow::parser::parse_workflow_yaml;
use kbflow::runner::{NodeCall, NodeExecutor, NodeRegistry, PortMap};
use kbflow::state::StateStore;
use serde_json::{json, Value};
use std::time::Duration;
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn call(config: Value, inputs: Value) -> NodeCall {
    NodeCall {
        execution_id: "exec-1".to_string(),
        node_id: "call_provider".to_string(),
        node_type: "http".to_string(),
        config: config.as_object().cloned().unwrap(),
        inputs: inputs.as_object().cloned().unwrap(),
    }
}

#[tokio::test]
async fn test_post_sends_inputs_as_json_body() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/embed"))
        .and(body_json(json!({"text": "hello"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"embedding": [0.5, 0.25]})))
        .expect(1)
        .mount(&server)
        .await;

    let executor = HttpNodeExecutor::new();
    let outputs = executor
        .execute(call(
            json!({"url": format!("{}/v1/embed", server.uri()), "allow_private_ips": true}),
            json!({"text": "hello"}),
        ))
        .await
        .unwrap();

    assert_eq!(outputs["embedding"], json!([0.5, 0.25]));
    assert_eq!(outputs["status_code"], 200);
}

#[tokio::test]
async fn test_get_sends_inputs_as_query() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/search"))
        .and(query_param("q", "leases"))
        .and(header("X-Api-Key", "secret"))
        .respond_with(ResponseTemplate::new(200).set_body_string("plain text"))
        .mount(&server)
        .await;

    let executor = HttpNodeExecutor::new();
    let outputs = executor
        .execute(call(
            json!({
                "url": format!("{}/search", server.uri()),
                "method": "GET",
                "headers": {"X-Api-Key": "secret"},
                "allow_private_ips": true
            }),
            json!({"q": "leases"}),
        ))
        .await
        .unwrap();

    assert_eq!(outputs["body"], "plain text");
    assert_eq!(outputs["status_code"], 200);
}

#[tokio::test]
async fn test_non_object_json_lands_under_response() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!(["a", "b"])))
        .mount(&server)
        .await;

    let outputs = HttpNodeExecutor::new()
        .execute(call(json!({"url": server.uri(), "allow_private_ips": true}), json!({})))
        .await
        .unwrap();

    assert_eq!(outputs["response"], json!(["a", "b"]));
    assert_eq!(outputs["status_code"], 201);
}

#[tokio::test]
async fn test_error_status_fails_node() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;

    let err = HttpNodeExecutor::new()
        .execute(call(json!({"url": server.uri(), "allow_private_ips": true}), json!({})))
        .await
        .unwrap_err();

    assert!(err.to_string().contains("500"));
}

#[tokio::test]
async fn test_request_timeout() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
        .mount(&server)
        .await;

    let err = HttpNodeExecutor::new()
        .execute(call(
            json!({"url": server.uri(), "timeout": 1, "allow_private_ips": true}),
            json!({}),
        ))
        .await
        .unwrap_err();

    assert!(err.to_string().contains("timed out"));
}

#[tokio::test]
async fn test_loopback_blocked_without_opt_in() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let result = HttpNodeExecutor::new()
        .execute(call(json!({"url": server.uri()}), json!({})))
        .await;

    assert!(result.is_err());
}

#[tokio::test]
async fn test_workflow_retries_transient_failure_and_routes_on_status() {
    let server = MockServer::start().await;

    // First call fails, the retry succeeds
    Mock::given(method("POST"))
        .and(path("/answer"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/answer"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"answer": "42"})))
        .mount(&server)
        .await;

    let yaml = format!(
        r#"
id: provider
name: Provider call
nodes:
  - id: start
    type: input
  - id: call_provider
    type: http
    timeout: 10
    retry: {{ max_retries: 2, base_delay: 10, max_delay: 50 }}
    config:
      url: {}/answer
      allow_private_ips: true
  - id: finish
    type: output
edges:
  - {{ id: e1, source: start, target: call_provider, source_output: query, target_input: query }}
  - id: e2
    source: call_provider
    target: finish
    source_output: answer
    target_input: answer
    condition: "output.status_code == 200"
"#,
        server.uri()
    );
    let definition = parse_workflow_yaml(&yaml).unwrap();

    let engine = WorkflowEngine::builder(StateStore::in_memory().unwrap())
        .registry(NodeRegistry::with_builtins())
        .build()
        .unwrap();
    let input: PortMap = json!({"query": "meaning of life"}).as_object().cloned().unwrap();
    let ctx = engine
        .execute_workflow(&definition, input, ExecuteOptions::default())
        .await
        .unwrap();

    assert_eq!(ctx.status, ExecutionStatus::Completed, "error: {:?}", ctx.error);
    assert_eq!(ctx.output_data.get("answer"), Some(&json!("42")));

    let step = ctx.step_for("call_provider").unwrap();
    assert_eq!(step.status, StepStatus::Completed);
    assert_eq!(step.metrics.get("attempts"), Some(&json!(2)));

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 2);
    let body: Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(body, json!({"query": "meaning of life"}));
}
