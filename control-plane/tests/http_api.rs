//! End-to-end HTTP scenarios from the dispatch fabric's testable
//! properties: happy dispatch, rejected credentials, an absent executor
//! timing out, and FIFO ordering under two commands racing a single
//! simulated executor. Run against a real Redis (`TEST_REDIS_URL`,
//! defaults to `redis://127.0.0.1:6379/0`) — see DESIGN.md.

mod support;

use axum::{
    body::{Body, to_bytes},
    http::{Request, StatusCode},
};
use kubently_control_plane::models::{Command, CommandResult, CommandType, ResultStatus};
use serde_json::{Value, json};
use tower::ServiceExt;

use support::{READ_ONLY_API_KEY, TEST_API_KEY, spawn, unique_cluster_id};

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn json_request(method: &str, uri: &str, api_key: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .header("x-api-key", api_key)
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap()
}

#[tokio::test]
async fn happy_dispatch_round_trip() {
    let app = spawn().await;
    let cluster_id = unique_cluster_id("kind");

    // POST /debug/session
    let resp = app
        .router
        .clone()
        .oneshot(json_request(
            "POST",
            "/debug/session",
            TEST_API_KEY,
            json!({ "cluster_id": cluster_id }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let created = body_json(resp).await;
    let session_id = created["session_id"].as_str().unwrap().to_string();

    // Stand in for the executor agent: pop the command the moment it lands,
    // then deliver a Result, the way `executor_stream`/`result_sink` would
    // over the wire.
    let cluster_for_executor = cluster_id.clone();
    let state = app.state.clone();
    let fake_executor = tokio::spawn(async move {
        let popped = state
            .queue
            .pop_next(&cluster_for_executor, std::time::Duration::from_secs(5))
            .await
            .unwrap()
            .expect("command should have been enqueued");
        let result = CommandResult {
            command_id: popped.command_id,
            success: true,
            stdout: "NAMESPACE     NAME\ndefault       pod/foo\n".to_string(),
            stderr: String::new(),
            output: "NAMESPACE     NAME\ndefault       pod/foo\n".to_string(),
            return_code: 0,
            status: ResultStatus::Success,
            executed_at: chrono::Utc::now(),
            execution_time_ms: 12,
        };
        state.queue.deliver(result).await.unwrap();
    });

    // POST /debug/execute
    let resp = app
        .router
        .clone()
        .oneshot(json_request(
            "POST",
            "/debug/execute",
            TEST_API_KEY,
            json!({
                "session_id": session_id,
                "cluster_id": cluster_id,
                "command_type": "get",
                "args": ["pods", "-A"],
            }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let result = body_json(resp).await;
    assert_eq!(result["success"], true);
    assert!(result["stdout"].as_str().unwrap().starts_with("NAMESPACE"));

    fake_executor.await.unwrap();

    // DELETE /debug/session/{id}
    let resp = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/debug/session/{session_id}"))
                .header("x-api-key", TEST_API_KEY)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn invalid_api_key_is_rejected_with_401() {
    let app = spawn().await;
    let resp = app
        .router
        .clone()
        .oneshot(json_request(
            "POST",
            "/debug/execute",
            "invalid-key-12345",
            json!({
                "session_id": uuid::Uuid::new_v4(),
                "cluster_id": "kind",
                "command_type": "get",
                "args": ["pods"],
            }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(resp).await;
    assert_eq!(body["error"], "Authentication failed: Invalid credentials");
    assert_eq!(body["status"], 401);
}

#[tokio::test]
async fn executor_absent_times_out() {
    let app = spawn().await;
    let cluster_id = unique_cluster_id("ghost");

    let resp = app
        .router
        .clone()
        .oneshot(json_request(
            "POST",
            "/debug/session",
            TEST_API_KEY,
            json!({ "cluster_id": cluster_id }),
        ))
        .await
        .unwrap();
    let created = body_json(resp).await;
    let session_id = created["session_id"].as_str().unwrap().to_string();

    let resp = app
        .router
        .clone()
        .oneshot(json_request(
            "POST",
            "/debug/execute",
            TEST_API_KEY,
            json!({
                "session_id": session_id,
                "cluster_id": cluster_id,
                "command_type": "get",
                "args": ["pods"],
                "timeout_seconds": 1,
            }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let result = body_json(resp).await;
    assert_eq!(result["status"], "TIMEOUT");
    assert_eq!(result["return_code"], -1);
}

#[tokio::test]
async fn mutating_verb_is_rejected_before_dispatch() {
    let app = spawn().await;
    let cluster_id = unique_cluster_id("kind");
    let resp = app
        .router
        .clone()
        .oneshot(json_request(
            "POST",
            "/debug/session",
            TEST_API_KEY,
            json!({ "cluster_id": cluster_id }),
        ))
        .await
        .unwrap();
    let created = body_json(resp).await;
    let session_id = created["session_id"].as_str().unwrap().to_string();

    let resp = app
        .router
        .clone()
        .oneshot(json_request(
            "POST",
            "/debug/execute",
            TEST_API_KEY,
            json!({
                "session_id": session_id,
                "cluster_id": cluster_id,
                "command_type": "get",
                "args": ["delete", "pods", "--all"],
            }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn read_only_identity_cannot_execute() {
    let app = spawn().await;
    let cluster_id = unique_cluster_id("kind");

    // read-only key can still create a session (debug:read)...
    let resp = app
        .router
        .clone()
        .oneshot(json_request(
            "POST",
            "/debug/session",
            READ_ONLY_API_KEY,
            json!({ "cluster_id": cluster_id }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let created = body_json(resp).await;
    let session_id = created["session_id"].as_str().unwrap().to_string();

    // ...but not dispatch a command (missing debug:execute).
    let resp = app
        .router
        .clone()
        .oneshot(json_request(
            "POST",
            "/debug/execute",
            READ_ONLY_API_KEY,
            json!({
                "session_id": session_id,
                "cluster_id": cluster_id,
                "command_type": "get",
                "args": ["pods"],
            }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn fifo_order_preserved_across_two_commands() {
    let app = spawn().await;
    let cluster_id = unique_cluster_id("fifo");

    let first = Command {
        command_id: uuid::Uuid::new_v4(),
        cluster_id: cluster_id.clone(),
        session_id: None,
        command_type: CommandType::Get,
        args: vec!["pods".into()],
        timeout_ms: 5_000,
        enqueued_at: chrono::Utc::now(),
    };
    let second = Command {
        command_id: uuid::Uuid::new_v4(),
        cluster_id: cluster_id.clone(),
        session_id: None,
        command_type: CommandType::Get,
        args: vec!["services".into()],
        timeout_ms: 5_000,
        enqueued_at: chrono::Utc::now(),
    };

    app.state.queue.enqueue(&first).await.unwrap();
    app.state.queue.enqueue(&second).await.unwrap();

    let popped_first = app
        .state
        .queue
        .pop_next(&cluster_id, std::time::Duration::from_secs(2))
        .await
        .unwrap()
        .unwrap();
    let popped_second = app
        .state
        .queue
        .pop_next(&cluster_id, std::time::Duration::from_secs(2))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(popped_first.command_id, first.command_id);
    assert_eq!(popped_second.command_id, second.command_id);
}

#[tokio::test]
async fn a2a_agent_card_is_public() {
    let app = spawn().await;
    let resp = app
        .router
        .clone()
        .oneshot(Request::builder().method("GET").uri("/a2a/").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    assert_eq!(body["name"], "kubently");
}

#[tokio::test]
async fn a2a_message_send_runs_mock_planner_end_to_end() {
    let app = spawn().await;

    // The mock planner parses "cluster <id>" out of the query and routes the
    // command there; simulate the only connected executor for that cluster.
    let cluster_id = unique_cluster_id("kind");
    let state = app.state.clone();
    let cluster_for_executor = cluster_id.clone();
    let fake_executor = tokio::spawn(async move {
        let popped = state
            .queue
            .pop_next(&cluster_for_executor, std::time::Duration::from_secs(5))
            .await
            .unwrap()
            .expect("mock planner should have enqueued a command");
        let result = CommandResult {
            command_id: popped.command_id,
            success: true,
            stdout: "NAMESPACE     NAME\nkubently      pod/agent-0\n".to_string(),
            stderr: String::new(),
            output: "NAMESPACE     NAME\nkubently      pod/agent-0\n".to_string(),
            return_code: 0,
            status: ResultStatus::Success,
            executed_at: chrono::Utc::now(),
            execution_time_ms: 9,
        };
        state.queue.deliver(result).await.unwrap();
    });

    let resp = app
        .router
        .clone()
        .oneshot(json_request(
            "POST",
            "/a2a/",
            TEST_API_KEY,
            json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": "message/send",
                "params": {
                    "message": {
                        "messageId": "m1",
                        "role": "user",
                        "parts": [{"text": format!("show me the pods in cluster {cluster_id}")}],
                    },
                },
            }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    let events = body["result"]["events"].as_array().unwrap();
    assert!(events.iter().any(|e| e["kind"] == "tool-call"));
    assert!(events.iter().any(|e| e["kind"] == "tool-response"));
    let final_event = events.last().unwrap();
    assert_eq!(final_event["kind"], "status-update");
    assert_eq!(final_event["final"], true);

    fake_executor.await.unwrap();
}

#[tokio::test]
async fn a2a_invoke_alias_behaves_like_message_send() {
    let app = spawn().await;

    let resp = app
        .router
        .clone()
        .oneshot(json_request(
            "POST",
            "/a2a/",
            TEST_API_KEY,
            json!({
                "jsonrpc": "2.0",
                "id": "abc",
                "method": "invoke",
                "params": {
                    "message": {
                        "messageId": "m1",
                        "role": "user",
                        "parts": [{"text": "what's the weather like"}],
                    },
                },
            }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    let events = body["result"]["events"].as_array().unwrap();
    // an unmatched query falls back to a single Say step: thinking + a
    // final status-update, no tool-call in between.
    assert!(!events.iter().any(|e| e["kind"] == "tool-call"));
    assert_eq!(events.last().unwrap()["kind"], "status-update");
}

#[tokio::test]
async fn executor_results_endpoint_requires_a_bearer_token() {
    let app = spawn().await;

    let result = CommandResult {
        command_id: uuid::Uuid::new_v4(),
        success: true,
        stdout: String::new(),
        stderr: String::new(),
        output: String::new(),
        return_code: 0,
        status: ResultStatus::Success,
        executed_at: chrono::Utc::now(),
        execution_time_ms: 1,
    };

    // An API key (not a bearer token) is accepted as a credential, but
    // `post_result` rejects anything that isn't `AuthMethod::BearerToken`
    // before it ever looks at the posted Result.
    let resp = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/executor/results")
                .header("content-type", "application/json")
                .header("x-cluster-id", "kind")
                .header("x-api-key", TEST_API_KEY)
                .body(Body::from(serde_json::to_vec(&result).unwrap()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

/// Exercises the side table `post_result` consults (`CommandQueue::owner_cluster`)
/// directly against a real Redis, the way `results.rs`'s handler does —
/// without a signed bearer token on hand to drive the full HTTP path.
#[tokio::test]
async fn queue_records_the_enqueuing_cluster_for_owner_validation() {
    let app = spawn().await;
    let cluster_id = unique_cluster_id("kind");

    let command = Command {
        command_id: uuid::Uuid::new_v4(),
        cluster_id: cluster_id.clone(),
        session_id: None,
        command_type: CommandType::Get,
        args: vec!["pods".into()],
        timeout_ms: 5_000,
        enqueued_at: chrono::Utc::now(),
    };
    app.state.queue.enqueue(&command).await.unwrap();

    let owner = app.state.queue.owner_cluster(command.command_id).await.unwrap();
    assert_eq!(owner.as_deref(), Some(cluster_id.as_str()));
    assert_ne!(owner.as_deref(), Some("some-other-cluster"));
}
