//! stdio and HTTP carriers around the protocol handler

mod common;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use common::*;
use serde_json::{json, Value};
use skilld::transport::{router, serve_lines};
use skilld::ProtocolHandler;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tower::ServiceExt;

fn handler(rt: &TestRuntime) -> Arc<ProtocolHandler> {
    Arc::new(ProtocolHandler::new(rt.composer.clone()))
}

const INITIALIZE: &str = r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{"protocolVersion":"2025-06-18","capabilities":{},"clientInfo":{"name":"t","version":"0"}}}"#;

// ==================== HTTP ====================

async fn post(app: &axum::Router, body: impl Into<Body>) -> (StatusCode, Option<Value>) {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/mcp")
                .header("content-type", "application/json")
                .body(body.into())
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        None
    } else {
        Some(serde_json::from_slice(&bytes).unwrap())
    };
    (status, value)
}

#[tokio::test]
async fn test_http_request_round_trip() {
    let rt = TestRuntime::new();
    register_add_and_double(&rt);
    let app = router(handler(&rt));

    let (status, body) = post(&app, INITIALIZE).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.unwrap()["result"]["serverInfo"]["name"], "skilld");

    let (status, body) = post(
        &app,
        r#"{"jsonrpc":"2.0","id":2,"method":"tools/call","params":{"name":"add","arguments":{"a":2,"b":3}}}"#,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let body = body.unwrap();
    assert_eq!(body["id"], 2);
    assert_eq!(body["result"]["content"][0]["text"], r#"{"result":5}"#);
}

#[tokio::test]
async fn test_http_notification_is_no_content() {
    let rt = TestRuntime::new();
    let app = router(handler(&rt));

    let (status, body) = post(&app, r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(body.is_none());
}

#[tokio::test]
async fn test_http_parse_error_is_still_json_rpc() {
    let rt = TestRuntime::new();
    let app = router(handler(&rt));

    let (status, body) = post(&app, "not json").await;
    assert_eq!(status, StatusCode::OK);
    let body = body.unwrap();
    assert_eq!(body["error"]["code"], -32700);
    assert_eq!(body["id"], Value::Null);

    let (status, body) = post(&app, b"\xff\xfe".to_vec()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.unwrap()["error"]["code"], -32700);
}

#[tokio::test]
async fn test_http_health() {
    let rt = TestRuntime::new();
    register_add_and_double(&rt);
    let app = router(handler(&rt));

    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["skills"], 2);
}

// ==================== stdio ====================

/// Feed `input` through the line transport and collect every output line
async fn run_lines(handler: Arc<ProtocolHandler>, input: impl AsRef<[u8]>) -> Vec<Value> {
    let (mut client, server) = tokio::io::duplex(64 * 1024);
    let (server_read, server_write) = tokio::io::split(server);
    let serving = tokio::spawn(serve_lines(handler, server_read, server_write));

    client.write_all(input.as_ref()).await.unwrap();
    client.shutdown().await.unwrap();

    let mut lines = BufReader::new(client).lines();
    let mut output = Vec::new();
    while let Some(line) = lines.next_line().await.unwrap() {
        output.push(serde_json::from_str(&line).unwrap());
    }
    serving.await.unwrap().unwrap();
    output
}

#[tokio::test]
async fn test_stdio_answers_each_request_once() {
    let rt = TestRuntime::new();
    register_add_and_double(&rt);

    let input = [
        INITIALIZE,
        r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#,
        "",
        r#"{"jsonrpc":"2.0","id":2,"method":"tools/list"}"#,
        r#"{"jsonrpc":"2.0","id":3,"method":"tools/call","params":{"name":"double","arguments":{"x":4}}}"#,
        "garbage",
    ]
    .join("\n")
        + "\n";

    let output = run_lines(handler(&rt), input).await;
    assert_eq!(output.len(), 4);

    let by_id = |id: Value| {
        output
            .iter()
            .find(|m| m["id"] == id)
            .unwrap_or_else(|| panic!("no response for {}", id))
            .clone()
    };
    assert!(by_id(json!(1))["result"]["protocolVersion"].is_string());
    assert_eq!(by_id(json!(2))["result"]["tools"].as_array().unwrap().len(), 2);
    assert_eq!(
        by_id(json!(3))["result"]["content"][0]["text"],
        r#"{"result":8}"#
    );
    assert_eq!(by_id(Value::Null)["error"]["code"], -32700);
}

#[tokio::test]
async fn test_stdio_announces_catalogue_changes() {
    let rt = TestRuntime::new();
    let input = [
        INITIALIZE,
        r#"{"jsonrpc":"2.0","id":2,"method":"skills/register","params":{"metadata":{"name":"leaf"},"code":"(module (import \"skill\" \"ret_i64\" (func $r (param i32 i32 i64))) (memory 1) (data (i32.const 0) \"ok\") (func (export \"leaf\") (call $r (i32.const 0) (i32.const 2) (i64.const 1))))"}}"#,
        r#"{"jsonrpc":"2.0","id":3,"method":"tools/call","params":{"name":"leaf","arguments":{}}}"#,
    ]
    .join("\n")
        + "\n";

    let output = run_lines(handler(&rt), input).await;
    assert!(output
        .iter()
        .any(|m| m["method"] == "notifications/tools/list_changed"));
    let call = output.iter().find(|m| m["id"] == 3).unwrap();
    assert_eq!(call["result"]["content"][0]["text"], r#"{"ok":1}"#);
}

#[tokio::test]
async fn test_stdio_survives_undecodable_line() {
    let rt = TestRuntime::new();
    let mut input = Vec::new();
    input.extend_from_slice(b"{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"ping\"}\n");
    input.extend_from_slice(b"\xff\xfe\n");
    input.extend_from_slice(b"{\"jsonrpc\":\"2.0\",\"id\":2,\"method\":\"ping\"}\n");

    let output = tokio::time::timeout(Duration::from_secs(10), run_lines(handler(&rt), input))
        .await
        .expect("transport must close its output");
    assert_eq!(output.len(), 3);
    assert_eq!(output[0]["id"], 1);
    assert_eq!(output[1]["id"], Value::Null);
    assert_eq!(output[1]["error"]["code"], -32700);
    assert_eq!(output[2]["id"], 2);
    assert_eq!(output[2]["result"], json!({}));
}
