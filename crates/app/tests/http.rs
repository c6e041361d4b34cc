mod common;

use bridge::error::{EXECUTION_ERROR, FORBIDDEN, INVALID_REQUEST, PARSE_ERROR};
use common::TestServer;
use reqwest::StatusCode;
use serde_json::{Value, json};

async fn post_text(server: &TestServer, body: &str) -> (StatusCode, Value) {
    let response = reqwest::Client::new()
        .post(server.http_url("/"))
        .header("content-type", "application/json")
        .body(body.to_owned())
        .send()
        .await
        .expect("post");
    let status = response.status();
    let text = response.text().await.expect("body");
    (status, serde_json::from_str(&text).expect("json body"))
}

#[tokio::test]
async fn execute_over_http() {
    let server = TestServer::start();
    let (status, body) = post_text(
        &server,
        r#"{"jsonrpc":"2.0","id":"h1","method":"execute","params":{"code":"result = 40 + 2"}}"#,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"jsonrpc": "2.0", "id": "h1", "result": 42}));
}

#[tokio::test]
async fn rpc_errors_keep_status_ok() {
    let server = TestServer::start();
    let (status, body) = post_text(&server, &common::execute_line(2, "import os")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["error"]["code"], json!(FORBIDDEN));

    let (status, body) =
        post_text(&server, &common::execute_line(3, "raise KeyError: missing")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["error"]["code"], json!(EXECUTION_ERROR));
    assert_eq!(body["id"], json!(3));

    let (status, body) = post_text(&server, "{not json").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["error"]["code"], json!(PARSE_ERROR));
}

#[tokio::test]
async fn notifications_get_no_content() {
    let server = TestServer::start();
    let response = reqwest::Client::new()
        .post(server.http_url("/"))
        .body(r#"{"jsonrpc":"2.0","method":"execute","params":{"code":"mark silent"}}"#)
        .send()
        .await
        .expect("post");
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert!(response.text().await.expect("body").is_empty());

    let (status, body) = post_text(&server, &common::execute_line(1, "result = 1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["result"], json!(1));
    assert!(server.probe.log().is_empty());
    assert_eq!(server.probe.executions(), 1);
}

#[tokio::test]
async fn multi_line_bodies_are_one_request() {
    let server = TestServer::start();
    let body = "{\n  \"jsonrpc\": \"2.0\",\n  \"id\": 8,\n  \"method\": \"execute\",\n  \"params\": {\"code\": \"result = 8\"}\n}\n";
    let (status, body) = post_text(&server, body).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"jsonrpc": "2.0", "id": 8, "result": 8}));
}

#[tokio::test]
async fn empty_body_is_a_bad_request() {
    let server = TestServer::start();
    let (status, body) = post_text(&server, "   ").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], json!(PARSE_ERROR));
    assert_eq!(body["id"], Value::Null);
}

#[tokio::test]
async fn get_root_describes_the_server() {
    let server = TestServer::start();
    let text = reqwest::get(server.http_url("/"))
        .await
        .expect("get")
        .text()
        .await
        .expect("body");
    let body: Value = serde_json::from_str(&text).expect("json");
    assert_eq!(body["name"], json!("host-rpc"));
    assert_eq!(body["methods"], json!(["describe", "execute", "shutdown"]));
    assert_eq!(body["accepting"], json!(true));
}

#[tokio::test]
async fn healthcheck_is_not_cached() {
    let server = TestServer::start();
    let response = reqwest::get(server.http_url("/healthz")).await.expect("get");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("cache-control")
            .and_then(|value| value.to_str().ok()),
        Some("no-store")
    );
}

#[tokio::test]
async fn unknown_paths_are_not_found() {
    let server = TestServer::start();
    let response = reqwest::Client::new()
        .post(server.http_url("/rpc/v2"))
        .body("{}")
        .send()
        .await
        .expect("post");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let text = response.text().await.expect("body");
    let body: Value = serde_json::from_str(&text).expect("json");
    assert_eq!(body["error"]["code"], json!(INVALID_REQUEST));
}

#[tokio::test]
async fn cors_preflight_is_allowed() {
    let server = TestServer::start();
    let response = reqwest::Client::new()
        .request(reqwest::Method::OPTIONS, server.http_url("/"))
        .header("origin", "http://localhost:3000")
        .header("access-control-request-method", "POST")
        .header("access-control-request-headers", "content-type")
        .send()
        .await
        .expect("preflight");
    assert!(response.status().is_success());
    assert!(
        response
            .headers()
            .contains_key("access-control-allow-origin")
    );
}
