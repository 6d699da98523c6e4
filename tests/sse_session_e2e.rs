//! End-to-end sessions: SSE open, POST delivery, engine replies, teardown

use std::time::Duration;

use pretty_assertions::assert_eq;
use reqwest::StatusCode;
use serde_json::{Value, json};

use relay_http_mcp_server::HttpMcpServer;
use relay_http_mcp_server::PrefixCredentialVerifier;
use relay_mcp_e2e::{SseClient, TEST_KEY, TestServer};
use relay_mcp_session_storage::is_valid_session_id;

#[tokio::test]
async fn test_initialize_and_get_current_sessions() {
    let server = TestServer::start_default().await.unwrap();
    let mut client = SseClient::connect(&server, TEST_KEY).await.unwrap();
    assert!(is_valid_session_id(client.session_id()));
    assert!(client.message_url().ends_with(&format!("/messages?session_id={}", client.session_id())));

    let init = client
        .request(&json!({
            "jsonrpc": "2.0", "id": 1, "method": "initialize",
            "params": {"protocolVersion": "2024-11-05", "capabilities": {},
                       "clientInfo": {"name": "e2e", "version": "0.0.0"}}
        }))
        .await
        .unwrap();
    assert_eq!(init["id"], json!(1));
    assert_eq!(init["result"]["protocolVersion"], json!("2024-11-05"));

    let accepted = client
        .post(&json!({"jsonrpc": "2.0", "method": "notifications/initialized"}))
        .await
        .unwrap();
    assert_eq!(accepted.status(), StatusCode::ACCEPTED);

    let call = client
        .request(&json!({
            "jsonrpc": "2.0", "id": "2", "method": "tools/call",
            "params": {"name": "get_current_sessions", "arguments": {}}
        }))
        .await
        .unwrap();
    assert_eq!(call["id"], json!("2"));
    assert_eq!(
        call["result"]["content"][0]["text"],
        json!(format!(
            "Session ID: {}\nAPI key: sa_t*********1234",
            client.session_id()
        ))
    );
}

#[tokio::test]
async fn test_replies_follow_post_order() {
    let server = TestServer::start_default().await.unwrap();
    let mut client = SseClient::connect(&server, TEST_KEY).await.unwrap();

    for id in 1..=5 {
        let response = client
            .post(&json!({"jsonrpc": "2.0", "id": id, "method": "ping"}))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    let mut ids = Vec::new();
    for _ in 1..=5 {
        ids.push(client.next_message().await.unwrap()["id"].clone());
    }
    assert_eq!(ids, (1..=5).map(|id| json!(id)).collect::<Vec<Value>>());
}

#[tokio::test]
async fn test_sessions_are_isolated() {
    let server = TestServer::start_default().await.unwrap();
    let mut first = SseClient::connect(&server, TEST_KEY).await.unwrap();
    let mut second = SseClient::connect(&server, "sa_tools_other5678").await.unwrap();
    assert_ne!(first.session_id(), second.session_id());

    let call = json!({
        "jsonrpc": "2.0", "id": 1, "method": "tools/call",
        "params": {"name": "get_current_sessions"}
    });
    let first_reply = first.request(&call).await.unwrap();
    let second_reply = second.request(&call).await.unwrap();

    let first_text = first_reply["result"]["content"][0]["text"].as_str().unwrap();
    let second_text = second_reply["result"]["content"][0]["text"].as_str().unwrap();
    assert!(first_text.contains(first.session_id()));
    assert!(second_text.contains(second.session_id()));
    assert!(second_text.ends_with("sa_t**********5678"));
}

#[tokio::test]
async fn test_post_after_disconnect_is_not_found() {
    let server = TestServer::start_default().await.unwrap();
    let client = SseClient::connect(&server, TEST_KEY).await.unwrap();
    let session_id = client.session_id().to_string();
    let message_url = client.message_url().to_string();
    drop(client);

    let registry = server.server().channels().registry().clone();
    for _ in 0..50 {
        if !registry.contains(&session_id) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(!registry.contains(&session_id), "session still registered");

    let response = reqwest::Client::new()
        .post(&message_url)
        .body(json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}).to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(response.text().await.unwrap(), "Could not find session");

    // The association outlives the connection
    assert_eq!(
        server
            .server()
            .channels()
            .store()
            .get_credential_by_session(&session_id)
            .await
            .unwrap()
            .as_deref(),
        Some(TEST_KEY)
    );
}

#[tokio::test]
async fn test_malformed_post_gets_400_and_parse_error_reply() {
    let server = TestServer::start_default().await.unwrap();
    let mut client = SseClient::connect(&server, TEST_KEY).await.unwrap();

    let response = client.post_raw("this is not json").await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let reply = client.next_message().await.unwrap();
    assert_eq!(reply["error"]["code"], json!(-32700));
    assert_eq!(reply["id"], Value::Null);
}

#[tokio::test]
async fn test_unknown_session_and_missing_id() {
    let server = TestServer::start_default().await.unwrap();
    let http = reqwest::Client::new();

    let response = http
        .post(server.url("/messages?session_id=0123456789abcdef0123456789abcdef"))
        .body("{}")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = http.post(server.url("/messages")).body("{}").send().await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_body_limit() {
    let server = TestServer::start(
        HttpMcpServer::builder()
            .verifier(std::sync::Arc::new(PrefixCredentialVerifier::default()))
            .max_body_size(256),
    )
    .await
    .unwrap();
    let client = SseClient::connect(&server, TEST_KEY).await.unwrap();

    let big = json!({
        "jsonrpc": "2.0", "id": 1, "method": "ping",
        "params": {"padding": "x".repeat(1024)}
    });
    let response = client.post(&big).await.unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn test_service_info_reports_storage() {
    let server = TestServer::start_default().await.unwrap();
    let info: Value = reqwest::get(server.url("/"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(info["status"], json!("running"));
    assert_eq!(info["storage"], json!("InMemory"));
}
