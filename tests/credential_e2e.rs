//! End-to-end credential checks: account service verification and the
//! per-credential session cap

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use reqwest::StatusCode;
use serde_json::json;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use relay_http_mcp_server::{
    BoxedSessionStore, HttpCredentialVerifier, HttpMcpServer, PrefixCredentialVerifier,
    VerifierConfig,
};
use relay_mcp_e2e::{SseClient, TEST_KEY, TestServer};
use relay_mcp_session_storage::{SqliteConfig, SqliteSessionStore};

async fn account_service() -> MockServer {
    let service = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/tools/verify"))
        .and(header("x-api-key", TEST_KEY))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {"valid": true}})))
        .mount(&service)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/tools/verify"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {"valid": false}})))
        .mount(&service)
        .await;
    service
}

async fn verified_server(api_url: String) -> TestServer {
    let verifier = HttpCredentialVerifier::new(VerifierConfig {
        api_url,
        timeout: Duration::from_secs(2),
        ..VerifierConfig::default()
    })
    .unwrap();
    TestServer::start(HttpMcpServer::builder().verifier(Arc::new(verifier)))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_verified_key_opens_session() {
    let service = account_service().await;
    let server = verified_server(service.uri()).await;

    let client = SseClient::connect(&server, TEST_KEY).await.unwrap();
    assert_eq!(
        server.server().get_stats().await.stored_sessions,
        1,
        "session {} should be stored",
        client.session_id()
    );
}

#[tokio::test]
async fn test_rejected_key_is_unauthorized_without_store_write() {
    let service = account_service().await;
    let server = verified_server(service.uri()).await;

    for credential in ["sa_tools_unknown99", "bad_key"] {
        let response = reqwest::get(server.url(&format!("/{}/sse", credential)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    let stats = server.server().get_stats().await;
    assert_eq!(stats.stored_sessions, 0);
    assert_eq!(stats.open_sessions, 0);
}

#[tokio::test]
async fn test_unreachable_account_service_fails_closed() {
    let server = verified_server("http://127.0.0.1:9".to_string()).await;

    let response = reqwest::get(server.url(&format!("/{}/sse", TEST_KEY)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(server.server().get_stats().await.stored_sessions, 0);
}

async fn assert_sixth_session_evicts_first(server: &TestServer) {
    let mut clients = Vec::new();
    for _ in 0..6 {
        clients.push(SseClient::connect(server, TEST_KEY).await.unwrap());
    }

    let stored: Vec<String> = server
        .server()
        .channels()
        .store()
        .list_sessions_by_credential(TEST_KEY)
        .await
        .unwrap()
        .into_iter()
        .map(|record| record.session_id)
        .collect();

    assert_eq!(stored.len(), 5);
    assert!(!stored.iter().any(|id| id == clients[0].session_id()));
    for client in &clients[1..] {
        assert!(stored.iter().any(|id| id == client.session_id()));
    }
}

#[tokio::test]
async fn test_session_cap_in_memory() {
    let server = TestServer::start_default().await.unwrap();
    assert_sixth_session_evicts_first(&server).await;
}

#[tokio::test]
async fn test_session_cap_sqlite() {
    let store = SqliteSessionStore::with_config(SqliteConfig::from_database_url("sqlite::memory:"))
        .await
        .unwrap();
    let store: Arc<BoxedSessionStore> = Arc::new(store);

    let server = TestServer::start(
        HttpMcpServer::builder_with_store(store)
            .verifier(Arc::new(PrefixCredentialVerifier::default())),
    )
    .await
    .unwrap();
    assert_eq!(server.server().get_stats().await.storage_type, "SQLite");

    assert_sixth_session_evicts_first(&server).await;
}
