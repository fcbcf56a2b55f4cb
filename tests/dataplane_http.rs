//! Contract tests for the Dataplane HTTP client against a mock server.

use haproxy_cloud_discovery::config::HaproxyConfig;
use haproxy_cloud_discovery::error::DataplaneError;
use haproxy_cloud_discovery::haproxy::dataplane::{DataplaneApi, HttpDataplaneClient};
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client_for(server: &MockServer) -> HttpDataplaneClient {
    let config = HaproxyConfig {
        base_url: server.uri(),
        username: "admin".to_string(),
        password: "pwd".to_string(),
        ..HaproxyConfig::default()
    };
    HttpDataplaneClient::new(&config).unwrap()
}

#[tokio::test]
async fn test_configuration_version_parses_bare_integer() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/services/haproxy/configuration/version"))
        .respond_with(ResponseTemplate::new(200).set_body_string("42\n"))
        .mount(&server)
        .await;

    let version = client_for(&server).configuration_version().await.unwrap();
    assert_eq!(version, 42);
}

#[tokio::test]
async fn test_requests_carry_basic_auth() {
    let server = MockServer::start().await;
    // base64("admin:pwd")
    Mock::given(method("GET"))
        .and(path("/v2/services/haproxy/configuration/version"))
        .and(header("authorization", "Basic YWRtaW46cHdk"))
        .respond_with(ResponseTemplate::new(200).set_body_string("1"))
        .mount(&server)
        .await;

    assert_eq!(client_for(&server).configuration_version().await.unwrap(), 1);
}

#[tokio::test]
async fn test_create_transaction_sends_version_and_parses_id() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v2/services/haproxy/transactions"))
        .and(query_param("version", "42"))
        .respond_with(
            ResponseTemplate::new(201)
                .set_body_json(serde_json::json!({ "id": "txn-abc", "status": "in_progress" })),
        )
        .mount(&server)
        .await;

    let id = client_for(&server).create_transaction(42).await.unwrap();
    assert_eq!(id, "txn-abc");
}

#[tokio::test]
async fn test_commit_conflict_maps_to_version_conflict() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/v2/services/haproxy/transactions/txn-abc"))
        .respond_with(ResponseTemplate::new(409).set_body_string("version mismatch"))
        .mount(&server)
        .await;

    let err = client_for(&server)
        .commit_transaction("txn-abc")
        .await
        .unwrap_err();
    assert!(err.is_version_conflict());
}

#[tokio::test]
async fn test_missing_backend_is_none() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/services/haproxy/configuration/backends/azure-web-80-eastus"))
        .and(query_param("transaction_id", "txn-1"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let backend = client_for(&server)
        .get_backend("azure-web-80-eastus", "txn-1")
        .await
        .unwrap();
    assert!(backend.is_none());
}

#[tokio::test]
async fn test_get_backend_unwraps_data_envelope() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/services/haproxy/configuration/backends/azure-web-80-eastus"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "_version": 42,
            "data": { "name": "azure-web-80-eastus", "mode": "http" }
        })))
        .mount(&server)
        .await;

    let backend = client_for(&server)
        .get_backend("azure-web-80-eastus", "txn-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(backend.name, "azure-web-80-eastus");
}

#[tokio::test]
async fn test_get_servers_scopes_to_backend_and_transaction() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/services/haproxy/configuration/servers"))
        .and(query_param("backend", "azure-web-80-eastus"))
        .and(query_param("transaction_id", "txn-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "data": [
                { "name": "srv0", "address": "10.0.0.1", "port": 80, "cookie": "srv0" },
                { "name": "srv1", "address": "127.0.0.1", "port": 80, "maintenance": "enabled" }
            ]
        })))
        .mount(&server)
        .await;

    let servers = client_for(&server)
        .get_servers("azure-web-80-eastus", "txn-1")
        .await
        .unwrap();
    assert_eq!(servers.len(), 2);
    assert_eq!(servers[0].name, "srv0");
    assert_eq!(servers[0].cookie.as_deref(), Some("srv0"));
    assert_eq!(servers[1].maintenance.as_deref(), Some("enabled"));
}

#[tokio::test]
async fn test_server_error_carries_status_and_body() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/services/haproxy/configuration/version"))
        .respond_with(ResponseTemplate::new(503).set_body_string("dataplane restarting"))
        .mount(&server)
        .await;

    let err = client_for(&server).configuration_version().await.unwrap_err();
    match err {
        DataplaneError::Api { status, body, .. } => {
            assert_eq!(status, 503);
            assert!(body.contains("restarting"));
        }
        other => panic!("expected Api error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_delete_transaction_hits_transaction_path() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/v2/services/haproxy/transactions/txn-abc"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    client_for(&server).delete_transaction("txn-abc").await.unwrap();
}

#[tokio::test]
async fn test_parked_server_payload_omits_unset_options() {
    use haproxy_cloud_discovery::haproxy::dataplane::Server;

    let server = Server {
        name: "srv3".to_string(),
        address: "127.0.0.1".to_string(),
        port: 80,
        maintenance: Some("enabled".to_string()),
        check: Some("disabled".to_string()),
        cookie: None,
        weight: None,
        backup: None,
    };
    let json = serde_json::to_value(&server).unwrap();

    assert_eq!(json["maintenance"], "enabled");
    assert!(json.get("cookie").is_none());
    assert!(json.get("weight").is_none());
    assert!(json.get("backup").is_none());
}
