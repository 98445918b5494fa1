//! Integration tests for the REST client's retry, auth, and absence
//! handling against a mock controller.

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use secrecy::SecretString;
use tokio_util::sync::CancellationToken;
use url::Url;
use wiremock::matchers::{header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use isy_api::configuration::probe;
use isy_api::transport::TransportConfig;
use isy_api::{ConnectionClass, Error, IsyClient, PermitPool};

fn client_for(server: &MockServer) -> (IsyClient, Arc<PermitPool>) {
    let base_url: Url = server.uri().parse().expect("mock server uri");
    let permits = Arc::new(PermitPool::new());
    let client = IsyClient::new(
        base_url,
        "admin".into(),
        SecretString::from("admin"),
        &TransportConfig {
            timeout: Duration::from_secs(5),
            ..TransportConfig::default()
        },
        Arc::clone(&permits),
        CancellationToken::new(),
    )
    .expect("client");
    (client, permits)
}

const CONFIG_CURRENT: &str = r#"{
    "app_full_version": "5.8.4",
    "uuid": "00:21:b9:02:45:1b",
    "name": "Home",
    "model": "eisy",
    "platform": "IoX",
    "variables": true,
    "nodedefs": true,
    "features": [
        { "id": "21010", "desc": "Networking Module", "isInstalled": true }
    ]
}"#;

const CONFIG_LEGACY: &str = r#"{
    "app_full_version": "4.9.0",
    "uuid": "00:21:b9:00:00:01",
    "name": "Home",
    "model": "ISY 994i",
    "platform": "ISY-C-994",
    "variables": true,
    "nodedefs": false,
    "features": []
}"#;

#[tokio::test]
async fn transient_503_is_retried_until_success() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/rest/config"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/rest/config"))
        .respond_with(ResponseTemplate::new(200).set_body_string(CONFIG_CURRENT))
        .expect(1)
        .mount(&server)
        .await;

    let (client, _permits) = client_for(&server);
    let snapshot = client.get_config().await.expect("config after retries");
    assert_eq!(snapshot.firmware, "5.8.4");
}

#[tokio::test]
async fn persistent_503_exhausts_the_full_retry_budget() {
    let server = MockServer::start().await;

    // Initial attempt plus five retries, one per backoff entry.
    Mock::given(method("GET"))
        .and(path("/rest/status"))
        .respond_with(ResponseTemplate::new(503))
        .expect(6)
        .mount(&server)
        .await;

    let (client, _permits) = client_for(&server);
    let err = client
        .get_status::<serde_json::Value>()
        .await
        .expect_err("must exhaust retries");
    assert!(matches!(err, Error::HttpStatus { status: 503, .. }));
}

#[tokio::test]
async fn unauthorized_fails_immediately_without_retry() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/rest/config"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;

    let (client, _permits) = client_for(&server);
    let err = client.get_config().await.expect_err("must be rejected");
    assert!(matches!(err, Error::Authentication { .. }));
    assert!(err.is_auth());
    assert!(!err.is_transient());
}

#[tokio::test]
async fn absent_endpoint_resolves_to_none_without_retry() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/rest/networking/resources"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let (client, _permits) = client_for(&server);
    let resources = client
        .list_network_resources::<serde_json::Value>()
        .await
        .expect("absence is not an error here");
    assert!(resources.is_none());
}

#[tokio::test]
async fn node_server_profiles_are_optional() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/rest/profiles/ns/0/connection"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let (client, _permits) = client_for(&server);
    let profiles = client
        .list_node_server_profiles::<serde_json::Value>()
        .await
        .expect("absence is tolerated");
    assert!(profiles.is_none());
}

#[tokio::test]
async fn unexpected_404_is_an_error() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/rest/nodes"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let (client, _permits) = client_for(&server);
    let err = client
        .list_nodes::<serde_json::Value>()
        .await
        .expect_err("404 must surface");
    assert!(matches!(err, Error::HttpStatus { status: 404, .. }));
    assert!(err.is_not_found());
}

#[tokio::test]
async fn requests_carry_basic_auth() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/rest/time"))
        .and(header_exists("authorization"))
        .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
        .expect(1)
        .mount(&server)
        .await;

    let (client, _permits) = client_for(&server);
    client
        .get_clock::<serde_json::Value>()
        .await
        .expect("clock");
}

#[tokio::test]
async fn node_addresses_with_spaces_are_percent_encoded() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/rest/nodes/2E%205C%20A1%201/cmd/DON"))
        .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
        .expect(1)
        .mount(&server)
        .await;

    let (client, _permits) = client_for(&server);
    client
        .send_node_command("2E 5C A1 1", "DON", None, None)
        .await
        .expect("command");
}

#[tokio::test]
async fn probe_upgrades_permits_on_current_platform() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/rest/config"))
        .respond_with(ResponseTemplate::new(200).set_body_string(CONFIG_CURRENT))
        .mount(&server)
        .await;

    let (client, permits) = client_for(&server);
    assert_eq!(permits.available(ConnectionClass::Plaintext), 5);

    let snapshot = probe(&client).await.expect("probe");
    assert!(snapshot.networking_installed());
    assert!(permits.is_upgraded());
    assert_eq!(permits.available(ConnectionClass::Plaintext), 50);
    assert_eq!(permits.available(ConnectionClass::Secure), 20);

    // Probing again must not stack further permits.
    probe(&client).await.expect("second probe");
    assert_eq!(permits.available(ConnectionClass::Plaintext), 50);
}

#[tokio::test]
async fn probe_keeps_legacy_ceilings_on_legacy_platform() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/rest/config"))
        .respond_with(ResponseTemplate::new(200).set_body_string(CONFIG_LEGACY))
        .mount(&server)
        .await;

    let (client, permits) = client_for(&server);
    probe(&client).await.expect("probe");
    assert!(!permits.is_upgraded());
    assert_eq!(permits.available(ConnectionClass::Plaintext), 5);
    assert_eq!(permits.available(ConnectionClass::Secure), 2);
}

#[tokio::test]
async fn concurrency_is_bounded_by_the_permit_pool() {
    let server = MockServer::start().await;

    // Each request takes long enough that all of them overlap if the
    // pool lets them.
    Mock::given(method("GET"))
        .and(path("/rest/status"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("{}")
                .set_delay(Duration::from_millis(100)),
        )
        .mount(&server)
        .await;

    let (client, permits) = client_for(&server);
    let client = Arc::new(client);

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let client = Arc::clone(&client);
        tasks.push(tokio::spawn(async move {
            client.get_status::<serde_json::Value>().await
        }));
    }

    // With eight in-flight plaintext requests against a ceiling of
    // five, the pool must be fully drained mid-burst.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(permits.available(ConnectionClass::Plaintext), 0);

    for task in tasks {
        task.await.expect("join").expect("request");
    }
    assert_eq!(permits.available(ConnectionClass::Plaintext), 5);
}

#[tokio::test]
async fn malformed_body_is_a_deserialization_error() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/rest/config"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<config/>"))
        .mount(&server)
        .await;

    let (client, _permits) = client_for(&server);
    let err = client.get_config().await.expect_err("not json");
    assert!(matches!(err, Error::Deserialization { .. }));
}
