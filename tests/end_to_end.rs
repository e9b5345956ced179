use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, HeaderValue, Method, Uri};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use trino_gateway::api::{GatewayApi, InMemoryCatalog};
use trino_gateway::core::{Backend, Policy, RoutingGroup, RoutingStrategy, RuleType, Scheme};
use trino_gateway::error::{AuthError, GatewayError};
use trino_gateway::router::auth::{AuthGate, AuthOutcome, Authenticator, CredentialValidator};
use trino_gateway::router::request::{ClientRequest, RequestParts};
use pingora::http::RequestHeader;
use trino_gateway::error::ErrorPhase;
use trino_gateway::router::{
    failure_status, rewrite_location, rewrite_upstream_headers, spawn_query_persistence,
    RequestRouter,
};

const ETL_PORT: u16 = 8081;
const SECURE_PORT: u16 = 8443;

struct CountingValidator {
    calls: AtomicUsize,
}

#[async_trait]
impl CredentialValidator for CountingValidator {
    async fn validate(&self, username: &str, password: &str) -> Result<bool, AuthError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(username == "alice" && password == "s3cret")
    }
}

fn trino(id: &str) -> Backend {
    let mut backend = Backend::new(id, format!("{}.internal:8080", id), Scheme::Http);
    backend.external_url = format!("{}.example.com", id);
    backend.healthy = true;
    backend
}

fn group(id: &str, members: &[&str]) -> RoutingGroup {
    RoutingGroup {
        id: id.to_string(),
        enabled: true,
        backends: members.iter().map(|m| m.to_string()).collect(),
        strategy: RoutingStrategy::RoundRobin,
    }
}

fn catalog() -> Arc<InMemoryCatalog> {
    let mut delegated = Policy::new("secure", RuleType::ListeningPort, SECURE_PORT.to_string(), "adhoc");
    delegated.auth_delegated = true;

    Arc::new(InMemoryCatalog::with_catalog(
        "adhoc",
        vec![trino("etl-1"), trino("adhoc-1")],
        vec![group("etl", &["etl-1"]), group("adhoc", &["adhoc-1"])],
        vec![
            Policy::new("etl", RuleType::ListeningPort, ETL_PORT.to_string(), "etl"),
            delegated,
        ],
    ))
}

fn gateway(catalog: Arc<InMemoryCatalog>, validator: Arc<CountingValidator>) -> RequestRouter {
    let api: Arc<dyn GatewayApi> = catalog;
    let authenticator = Authenticator::new(validator, Duration::from_secs(60));
    RequestRouter::new(
        Arc::clone(&api),
        AuthGate::new(api, Some(authenticator), Vec::new()),
        "adhoc",
    )
}

fn statement_headers(user: &str, password: Option<&str>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert("X-Trino-User", HeaderValue::from_str(user).unwrap());
    if let Some(password) = password {
        headers.insert("X-Trino-Password", HeaderValue::from_str(password).unwrap());
    }
    headers.insert(http::header::HOST, HeaderValue::from_static("gateway.example.com"));
    headers
}

#[tokio::test]
async fn test_statement_routed_and_persisted() {
    let catalog = catalog();
    let router = gateway(Arc::clone(&catalog), Arc::new(CountingValidator { calls: AtomicUsize::new(0) }));

    let method = Method::POST;
    let uri: Uri = "/v1/statement".parse().unwrap();
    let headers = statement_headers("alice", None);
    let parts = RequestParts {
        method: &method,
        uri: &uri,
        headers: &headers,
        client_ip: "10.1.2.3",
        port: ETL_PORT,
    };

    assert_eq!(
        router.authorize(ETL_PORT, &headers).await.unwrap(),
        AuthOutcome::PassThrough
    );

    let (request, route) = router.route(&parts, "SELECT 1").await.unwrap();
    assert_eq!(route.group_id, "etl");
    assert_eq!(route.backend.id, "etl-1");
    assert_eq!(route.authority(), "etl-1.internal:8080");

    let mut upstream = RequestHeader::build("POST", b"/v1/statement", None).unwrap();
    upstream.insert_header("Host", "gateway.example.com").unwrap();
    rewrite_upstream_headers(&mut upstream, &route, false).unwrap();
    assert_eq!(
        upstream.headers.get("Host").unwrap().to_str().unwrap(),
        "etl-1.internal:8080"
    );
    assert_eq!(
        upstream.headers.get("X-Forwarded-Host").unwrap().to_str().unwrap(),
        "etl-1.internal:8080"
    );

    // a refused connection to the chosen backend is answered as a gateway fault
    assert_eq!(
        failure_status(
            ErrorPhase::Transport,
            &pingora::ErrorType::ConnectRefused,
            &pingora::ErrorSource::Upstream
        ),
        502
    );

    let location = rewrite_location(
        "http://etl-1.internal:8080/v1/statement/queued/20240101_000000_00001_abcde/1",
        Scheme::Https,
        "gateway.example.com",
    );
    assert_eq!(
        location,
        "https://gateway.example.com/v1/statement/queued/20240101_000000_00001_abcde/1"
    );

    let ClientRequest::Query(query_request) = request else {
        panic!("statement should classify as a query");
    };
    assert!(query_request.transaction_id.is_empty());
    assert_eq!(query_request.query.username, "alice");

    let api: Arc<dyn GatewayApi> = catalog.clone();
    spawn_query_persistence(
        api,
        query_request.query,
        Bytes::from_static(br#"{"id":"20240101_000000_00001_abcde","nextUri":"x"}"#),
        None,
    )
    .await
    .unwrap();

    let saved = catalog
        .get_query("20240101_000000_00001_abcde")
        .await
        .expect("query persisted");
    assert_eq!(saved.group_id, "etl");
    assert_eq!(saved.backend_id, "etl-1");
    assert_eq!(saved.text, "SELECT 1");
    assert_eq!(saved.client_ip, "10.1.2.3");
    assert_eq!(saved.server_host, "http://etl-1.example.com");
    assert!(saved.submitted_at >= saved.received_at);

    // follow-up requests for the query stick to its backend
    let assignment = catalog
        .find_backend_for_query("20240101_000000_00001_abcde")
        .await
        .unwrap();
    assert_eq!(assignment.backend_id, "etl-1");

    let ui_uri: Uri = "/ui/query.html?20240101_000000_00001_abcde".parse().unwrap();
    let get = Method::GET;
    let ui_parts = RequestParts {
        method: &get,
        uri: &ui_uri,
        headers: &headers,
        client_ip: "10.1.2.3",
        port: 8080,
    };
    let (_, ui_route) = router.route(&ui_parts, "").await.unwrap();
    assert_eq!(ui_route.backend.id, "etl-1");
    assert_eq!(ui_route.host, "etl-1.example.com");
}

#[tokio::test]
async fn test_delegated_port_authenticates_once() {
    let validator = Arc::new(CountingValidator {
        calls: AtomicUsize::new(0),
    });
    let router = gateway(catalog(), Arc::clone(&validator));

    let good = statement_headers("alice", Some("s3cret"));
    for _ in 0..3 {
        let outcome = router.authorize(SECURE_PORT, &good).await.unwrap();
        assert_eq!(
            outcome,
            AuthOutcome::Authenticated {
                username: "alice".to_string(),
                basic_auth: false
            }
        );
    }
    assert_eq!(validator.calls.load(Ordering::SeqCst), 1);

    let bad = statement_headers("alice", Some("wrong"));
    let err = router.authorize(SECURE_PORT, &bad).await.unwrap_err();
    assert!(matches!(err, GatewayError::Auth(AuthError::Rejected { .. })));
    assert_eq!(err.http_status(), 401);

    let missing = statement_headers("alice", None);
    let err = router.authorize(SECURE_PORT, &missing).await.unwrap_err();
    assert!(matches!(err, GatewayError::Auth(AuthError::PasswordRequired)));
}

#[tokio::test]
async fn test_unmatched_port_rejected() {
    let router = gateway(catalog(), Arc::new(CountingValidator { calls: AtomicUsize::new(0) }));

    let method = Method::POST;
    let uri: Uri = "/v1/statement".parse().unwrap();
    let headers = statement_headers("bob", None);
    let parts = RequestParts {
        method: &method,
        uri: &uri,
        headers: &headers,
        client_ip: "10.1.2.4",
        port: 9999,
    };

    // other listening-port policies exist, so an unmatched port has no group
    let err = router.route(&parts, "SELECT 1").await.unwrap_err();
    assert!(matches!(err, GatewayError::NoEligibleGroup { port: 9999, .. }));
    assert_eq!(err.http_status(), 400);
}
