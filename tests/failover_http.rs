//! End-to-end dispatch through the real HTTP transport.
//!
//! Verifies against wiremock upstreams that:
//! - A healthy provider serves the forwarded request and the response is
//!   tagged with the serving provider
//! - A 5xx primary is skipped and the next candidate serves the request
//! - A hanging primary is cut off by the per-attempt timeout and recorded
//!   as a timeout, distinct from an error status
//! - Liveness probes measure round-trip time against the /models endpoint

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use http::Request;
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use polyroute::config::Config;
use polyroute::server::{build_state, create_router};
use polyroute::transport::{HttpTransport, ProviderEndpoint, ProviderTransport};

fn completion_body() -> serde_json::Value {
    serde_json::json!({
        "id": "resp-upstream",
        "output": "upstream says hi",
        "usage": {"prompt_tokens": 9, "completion_tokens": 4}
    })
}

async fn mock_provider_ok() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion_body()))
        .mount(&server)
        .await;
    server
}

async fn mock_provider_failing(status: u16) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/completions"))
        .respond_with(ResponseTemplate::new(status))
        .mount(&server)
        .await;
    server
}

async fn mock_provider_hanging(delay: Duration) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(completion_body())
                .set_delay(delay),
        )
        .mount(&server)
        .await;
    server
}

fn config_for(primary_url: &str, fallback_url: &str, attempt_timeout_ms: u64) -> Config {
    let toml = format!(
        r#"
        [server]
        listen = "127.0.0.1:0"

        [routing]
        attempt_timeout_ms = {attempt_timeout_ms}

        [[providers]]
        name = "primary"
        url = "{primary_url}"
        base_weight = 1.0

        [[providers]]
        name = "fallback"
        url = "{fallback_url}"
        base_weight = 0.5
        "#
    );
    Config::parse_str(&toml).expect("valid test config")
}

fn app_for(config: Config) -> axum::Router {
    let transport = Arc::new(HttpTransport::new(reqwest::Client::new()));
    create_router(build_state(config, transport, None))
}

fn post_route(prompt: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/v1/route")
        .header("content-type", "application/json")
        .body(Body::from(
            serde_json::json!({ "prompt": prompt }).to_string(),
        ))
        .unwrap()
}

async fn parse_body(response: axum::response::Response) -> (http::StatusCode, serde_json::Value) {
    let status = response.status();
    let body_bytes = axum::body::to_bytes(response.into_body(), 1_048_576)
        .await
        .expect("read body");
    let json: serde_json::Value = serde_json::from_slice(&body_bytes).unwrap_or_default();
    (status, json)
}

#[tokio::test]
async fn healthy_primary_serves_request() {
    let primary = mock_provider_ok().await;
    let fallback = mock_provider_ok().await;
    let app = app_for(config_for(&primary.uri(), &fallback.uri(), 5000));

    let response = app.oneshot(post_route("hello upstream")).await.unwrap();
    assert_eq!(response.status(), http::StatusCode::OK);
    assert_eq!(
        response.headers().get("x-polyroute-provider").unwrap(),
        "primary"
    );

    let (_, json) = parse_body(response).await;
    assert_eq!(json["output"], "upstream says hi");
    assert_eq!(json["polyroute_provider"], "primary");
}

#[tokio::test]
async fn error_status_advances_to_fallback() {
    let primary = mock_provider_failing(500).await;
    let fallback = mock_provider_ok().await;
    let app = app_for(config_for(&primary.uri(), &fallback.uri(), 5000));

    let response = app.oneshot(post_route("hello")).await.unwrap();
    assert_eq!(response.status(), http::StatusCode::OK);
    assert_eq!(
        response.headers().get("x-polyroute-provider").unwrap(),
        "fallback"
    );
}

#[tokio::test]
async fn slow_primary_times_out_and_falls_back() {
    let primary = mock_provider_hanging(Duration::from_secs(5)).await;
    let fallback = mock_provider_ok().await;
    // 200ms per-attempt budget: the primary cannot finish in time.
    let app = app_for(config_for(&primary.uri(), &fallback.uri(), 200));

    let response = app.oneshot(post_route("hello")).await.unwrap();
    assert_eq!(response.status(), http::StatusCode::OK);
    assert_eq!(
        response.headers().get("x-polyroute-provider").unwrap(),
        "fallback"
    );
}

#[tokio::test]
async fn exhaustion_distinguishes_timeout_from_status() {
    let primary = mock_provider_hanging(Duration::from_secs(5)).await;
    let fallback = mock_provider_failing(503).await;
    let app = app_for(config_for(&primary.uri(), &fallback.uri(), 200));

    let response = app.oneshot(post_route("hello")).await.unwrap();
    let (status, json) = parse_body(response).await;
    assert_eq!(status, http::StatusCode::BAD_GATEWAY);

    let attempts = json["error"]["attempts"].as_array().unwrap();
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[0]["provider"], "primary");
    assert_eq!(attempts[0]["kind"], "timeout");
    assert_eq!(attempts[1]["provider"], "fallback");
    assert_eq!(attempts[1]["kind"], "status");
}

#[tokio::test]
async fn probe_measures_models_endpoint() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/models"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "object": "list", "data": []
        })))
        .mount(&server)
        .await;

    let transport = HttpTransport::new(reqwest::Client::new());
    let endpoint = ProviderEndpoint {
        id: 0,
        name: "probe-target".to_string(),
        url: server.uri(),
        api_key: None,
    };

    let latency = transport.probe(&endpoint).await.expect("probe succeeds");
    assert!(latency < Duration::from_secs(5));
}

#[tokio::test]
async fn probe_failure_on_error_status() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/models"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let transport = HttpTransport::new(reqwest::Client::new());
    let endpoint = ProviderEndpoint {
        id: 0,
        name: "probe-target".to_string(),
        url: server.uri(),
        api_key: None,
    };

    assert!(transport.probe(&endpoint).await.is_err());
}
