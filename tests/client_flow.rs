use std::collections::HashSet;
use std::io::Write;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use http::HeaderMap;
use http::header::{HeaderValue, SET_COOKIE};

use sessionwire::{
    ClientConfig, DerivationError, HttpTransport, ProxyPoolConfig, RequestOptions,
    RotationStrategy, SessionWire, TokenDeriver, TokenSource, TransportError, TransportErrorKind,
    TransportRequest, TransportResponse,
};

/// Answers the token endpoint with a csrf cookie and everything else from a queue.
struct ScriptedTransport {
    token_endpoint: &'static str,
    outcomes: Mutex<Vec<Result<TransportResponse, TransportError>>>,
    seen: Mutex<Vec<TransportRequest>>,
}

impl ScriptedTransport {
    fn new(outcomes: Vec<Result<TransportResponse, TransportError>>) -> Arc<Self> {
        Arc::new(Self {
            token_endpoint: "https://api.test/",
            outcomes: Mutex::new(outcomes.into_iter().rev().collect()),
            seen: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        if request.url.as_str() == self.token_endpoint {
            let mut headers = HeaderMap::new();
            headers.append(SET_COOKIE, HeaderValue::from_static("ct0=derived-token; Path=/"));
            return Ok(TransportResponse::new(200, headers, Bytes::new()));
        }
        self.seen.lock().unwrap().push(request);
        self.outcomes
            .lock()
            .unwrap()
            .pop()
            .expect("no more scripted outcomes")
    }
}

struct FailingDeriver;

#[async_trait]
impl TokenDeriver for FailingDeriver {
    async fn derive(&self, _identity: &str) -> Result<String, DerivationError> {
        Err(TransportError::new(TransportErrorKind::Dns, "no such host").into())
    }
}

fn config(rotation: RotationStrategy) -> ClientConfig {
    ClientConfig {
        token_endpoint: "https://api.test/".into(),
        proxy: ProxyPoolConfig {
            rotation,
            ..Default::default()
        },
        ..ClientConfig::default()
    }
}

fn ok(body: &'static str) -> Result<TransportResponse, TransportError> {
    Ok(TransportResponse::new(200, HeaderMap::new(), body))
}

#[tokio::test]
async fn derives_token_once_and_reuses_it() {
    let transport = ScriptedTransport::new(vec![ok("{}"), ok("{}")]);
    let client = SessionWire::builder()
        .with_config(config(RotationStrategy::Sticky))
        .with_transport(transport.clone())
        .build()
        .unwrap();

    client.get("auth-1", "https://api.test/graphql/A").await.unwrap();
    client.get("auth-1", "https://api.test/graphql/B").await.unwrap();

    let seen = transport.seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    for request in seen.iter() {
        assert_eq!(request.headers["x-csrf-token"], "derived-token");
    }
    assert_eq!(
        client.executor().sessions().token_source("auth-1"),
        Some(TokenSource::Derived)
    );
}

#[tokio::test]
async fn fallback_token_is_counted_and_still_sent() {
    let transport = ScriptedTransport::new(vec![Ok(TransportResponse::new(
        403,
        HeaderMap::new(),
        r#"{"errors":[{"code":353,"message":"This request requires a matching csrf cookie and header."}]}"#,
    ))]);
    let client = SessionWire::builder()
        .with_config(config(RotationStrategy::Sticky))
        .with_transport(transport.clone())
        .with_token_deriver(Arc::new(FailingDeriver))
        .build()
        .unwrap();

    let envelope = client.get("auth-1", "https://api.test/graphql/A").await.unwrap();
    assert_eq!(envelope.status(), 403);

    let sent = transport.seen.lock().unwrap()[0].headers["x-csrf-token"].clone();
    assert_eq!(sent.len(), sessionwire::session::TOKEN_LEN);
    assert_eq!(client.metrics().token_fallbacks, 1);
    assert_eq!(
        client.executor().sessions().token_source("auth-1"),
        Some(TokenSource::Fallback)
    );
}

#[tokio::test]
async fn round_robin_spreads_identities_across_proxies() {
    let responses = (0..3).map(|_| ok("{}")).collect();
    let transport = ScriptedTransport::new(responses);
    let client = SessionWire::builder()
        .with_config(config(RotationStrategy::RoundRobin))
        .with_transport(transport.clone())
        .with_proxies([
            "u:p:one.test:8000",
            "u:p:two.test:8000",
            "u:p:three.test:8000",
            "u:p:example.com:8000",
        ])
        .build()
        .unwrap();
    assert_eq!(client.proxy_health().total_proxies, 3);

    for identity in ["auth-1", "auth-2", "auth-3"] {
        client.get(identity, "https://api.test/graphql/A").await.unwrap();
    }

    let hosts: HashSet<String> = transport
        .seen
        .lock()
        .unwrap()
        .iter()
        .map(|request| request.proxy.as_ref().unwrap().host.clone())
        .collect();
    assert_eq!(hosts.len(), 3);
}

#[tokio::test]
async fn retry_metrics_follow_transport_failures() {
    let transport = ScriptedTransport::new(vec![
        Err(TransportError::new(TransportErrorKind::ConnectionReset, "reset by peer")),
        Err(TransportError::new(TransportErrorKind::Timeout, "timed out")),
        ok(r#"{"errors":[{"code":187,"message":"Status is a duplicate."}]}"#),
    ]);
    let client = SessionWire::builder()
        .with_config(config(RotationStrategy::Sticky))
        .with_transport(transport)
        .with_proxies(["u:p:one.test:8000", "u:p:two.test:8000"])
        .build()
        .unwrap();

    let envelope = client.get("auth-1", "https://api.test/graphql/A").await.unwrap();
    assert!(envelope.ok());
    assert!(client.classify(&envelope).duplicate);

    let metrics = client.metrics();
    assert_eq!(metrics.attempts, 3);
    assert_eq!(metrics.transport_failures, 2);
    assert_eq!(metrics.retries, 2);
    assert_eq!(metrics.responses, 1);
}

#[tokio::test]
async fn proxy_file_feeds_the_pool() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "# pool\nu:p:one.test:8000\nu:p:localhost:8000\n\nu:p:two.test:9000").unwrap();

    let client = SessionWire::builder()
        .with_config(config(RotationStrategy::Random))
        .with_transport(ScriptedTransport::new(Vec::new()))
        .with_proxy_file(file.path())
        .unwrap()
        .build()
        .unwrap();

    let report = client.proxy_health();
    assert_eq!(report.total_proxies, 2);
    assert_eq!(report.healthy_proxies, 2);
    assert_eq!(client.load_proxies(["u:p:example.org:1"]), 0);
    assert_eq!(client.proxy_health().total_proxies, 0);
}

#[tokio::test]
async fn options_carry_json_body() {
    let transport = ScriptedTransport::new(vec![ok(r#"{"data":{}}"#)]);
    let client = SessionWire::builder()
        .with_config(config(RotationStrategy::Sticky))
        .with_transport(transport.clone())
        .build()
        .unwrap();

    let body = serde_json::json!({"variables": {"id": "1"}});
    client
        .execute(
            "https://api.test/graphql/Mutation",
            RequestOptions::post("auth-1").with_json(&body),
        )
        .await
        .unwrap();

    let seen = transport.seen.lock().unwrap();
    assert_eq!(seen[0].headers["content-type"], "application/json");
    assert_eq!(seen[0].body.as_deref(), Some(body.to_string().as_bytes()));
}
