//! Ingress pipeline scenarios: signed webhook in, broker message out.

use std::time::Duration;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use hmac::{Hmac, Mac};
use hookrelay::broker::channel::ChannelBroker;
use hookrelay::broker::{Delivery, Source};
use hookrelay::config::Config;
use hookrelay::event::NoStateResolver;
use hookrelay::server;
use sha2::Sha256;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

fn github_config(bus: &str, rules_yaml: &str) -> Config {
    let yaml = format!(
        r#"
providers:
  github:
    enabled: true
    secret: test-secret
watermill:
  driver: channel
  channel:
    bus: {bus}
    persistent: true
{rules_yaml}
"#
    );
    Config::from_yaml(&yaml).unwrap()
}

async fn build_router(config: &Config) -> Router {
    let (router, _shared) = server::build(config, Arc::new(NoStateResolver))
        .await
        .unwrap();
    router
}

fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

fn github_request(body: &str, event: &str) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri("/webhooks/github")
        .header("x-github-event", event)
        .header("x-hub-signature-256", sign("test-secret", body.as_bytes()))
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn drain(bus: &ChannelBroker, topic: &str) -> Vec<Delivery> {
    let token = CancellationToken::new();
    let mut rx = bus.subscribe(token.clone(), topic).await.unwrap();
    let mut out = Vec::new();
    while let Ok(Some(delivery)) = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await
    {
        out.push(delivery);
    }
    token.cancel();
    out
}

#[tokio::test]
async fn pull_request_open_matches_and_publishes() {
    let config = github_config(
        "ingress-pr-open",
        r#"
rules:
  - when: action == "opened" && pull_request.draft == false
    emit: pr.opened.ready
"#,
    );
    let router = build_router(&config).await;

    let body = r#"{"action":"opened","pull_request":{"draft":false}}"#;
    let response = router
        .oneshot(github_request(body, "pull_request"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-request-id"));

    let bus = ChannelBroker::shared(&config.broker.channel);
    let deliveries = drain(&bus, "pr.opened.ready").await;
    assert_eq!(deliveries.len(), 1);

    let message = &deliveries[0].message;
    assert_eq!(message.metadata["provider"], "github");
    assert_eq!(message.metadata["event"], "pull_request");
    assert!(!message.metadata["request_id"].is_empty());
    assert_eq!(message.metadata["driver"], "channel");

    let wire: serde_json::Value = serde_json::from_slice(&message.payload).unwrap();
    assert_eq!(wire["provider"], "github");
    assert_eq!(wire["name"], "pull_request");
    assert_eq!(wire["data"]["action"], "opened");
    assert_eq!(wire["data"]["pull_request.draft"], false);
}

#[tokio::test]
async fn jsonpath_and_functions_multi_match_in_order() {
    let config = github_config(
        "ingress-multi",
        r#"
rules:
  - when: contains(labels, "bug")
    emit: [label.bug]
  - when: like(ref, "refs/heads/%")
    emit: [branch.push]
"#,
    );
    let router = build_router(&config).await;

    let body = r#"{"labels":["bug","ui"],"ref":"refs/heads/main"}"#;
    let response = router.oneshot(github_request(body, "push")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bus = ChannelBroker::shared(&config.broker.channel);
    assert_eq!(drain(&bus, "label.bug").await.len(), 1);
    assert_eq!(drain(&bus, "branch.push").await.len(), 1);
}

#[tokio::test]
async fn missing_field_matches_nothing_strict_or_lax() {
    for strict in [true, false] {
        let config = github_config(
            &format!("ingress-missing-{strict}"),
            &format!(
                r#"
rules:
  - when: missing == true
    emit: never
rules_strict: {strict}
"#
            ),
        );
        let router = build_router(&config).await;

        let response = router.oneshot(github_request("{}", "push")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bus = ChannelBroker::shared(&config.broker.channel);
        assert!(drain(&bus, "never").await.is_empty());
    }
}

#[tokio::test]
async fn bad_signature_is_rejected_without_publishing() {
    let config = github_config(
        "ingress-badsig",
        r#"
rules:
  - when: action == "opened"
    emit: pr.opened
"#,
    );
    let router = build_router(&config).await;

    let body = r#"{"action":"opened"}"#;
    let request = Request::builder()
        .method(Method::POST)
        .uri("/webhooks/github")
        .header("x-github-event", "pull_request")
        .header("x-hub-signature-256", sign("wrong-secret", body.as_bytes()))
        .body(Body::from(body))
        .unwrap();

    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(response.headers().contains_key("x-request-id"));

    let bus = ChannelBroker::shared(&config.broker.channel);
    assert!(drain(&bus, "pr.opened").await.is_empty());
}

#[tokio::test]
async fn oversize_body_answers_413() {
    let yaml = r#"
server:
  max_body_bytes: 64
providers:
  github:
    enabled: true
watermill:
  driver: channel
  channel:
    bus: ingress-oversize
"#;
    let config = Config::from_yaml(yaml).unwrap();
    let router = build_router(&config).await;

    let body = "x".repeat(1024);
    let request = Request::builder()
        .method(Method::POST)
        .uri("/webhooks/github")
        .header("x-github-event", "push")
        .body(Body::from(body))
        .unwrap();

    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert!(response.headers().contains_key("x-request-id"));
}

#[tokio::test]
async fn non_post_answers_405() {
    let config = github_config("ingress-405", "");
    let router = build_router(&config).await;

    let request = Request::builder()
        .method(Method::GET)
        .uri("/webhooks/github")
        .body(Body::empty())
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn ping_is_acked_without_emission() {
    let config = github_config(
        "ingress-ping",
        r#"
rules:
  - when: zen != ""
    emit: should.not.fire
"#,
    );
    let router = build_router(&config).await;

    let body = r#"{"zen":"practicality beats purity"}"#;
    let response = router.oneshot(github_request(body, "ping")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bus = ChannelBroker::shared(&config.broker.channel);
    assert!(drain(&bus, "should.not.fire").await.is_empty());
}

#[tokio::test]
async fn supplied_request_id_is_echoed_and_stamped() {
    let config = github_config(
        "ingress-reqid",
        r#"
rules:
  - when: action == "opened"
    emit: pr.opened
"#,
    );
    let router = build_router(&config).await;

    let body = r#"{"action":"opened"}"#;
    let mut request = github_request(body, "pull_request");
    request
        .headers_mut()
        .insert("x-request-id", "corr-123".parse().unwrap());

    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-request-id"], "corr-123");

    let bus = ChannelBroker::shared(&config.broker.channel);
    let deliveries = drain(&bus, "pr.opened").await;
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].message.metadata["request_id"], "corr-123");
}

#[tokio::test]
async fn unknown_event_name_is_a_parse_failure() {
    let config = github_config("ingress-unknown-event", "");
    let router = build_router(&config).await;

    let response = router
        .oneshot(github_request("{}", "not_a_real_event"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn gitlab_token_and_bitbucket_uuid_routes() {
    let yaml = r#"
providers:
  gitlab:
    enabled: true
    secret: gl-token
  bitbucket:
    enabled: true
    secret: hook-uuid-1
watermill:
  driver: channel
  channel:
    bus: ingress-gl-bb
    persistent: true
rules:
  - when: ref != ""
    emit: any.push
"#;
    let config = Config::from_yaml(yaml).unwrap();
    let router = build_router(&config).await;

    let gitlab_ok = Request::builder()
        .method(Method::POST)
        .uri("/webhooks/gitlab")
        .header("x-gitlab-event", "Push Hook")
        .header("x-gitlab-token", "gl-token")
        .body(Body::from(r#"{"ref":"refs/heads/main"}"#))
        .unwrap();
    let response = router.clone().oneshot(gitlab_ok).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let gitlab_bad = Request::builder()
        .method(Method::POST)
        .uri("/webhooks/gitlab")
        .header("x-gitlab-event", "Push Hook")
        .header("x-gitlab-token", "wrong")
        .body(Body::from(r#"{"ref":"refs/heads/main"}"#))
        .unwrap();
    let response = router.clone().oneshot(gitlab_bad).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let bitbucket_ok = Request::builder()
        .method(Method::POST)
        .uri("/webhooks/bitbucket")
        .header("x-event-key", "repo:push")
        .header("x-hook-uuid", "hook-uuid-1")
        .body(Body::from(r#"{"ref":"refs/heads/dev"}"#))
        .unwrap();
    let response = router.clone().oneshot(bitbucket_ok).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // one publish per accepted delivery, none for the rejected one
    let bus = ChannelBroker::shared(&config.broker.channel);
    let deliveries = drain(&bus, "any.push").await;
    assert_eq!(deliveries.len(), 2);
    let providers: Vec<_> = deliveries
        .iter()
        .map(|d| d.message.metadata["provider"].clone())
        .collect();
    assert_eq!(providers, vec!["gitlab", "bitbucket"]);
}

#[tokio::test]
async fn unreachable_driver_is_skipped_and_publish_still_works() {
    let yaml = r#"
providers:
  github:
    enabled: true
watermill:
  drivers: [channel, amqp]
  channel:
    bus: ingress-partial
    persistent: true
rules:
  - when: action == "opened"
    emit: pr.opened
"#;
    // amqp has no registered driver binding in this process: it is skipped
    // at mux construction, the in-process driver still delivers
    let config = Config::from_yaml(yaml).unwrap();
    let router = build_router(&config).await;

    let response = router
        .oneshot(github_request(r#"{"action":"opened"}"#, "pull_request"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bus = ChannelBroker::shared(&config.broker.channel);
    assert_eq!(drain(&bus, "pr.opened").await.len(), 1);
}
