use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Router};
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::event::{Event, StateResolver};
use crate::expr::ExprError;
use crate::metrics;
use crate::providers::{self, Provider};
use crate::publish::{PublishError, PublisherMux};
use crate::ratelimit::{rate_limit, RateLimiter};
use crate::rules::RuleEngine;

/// Rate-limit entries idle longer than this are dropped.
const RATE_LIMIT_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
    #[error("rule compilation failed: {0}")]
    Rules(#[from] ExprError),
    #[error(transparent)]
    Publisher(#[from] PublishError),
}

/// State shared across all webhook routes. Read-only after construction.
pub struct SharedState {
    pub rules: RuleEngine,
    pub publisher: PublisherMux,
    pub state_resolver: Arc<dyn StateResolver>,
    pub debug_events: bool,
}

#[derive(Clone)]
struct ProviderState {
    shared: Arc<SharedState>,
    provider: Arc<dyn Provider>,
}

/// Correlation id for one delivery, stamped on every response.
#[derive(Clone)]
pub struct RequestId(pub String);

/// Compile the rules, build the publisher, and assemble the router.
pub async fn build(
    config: &Config,
    state_resolver: Arc<dyn StateResolver>,
) -> Result<(Router, Arc<SharedState>), BuildError> {
    let rules = RuleEngine::new(&config.normalized_rules()?, config.rules_strict)?;
    let publisher = PublisherMux::new(&config.broker).await?;
    info!(drivers = ?publisher.drivers(), "publisher ready");

    let shared = Arc::new(SharedState {
        rules,
        publisher,
        state_resolver,
        debug_events: config.server.debug_events,
    });
    let router = build_router(config, shared.clone());
    Ok((router, shared))
}

pub fn build_router(config: &Config, shared: Arc<SharedState>) -> Router {
    let mut router = Router::new().route("/health", get(health));

    let provider_configs = [
        ("github", &config.providers.github),
        ("gitlab", &config.providers.gitlab),
        ("bitbucket", &config.providers.bitbucket),
    ];
    for (name, provider_config) in provider_configs {
        if !provider_config.enabled {
            continue;
        }
        match providers::create(name, provider_config) {
            Ok(provider) => {
                if provider_config.secret.is_empty() {
                    warn!(provider = name, "no secret configured, verification is OFF");
                }
                info!(provider = name, path = %provider_config.path, "webhook enabled");
                let state = ProviderState {
                    shared: shared.clone(),
                    provider: Arc::from(provider),
                };
                router = router.route(&provider_config.path, post(handle_webhook).with_state(state));
            }
            Err(e) => {
                warn!(provider = name, error = %e, "failed to create provider, skipping");
            }
        }
    }

    if config.server.metrics_enabled {
        if let Some(handle) = metrics::install_recorder() {
            router = router.route(
                &config.server.metrics_path,
                get(move || {
                    let handle = handle.clone();
                    async move { handle.render() }
                }),
            );
        }
    }

    router = router.layer(DefaultBodyLimit::max(config.server.max_body_bytes));

    if config.server.rate_limit_rps > 0 {
        let limiter = Arc::new(RateLimiter::new(
            config.server.rate_limit_rps,
            config.server.rate_limit_burst,
            RATE_LIMIT_TTL,
        ));
        router = router.layer(axum::middleware::from_fn_with_state(limiter, rate_limit));
    }

    if config.server.write_timeout_ms > 0 {
        let timeout = Duration::from_millis(config.server.write_timeout_ms);
        router = router.layer(axum::middleware::from_fn(
            move |request: Request, next: Next| async move {
                match tokio::time::timeout(timeout, next.run(request)).await {
                    Ok(response) => response,
                    Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
                }
            },
        ));
    }

    // outermost: every response carries the correlation id
    router.layer(axum::middleware::from_fn(stamp_request_id))
}

async fn health() -> impl IntoResponse {
    axum::Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Extract or synthesize the request id, expose it to handlers, and echo
/// it on the response.
async fn stamp_request_id(mut request: Request, next: Next) -> Response {
    let id = request_id_from_headers(request.headers());
    request.extensions_mut().insert(RequestId(id.clone()));

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

fn request_id_from_headers(headers: &HeaderMap) -> String {
    for name in ["x-request-id", "x-correlation-id"] {
        if let Some(id) = headers.get(name).and_then(|v| v.to_str().ok()) {
            if !id.is_empty() {
                return id.to_string();
            }
        }
    }
    Uuid::new_v4().to_string()
}

/// The ingress pipeline: verify, parse, canonicalize, evaluate, publish.
///
/// User-visible failures are status codes only; publish failures keep the
/// 200 (the producer is acked even when downstream fan-out partially
/// fails; escalation is deliberately left to a future design pass).
async fn handle_webhook(
    State(state): State<ProviderState>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let provider = &state.provider;
    metrics::inc_request(provider.name());

    if let Err(e) = provider.verify(&headers, &body) {
        warn!(
            provider = provider.name(),
            request_id = %request_id,
            error = %e,
            "verification failed"
        );
        metrics::inc_parse_error(provider.name());
        return StatusCode::BAD_REQUEST;
    }

    let parsed = match provider.parse(&headers, &body) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!(
                provider = provider.name(),
                request_id = %request_id,
                error = %e,
                "parse failed"
            );
            metrics::inc_parse_error(provider.name());
            return StatusCode::BAD_REQUEST;
        }
    };
    if parsed.control {
        return StatusCode::OK;
    }

    let mut event = Event::from_payload(provider.name(), parsed.name, request_id.clone(), body);
    event.state_id = state
        .shared
        .state_resolver
        .resolve(&event.provider, &event.raw_payload)
        .await;

    if state.shared.debug_events {
        debug!(
            request_id = %request_id,
            payload = %String::from_utf8_lossy(&event.raw_payload),
            "inbound payload"
        );
    }

    let matches = state.shared.rules.evaluate(&event);
    info!(
        provider = %event.provider,
        event = %event.name,
        request_id = %request_id,
        matched = matches.len(),
        "webhook processed"
    );

    for rule_match in &matches {
        // failures are logged and counted inside the mux; the response
        // stays 200 either way
        let _ = state
            .shared
            .publisher
            .publish(&rule_match.topic, &event, &rule_match.drivers)
            .await;
    }

    StatusCode::OK
}
