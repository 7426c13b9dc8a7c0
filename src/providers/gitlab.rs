use axum::http::HeaderMap;
use subtle::ConstantTimeEq;

use super::{header, require_json, ParsedWebhook, Provider, ProviderError};

/// Event names GitLab delivers in `X-Gitlab-Event`.
const KNOWN_EVENTS: &[&str] = &[
    "Push Hook",
    "Tag Push Hook",
    "Issue Hook",
    "Confidential Issue Hook",
    "Note Hook",
    "Confidential Note Hook",
    "Merge Request Hook",
    "Wiki Page Hook",
    "Pipeline Hook",
    "Build Hook",
    "Job Hook",
    "Deployment Hook",
    "System Hook",
];

pub struct GitLab {
    secret: String,
}

impl GitLab {
    pub fn new(secret: &str) -> Self {
        Self {
            secret: secret.to_string(),
        }
    }
}

impl Provider for GitLab {
    fn name(&self) -> &'static str {
        "gitlab"
    }

    /// GitLab sends the shared secret verbatim in `X-Gitlab-Token`;
    /// the comparison is constant-time.
    fn verify(&self, headers: &HeaderMap, _body: &[u8]) -> Result<(), ProviderError> {
        if self.secret.is_empty() {
            return Ok(());
        }
        let token = headers
            .get("x-gitlab-token")
            .and_then(|v| v.to_str().ok())
            .ok_or(ProviderError::MissingSignature("X-Gitlab-Token"))?;

        if token.as_bytes().ct_eq(self.secret.as_bytes()).into() {
            Ok(())
        } else {
            Err(ProviderError::SignatureMismatch)
        }
    }

    fn parse(&self, headers: &HeaderMap, body: &[u8]) -> Result<ParsedWebhook, ProviderError> {
        let event = header(headers, "x-gitlab-event")?;
        if !KNOWN_EVENTS.contains(&event) {
            return Err(ProviderError::UnknownEvent(event.to_string()));
        }
        require_json(body)?;
        Ok(ParsedWebhook {
            name: event.to_string(),
            control: false,
        })
    }
}
