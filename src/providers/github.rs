use axum::http::HeaderMap;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::Sha256;
use tracing::warn;

use super::{header, require_json, ParsedWebhook, Provider, ProviderError};

type HmacSha256 = Hmac<Sha256>;
type HmacSha1 = Hmac<Sha1>;

/// Event names GitHub delivers in `X-GitHub-Event`.
const KNOWN_EVENTS: &[&str] = &[
    "check_run",
    "check_suite",
    "commit_comment",
    "create",
    "delete",
    "dependabot_alert",
    "deploy_key",
    "deployment",
    "deployment_status",
    "fork",
    "github_app_authorization",
    "gollum",
    "installation",
    "installation_repositories",
    "integration_installation",
    "integration_installation_repositories",
    "issue_comment",
    "issues",
    "label",
    "member",
    "membership",
    "meta",
    "milestone",
    "org_block",
    "organization",
    "page_build",
    "ping",
    "project",
    "project_card",
    "project_column",
    "public",
    "pull_request",
    "pull_request_review",
    "pull_request_review_comment",
    "push",
    "release",
    "repository",
    "repository_vulnerability_alert",
    "security_advisory",
    "status",
    "team",
    "team_add",
    "watch",
    "workflow_dispatch",
    "workflow_job",
    "workflow_run",
];

pub struct GitHub {
    secret: String,
}

impl GitHub {
    pub fn new(secret: &str) -> Self {
        Self {
            secret: secret.to_string(),
        }
    }
}

impl Provider for GitHub {
    fn name(&self) -> &'static str {
        "github"
    }

    /// HMAC-SHA256 over the body, expected in `X-Hub-Signature-256`. When
    /// that header is absent the legacy `X-Hub-Signature` (HMAC-SHA1) is
    /// accepted instead.
    fn verify(&self, headers: &HeaderMap, body: &[u8]) -> Result<(), ProviderError> {
        if self.secret.is_empty() {
            return Ok(());
        }

        if let Some(sig) = headers
            .get("x-hub-signature-256")
            .and_then(|v| v.to_str().ok())
        {
            return verify_sha256(self.secret.as_bytes(), sig, body);
        }

        if let Some(sig) = headers.get("x-hub-signature").and_then(|v| v.to_str().ok()) {
            warn!("falling back to legacy SHA-1 webhook signature");
            return verify_sha1(self.secret.as_bytes(), sig, body);
        }

        Err(ProviderError::MissingSignature("X-Hub-Signature-256"))
    }

    fn parse(&self, headers: &HeaderMap, body: &[u8]) -> Result<ParsedWebhook, ProviderError> {
        let event = header(headers, "x-github-event")?;
        if !KNOWN_EVENTS.contains(&event) {
            return Err(ProviderError::UnknownEvent(event.to_string()));
        }
        require_json(body)?;
        Ok(ParsedWebhook {
            name: event.to_string(),
            control: event == "ping",
        })
    }
}

fn verify_sha256(secret: &[u8], signature: &str, body: &[u8]) -> Result<(), ProviderError> {
    let hex_sig = signature
        .strip_prefix("sha256=")
        .ok_or(ProviderError::InvalidFormat)?;
    let expected = hex::decode(hex_sig).map_err(|_| ProviderError::InvalidFormat)?;

    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key size");
    mac.update(body);
    mac.verify_slice(&expected)
        .map_err(|_| ProviderError::SignatureMismatch)
}

fn verify_sha1(secret: &[u8], signature: &str, body: &[u8]) -> Result<(), ProviderError> {
    let hex_sig = signature
        .strip_prefix("sha1=")
        .ok_or(ProviderError::InvalidFormat)?;
    let expected = hex::decode(hex_sig).map_err(|_| ProviderError::InvalidFormat)?;

    let mut mac = HmacSha1::new_from_slice(secret).expect("HMAC accepts any key size");
    mac.update(body);
    mac.verify_slice(&expected)
        .map_err(|_| ProviderError::SignatureMismatch)
}
