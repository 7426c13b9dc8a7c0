pub mod bitbucket;
pub mod github;
pub mod gitlab;

use axum::http::HeaderMap;

use crate::config::ProviderConfig;

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("missing signature header {0}")]
    MissingSignature(&'static str),
    #[error("invalid signature format")]
    InvalidFormat,
    #[error("signature mismatch")]
    SignatureMismatch,
    #[error("missing event header {0}")]
    MissingEventHeader(&'static str),
    #[error("unknown event '{0}'")]
    UnknownEvent(String),
    #[error("invalid JSON body: {0}")]
    InvalidBody(String),
    #[error("unknown provider '{0}'")]
    UnknownProvider(String),
}

/// Outcome of parsing a webhook request's headers and body.
#[derive(Debug)]
pub struct ParsedWebhook {
    /// Provider-native event name (e.g. `pull_request`, `Merge Request Hook`).
    pub name: String,
    /// Control events (GitHub `ping`) are acknowledged without emission.
    pub control: bool,
}

/// One upstream source-control provider: authenticity check plus payload
/// parsing into the provider's event variants.
pub trait Provider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Validate the request signature against the configured secret.
    /// An empty secret skips verification.
    fn verify(&self, headers: &HeaderMap, body: &[u8]) -> Result<(), ProviderError>;

    /// Parse the event name and body into a known event variant.
    fn parse(&self, headers: &HeaderMap, body: &[u8]) -> Result<ParsedWebhook, ProviderError>;
}

/// Create a provider handler from config.
pub fn create(name: &str, config: &ProviderConfig) -> Result<Box<dyn Provider>, ProviderError> {
    match name {
        "github" => Ok(Box::new(github::GitHub::new(&config.secret))),
        "gitlab" => Ok(Box::new(gitlab::GitLab::new(&config.secret))),
        "bitbucket" => Ok(Box::new(bitbucket::Bitbucket::new(&config.secret))),
        other => Err(ProviderError::UnknownProvider(other.to_string())),
    }
}

/// Shared body check: every provider delivers JSON.
pub(crate) fn require_json(body: &[u8]) -> Result<(), ProviderError> {
    serde_json::from_slice::<serde_json::Value>(body)
        .map(|_| ())
        .map_err(|e| ProviderError::InvalidBody(e.to_string()))
}

pub(crate) fn header<'a>(
    headers: &'a HeaderMap,
    name: &'static str,
) -> Result<&'a str, ProviderError> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .ok_or(ProviderError::MissingEventHeader(name))
}
