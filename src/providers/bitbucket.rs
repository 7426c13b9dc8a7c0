use axum::http::HeaderMap;
use subtle::ConstantTimeEq;

use super::{header, require_json, ParsedWebhook, Provider, ProviderError};

/// Event keys Bitbucket delivers in `X-Event-Key`.
const KNOWN_EVENTS: &[&str] = &[
    "repo:push",
    "repo:fork",
    "repo:updated",
    "repo:commit_comment_created",
    "repo:commit_status_created",
    "repo:commit_status_updated",
    "issue:created",
    "issue:updated",
    "issue:comment_created",
    "pullrequest:created",
    "pullrequest:updated",
    "pullrequest:approved",
    "pullrequest:unapproved",
    "pullrequest:fulfilled",
    "pullrequest:rejected",
    "pullrequest:comment_created",
    "pullrequest:comment_updated",
    "pullrequest:comment_deleted",
];

pub struct Bitbucket {
    hook_uuid: String,
}

impl Bitbucket {
    pub fn new(hook_uuid: &str) -> Self {
        Self {
            hook_uuid: hook_uuid.to_string(),
        }
    }
}

impl Provider for Bitbucket {
    fn name(&self) -> &'static str {
        "bitbucket"
    }

    /// Bitbucket identifies the hook with `X-Hook-UUID`; authenticity is the
    /// UUID matching the configured one.
    fn verify(&self, headers: &HeaderMap, _body: &[u8]) -> Result<(), ProviderError> {
        if self.hook_uuid.is_empty() {
            return Ok(());
        }
        let uuid = headers
            .get("x-hook-uuid")
            .and_then(|v| v.to_str().ok())
            .ok_or(ProviderError::MissingSignature("X-Hook-UUID"))?;

        if uuid.as_bytes().ct_eq(self.hook_uuid.as_bytes()).into() {
            Ok(())
        } else {
            Err(ProviderError::SignatureMismatch)
        }
    }

    fn parse(&self, headers: &HeaderMap, body: &[u8]) -> Result<ParsedWebhook, ProviderError> {
        let event = header(headers, "x-event-key")?;
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_uuid_accepted() {
        let provider = Bitbucket::new("abc-123");
        let mut headers = HeaderMap::new();
        headers.insert("x-hook-uuid", "abc-123".parse().unwrap());
        assert!(provider.verify(&headers, b"{}").is_ok());
    }

    #[test]
    fn wrong_uuid_rejected() {
        let provider = Bitbucket::new("abc-123");
        let mut headers = HeaderMap::new();
        headers.insert("x-hook-uuid", "def-456".parse().unwrap());
        assert!(matches!(
            provider.verify(&headers, b"{}"),
            Err(ProviderError::SignatureMismatch)
        ));
    }

    #[test]
    fn empty_uuid_config_skips_verification() {
        let provider = Bitbucket::new("");
        assert!(provider.verify(&HeaderMap::new(), b"{}").is_ok());
    }

    #[test]
    fn parse_push_event() {
        let provider = Bitbucket::new("");
        let mut headers = HeaderMap::new();
        headers.insert("x-event-key", "repo:push".parse().unwrap());
        let parsed = provider.parse(&headers, br#"{"push":{}}"#).unwrap();
        assert_eq!(parsed.name, "repo:push");
    }

    #[test]
    fn unknown_event_key_rejected() {
        let provider = Bitbucket::new("");
        let mut headers = HeaderMap::new();
        headers.insert("x-event-key", "repo:mystery".parse().unwrap());
        assert!(matches!(
            provider.parse(&headers, b"{}"),
            Err(ProviderError::UnknownEvent(_))
        ));
    }
}
