//! GitHub App authentication: app JWT → installation access token.
//!
//! The parsed signing key is loaded once at construction; the installation
//! token is cached and refreshed shortly before it expires, so concurrent
//! workers share one token exchange instead of racing the API.

use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::info;

const DEFAULT_API_BASE: &str = "https://api.github.com";

/// Refresh this many seconds before the cached token expires.
const REFRESH_MARGIN_SECS: i64 = 60;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("failed to read private key: {0}")]
    KeyRead(std::io::Error),
    #[error("invalid private key: {0}")]
    KeyParse(jsonwebtoken::errors::Error),
    #[error("JWT encoding failed: {0}")]
    JwtEncode(jsonwebtoken::errors::Error),
    #[error("token exchange request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("GitHub API error {status}: {body}")]
    Api { status: u16, body: String },
    #[error("no installation found for app")]
    NoInstallation,
    #[error("installation token missing from response")]
    TokenMissing,
}

#[derive(Serialize)]
struct JwtClaims {
    iat: i64,
    exp: i64,
    iss: String,
}

#[derive(Deserialize)]
struct InstallationToken {
    token: String,
}

#[derive(Debug)]
struct CachedToken {
    token: String,
    expires_at: i64,
}

/// GitHub App authenticator shared by the worker's client provider.
pub struct GitHubAppAuth {
    app_id: String,
    api_base: String,
    encoding_key: EncodingKey,
    http: reqwest::Client,
    cached: RwLock<Option<CachedToken>>,
}

impl std::fmt::Debug for GitHubAppAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitHubAppAuth")
            .field("app_id", &self.app_id)
            .field("api_base", &self.api_base)
            .finish_non_exhaustive()
    }
}

impl GitHubAppAuth {
    /// Load the RSA signing key from a PEM file. `api_base` falls back to
    /// the public GitHub API when empty (set it for GHES).
    pub fn from_pem_file(
        app_id: impl Into<String>,
        private_key_path: &str,
        api_base: Option<&str>,
        http: reqwest::Client,
    ) -> Result<Self, AuthError> {
        let pem = std::fs::read(private_key_path).map_err(AuthError::KeyRead)?;
        let encoding_key = EncodingKey::from_rsa_pem(&pem).map_err(AuthError::KeyParse)?;
        Ok(Self {
            app_id: app_id.into(),
            api_base: normalize_api_base(api_base),
            encoding_key,
            http,
            cached: RwLock::new(None),
        })
    }

    /// A valid installation token, from cache or freshly exchanged.
    pub async fn get_token(&self) -> Result<String, AuthError> {
        {
            let cached = self.cached.read().await;
            if let Some(token) = &*cached {
                let now = chrono::Utc::now().timestamp();
                if token.expires_at - REFRESH_MARGIN_SECS > now {
                    return Ok(token.token.clone());
                }
            }
        }
        self.refresh_token().await
    }

    fn app_jwt(&self) -> Result<String, AuthError> {
        let now = chrono::Utc::now().timestamp();
        let claims = JwtClaims {
            // 30s of clock-skew allowance; GitHub rejects exp > 10 minutes
            iat: now - 30,
            exp: now + 9 * 60,
            iss: self.app_id.clone(),
        };
        encode(&Header::new(Algorithm::RS256), &claims, &self.encoding_key)
            .map_err(AuthError::JwtEncode)
    }

    async fn find_installation_id(&self, jwt: &str) -> Result<u64, AuthError> {
        let response = self
            .http
            .get(format!("{}/app/installations", self.api_base))
            .header("authorization", format!("Bearer {jwt}"))
            .header("accept", "application/vnd.github+json")
            .header("user-agent", "hookrelay")
            .send()
            .await?;

        let status = response.status().as_u16();
        let body = response.text().await?;
        if status != 200 {
            return Err(AuthError::Api { status, body });
        }

        let installations: Vec<Value> = serde_json::from_str(&body).unwrap_or_default();
        installations
            .first()
            .and_then(|installation| installation["id"].as_u64())
            .ok_or(AuthError::NoInstallation)
    }

    async fn refresh_token(&self) -> Result<String, AuthError> {
        let jwt = self.app_jwt()?;
        let installation_id = self.find_installation_id(&jwt).await?;

        let response = self
            .http
            .post(format!(
                "{}/app/installations/{installation_id}/access_tokens",
                self.api_base
            ))
            .header("authorization", format!("Bearer {jwt}"))
            .header("accept", "application/vnd.github+json")
            .header("user-agent", "hookrelay")
            .send()
            .await?;

        let status = response.status().as_u16();
        let body = response.text().await?;
        if status != 201 {
            return Err(AuthError::Api { status, body });
        }

        let parsed: InstallationToken =
            serde_json::from_str(&body).map_err(|_| AuthError::TokenMissing)?;
        if parsed.token.is_empty() {
            return Err(AuthError::TokenMissing);
        }

        info!(installation_id, "GitHub App installation token acquired");

        // installation tokens last an hour; cache for 55 minutes
        let expires_at = chrono::Utc::now().timestamp() + 55 * 60;
        let mut cached = self.cached.write().await;
        *cached = Some(CachedToken {
            token: parsed.token.clone(),
            expires_at,
        });

        Ok(parsed.token)
    }
}

fn normalize_api_base(base: Option<&str>) -> String {
    match base.map(str::trim) {
        Some(base) if !base.is_empty() => base.trim_end_matches('/').to_string(),
        _ => DEFAULT_API_BASE.to_string(),
    }
}

/// Pull the App installation id out of a webhook payload, when present.
pub fn installation_id_from_payload(payload: &[u8]) -> Option<u64> {
    let value: Value = serde_json::from_slice(payload).ok()?;
    value.get("installation")?.get("id")?.as_u64()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_base_normalization() {
        assert_eq!(normalize_api_base(None), DEFAULT_API_BASE);
        assert_eq!(normalize_api_base(Some("  ")), DEFAULT_API_BASE);
        assert_eq!(
            normalize_api_base(Some("https://ghe.example.com/api/v3/")),
            "https://ghe.example.com/api/v3"
        );
    }

    #[test]
    fn installation_id_extraction() {
        let payload = br#"{"installation":{"id":4242},"action":"created"}"#;
        assert_eq!(installation_id_from_payload(payload), Some(4242));
        assert_eq!(installation_id_from_payload(b"{}"), None);
        assert_eq!(installation_id_from_payload(b"not json"), None);
    }

    #[test]
    fn missing_key_file_is_a_read_error() {
        let err = GitHubAppAuth::from_pem_file(
            "1234",
            "/nonexistent/key.pem",
            None,
            reqwest::Client::new(),
        )
        .unwrap_err();
        assert!(matches!(err, AuthError::KeyRead(_)));
    }
}
