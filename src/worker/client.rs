use std::any::Any;
use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;

use super::event::Event;
use crate::github_auth::GitHubAppAuth;

/// Builds a provider API client for a message. The worker calls this once
/// per message and attaches the result to the event before dispatch.
#[async_trait]
pub trait ClientProvider: Send + Sync {
    async fn client(&self, event: &Event) -> anyhow::Result<Arc<dyn Any + Send + Sync>>;
}

/// An authenticated GitHub API handle, ready for handler use.
pub struct GithubClient {
    token: String,
    http: reqwest::Client,
}

impl GithubClient {
    /// The installation token; valid for at least the current message.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// A request builder with auth and API headers already set.
    pub fn get(&self, url: &str) -> reqwest::RequestBuilder {
        self.request(reqwest::Method::GET, url)
    }

    pub fn post(&self, url: &str) -> reqwest::RequestBuilder {
        self.request(reqwest::Method::POST, url)
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, url)
            .header("authorization", format!("Bearer {}", self.token))
            .header("accept", "application/vnd.github+json")
            .header("user-agent", "hookrelay")
    }
}

/// Stock client provider: GitHub App auth, one installation token shared
/// across messages until it nears expiry.
pub struct GithubAppClientProvider {
    auth: Arc<GitHubAppAuth>,
    http: reqwest::Client,
}

impl GithubAppClientProvider {
    pub fn new(auth: Arc<GitHubAppAuth>) -> Self {
        Self {
            auth,
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ClientProvider for GithubAppClientProvider {
    async fn client(&self, event: &Event) -> anyhow::Result<Arc<dyn Any + Send + Sync>> {
        if event.provider != "github" {
            bail!("no client available for provider '{}'", event.provider);
        }
        let token = self.auth.get_token().await?;
        Ok(Arc::new(GithubClient {
            token,
            http: self.http.clone(),
        }))
    }
}
