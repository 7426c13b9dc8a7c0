//! HTTP publish driver.
//!
//! `topic_url` mode treats the topic itself as the target URL; `base_url`
//! mode posts to `<base_url>/<topic>`. Metadata travels as request headers.

use async_trait::async_trait;

use super::{BrokerError, Message, Sink};
use crate::config::HttpConfig;

enum Mode {
    TopicUrl,
    BaseUrl,
}

pub struct HttpSink {
    client: reqwest::Client,
    mode: Mode,
    base_url: String,
}

impl HttpSink {
    pub fn new(cfg: &HttpConfig) -> Result<Self, BrokerError> {
        let mode = match cfg.mode.to_lowercase().as_str() {
            "topic_url" => Mode::TopicUrl,
            "base_url" => Mode::BaseUrl,
            other => {
                return Err(BrokerError::Config(format!(
                    "unsupported http mode: {other}"
                )))
            }
        };
        if matches!(mode, Mode::BaseUrl) && cfg.base_url.is_empty() {
            return Err(BrokerError::Config(
                "http base_url is required for base_url mode".to_string(),
            ));
        }
        Ok(Self {
            client: reqwest::Client::new(),
            mode,
            base_url: cfg.base_url.clone(),
        })
    }

    fn target_url(&self, topic: &str) -> Result<String, BrokerError> {
        match self.mode {
            Mode::TopicUrl => {
                if topic.is_empty() {
                    return Err(BrokerError::Config("http topic url is empty".to_string()));
                }
                Ok(topic.to_string())
            }
            Mode::BaseUrl => {
                let base = self.base_url.trim_end_matches('/');
                if topic.is_empty() {
                    return Ok(base.to_string());
                }
                Ok(format!("{base}/{}", topic.trim_start_matches('/')))
            }
        }
    }
}

#[async_trait]
impl Sink for HttpSink {
    async fn publish(&self, topic: &str, message: Message) -> Result<(), BrokerError> {
        let url = self.target_url(topic)?;

        let mut request = self
            .client
            .post(&url)
            .header("content-type", "application/json")
            .body(message.payload.clone());
        for (key, value) in &message.metadata {
            request = request.header(key, value);
        }

        let response = request
            .send()
            .await
            .map_err(|e| BrokerError::Publish(e.to_string()))?;
        if !response.status().is_success() {
            return Err(BrokerError::Publish(format!(
                "{url} answered {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sink(mode: &str, base_url: &str) -> Result<HttpSink, BrokerError> {
        HttpSink::new(&HttpConfig {
            base_url: base_url.to_string(),
            mode: mode.to_string(),
        })
    }

    #[test]
    fn topic_url_mode_uses_the_topic() {
        let sink = sink("topic_url", "").unwrap();
        assert_eq!(
            sink.target_url("https://example.com/hook").unwrap(),
            "https://example.com/hook"
        );
        assert!(sink.target_url("").is_err());
    }

    #[test]
    fn base_url_mode_joins_without_double_slashes() {
        let sink = sink("base_url", "https://example.com/events/").unwrap();
        assert_eq!(
            sink.target_url("/pr.opened").unwrap(),
            "https://example.com/events/pr.opened"
        );
        assert_eq!(
            sink.target_url("").unwrap(),
            "https://example.com/events"
        );
    }

    #[test]
    fn base_url_mode_requires_base_url() {
        assert!(matches!(sink("base_url", ""), Err(BrokerError::Config(_))));
    }

    #[test]
    fn unknown_mode_rejected() {
        assert!(matches!(
            sink("query_param", "x"),
            Err(BrokerError::Config(_))
        ));
    }
}
