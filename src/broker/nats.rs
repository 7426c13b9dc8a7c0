//! NATS JetStream driver.
//!
//! Each topic gets its own stream (`<stream>_<topic>`), created on first
//! use; subscriptions are pull consumers, durable when a durable name is
//! configured. Metadata maps to NATS headers.

use std::collections::HashMap;

use async_nats::jetstream;
use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use super::{Acker, BrokerError, Delivery, Message, Sink, Source};
use crate::config::NatsConfig;

/// Fan-out buffer between the consumer stream and the caller.
const SUBSCRIBE_BUFFER: usize = 64;

#[derive(Debug)]
pub struct NatsBroker {
    client: async_nats::Client,
    jetstream: jetstream::Context,
    stream_prefix: String,
    durable: String,
}

impl NatsBroker {
    pub async fn connect(cfg: &NatsConfig) -> Result<Self, BrokerError> {
        if cfg.url.is_empty() {
            return Err(BrokerError::Config("nats url is required".to_string()));
        }
        let client = async_nats::connect(&cfg.url)
            .await
            .map_err(|e| BrokerError::Connect(e.to_string()))?;
        let jetstream = jetstream::new(client.clone());
        Ok(Self {
            client,
            jetstream,
            stream_prefix: cfg.stream.clone(),
            durable: cfg.durable.clone(),
        })
    }

    async fn ensure_stream(&self, topic: &str) -> Result<jetstream::stream::Stream, BrokerError> {
        self.jetstream
            .get_or_create_stream(jetstream::stream::Config {
                name: format!("{}_{}", self.stream_prefix, sanitize(topic)),
                subjects: vec![topic.to_string()],
                ..Default::default()
            })
            .await
            .map_err(|e| BrokerError::Connect(e.to_string()))
    }
}

#[async_trait]
impl Sink for NatsBroker {
    async fn publish(&self, topic: &str, message: Message) -> Result<(), BrokerError> {
        self.ensure_stream(topic).await?;

        let mut headers = async_nats::HeaderMap::new();
        for (key, value) in &message.metadata {
            headers.insert(key.as_str(), value.as_str());
        }

        self.jetstream
            .publish_with_headers(topic.to_string(), headers, message.payload.clone())
            .await
            .map_err(|e| BrokerError::Publish(e.to_string()))?
            .await
            .map_err(|e| BrokerError::Publish(e.to_string()))?;
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.client
            .flush()
            .await
            .map_err(|e| BrokerError::Publish(e.to_string()))
    }
}

#[async_trait]
impl Source for NatsBroker {
    async fn subscribe(
        &self,
        token: CancellationToken,
        topic: &str,
    ) -> Result<mpsc::Receiver<Delivery>, BrokerError> {
        let stream = self.ensure_stream(topic).await?;

        let durable_name = if self.durable.is_empty() {
            None
        } else {
            Some(format!("{}_{}", self.durable, sanitize(topic)))
        };
        let consumer = stream
            .create_consumer(jetstream::consumer::pull::Config {
                durable_name,
                ..Default::default()
            })
            .await
            .map_err(|e| BrokerError::Subscribe(e.to_string()))?;

        let mut messages = consumer
            .messages()
            .await
            .map_err(|e| BrokerError::Subscribe(e.to_string()))?;

        let (tx, rx) = mpsc::channel(SUBSCRIBE_BUFFER);
        let topic = topic.to_string();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    next = messages.next() => {
                        let msg = match next {
                            Some(Ok(msg)) => msg,
                            Some(Err(e)) => {
                                warn!(topic = %topic, error = %e, "nats consumer error");
                                continue;
                            }
                            None => break,
                        };

                        let mut metadata = HashMap::new();
                        if let Some(headers) = msg.headers.as_ref() {
                            for (name, values) in headers.iter() {
                                let value = values
                                    .first()
                                    .map(|v| v.as_str().to_string())
                                    .unwrap_or_default();
                                metadata.insert(name.to_string(), value);
                            }
                        }

                        let message = Message {
                            uuid: Uuid::new_v4().to_string(),
                            payload: msg.payload.clone(),
                            metadata,
                        };
                        let delivery = Delivery::new(message, Acker::Nats(Box::new(msg)));
                        if tx.send(delivery).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        Sink::close(self).await
    }
}

/// Stream and consumer names allow a restricted character set; topics do not.
fn sanitize(topic: &str) -> String {
    topic
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_names_sanitize_to_stream_names() {
        assert_eq!(sanitize("pr.opened.ready"), "pr_opened_ready");
        assert_eq!(sanitize("label/bug#1"), "label_bug_1");
    }

    #[tokio::test]
    async fn empty_url_is_a_config_error() {
        let err = NatsBroker::connect(&NatsConfig::default()).await.unwrap_err();
        assert!(matches!(err, BrokerError::Config(_)));
        assert!(!err.is_retryable());
    }
}
