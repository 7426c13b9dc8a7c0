//! Publisher mux: one sink per configured driver, fan-out per event.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::warn;

use crate::broker::{
    self, channel::ChannelBroker, http::HttpSink, nats::NatsBroker, BrokerError, Message, Sink,
    META_DRIVER, META_EVENT, META_PROVIDER, META_REQUEST_ID, META_STATE_ID,
};
use crate::config::{BrokerConfig, PublishRetryConfig};
use crate::event::Event;
use crate::metrics;

const BUILD_ATTEMPTS: u32 = 10;
const BUILD_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("no publishers available")]
    NoSinks,
    #[error("event serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("publish failed on {} driver(s)", .0.len())]
    Failed(Vec<(String, BrokerError)>),
}

/// Fans events out to a caller-selected subset of the built drivers.
///
/// Construction builds every configured driver, retrying transient
/// failures up to 10 times 2 s apart; a driver that stays down is skipped
/// with a warning. Zero built sinks is fatal.
pub struct PublisherMux {
    sinks: Vec<(String, Arc<dyn Sink>)>,
    retry: PublishRetryConfig,
}

impl PublisherMux {
    pub async fn new(cfg: &BrokerConfig) -> Result<Self, PublishError> {
        let mut sinks: Vec<(String, Arc<dyn Sink>)> = Vec::new();
        for driver in broker::configured_drivers(cfg) {
            match build_sink_with_retry(cfg, &driver).await {
                Ok(sink) => sinks.push((driver, sink)),
                Err(e) => {
                    warn!(driver = %driver, error = %e, "publisher init failed, skipping driver");
                }
            }
        }
        if sinks.is_empty() {
            return Err(PublishError::NoSinks);
        }
        Ok(Self {
            sinks,
            retry: cfg.publish_retry.clone(),
        })
    }

    /// Names of the drivers that were actually built, in configured order.
    pub fn drivers(&self) -> Vec<&str> {
        self.sinks.iter().map(|(name, _)| name.as_str()).collect()
    }

    fn sink(&self, name: &str) -> Option<&Arc<dyn Sink>> {
        self.sinks
            .iter()
            .find(|(sink_name, _)| sink_name == name)
            .map(|(_, sink)| sink)
    }

    /// Publish the event on `topic`. An empty `drivers` list means every
    /// built sink. The payload is marshaled once; failures are collected
    /// per driver and never short-circuit the remaining targets.
    pub async fn publish(
        &self,
        topic: &str,
        event: &Event,
        drivers: &[String],
    ) -> Result<(), PublishError> {
        let payload = Bytes::from(serde_json::to_vec(event)?);

        let targets: Vec<String> = if drivers.is_empty() {
            self.sinks.iter().map(|(name, _)| name.clone()).collect()
        } else {
            drivers.iter().map(|name| canonical_name(name)).collect()
        };

        let mut failures = Vec::new();
        for target in targets {
            let Some(sink) = self.sink(&target) else {
                warn!(driver = %target, topic = %topic, "unknown publish driver");
                failures.push((
                    target.clone(),
                    BrokerError::UnsupportedDriver(target.clone()),
                ));
                continue;
            };

            let message = Message::new(payload.clone())
                .with_metadata(META_PROVIDER, event.provider.clone())
                .with_metadata(META_EVENT, event.name.clone())
                .with_metadata(META_REQUEST_ID, event.request_id.clone())
                .with_metadata(META_STATE_ID, event.state_id.clone().unwrap_or_default())
                .with_metadata(META_DRIVER, target.clone());

            if let Err(e) = self.publish_with_retry(sink, topic, message).await {
                metrics::inc_publish_error(&target);
                warn!(
                    driver = %target,
                    topic = %topic,
                    request_id = %event.request_id,
                    error = %e,
                    "publish failed"
                );
                failures.push((target, e));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(PublishError::Failed(failures))
        }
    }

    async fn publish_with_retry(
        &self,
        sink: &Arc<dyn Sink>,
        topic: &str,
        message: Message,
    ) -> Result<(), BrokerError> {
        let attempts = self.retry.attempts.max(1);
        let mut last = None;
        for attempt in 1..=attempts {
            match sink.publish(topic, message.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    last = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(Duration::from_millis(self.retry.delay_ms)).await;
                    }
                }
            }
        }
        Err(last.unwrap_or_else(|| BrokerError::Publish("no attempt was made".to_string())))
    }

    /// Close every sink; errors are aggregated.
    pub async fn close(&self) -> Result<(), PublishError> {
        let mut failures = Vec::new();
        for (name, sink) in &self.sinks {
            if let Err(e) = sink.close().await {
                failures.push((name.clone(), e));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(PublishError::Failed(failures))
        }
    }
}

fn canonical_name(name: &str) -> String {
    let name = name.trim().to_lowercase();
    if name == "gochannel" {
        "channel".to_string()
    } else {
        name
    }
}

async fn build_sink(cfg: &BrokerConfig, driver: &str) -> Result<Arc<dyn Sink>, BrokerError> {
    match driver {
        "channel" => Ok(Arc::new(ChannelBroker::shared(&cfg.channel))),
        "nats" => Ok(Arc::new(NatsBroker::connect(&cfg.nats).await?)),
        "http" => Ok(Arc::new(HttpSink::new(&cfg.http)?)),
        other => match broker::sink_factory(other) {
            Some(factory) => factory(cfg).await,
            None => Err(BrokerError::UnsupportedDriver(other.to_string())),
        },
    }
}

async fn build_sink_with_retry(
    cfg: &BrokerConfig,
    driver: &str,
) -> Result<Arc<dyn Sink>, BrokerError> {
    let mut last = None;
    for attempt in 1..=BUILD_ATTEMPTS {
        match build_sink(cfg, driver).await {
            Ok(sink) => return Ok(sink),
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => {
                warn!(driver = %driver, attempt, error = %e, "sink init failed, will retry");
                last = Some(e);
                if attempt < BUILD_ATTEMPTS {
                    tokio::time::sleep(BUILD_DELAY).await;
                }
            }
        }
    }
    Err(last.unwrap_or_else(|| BrokerError::Connect("sink init never ran".to_string())))
}
