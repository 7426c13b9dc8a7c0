//! Subscriber mux: joins every configured driver's subscription into one
//! buffered stream, stamping each message with its originating driver.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::broker::{
    self, channel::ChannelBroker, nats::NatsBroker, BrokerError, Delivery, Source, META_DRIVER,
};
use crate::config::BrokerConfig;

const BUILD_ATTEMPTS: u32 = 10;
const BUILD_DELAY: Duration = Duration::from_secs(2);

/// Default fan-in buffer when the config does not override it.
const DEFAULT_BUFFER: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum SubscribeError {
    #[error("no supported subscriber drivers configured")]
    NoSources,
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// One source per configured driver, joined per `subscribe` call into a
/// single bounded channel. FIFO holds per source; nothing is guaranteed
/// across sources.
pub struct SubscriberMux {
    sources: Vec<(String, Arc<dyn Source>)>,
    buffer: usize,
}

impl SubscriberMux {
    pub async fn new(cfg: &BrokerConfig) -> Result<Self, SubscribeError> {
        let mut sources: Vec<(String, Arc<dyn Source>)> = Vec::new();
        for driver in broker::configured_drivers(cfg) {
            if !source_driver_supported(&driver) {
                warn!(driver = %driver, "skipping unsupported subscriber driver");
                continue;
            }
            match build_source_with_retry(cfg, &driver).await {
                Ok(source) => sources.push((driver, source)),
                Err(e) => {
                    warn!(driver = %driver, error = %e, "subscriber init failed, skipping driver");
                }
            }
        }
        if sources.is_empty() {
            return Err(SubscribeError::NoSources);
        }
        Ok(Self {
            sources,
            buffer: if cfg.channel.output_buffer > 0 {
                cfg.channel.output_buffer
            } else {
                DEFAULT_BUFFER
            },
        })
    }

    /// Assemble a mux from pre-built sources; for embedders with their own
    /// driver bindings and for tests.
    pub fn from_sources(
        sources: Vec<(String, Arc<dyn Source>)>,
        buffer: usize,
    ) -> Result<Self, SubscribeError> {
        if sources.is_empty() {
            return Err(SubscribeError::NoSources);
        }
        Ok(Self {
            sources,
            buffer: buffer.max(1),
        })
    }

    pub fn drivers(&self) -> Vec<&str> {
        self.sources.iter().map(|(name, _)| name.as_str()).collect()
    }
}

#[async_trait]
impl Source for SubscriberMux {
    /// Subscribe every source and fan in. On any source failing to
    /// subscribe, the already-opened sources are closed and the error is
    /// returned. The output channel closes once every forwarding task has
    /// exited (its source ended or the token was cancelled).
    async fn subscribe(
        &self,
        token: CancellationToken,
        topic: &str,
    ) -> Result<mpsc::Receiver<Delivery>, BrokerError> {
        let mut streams = Vec::with_capacity(self.sources.len());
        for (driver, source) in &self.sources {
            match source.subscribe(token.clone(), topic).await {
                Ok(rx) => streams.push((driver.clone(), rx)),
                Err(e) => {
                    for (_, source) in &self.sources {
                        let _ = source.close().await;
                    }
                    return Err(e);
                }
            }
        }

        let (tx, rx) = mpsc::channel(self.buffer);
        for (driver, mut stream) in streams {
            let tx = tx.clone();
            let token = token.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        next = stream.recv() => {
                            let Some(mut delivery) = next else { break };
                            delivery
                                .message
                                .metadata
                                .insert(META_DRIVER.to_string(), driver.clone());
                            if tx.send(delivery).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
        // only forwarder clones keep the channel open now
        drop(tx);

        Ok(rx)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let mut first_err = None;
        for (_, source) in &self.sources {
            if let Err(e) = source.close().await {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }
}

fn source_driver_supported(driver: &str) -> bool {
    matches!(driver, "channel" | "nats") || broker::source_factory(driver).is_some()
}

async fn build_source(cfg: &BrokerConfig, driver: &str) -> Result<Arc<dyn Source>, BrokerError> {
    match driver {
        "channel" => Ok(Arc::new(ChannelBroker::shared(&cfg.channel))),
        "nats" => Ok(Arc::new(NatsBroker::connect(&cfg.nats).await?)),
        other => match broker::source_factory(other) {
            Some(factory) => factory(cfg).await,
            None => Err(BrokerError::UnsupportedDriver(other.to_string())),
        },
    }
}

async fn build_source_with_retry(
    cfg: &BrokerConfig,
    driver: &str,
) -> Result<Arc<dyn Source>, BrokerError> {
    let mut last = None;
    for attempt in 1..=BUILD_ATTEMPTS {
        match build_source(cfg, driver).await {
            Ok(source) => return Ok(source),
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => {
                warn!(driver = %driver, attempt, error = %e, "source init failed, will retry");
                last = Some(e);
                if attempt < BUILD_ATTEMPTS {
                    tokio::time::sleep(BUILD_DELAY).await;
                }
            }
        }
    }
    Err(last.unwrap_or_else(|| BrokerError::Connect("source init never ran".to_string())))
}
