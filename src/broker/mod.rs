//! Broker bindings shared by the publisher and subscriber muxes.
//!
//! Each configured driver is one broker binding; its publish side is a
//! [`Sink`], its subscribe side a [`Source`]. The wire library behind a
//! driver is a collaborator: `channel`, `nats` and `http` ship built in,
//! anything else installs through the module-scope driver registry.

pub mod channel;
pub mod http;
pub mod nats;

use std::collections::HashMap;
use std::sync::{Arc, LazyLock, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use crate::config::BrokerConfig;

pub const META_PROVIDER: &str = "provider";
pub const META_EVENT: &str = "event";
pub const META_REQUEST_ID: &str = "request_id";
pub const META_STATE_ID: &str = "state_id";
pub const META_DRIVER: &str = "driver";

pub type Metadata = HashMap<String, String>;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("driver misconfigured: {0}")]
    Config(String),
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("subscribe failed: {0}")]
    Subscribe(String),
    #[error("unsupported driver: {0}")]
    UnsupportedDriver(String),
}

impl BrokerError {
    /// Connection-level failures are worth retrying during mux
    /// construction; configuration mistakes are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BrokerError::Connect(_) | BrokerError::Publish(_) | BrokerError::Subscribe(_)
        )
    }
}

/// One broker message: opaque payload plus string metadata headers.
#[derive(Debug, Clone)]
pub struct Message {
    pub uuid: String,
    pub payload: Bytes,
    pub metadata: Metadata,
}

impl Message {
    pub fn new(payload: Bytes) -> Self {
        Self {
            uuid: Uuid::new_v4().to_string(),
            payload,
            metadata: Metadata::new(),
        }
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<String>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// A message handed to a consumer. Ack and nack consume the delivery, so
/// each one is settled at most once; dropping it unsettled leaves the
/// broker's redelivery policy in charge.
pub struct Delivery {
    pub message: Message,
    acker: Acker,
}

pub(crate) enum Acker {
    Noop,
    Channel(channel::ChannelAcker),
    Nats(Box<async_nats::jetstream::Message>),
}

impl Delivery {
    pub(crate) fn new(message: Message, acker: Acker) -> Self {
        Self { message, acker }
    }

    /// A delivery that needs no settlement (tests, fire-and-forget sources).
    pub fn unsettled(message: Message) -> Self {
        Self {
            message,
            acker: Acker::Noop,
        }
    }

    pub async fn ack(self) {
        match self.acker {
            Acker::Noop => {}
            Acker::Channel(acker) => acker.ack().await,
            Acker::Nats(msg) => {
                if let Err(e) = msg.ack().await {
                    warn!(error = %e, "nats ack failed");
                }
            }
        }
    }

    pub async fn nack(self) {
        match self.acker {
            Acker::Noop => {}
            Acker::Channel(acker) => acker.nack().await,
            Acker::Nats(msg) => {
                if let Err(e) = msg
                    .ack_with(async_nats::jetstream::AckKind::Nak(None))
                    .await
                {
                    warn!(error = %e, "nats nack failed");
                }
            }
        }
    }
}

/// Publish side of one driver.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn publish(&self, topic: &str, message: Message) -> Result<(), BrokerError>;
    async fn close(&self) -> Result<(), BrokerError>;
}

/// Subscribe side of one driver. The returned channel yields deliveries
/// until the token is cancelled or the underlying subscription ends.
#[async_trait]
pub trait Source: Send + Sync {
    async fn subscribe(
        &self,
        token: CancellationToken,
        topic: &str,
    ) -> Result<mpsc::Receiver<Delivery>, BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

// -- driver registry --
//
// Embedders install additional drivers (AMQP, Kafka, SQL queues, anything
// with a sink/source contract) by name; the muxes consult the registry for
// every driver they do not build themselves.

pub type SinkFactory = Arc<
    dyn Fn(&BrokerConfig) -> BoxFuture<'static, Result<Arc<dyn Sink>, BrokerError>> + Send + Sync,
>;
pub type SourceFactory = Arc<
    dyn Fn(&BrokerConfig) -> BoxFuture<'static, Result<Arc<dyn Source>, BrokerError>>
        + Send
        + Sync,
>;

static SINK_FACTORIES: LazyLock<RwLock<HashMap<String, SinkFactory>>> =
    LazyLock::new(Default::default);
static SOURCE_FACTORIES: LazyLock<RwLock<HashMap<String, SourceFactory>>> =
    LazyLock::new(Default::default);

/// Install a publish-side driver under `name` (case-insensitive).
pub fn register_sink_driver(name: &str, factory: SinkFactory) {
    if name.is_empty() {
        return;
    }
    let mut factories = SINK_FACTORIES.write().unwrap_or_else(|e| e.into_inner());
    factories.insert(name.to_lowercase(), factory);
}

/// Install a subscribe-side driver under `name` (case-insensitive).
pub fn register_source_driver(name: &str, factory: SourceFactory) {
    if name.is_empty() {
        return;
    }
    let mut factories = SOURCE_FACTORIES.write().unwrap_or_else(|e| e.into_inner());
    factories.insert(name.to_lowercase(), factory);
}

pub(crate) fn sink_factory(name: &str) -> Option<SinkFactory> {
    let factories = SINK_FACTORIES.read().unwrap_or_else(|e| e.into_inner());
    factories.get(name).cloned()
}

pub(crate) fn source_factory(name: &str) -> Option<SourceFactory> {
    let factories = SOURCE_FACTORIES.read().unwrap_or_else(|e| e.into_inner());
    factories.get(name).cloned()
}

/// The ordered, deduplicated driver list from config. `gochannel` is the
/// original deployment name for the in-process driver.
pub(crate) fn configured_drivers(cfg: &BrokerConfig) -> Vec<String> {
    let raw = if !cfg.drivers.is_empty() {
        cfg.drivers.clone()
    } else if !cfg.driver.is_empty() {
        vec![cfg.driver.clone()]
    } else {
        vec!["channel".to_string()]
    };

    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::with_capacity(raw.len());
    for name in raw {
        let mut name = name.trim().to_lowercase();
        if name == "gochannel" {
            name = "channel".to_string();
        }
        if name.is_empty() || !seen.insert(name.clone()) {
            continue;
        }
        out.push(name);
    }
    out
}
